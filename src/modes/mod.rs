//! Run modes and their lifecycle.
//!
//! A mode moves through `None -> Starting -> Started -> Stopping -> Stopped` within one run
//! cycle. `Start` is only valid from `None` or `Stopped`; anything else is a programming error
//! reported as [`ModeError::InvalidTransition`].

pub mod client;
pub mod mock;
pub mod process;
pub mod server;

use crate::ci::CiClient;
use crate::config::SharedConfig;
use crate::errors::ModeError;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter)]
pub enum Status {
    None,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl Status {
    pub fn is_stopped(self) -> bool {
        matches!(self, Status::None | Status::Stopped)
    }
}

/// Thread-safe status holder of one mode.
///
/// Backed by a watch channel so that `stop` can wait for the execution task to report
/// `Stopped` instead of polling.
#[derive(Debug)]
pub struct Lifecycle {
    status: watch::Sender<Status>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (status, _) = watch::channel(Status::None);
        Self { status }
    }

    pub fn get(&self) -> Status {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// `None`/`Stopped` -> `Starting`.
    pub fn begin_start(&self, mode: &str) -> Result<(), ModeError> {
        let mut observed = Status::None;
        let started = self.status.send_if_modified(|status| {
            observed = *status;
            if status.is_stopped() {
                *status = Status::Starting;
                true
            } else {
                false
            }
        });

        if started {
            Ok(())
        } else {
            Err(ModeError::InvalidTransition {
                mode: mode.to_string(),
                status: observed.to_string(),
            })
        }
    }

    /// `Starting` -> `Started`. Returns false if a stop was requested meanwhile.
    pub fn mark_started(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == Status::Starting {
                *status = Status::Started;
                true
            } else {
                false
            }
        })
    }

    /// `Starting`/`Started` -> `Stopping`. Returns false if nothing is running.
    pub fn request_stop(&self) -> bool {
        self.status.send_if_modified(|status| {
            if matches!(status, Status::Starting | Status::Started) {
                *status = Status::Stopping;
                true
            } else {
                false
            }
        })
    }

    pub fn mark_stopped(&self) {
        self.status.send_if_modified(|status| {
            if *status == Status::Stopped {
                false
            } else {
                *status = Status::Stopped;
                true
            }
        });
    }

    /// Resolves once the execution task observed a stop request.
    pub async fn stop_requested(&self) {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|status| matches!(status, Status::Stopping | Status::Stopped))
            .await;
    }

    pub async fn wait_until_stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|status| status.is_stopped()).await;
    }

    /// Requests a stop and returns once the mode reached `Stopped`. No-op if already stopped.
    pub async fn stop(&self) {
        if self.get().is_stopped() {
            return;
        }
        self.request_stop();
        self.wait_until_stopped().await;
    }
}

#[async_trait]
pub trait Mode: Send + Sync {
    fn name(&self) -> &'static str;

    fn lifecycle(&self) -> &Lifecycle;

    /// Checks (and may complete, e.g. by fetching a secret) the configuration before startup.
    async fn is_config_acceptable(&self, config: &SharedConfig, ci: &CiClient) -> bool;

    /// Launches the mode asynchronously and returns immediately with status `Starting`.
    fn start(&self, config: SharedConfig) -> Result<(), ModeError>;

    fn status(&self) -> Status {
        self.lifecycle().get()
    }

    async fn stop(&self) {
        self.lifecycle().stop().await;
    }
}

/// Callback notified about `Starting`, `Started` and `Stopped` of the running mode.
///
/// Listeners run on the task driving the transition and must handle their own failures.
#[async_trait]
pub trait ModeListener: Send + Sync {
    async fn on_mode_transition(&self, mode: &dyn Mode, next: Status, config: &SharedConfig);
}

#[derive(Default)]
pub struct ModeListeners {
    listeners: RwLock<Vec<Arc<dyn ModeListener>>>,
}

impl ModeListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ModeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every listener in registration order, one after another.
    pub async fn notify(&self, mode: &dyn Mode, next: Status, config: &SharedConfig) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for listener in listeners {
            listener.on_mode_transition(mode, next, config).await;
        }
    }
}

/// All run modes known to the launcher, registered once at startup.
#[derive(Default)]
pub struct ModeRegistry {
    modes: Vec<Arc<dyn Mode>>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self::new()
            .register(Arc::new(client::ClientMode::new()))
            .register(Arc::new(mock::MockMode::new()))
            .register(Arc::new(server::ServerMode::new()))
    }

    pub fn register(mut self, mode: Arc<dyn Mode>) -> Self {
        self.modes.push(mode);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Mode>, ModeError> {
        self.modes
            .iter()
            .find(|mode| mode.name() == name)
            .cloned()
            .ok_or_else(|| ModeError::UnknownMode(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modes.iter().map(|mode| mode.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, shared};
    use std::sync::Mutex;
    use std::time::Duration;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_order_is_lifecycle_order() {
        let all: Vec<Status> = Status::iter().collect();
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_start_only_from_none_or_stopped() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_start("test").is_ok());
        assert_eq!(lifecycle.get(), Status::Starting);

        let err = lifecycle.begin_start("test").unwrap_err();
        assert!(matches!(err, ModeError::InvalidTransition { .. }));
        assert!(err.to_string().contains("Starting"));

        assert!(lifecycle.mark_started());
        assert!(lifecycle.begin_start("test").is_err());

        assert!(lifecycle.request_stop());
        assert!(lifecycle.begin_start("test").is_err());

        lifecycle.mark_stopped();
        assert!(lifecycle.begin_start("test").is_ok());
    }

    #[test]
    fn test_stop_request_ignored_when_not_running() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.request_stop());
        assert_eq!(lifecycle.get(), Status::None);
    }

    #[test]
    fn test_started_not_reached_after_early_stop() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start("test").unwrap();
        assert!(lifecycle.request_stop());
        assert!(!lifecycle.mark_started());
        assert_eq!(lifecycle.get(), Status::Stopping);
    }

    #[tokio::test]
    async fn test_stop_on_stopped_is_noop() {
        let lifecycle = Lifecycle::new();
        tokio::time::timeout(Duration::from_secs(1), lifecycle.stop())
            .await
            .expect("stop on an idle lifecycle must return immediately");
    }

    #[tokio::test]
    async fn test_stop_waits_for_stopped() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin_start("test").unwrap();
        lifecycle.mark_started();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let lifecycle = lifecycle.clone();
            let observed = observed.clone();
            tokio::spawn(async move {
                lifecycle.stop_requested().await;
                observed.lock().unwrap().push(lifecycle.get());
                tokio::time::sleep(Duration::from_millis(50)).await;
                lifecycle.mark_stopped();
            })
        };

        lifecycle.stop().await;
        assert_eq!(lifecycle.get(), Status::Stopped);
        assert_eq!(*observed.lock().unwrap(), vec![Status::Stopping]);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_observed_statuses_only_move_forward() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut rx = lifecycle.subscribe();
        let seen = tokio::spawn(async move {
            let mut seen = vec![*rx.borrow_and_update()];
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                seen.push(status);
                if status == Status::Stopped {
                    break;
                }
            }
            seen
        });

        lifecycle.begin_start("test").unwrap();
        tokio::task::yield_now().await;
        lifecycle.mark_started();
        tokio::task::yield_now().await;
        lifecycle.request_stop();
        tokio::task::yield_now().await;
        lifecycle.mark_stopped();

        let seen = seen.await.unwrap();
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", seen);
        assert_eq!(seen.last(), Some(&Status::Stopped));
    }

    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<(usize, Status)>>>,
    }

    #[async_trait]
    impl ModeListener for Recorder {
        async fn on_mode_transition(&self, _mode: &dyn Mode, next: Status, _config: &SharedConfig) {
            self.log.lock().unwrap().push((self.id, next));
        }
    }

    #[tokio::test]
    async fn test_listeners_notified_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners = ModeListeners::new();
        for id in 0..3 {
            listeners.register(Arc::new(Recorder {
                id,
                log: log.clone(),
            }));
        }

        let mode = mock::MockMode::new();
        let config = shared(Config::default());
        listeners.notify(&mode, Status::Starting, &config).await;
        listeners.notify(&mode, Status::Stopped, &config).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (0, Status::Starting),
                (1, Status::Starting),
                (2, Status::Starting),
                (0, Status::Stopped),
                (1, Status::Stopped),
                (2, Status::Stopped),
            ]
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ModeRegistry::with_defaults();
        assert_eq!(registry.get("client").unwrap().name(), "client");
        assert_eq!(registry.names(), vec!["client", "mock", "ssh-server"]);
        assert_eq!(registry.get("ssh-server").unwrap().name(), "ssh-server");
        assert!(matches!(
            registry.get("server"),
            Err(ModeError::UnknownMode(_))
        ));
    }
}
