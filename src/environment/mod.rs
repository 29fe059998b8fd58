//! Environment preparers.
//!
//! A preparer sets up something the running mode depends on (an SSH tunnel, a restart
//! policy, the agent jar). Preparation happens in two phases: `configure` runs for every
//! accepting preparer one after another and may change the shared configuration, then
//! `prepare` runs for all of them concurrently and the orchestrator waits for every one.

pub mod download;
pub mod gc;
pub mod monitor;
pub mod naming;
pub mod outofmemory;
pub mod periodic;
pub mod sshtunnel;

use crate::ci::CiClient;
use crate::config::{Config, SharedConfig};
use crate::constants::IDLE_POLL_INTERVAL;
use crate::errors::FatalConfigurationError;
use crate::modes::{Mode, ModeListeners};
use crate::util::{self, AtomicFlag};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything a preparer may touch while setting up or running its background work.
pub struct Environment {
    pub config: SharedConfig,
    pub ci: Arc<CiClient>,
    pub listeners: Arc<ModeListeners>,
    pub mode: Arc<dyn Mode>,
    /// Whether the node currently runs no build. Written by the node monitor.
    pub idle: Arc<AtomicFlag>,
    /// Cancelled on shutdown, ends every background task.
    pub shutdown: CancellationToken,
}

impl Environment {
    pub fn new(config: SharedConfig, ci: Arc<CiClient>, mode: Arc<dyn Mode>) -> Self {
        Self {
            config,
            ci,
            listeners: Arc::new(ModeListeners::new()),
            mode,
            idle: Arc::new(AtomicFlag::new(true)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops the running mode, first waiting for the node to become idle if requested.
    ///
    /// Returns false if shutdown interrupted the wait.
    pub async fn stop_mode(&self, only_when_idle: bool, group: &str) -> bool {
        if only_when_idle
            && !util::wait_for_flag(&self.idle, IDLE_POLL_INTERVAL, &self.shutdown, group).await
        {
            return false;
        }
        self.mode.stop().await;
        true
    }
}

#[async_trait]
pub trait Preparer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Preparers returning false are skipped entirely.
    fn is_config_acceptable(&self, config: &Config) -> bool;

    /// Sequential phase. The only place a preparer may reshape the configuration or register
    /// mode listeners.
    async fn configure(&self, _env: &Arc<Environment>) -> Result<(), FatalConfigurationError> {
        Ok(())
    }

    /// Concurrent phase. Long running work must be spawned and bound to `env.shutdown`.
    async fn prepare(&self, env: Arc<Environment>) -> Result<(), FatalConfigurationError>;
}

#[derive(Default)]
pub struct PreparerRegistry {
    preparers: Vec<Arc<dyn Preparer>>,
}

impl PreparerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The preparers of a regular launcher run, in configure order.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(Arc::new(naming::NodeNameHandler))
            .register(Arc::new(sshtunnel::SshTunnelEstablisher::new()))
            .register(Arc::new(download::ClientJarDownloader::new()))
            .register(Arc::new(outofmemory::OutOfMemoryRestarter))
            .register(Arc::new(monitor::NodeMonitor))
            .register(Arc::new(periodic::PeriodicRestarter))
            .register(Arc::new(gc::FullGcInvoker))
    }

    pub fn register(mut self, preparer: Arc<dyn Preparer>) -> Self {
        self.preparers.push(preparer);
        self
    }

    pub fn len(&self) -> usize {
        self.preparers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preparers.is_empty()
    }

    /// Runs both preparation phases and returns once every `prepare` call completed.
    ///
    /// The first fatal error is returned after all preparers finished.
    pub async fn prepare_environment(
        &self,
        env: &Arc<Environment>,
    ) -> Result<(), FatalConfigurationError> {
        let accepted: Vec<Arc<dyn Preparer>> = {
            let config = env.config.load();
            self.preparers
                .iter()
                .filter(|preparer| {
                    let accepted = preparer.is_config_acceptable(&config);
                    if !accepted {
                        tracing::info!(
                            group = "env",
                            "Skipping {}, not applicable to the current configuration.",
                            preparer.name()
                        );
                    }
                    accepted
                })
                .cloned()
                .collect()
        };

        for preparer in &accepted {
            preparer.configure(env).await?;
        }

        let mut tasks = JoinSet::new();
        for preparer in accepted {
            tracing::info!(group = "env", "Preparing {}", preparer.name());
            let env = env.clone();
            tasks.spawn(async move { (preparer.name(), preparer.prepare(env).await) });
        }

        let mut fatal = None;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    tracing::error!(group = "env", "{} failed: {}", name, e);
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(group = "env", "A preparer panicked: {}", e);
                }
            }
        }

        tracing::info!(group = "env", "Finished preparing the environment.");

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::shared;
    use crate::modes::mock::MockMode;
    use crate::util::AtomicCounter;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_env() -> Arc<Environment> {
        let config = shared(Config::default());
        let ci = Arc::new(CiClient::new(config.clone()).unwrap());
        Arc::new(Environment::new(config, ci, Arc::new(MockMode::new())))
    }

    struct Counting {
        name: &'static str,
        accept: bool,
        delay: Duration,
        prepared: Arc<AtomicCounter>,
        order: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Preparer for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_config_acceptable(&self, _config: &Config) -> bool {
            self.accept
        }

        async fn configure(&self, env: &Arc<Environment>) -> Result<(), FatalConfigurationError> {
            self.order.lock().unwrap().push(format!("configure {}", self.name));
            let name = self.name;
            crate::config::update_config(&env.config, |c| {
                c.runtime.java_args.push(format!("-D{}", name))
            });
            Ok(())
        }

        async fn prepare(&self, _env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
            tokio::time::sleep(self.delay).await;
            self.prepared.increment();
            if self.fail {
                return Err(FatalConfigurationError::new(self.name, "broken"));
            }
            Ok(())
        }
    }

    fn counting(
        name: &'static str,
        accept: bool,
        prepared: &Arc<AtomicCounter>,
        order: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<Counting> {
        Arc::new(Counting {
            name,
            accept,
            delay: Duration::from_millis(20),
            prepared: prepared.clone(),
            order: order.clone(),
            fail: false,
        })
    }

    #[tokio::test]
    async fn test_only_accepting_preparers_run_and_all_are_awaited() {
        let prepared = Arc::new(AtomicCounter::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = PreparerRegistry::new()
            .register(counting("a", true, &prepared, &order))
            .register(counting("b", false, &prepared, &order))
            .register(counting("c", true, &prepared, &order))
            .register(counting("d", true, &prepared, &order));

        let env = test_env();
        registry.prepare_environment(&env).await.unwrap();

        assert_eq!(prepared.get(), 3);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["configure a", "configure c", "configure d"]
        );
        assert_eq!(env.config.load().runtime.java_args, vec!["-Da", "-Dc", "-Dd"]);
    }

    #[tokio::test]
    async fn test_prepare_runs_concurrently() {
        let prepared = Arc::new(AtomicCounter::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PreparerRegistry::new();
        for name in ["a", "b", "c", "d", "e"] {
            registry = registry.register(Arc::new(Counting {
                name,
                accept: true,
                delay: Duration::from_millis(200),
                prepared: prepared.clone(),
                order: order.clone(),
                fail: false,
            }));
        }

        let started = std::time::Instant::now();
        registry.prepare_environment(&test_env()).await.unwrap();

        assert_eq!(prepared.get(), 5);
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_fatal_error_reported_after_all_complete() {
        let prepared = Arc::new(AtomicCounter::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = PreparerRegistry::new()
            .register(Arc::new(Counting {
                name: "broken",
                accept: true,
                delay: Duration::from_millis(1),
                prepared: prepared.clone(),
                order: order.clone(),
                fail: true,
            }))
            .register(Arc::new(Counting {
                name: "slow",
                accept: true,
                delay: Duration::from_millis(100),
                prepared: prepared.clone(),
                order: order.clone(),
                fail: false,
            }));

        let err = registry.prepare_environment(&test_env()).await.unwrap_err();

        assert_eq!(err.component, "broken");
        assert_eq!(prepared.get(), 2);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = PreparerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.prepare_environment(&test_env()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_mode_interrupted_by_shutdown() {
        let env = test_env();
        env.idle.set(false);
        env.shutdown.cancel();
        assert!(!env.stop_mode(true, "test").await);
        assert!(env.stop_mode(false, "test").await);
    }

    #[test]
    fn test_default_registry() {
        assert_eq!(PreparerRegistry::with_defaults().len(), 7);
    }
}
