//! The outer loop: prepare the environment once, then run the configured mode again and
//! again until shutdown.

use crate::constants::RESTART_COUNT_RESET_AFTER;
use crate::environment::{Environment, PreparerRegistry};
use crate::errors::{self, FatalConfigurationError, ModeError};
use crate::modes::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::time::Instant;

const GROUP: &str = "launcher";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Configuration(#[from] FatalConfigurationError),
    #[error(transparent)]
    Mode(#[from] ModeError),
}

/// Delay before the next restart grows with every restart and resets after a long run.
#[derive(Debug)]
pub struct RestartBackoff {
    sleep_per_restart: Duration,
    reset_after: Duration,
    restart_count: u32,
    last_start: Instant,
}

impl RestartBackoff {
    pub fn new(sleep_per_restart: Duration, now: Instant) -> Self {
        Self {
            sleep_per_restart,
            reset_after: RESTART_COUNT_RESET_AFTER,
            restart_count: 0,
            last_start: now,
        }
    }

    /// Returns the delay before restarting at `now` and records the restart.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        if now.saturating_duration_since(self.last_start) > self.reset_after {
            self.restart_count = 0;
        }
        let delay = self.sleep_per_restart * self.restart_count;
        self.restart_count += 1;
        self.last_start = now + delay;
        delay
    }
}

/// Runs one `Starting -> Started -> Stopped` cycle of the configured mode.
///
/// Returns `Ok(true)` when the mode ended by itself and should be restarted, `Ok(false)` when
/// shutdown was requested.
pub async fn run_configured_mode(env: &Environment) -> Result<bool, ModeError> {
    let mode = env.mode.clone();
    let run_id = uuid::Uuid::new_v4();
    tracing::info!(group = GROUP, %run_id, "Starting mode '{}'", mode.name());

    env.listeners
        .notify(mode.as_ref(), Status::Starting, &env.config)
        .await;

    if let Err(e) = mode.start(env.config.clone()) {
        env.listeners
            .notify(mode.as_ref(), Status::Stopped, &env.config)
            .await;
        return Err(e);
    }

    env.listeners
        .notify(mode.as_ref(), Status::Started, &env.config)
        .await;

    let mut status = mode.lifecycle().subscribe();
    let restart = tokio::select! {
        _ = env.shutdown.cancelled() => {
            tracing::info!(group = GROUP, %run_id, "Shutdown requested, stopping mode '{}'", mode.name());
            mode.stop().await;
            false
        }
        _ = status.wait_for(|s| *s == Status::Stopped) => !env.shutdown.is_cancelled(),
    };

    env.listeners
        .notify(mode.as_ref(), Status::Stopped, &env.config)
        .await;
    tracing::info!(group = GROUP, %run_id, "Mode '{}' stopped", mode.name());

    Ok(restart)
}

pub struct Launcher {
    env: Arc<Environment>,
    preparers: PreparerRegistry,
}

impl Launcher {
    pub fn new(env: Arc<Environment>, preparers: PreparerRegistry) -> Self {
        Self { env, preparers }
    }

    /// Prepares the environment and verifies the mode accepts the resulting configuration.
    pub async fn prepare(&self) -> Result<(), LaunchError> {
        self.preparers.prepare_environment(&self.env).await?;

        let mode = &self.env.mode;
        if !mode
            .is_config_acceptable(&self.env.config, &self.env.ci)
            .await
        {
            return Err(FatalConfigurationError::new(
                mode.name(),
                errors::mode::rejected_config(mode.name()),
            )
            .into());
        }
        Ok(())
    }

    /// Runs the mode until shutdown, sleeping with a growing back-off between restarts.
    pub async fn run(&self) -> Result<(), LaunchError> {
        let sleep_per_restart = Duration::from_secs(
            self.env
                .config
                .load()
                .client
                .restart
                .sleep_on_failure_seconds,
        );
        let mut backoff = RestartBackoff::new(sleep_per_restart, Instant::now());

        while run_configured_mode(&self.env).await? {
            println!("\n:::::::::::::::::::::::::::::::::");
            println!("::     Restarting CI Client    ::");
            println!(":::::::::::::::::::::::::::::::::\n");

            let delay = backoff.next_delay(Instant::now());
            if !delay.is_zero() {
                tracing::info!(
                    group = GROUP,
                    "Sleeping {} before restarting the client.",
                    humantime::format_duration(delay)
                );
                tokio::select! {
                    _ = self.env.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.env.shutdown.cancel();
        Ok(())
    }
}

/// Cancels the shutdown token on Ctrl+C.
pub fn spawn_signal_handler(env: &Arc<Environment>) {
    let shutdown = env.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!(group = GROUP, "Ctrl+C received, shutting down"),
            Err(e) => tracing::error!(group = GROUP, "Error listening for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });
}

/// `r` + Return restarts the client.
pub fn spawn_keyboard_listener(env: &Arc<Environment>) {
    let env = env.clone();
    tokio::spawn(async move {
        tracing::info!(group = GROUP, "Listening for keys: [R+Return]: Restart client.");
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = env.shutdown.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().eq_ignore_ascii_case("r") => {
                        tracing::info!(group = GROUP, "Restart requested from the keyboard.");
                        env.mode.stop().await;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::CiClient;
    use crate::config::{Config, shared};
    use crate::modes::mock::MockMode;
    use crate::modes::{Mode, ModeListener};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_backoff_grows_linearly() {
        let start = Instant::now();
        let mut backoff = RestartBackoff::new(Duration::from_secs(30), start);

        assert_eq!(backoff.next_delay(start), Duration::ZERO);
        assert_eq!(backoff.next_delay(start), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(start), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_resets_after_long_run() {
        let start = Instant::now();
        let mut backoff = RestartBackoff::new(Duration::from_secs(30), start);
        backoff.next_delay(start);
        backoff.next_delay(start);

        let later = start + Duration::from_secs(3 * 60 * 60);
        assert_eq!(backoff.next_delay(later), Duration::ZERO);
        assert_eq!(backoff.next_delay(later), Duration::from_secs(30));
    }

    struct Recorder(Arc<Mutex<Vec<Status>>>);

    #[async_trait]
    impl ModeListener for Recorder {
        async fn on_mode_transition(&self, _mode: &dyn Mode, next: Status, _config: &crate::config::SharedConfig) {
            self.0.lock().unwrap().push(next);
        }
    }

    fn test_env(mode: Arc<dyn Mode>) -> Arc<Environment> {
        let config = shared(Config::default());
        let ci = Arc::new(CiClient::new(config.clone()).unwrap());
        Arc::new(Environment::new(config, ci, mode))
    }

    #[tokio::test]
    async fn test_mode_ending_by_itself_requests_restart() {
        let env = test_env(Arc::new(MockMode::with_run_duration(Duration::from_millis(10))));
        let seen = Arc::new(Mutex::new(Vec::new()));
        env.listeners.register(Arc::new(Recorder(seen.clone())));

        assert!(run_configured_mode(&env).await.unwrap());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Status::Starting, Status::Started, Status::Stopped]
        );
    }

    #[tokio::test]
    async fn test_shutdown_ends_the_loop() {
        let mode = Arc::new(MockMode::new());
        let env = test_env(mode.clone());
        let launcher = Launcher::new(env.clone(), PreparerRegistry::new());

        let shutdown = env.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), launcher.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mode.status(), Status::Stopped);
        assert_eq!(mode.runs(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mode = Arc::new(MockMode::new());
        let env = test_env(mode.clone());
        let launcher = Launcher::new(env.clone(), PreparerRegistry::new());

        let stopper = {
            let mode = mode.clone();
            let shutdown = env.shutdown.clone();
            tokio::spawn(async move {
                let mut rx = mode.lifecycle().subscribe();
                rx.wait_for(|s| *s == Status::Started).await.unwrap();
                mode.stop().await;
                while mode.runs() < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                shutdown.cancel();
            })
        };

        tokio::time::timeout(Duration::from_secs(5), launcher.run())
            .await
            .unwrap()
            .unwrap();
        stopper.await.unwrap();
        assert_eq!(mode.runs(), 2);
    }

    #[tokio::test]
    async fn test_start_of_running_mode_is_fatal() {
        let mode = Arc::new(MockMode::new());
        mode.lifecycle().begin_start("mock").unwrap();
        let env = test_env(mode);

        let result = run_configured_mode(&env).await;
        assert!(matches!(result, Err(ModeError::InvalidTransition { .. })));
    }
}
