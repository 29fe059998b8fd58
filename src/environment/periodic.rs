use super::{Environment, Preparer};
use crate::config::Config;
use crate::errors::FatalConfigurationError;
use crate::modes::Status;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "periodic";

/// Restarts the running mode every `client.restart.periodic.interval_hours`.
pub struct PeriodicRestarter;

pub(crate) fn restart_interval(config: &Config) -> Option<Duration> {
    let periodic = &config.client.restart.periodic;
    (periodic.enabled && periodic.interval_hours > 0)
        .then(|| Duration::from_secs(periodic.interval_hours * 60 * 60))
}

async fn run(env: Arc<Environment>, interval: Duration, only_when_idle: bool) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = env.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if env.mode.status() != Status::Started {
                    continue;
                }
                tracing::info!(
                    group = GROUP,
                    "Periodic restart after {} is due.",
                    humantime::format_duration(interval)
                );
                if !env.stop_mode(only_when_idle, GROUP).await {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Preparer for PeriodicRestarter {
    fn name(&self) -> &'static str {
        "periodic restart"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        restart_interval(config).is_some()
    }

    async fn prepare(&self, env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let config = env.config.load_full();
        if let Some(interval) = restart_interval(&config) {
            tracing::info!(
                group = GROUP,
                "Restarting the client every {}.",
                humantime::format_duration(interval)
            );
            tokio::spawn(run(
                env.clone(),
                interval,
                config.client.restart.periodic.only_when_idle,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::CiClient;
    use crate::config::shared;
    use crate::modes::Mode;
    use crate::modes::mock::MockMode;

    #[test]
    fn test_restart_interval() {
        let mut config = Config::default();
        assert_eq!(restart_interval(&config), None);

        config.client.restart.periodic.enabled = true;
        config.client.restart.periodic.interval_hours = 2;
        assert_eq!(restart_interval(&config), Some(Duration::from_secs(7200)));

        config.client.restart.periodic.interval_hours = 0;
        assert_eq!(restart_interval(&config), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_started_mode() {
        let config = shared(Config::default());
        let ci = Arc::new(CiClient::new(config.clone()).unwrap());
        let mode = Arc::new(MockMode::new());
        let env = Arc::new(Environment::new(config.clone(), ci, mode.clone()));

        mode.start(config).unwrap();
        let mut rx = mode.lifecycle().subscribe();
        rx.wait_for(|s| *s == Status::Started).await.unwrap();

        let task = tokio::spawn(run(env.clone(), Duration::from_secs(3600), false));
        tokio::time::sleep(Duration::from_secs(3601)).await;
        mode.lifecycle().wait_until_stopped().await;
        assert_eq!(mode.status(), Status::Stopped);

        env.shutdown.cancel();
        task.await.unwrap();
    }
}
