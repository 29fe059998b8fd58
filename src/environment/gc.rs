use super::{Environment, Preparer};
use crate::config::{Config, ForceFullGcSettings};
use crate::errors::FatalConfigurationError;
use crate::modes::Status;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "gc";

/// Asks the agent JVM (through the CI server's script console) for a full GC on a schedule.
pub struct FullGcInvoker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSchedule {
    pub interval: Duration,
    /// The schedule only fires while the node's idle flag has this value.
    pub when_idle: bool,
}

pub fn schedules(settings: &ForceFullGcSettings) -> Vec<GcSchedule> {
    let mut schedules = Vec::new();
    if !settings.enabled {
        return schedules;
    }

    if !settings.only_when_idle && settings.interval_minutes > 0 {
        schedules.push(GcSchedule {
            interval: Duration::from_secs(settings.interval_minutes * 60),
            when_idle: false,
        });
    }

    let idle_minutes = match settings.idle_interval_minutes {
        0 if settings.only_when_idle => settings.interval_minutes,
        minutes => minutes,
    };
    if idle_minutes > 0 {
        schedules.push(GcSchedule {
            interval: Duration::from_secs(idle_minutes * 60),
            when_idle: true,
        });
    }

    schedules
}

async fn run(env: Arc<Environment>, schedule: GcSchedule) {
    let start = tokio::time::Instant::now() + schedule.interval;
    let mut ticker = tokio::time::interval_at(start, schedule.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = env.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if env.mode.status() != Status::Started || env.idle.get() != schedule.when_idle {
                    continue;
                }
                match env.ci.invoke_gc().await {
                    Ok(()) => tracing::info!(group = GROUP, "Forced a full GC on the client."),
                    Err(e) => tracing::warn!(group = GROUP, "Failed to force a full GC: {:#}", e),
                }
            }
        }
    }
}

#[async_trait]
impl Preparer for FullGcInvoker {
    fn name(&self) -> &'static str {
        "full GC invoker"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        config.java.force_full_gc.enabled && config.ci.has_connection()
    }

    async fn prepare(&self, env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let settings = env.config.load().java.force_full_gc.clone();
        for schedule in schedules(&settings) {
            tracing::debug!(
                group = GROUP,
                "Full GC every {} while {}",
                humantime::format_duration(schedule.interval),
                if schedule.when_idle { "idle" } else { "busy" }
            );
            tokio::spawn(run(env.clone(), schedule));
        }
        Ok(())
    }
}
