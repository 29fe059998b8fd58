//! Watches the node's state on the CI server and restarts the client when the server keeps
//! reporting the node offline or cannot be reached at all.
//!
//! The monitor also maintains the shared idle flag used by idle-gated restarts.

use super::{Environment, Preparer};
use crate::config::{Config, StateOnServerSettings};
use crate::errors::FatalConfigurationError;
use crate::modes::Status;
use async_trait::async_trait;
use std::sync::Arc;

const GROUP: &str = "monitor";

/// One polling result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The local mode is not running, the server state is irrelevant.
    LocalNotStarted,
    Online { idle: bool },
    Offline,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// The node just came online (after start or after being offline).
    CameOnline,
    /// Offline or unreachable, but below the threshold.
    Degraded { count: u32, max: u32 },
    ForceRestart,
}

/// Counts consecutive offline and unreachable observations separately.
///
/// Reaching either threshold asks for exactly one restart and resets that counter. An
/// observation of the other kind also resets a counter. Any online observation, or a locally
/// stopped mode, resets both.
#[derive(Debug)]
pub struct OfflineTracker {
    max_offline: u32,
    max_unreachable: u32,
    offline: u32,
    unreachable: u32,
    online: bool,
}

impl OfflineTracker {
    pub fn new(max_offline: u32, max_unreachable: u32) -> Self {
        Self {
            max_offline: max_offline.max(1),
            max_unreachable: max_unreachable.max(1),
            offline: 0,
            unreachable: 0,
            online: false,
        }
    }

    pub fn from_settings(settings: &StateOnServerSettings) -> Self {
        Self::new(settings.max_failures, settings.max_unreachable)
    }

    pub fn observe(&mut self, observation: Observation) -> Verdict {
        match observation {
            Observation::LocalNotStarted => {
                self.reset();
                self.online = false;
                Verdict::Healthy
            }
            Observation::Online { .. } => {
                self.reset();
                if std::mem::replace(&mut self.online, true) {
                    Verdict::Healthy
                } else {
                    Verdict::CameOnline
                }
            }
            // Each counter measures one consecutive run, the other kind breaks it.
            Observation::Offline => {
                self.online = false;
                self.unreachable = 0;
                Self::count(&mut self.offline, self.max_offline)
            }
            Observation::Unreachable => {
                self.online = false;
                self.offline = 0;
                Self::count(&mut self.unreachable, self.max_unreachable)
            }
        }
    }

    fn count(counter: &mut u32, max: u32) -> Verdict {
        *counter += 1;
        if *counter >= max {
            *counter = 0;
            Verdict::ForceRestart
        } else {
            Verdict::Degraded {
                count: *counter,
                max,
            }
        }
    }

    fn reset(&mut self) {
        self.offline = 0;
        self.unreachable = 0;
    }
}

/// Whether the node runs no build, as far as the observation tells.
pub fn is_idle(observation: Observation) -> bool {
    match observation {
        Observation::Online { idle } => idle,
        _ => true,
    }
}

pub struct NodeMonitor;

async fn observe(env: &Environment) -> Observation {
    if env.mode.status() != Status::Started {
        return Observation::LocalNotStarted;
    }

    match env.ci.node_status().await {
        Ok(status) if status.offline => Observation::Offline,
        Ok(status) => Observation::Online { idle: status.idle },
        Err(e) => {
            tracing::error!(group = GROUP, "Failed to query the node state: {:#}", e);
            Observation::Unreachable
        }
    }
}

async fn run(env: Arc<Environment>, settings: StateOnServerSettings) {
    let mut tracker = OfflineTracker::from_settings(&settings);
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(settings.interval_seconds));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = env.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let observation = observe(&env).await;
                env.idle.set(is_idle(observation));

                match tracker.observe(observation) {
                    Verdict::Healthy => {}
                    Verdict::CameOnline => {
                        tracing::info!(group = GROUP, "Node is online.");
                    }
                    Verdict::Degraded { count, max } => {
                        tracing::warn!(
                            group = GROUP,
                            "Node is {:?} on the server ({}/{}).",
                            observation,
                            count,
                            max
                        );
                    }
                    Verdict::ForceRestart => {
                        if env.mode.status() == Status::Started {
                            tracing::warn!(
                                group = GROUP,
                                "Node stayed {:?} on the server, forcing a reconnect.",
                                observation
                            );
                            env.mode.stop().await;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Preparer for NodeMonitor {
    fn name(&self) -> &'static str {
        "node monitor"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        !config.client.monitoring.state_on_server.enabled || config.ci.has_connection()
    }

    async fn prepare(&self, env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let settings = env.config.load().client.monitoring.state_on_server.clone();
        if !settings.enabled {
            env.idle.set(true);
            return Ok(());
        }

        tokio::spawn(run(env.clone(), settings));
        Ok(())
    }
}
