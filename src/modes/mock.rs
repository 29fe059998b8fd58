//! A mode that pretends to run the agent, used for dry runs (`LAUNCHER_MOCK`) and tests.

use super::{Lifecycle, Mode};
use crate::ci::CiClient;
use crate::config::SharedConfig;
use crate::errors::ModeError;
use crate::util::AtomicCounter;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const MOCK_MODE_NAME: &str = "mock";

const GROUP: &str = "mock";

#[derive(Default)]
pub struct MockMode {
    lifecycle: Arc<Lifecycle>,
    runs: Arc<AtomicCounter>,
    run_for: Option<Duration>,
}

impl MockMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run ends by itself after `duration`, as if the agent lost its connection.
    pub fn with_run_duration(duration: Duration) -> Self {
        Self {
            run_for: Some(duration),
            ..Self::default()
        }
    }

    pub fn runs(&self) -> i32 {
        self.runs.get()
    }

    fn generate_fake_pid() -> u32 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        nanos % 100_000 + 10_000
    }
}

#[async_trait]
impl Mode for MockMode {
    fn name(&self) -> &'static str {
        MOCK_MODE_NAME
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn is_config_acceptable(&self, _config: &SharedConfig, _ci: &CiClient) -> bool {
        true
    }

    fn start(&self, _config: SharedConfig) -> Result<(), ModeError> {
        self.lifecycle.begin_start(self.name())?;

        let lifecycle = self.lifecycle.clone();
        let run = self.runs.increment();
        let run_for = self.run_for;

        tokio::spawn(async move {
            let pid = Self::generate_fake_pid();
            tracing::info!(group = GROUP, "MOCK: run {} started with fake PID {}", run, pid);
            lifecycle.mark_started();

            match run_for {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            tracing::info!(group = GROUP, "MOCK: run {} ended by itself", run);
                        }
                        _ = lifecycle.stop_requested() => {}
                    }
                }
                None => lifecycle.stop_requested().await,
            }

            tracing::info!(group = GROUP, "MOCK: stopped fake PID {}", pid);
            lifecycle.mark_stopped();
        });

        Ok(())
    }
}
