use super::{Environment, Preparer};
use crate::config::{Config, update_config};
use crate::constants::OOM_MARKER_FILE_NAME;
use crate::errors::FatalConfigurationError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "oom";

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

const JVM_OOM_OPTION: &str = "-XX:OnOutOfMemoryError=";

/// Lets the JVM drop a marker file on `OutOfMemoryError` and restarts the client when it appears.
pub struct OutOfMemoryRestarter;

/// The JVM option that writes `marker` when the agent runs out of memory.
pub fn out_of_memory_java_arg(marker: &Path) -> String {
    let command = if cfg!(windows) {
        let shell = std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string());
        format!("{} /c echo 1 > \"{}\"", shell, marker.display())
    } else {
        format!("/bin/echo 1 > \"{}\"", marker.display())
    };
    format!("{}{}", JVM_OOM_OPTION, command)
}

/// Removes the marker, reporting whether it was there.
pub(crate) async fn consume_marker(marker: &Path) -> bool {
    match tokio::fs::remove_file(marker).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(group = GROUP, "Cannot remove {}: {}", marker.display(), e);
            false
        }
    }
}

async fn run(env: Arc<Environment>, marker: PathBuf, only_when_idle: bool) {
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = env.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !consume_marker(&marker).await {
                    continue;
                }
                tracing::warn!(group = GROUP, "The client ran out of memory, restarting it.");
                if !env.stop_mode(only_when_idle, GROUP).await {
                    break;
                }
            }
        }
    }
}

fn marker_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(OOM_MARKER_FILE_NAME)
}

#[async_trait]
impl Preparer for OutOfMemoryRestarter {
    fn name(&self) -> &'static str {
        "out of memory restart"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        config.client.restart.out_of_memory.enabled
    }

    async fn configure(&self, env: &Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let java_arg = out_of_memory_java_arg(&marker_path());
        update_config(&env.config, |c| {
            c.runtime
                .java_args
                .retain(|arg| !arg.starts_with(JVM_OOM_OPTION));
            c.runtime.java_args.push(java_arg.clone());
        });
        Ok(())
    }

    async fn prepare(&self, env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let marker = marker_path();
        // A marker left over from a previous launcher run must not trigger a restart.
        consume_marker(&marker).await;

        let only_when_idle = env.config.load().client.restart.out_of_memory.only_when_idle;
        tokio::spawn(run(env.clone(), marker, only_when_idle));
        Ok(())
    }
}
