use std::path::PathBuf;
use std::time::Duration;

pub const APP_NAME: &str = "CI Client Launcher";

pub const CONFIG_FILE_NAME: &str = "launcher.yaml";

pub const DEFAULT_RUN_MODE: &str = "client";

pub const CLIENT_JAR_NAME: &str = "agent.jar";

/// Customized connection descriptor handed to the agent via `-jnlpUrl file:`.
pub const AGENT_DESCRIPTOR_FILE_NAME: &str = "~slave-agent.jnlp";

/// Name of the file the JVM writes when it runs out of memory.
pub const OOM_MARKER_FILE_NAME: &str = "~client-oom.marker";

/// Interval used when a restart waits for the node to become idle.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period between killing the client process and reporting it stopped.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Delay between a console restart token match and the resulting stop.
pub const CONSOLE_RESTART_DELAY: Duration = Duration::from_secs(1);

/// A run longer than this resets the restart back-off.
pub const RESTART_COUNT_RESET_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

pub fn default_log_directory() -> PathBuf {
    PathBuf::from(".").join("logs")
}
