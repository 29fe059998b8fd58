pub mod loader;

use anyhow::{Context, ensure};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The configuration snapshot shared by the launcher, the modes and every preparer.
///
/// Writers go through [`update_config`] so concurrent updates never overwrite each other.
pub type SharedConfig = Arc<ArcSwap<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

/// Applies `f` to a copy of the current snapshot and publishes the result (read-copy-update).
pub fn update_config<F>(config: &SharedConfig, mut f: F)
where
    F: FnMut(&mut Config),
{
    config.rcu(|current| {
        let mut next = Config::clone(current);
        f(&mut next);
        next
    });
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn is_set(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Expected MD5 host key fingerprint, `-` disables verification.
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub auth: Credentials,
    #[serde(default = "default_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    #[serde(default)]
    pub patch_node_config: bool,
}

impl Default for SshTunnelSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            port: default_ssh_port(),
            fingerprint: String::new(),
            auth: Credentials::default(),
            connect_timeout_seconds: default_timeout_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
            patch_node_config: false,
        }
    }
}

impl SshTunnelSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default)]
    pub ssh: SshTunnelSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub accept_any_cert: bool,
    #[serde(default)]
    pub auth: Credentials,
    #[serde(default = "default_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl Default for CiSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            accept_any_cert: false,
            auth: Credentials::default(),
            request_timeout_seconds: default_timeout_seconds(),
            tunnel: TunnelSettings::default(),
        }
    }
}

impl CiSettings {
    /// Returns true if an http(s) URL of the CI server is configured.
    pub fn has_connection(&self) -> bool {
        let url = self.url.to_ascii_lowercase();
        (url.starts_with("http://") && url.len() > "http://".len())
            || (url.starts_with("https://") && url.len() > "https://".len())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateOnServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_max_unreachable")]
    pub max_unreachable: u32,
    #[serde(default = "default_heartbeat_seconds")]
    pub interval_seconds: u64,
}

impl Default for StateOnServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: default_max_failures(),
            max_unreachable: default_max_unreachable(),
            interval_seconds: default_heartbeat_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleMonitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ConsoleMonitorSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default)]
    pub state_on_server: StateOnServerSettings,
    #[serde(default)]
    pub console: ConsoleMonitorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicRestartSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub only_when_idle: bool,
    #[serde(default = "default_periodic_hours")]
    pub interval_hours: u64,
}

impl Default for PeriodicRestartSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            only_when_idle: true,
            interval_hours: default_periodic_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutOfMemoryRestartSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub only_when_idle: bool,
}

impl Default for OutOfMemoryRestartSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            only_when_idle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSettings {
    #[serde(default)]
    pub handle_reconnects: bool,
    #[serde(default = "default_sleep_on_failure")]
    pub sleep_on_failure_seconds: u64,
    #[serde(default)]
    pub periodic: PeriodicRestartSettings,
    #[serde(default)]
    pub out_of_memory: OutOfMemoryRestartSettings,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            handle_reconnects: false,
            sleep_on_failure_seconds: default_sleep_on_failure(),
            periodic: PeriodicRestartSettings::default(),
            out_of_memory: OutOfMemoryRestartSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_client_name")]
    pub name: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub pass_auth: bool,
    #[serde(default)]
    pub create_if_missing: bool,
    #[serde(default = "default_java")]
    pub java: PathBuf,
    #[serde(default = "default_jar")]
    pub jar: PathBuf,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub restart: RestartSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            secret_key: String::new(),
            pass_auth: false,
            create_if_missing: false,
            java: default_java(),
            jar: default_jar(),
            monitoring: MonitoringSettings::default(),
            restart: RestartSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceFullGcSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub only_when_idle: bool,
    #[serde(default = "default_gc_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub idle_interval_minutes: u64,
}

impl Default for ForceFullGcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            only_when_idle: true,
            interval_minutes: default_gc_minutes(),
            idle_interval_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaSettings {
    #[serde(default = "default_java_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub max_memory: String,
    #[serde(default)]
    pub force_full_gc: ForceFullGcSettings,
}

impl Default for JavaSettings {
    fn default() -> Self {
        Self {
            args: default_java_args(),
            max_memory: String::new(),
            force_full_gc: ForceFullGcSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default = "default_restart_tokens")]
    pub restart_tokens: Vec<String>,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            restart_tokens: default_restart_tokens(),
        }
    }
}

impl ConsoleSettings {
    /// Returns true if `line` contains any of the restart trigger tokens.
    pub fn is_restart_triggered(&self, line: &str) -> bool {
        self.restart_tokens
            .iter()
            .any(|token| !token.is_empty() && line.contains(token.as_str()))
    }
}

/// Settings of the `ssh-server` run mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshServerSettings {
    #[serde(default = "default_ssh_server_address")]
    pub address: String,
    #[serde(default = "default_ssh_server_port")]
    pub port: u16,
    #[serde(default = "default_ssh_server_auth")]
    pub auth: Credentials,
    /// Private host key, searched in `id_ed25519`/`id_rsa` and `~/.ssh` when empty.
    #[serde(default)]
    pub host_key: Option<PathBuf>,
    /// Lets authenticated clients open `direct-tcpip` channels (`ssh -L`).
    #[serde(default)]
    pub allow_tcp_forwarding: bool,
}

impl Default for SshServerSettings {
    fn default() -> Self {
        Self {
            address: default_ssh_server_address(),
            port: default_ssh_server_port(),
            auth: default_ssh_server_auth(),
            host_key: None,
            allow_tcp_forwarding: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
        }
    }
}

/// Values produced at runtime by preparers, never persisted.
#[derive(Debug, Clone, Default)]
pub struct RuntimeArgs {
    /// JVM options added by preparers (e.g. the out-of-memory hook).
    pub java_args: Vec<String>,
    /// Agent options added by preparers, e.g. `-tunnel` -> `127.0.0.1:40000`.
    pub connect_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_run_mode")]
    pub run_mode: String,

    #[serde(default)]
    pub ci: CiSettings,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub java: JavaSettings,

    #[serde(default)]
    pub console: ConsoleSettings,

    #[serde(default)]
    pub ssh_server: SshServerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(skip)]
    pub runtime: RuntimeArgs,
}

fn default_version() -> u32 {
    1
}

fn default_run_mode() -> String {
    crate::constants::DEFAULT_RUN_MODE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_heartbeat_seconds() -> u64 {
    15
}

fn default_ssh_server_address() -> String {
    "0.0.0.0".to_string()
}

fn default_ssh_server_port() -> u16 {
    2022
}

fn default_ssh_server_auth() -> Credentials {
    Credentials {
        user: "ssh".to_string(),
        password: "changeit".to_string(),
    }
}

fn default_max_failures() -> u32 {
    2
}

fn default_max_unreachable() -> u32 {
    6
}

fn default_periodic_hours() -> u64 {
    48
}

fn default_sleep_on_failure() -> u64 {
    30
}

fn default_gc_minutes() -> u64 {
    5
}

fn default_client_name() -> String {
    hostname()
}

fn default_java() -> PathBuf {
    PathBuf::from(if cfg!(windows) { "java.exe" } else { "java" })
}

fn default_jar() -> PathBuf {
    PathBuf::from(crate::constants::CLIENT_JAR_NAME)
}

fn default_java_args() -> Vec<String> {
    [
        "-Xms10m",
        "-XX:GCTimeRatio=8",
        "-XX:+ClassUnloading",
        "-XX:+UseMaximumCompactionOnSystemGC",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_restart_tokens() -> Vec<String> {
    [
        "java.lang.OutOfMemoryError",
        "I/O error in channel channel",
        "The server rejected the connection",
        "java.net.SocketTimeoutException",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_log_directory() -> PathBuf {
    crate::constants::default_log_directory()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_default()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            run_mode: default_run_mode(),
            ci: CiSettings::default(),
            client: ClientSettings::default(),
            java: JavaSettings::default(),
            console: ConsoleSettings::default(),
            ssh_server: SshServerSettings::default(),
            logging: LoggingSettings::default(),
            runtime: RuntimeArgs::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.version == 1,
            "Unsupported config version: {}. Expected version 1",
            self.version
        );
        ensure!(!self.run_mode.trim().is_empty(), "Run mode cannot be empty");

        if !self.ci.url.is_empty() {
            url::Url::parse(&self.ci.url)
                .with_context(|| format!("Invalid CI url: {}", self.ci.url))?;
        }

        let ssh = &self.ci.tunnel.ssh;
        ensure!(ssh.port != 0, "SSH tunnel port must not be 0");
        ensure!(
            ssh.heartbeat_seconds > 0,
            "SSH tunnel heartbeat interval must be at least 1 second"
        );

        ensure!(
            !self.ssh_server.address.trim().is_empty(),
            "SSH server listen address cannot be empty"
        );

        let state = &self.client.monitoring.state_on_server;
        ensure!(
            state.interval_seconds > 0,
            "Node monitoring interval must be at least 1 second"
        );
        ensure!(
            state.max_failures > 0,
            "Node monitoring max failures must be at least 1, got: {}",
            state.max_failures
        );

        Ok(())
    }

    /// Returns the `-Xmx` value, if one is configured.
    pub fn max_memory_arg(&self) -> Option<String> {
        let value = self.java.max_memory.trim();
        (!value.is_empty()).then(|| format!("-Xmx{}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validate_default() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validate_invalid_version() {
        let config = Config {
            version: 999,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported config version")
        );
    }

    #[test]
    fn test_config_validate_invalid_url() {
        let mut config = Config::default();
        config.ci.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_zero_ssh_port() {
        let mut config = Config::default();
        config.ci.tunnel.ssh.port = 0;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("port must not be 0"));
    }

    #[test]
    fn test_ssh_server_defaults_and_validation() {
        let settings: SshServerSettings = serde_yaml::from_str("port: 2200").unwrap();
        assert_eq!(settings.address, "0.0.0.0");
        assert_eq!(settings.port, 2200);
        assert_eq!(settings.auth.user, "ssh");
        assert!(!settings.allow_tcp_forwarding);

        let mut config = Config::default();
        config.ssh_server.address = " ".to_string();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("listen address"));
    }

    #[test]
    fn test_has_ci_connection() {
        let mut ci = CiSettings::default();
        assert!(!ci.has_connection());
        ci.url = "http://".to_string();
        assert!(!ci.has_connection());
        ci.url = "HTTPS://jenkins/ci".to_string();
        assert!(ci.has_connection());
        ci.url = "ftp://jenkins".to_string();
        assert!(!ci.has_connection());
    }

    #[test]
    fn test_restart_token_match() {
        let console = ConsoleSettings::default();
        assert!(console.is_restart_triggered("Exception: java.lang.OutOfMemoryError: heap"));
        assert!(!console.is_restart_triggered("INFO: Connected"));
    }

    #[test]
    fn test_empty_token_never_matches() {
        let console = ConsoleSettings {
            restart_tokens: vec![String::new()],
        };
        assert!(!console.is_restart_triggered("anything"));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let config = shared(Config::default());

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let config = config.clone();
            tasks.spawn(async move {
                update_config(&config, |c| {
                    c.runtime
                        .connect_args
                        .insert(format!("-arg{}", i), i.to_string());
                });
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(config.load().runtime.connect_args.len(), 16);
    }

    #[test]
    fn test_max_memory_arg() {
        let mut config = Config::default();
        assert!(config.max_memory_arg().is_none());
        config.java.max_memory = "512m".to_string();
        assert_eq!(config.max_memory_arg().as_deref(), Some("-Xmx512m"));
    }
}
