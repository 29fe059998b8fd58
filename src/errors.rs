use thiserror::Error;

/// Raised by a mode when a lifecycle command does not fit its current status.
#[derive(Debug, Error)]
pub enum ModeError {
    #[error("Cannot start mode '{mode}' whose status is {status}, expected None or Stopped")]
    InvalidTransition { mode: String, status: String },

    #[error("The configured mode '{0}' is not implemented")]
    UnknownMode(String),
}

/// A configuration problem that must end the process before the restart loop is entered.
#[derive(Debug, Error)]
#[error("{component} rejected the configuration: {reason}")]
pub struct FatalConfigurationError {
    pub component: String,
    pub reason: String,
}

impl FatalConfigurationError {
    pub fn new(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

pub mod mode {
    pub fn rejected_config(name: &str) -> String {
        format!(
            "The configured mode '{}' does not accept the current configuration",
            name
        )
    }

    pub const NO_CI_URL: &str = "No CI server URL defined. Cannot connect to the CI server.";

    pub fn no_secret(node: &str) -> String {
        format!(
            "No secret key set for node {} and the attempt to fetch it from the CI server failed.",
            node
        )
    }
}

pub mod ssh_server {
    pub const NO_CREDENTIALS: &str =
        "SSH server mode needs a user and a password in 'ssh_server.auth'.";

    pub const NO_HOST_KEY: &str = "No SSH host key found. Configure 'ssh_server.host_key' or place an id_ed25519 or id_rsa key in the working directory or ~/.ssh.";

    pub fn unreadable_host_key(path: &std::path::Path) -> String {
        format!("Failed to load SSH host key from {}", path.display())
    }
}

pub mod tunnel {
    pub const ADDRESS_EMPTY: &str = "SSH tunnel is enabled but SSH server address is empty.";
    pub const NO_CI_URL: &str =
        "No CI server URL defined. SSH tunnel settings are not enough to connect to the CI server.";

    pub fn fingerprint_unknown(host: &str, actual: &str) -> String {
        format!(
            "The host fingerprint of '{}' is '{}'. Please add this to the configuration in order to connect.",
            host, actual
        )
    }

    pub fn fingerprint_mismatch(host: &str, actual: &str, expected: &str) -> String {
        format!(
            "The host fingerprint of '{}' is '{}' while '{}' was expected. Connection aborted.",
            host, actual, expected
        )
    }

    pub fn unsupported_host_key(address: &str) -> String {
        format!(
            "'{}' offers no host key type this launcher supports (ed25519 or ECDSA). RSA-only servers are not supported.",
            address
        )
    }

    pub fn auth_failed(user: &str, address: &str) -> String {
        format!("SSH authentication failed for user '{}' on '{}'", user, address)
    }

    pub fn no_jnlp_port(status: &str) -> String {
        format!(
            "The CI server did not provide the JNLP port, the reply was {}.",
            status
        )
    }
}

pub mod ci {
    pub fn request_failed(path: &str, status: &str) -> String {
        format!("Request to '{}' failed with {}", path, status)
    }

    pub fn invalid_url(url: &str) -> String {
        format!("Invalid CI server URL: {}", url)
    }

    pub const DESCRIPTOR_WITHOUT_ARGUMENTS: &str =
        "The agent descriptor served by the CI server has no <application-desc> element.";
}

pub mod config {
    pub fn validation_failed(context: &str) -> String {
        format!("Config validation failed for {}", context)
    }

    pub fn corrupted(backup_path: &str, error: &str) -> String {
        format!(
            "Config file was corrupted and has been replaced with defaults. Backup saved to {}. Error: {}",
            backup_path, error
        )
    }

    pub fn corrupted_yaml(path: &str, error: &str) -> String {
        format!("Corrupted YAML config at {}: {}", path, error)
    }

    pub fn backup_created(path: &str) -> String {
        format!("Created backup of corrupted config at {}", path)
    }

    pub fn failed_to_create_default(path: &str) -> String {
        format!("Failed to create default config at {}", path)
    }

    pub fn failed_to_read(path: &str) -> String {
        format!("Failed to read config from {}", path)
    }

    pub fn failed_to_serialize() -> String {
        "Failed to serialize config to YAML".to_string()
    }

    pub fn failed_to_create_dir(error: &str) -> String {
        format!("Failed to create config directory: {}", error)
    }

    pub fn failed_to_write_temp(path: &str) -> String {
        format!("Failed to write temporary config to {}", path)
    }

    pub fn failed_to_rename(from: &str, to: &str) -> String {
        format!("Failed to rename {} to {}", from, to)
    }

    #[cfg(unix)]
    pub const FAILED_TO_OPEN_TEMP: &str = "Failed to open temp file for fsync";
    #[cfg(unix)]
    pub const FAILED_TO_FSYNC: &str = "Failed to fsync temp file";
}

pub mod disk {
    pub const FULL: &str =
        "Disk space exhausted. Cannot save configuration. Free up disk space and try again.";
}

pub mod process {
    pub fn spawn_failed(error: &str) -> String {
        format!("Failed to spawn CI client process: {}", error)
    }

    pub fn not_found(path: &str) -> String {
        format!(
            "Executable not found at {}. Please verify the java path configuration.",
            path
        )
    }

    pub fn permission_denied(path: &str) -> String {
        format!(
            "Permission denied executing {}. Check file permissions.",
            path
        )
    }

    pub const FAILED_TO_CAPTURE_STDOUT: &str = "Failed to capture stdout";
    pub const FAILED_TO_CAPTURE_STDERR: &str = "Failed to capture stderr";
}

pub mod working_dir {
    pub fn not_a_directory(path: &str) -> String {
        format!(
            "{} is not a directory, cannot change working directory, stopping here to prevent any damage.",
            path
        )
    }

    pub fn failed_to_create(path: &str) -> String {
        format!(
            "Failed creating working directory {}, stopping here to prevent any damage.",
            path
        )
    }

    pub fn failed_to_change(path: &str) -> String {
        format!("Failed changing working directory to {}", path)
    }
}
