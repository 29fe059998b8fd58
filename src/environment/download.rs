use super::{Environment, Preparer};
use crate::ci::CiClient;
use crate::config::{Config, SharedConfig};
use crate::errors::FatalConfigurationError;
use crate::modes::client::CLIENT_MODE_NAME;
use crate::modes::{Mode, ModeListener, Status};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;

const GROUP: &str = "download";

const CLIENT_JAR_PATH: &str = "jnlpJars/agent.jar";

/// Keeps the local agent jar in sync with the CI server before every client start.
pub struct ClientJarDownloader {
    listener: Arc<JarRefresher>,
}

impl Default for ClientJarDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientJarDownloader {
    pub fn new() -> Self {
        Self {
            listener: Arc::new(JarRefresher::default()),
        }
    }
}

#[derive(Default)]
struct JarRefresher {
    ci: OnceLock<Arc<CiClient>>,
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".download");
    target.with_file_name(name)
}

fn last_modified(response: &reqwest::Response) -> Option<std::time::SystemTime> {
    let value = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)?
        .to_str()
        .ok()?;
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(std::time::SystemTime::from)
}

/// Downloads the jar into `target` unless the server reports the local copy as current.
/// Returns whether a new file was written.
pub async fn download_client_jar(ci: &CiClient, target: &Path) -> Result<bool> {
    let local_modified = tokio::fs::metadata(target)
        .await
        .ok()
        .and_then(|meta| meta.modified().ok());

    let Some(mut response) = ci.download(CLIENT_JAR_PATH, local_modified).await? else {
        return Ok(false);
    };
    let modified = last_modified(&response);

    let temp = temp_path(target);
    let mut file = tokio::fs::File::create(&temp)
        .await
        .with_context(|| format!("Failed to create {}", temp.display()))?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(modified) = modified {
        let std_file = std::fs::File::options().write(true).open(&temp)?;
        if let Err(e) = std_file.set_modified(modified) {
            tracing::debug!(group = GROUP, "Cannot set modification time: {}", e);
        }
    }

    tokio::fs::rename(&temp, target)
        .await
        .with_context(|| format!("Failed to move {} to {}", temp.display(), target.display()))?;
    Ok(true)
}

#[async_trait]
impl ModeListener for JarRefresher {
    async fn on_mode_transition(&self, mode: &dyn Mode, next: Status, config: &SharedConfig) {
        let snapshot = config.load_full();
        if next != Status::Starting
            || mode.name() != CLIENT_MODE_NAME
            || !snapshot.ci.has_connection()
        {
            return;
        }
        let Some(ci) = self.ci.get() else {
            return;
        };

        let jar = &snapshot.client.jar;
        match download_client_jar(ci, jar).await {
            Ok(true) => tracing::info!(group = GROUP, "Downloaded {}", jar.display()),
            Ok(false) => tracing::debug!(group = GROUP, "{} is up to date", jar.display()),
            Err(e) if jar.exists() => {
                tracing::warn!(group = GROUP, "Failed to update {}: {:#}", jar.display(), e)
            }
            Err(e) => tracing::error!(
                group = GROUP,
                "Failed to download {}, the client cannot start: {:#}",
                jar.display(),
                e
            ),
        }
    }
}

#[async_trait]
impl Preparer for ClientJarDownloader {
    fn name(&self) -> &'static str {
        "client jar downloader"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        config.ci.has_connection()
    }

    async fn configure(&self, env: &Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let _ = self.listener.ci.set(env.ci.clone());
        env.listeners.register(self.listener.clone());
        Ok(())
    }

    async fn prepare(&self, _env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        Ok(())
    }
}
