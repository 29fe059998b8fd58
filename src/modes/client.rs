//! Runs the CI agent (`java -jar agent.jar -jnlpUrl ...`) as a child process.

use super::process::{self, ConsoleScanner};
use super::{Lifecycle, Mode};
use crate::ci::{self, CiClient, xml_escape, xml_unescape};
use crate::config::{Config, SharedConfig, update_config};
use crate::constants::{AGENT_DESCRIPTOR_FILE_NAME, CONSOLE_RESTART_DELAY, KILL_GRACE_PERIOD};
use crate::errors::{self, ModeError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use itertools::Itertools;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

pub const CLIENT_MODE_NAME: &str = "client";

const GROUP: &str = "client";

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

static APPLICATION_DESC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(<application-desc[^>]*>)(.*?)(</application-desc>)")
        .expect("valid application-desc pattern")
});

static ARGUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<argument>(.*?)</argument>").expect("valid argument pattern"));

#[derive(Default)]
pub struct ClientMode {
    lifecycle: Arc<Lifecycle>,
}

impl ClientMode {
    pub fn new() -> Self {
        Self::default()
    }
}

fn node_jnlp_url(config: &Config) -> String {
    format!(
        "{}/computer/{}/slave-agent.jnlp",
        config.ci.url.trim_end_matches('/'),
        ci::encode_path_segment(&config.client.name)
    )
}

/// Rewrites the agent arguments of a JNLP descriptor.
///
/// Every argument named in `overrides` is dropped together with the value following it, then
/// all overrides are appended as name/value pairs. Returns `None` when the descriptor has no
/// `<application-desc>` element.
pub fn customize_agent_descriptor(
    descriptor: &str,
    overrides: &BTreeMap<String, String>,
) -> Option<String> {
    let captures = APPLICATION_DESC.captures(descriptor)?;
    let whole = captures.get(0)?;

    let mut current = ARGUMENT
        .captures_iter(&captures[2])
        .map(|argument| xml_unescape(argument[1].trim()));
    let mut arguments = Vec::new();
    while let Some(argument) = current.next() {
        if overrides.contains_key(&argument) {
            current.next();
        } else {
            arguments.push(argument);
        }
    }
    arguments.extend(
        overrides
            .iter()
            .flat_map(|(name, value)| [name.clone(), value.clone()]),
    );

    let body: String = arguments
        .iter()
        .map(|argument| format!("\n    <argument>{}</argument>", xml_escape(argument)))
        .collect();

    Some(format!(
        "{}{}{}\n  {}{}",
        &descriptor[..whole.start()],
        &captures[1],
        body,
        &captures[3],
        &descriptor[whole.end()..]
    ))
}

/// Fetches the node's descriptor, applies the connect args and writes it into `directory`.
async fn write_agent_descriptor(
    config: &SharedConfig,
    overrides: &BTreeMap<String, String>,
    directory: &Path,
) -> Result<PathBuf> {
    let ci = CiClient::new(config.clone())?;
    let descriptor = ci.agent_descriptor().await?;
    let customized = customize_agent_descriptor(&descriptor, overrides)
        .context(errors::ci::DESCRIPTOR_WITHOUT_ARGUMENTS)?;

    let path = directory.join(AGENT_DESCRIPTOR_FILE_NAME);
    tokio::fs::write(&path, customized)
        .await
        .with_context(|| format!("Failed writing {}", path.display()))?;
    Ok(path)
}

async fn discard_agent_descriptor(descriptor: Option<PathBuf>) {
    if let Some(path) = descriptor
        && let Err(e) = tokio::fs::remove_file(&path).await
    {
        tracing::debug!(group = GROUP, "Cannot remove {}: {}", path.display(), e);
    }
}

/// Assembles the agent command line from the configuration snapshot.
///
/// With a customized `descriptor` the secret and the connect args are already part of it and
/// are left off the command line.
pub fn build_command_line(config: &Config, descriptor: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = config.runtime.java_args.clone();
    args.extend(config.java.args.iter().cloned());
    args.extend(config.max_memory_arg());

    args.push("-jar".to_string());
    args.push(config.client.jar.display().to_string());
    args.push("-jnlpUrl".to_string());
    match descriptor {
        Some(path) => args.push(format!("file:{}", path.display())),
        None => args.push(node_jnlp_url(config)),
    }

    let pass_credentials = config.client.pass_auth && config.ci.auth.is_set();

    if descriptor.is_none() && !config.client.secret_key.is_empty() && !pass_credentials {
        args.push("-secret".to_string());
        args.push(config.client.secret_key.clone());
    }

    if config.ci.accept_any_cert {
        args.push("-noCertificateCheck".to_string());
    }

    if config.client.restart.handle_reconnects {
        args.push("-noReconnect".to_string());
    }

    if pass_credentials {
        let credentials = format!("{}:{}", config.ci.auth.user, config.ci.auth.password);
        args.push("-auth".to_string());
        args.push(credentials.clone());
        args.push("-jnlpCredentials".to_string());
        args.push(credentials);
    }

    if descriptor.is_none() {
        for (key, value) in &config.runtime.connect_args {
            args.push(key.clone());
            args.push(value.clone());
        }
    }

    args
}

async fn execute(lifecycle: Arc<Lifecycle>, config: SharedConfig) {
    let snapshot = config.load_full();

    let descriptor = if snapshot.runtime.connect_args.is_empty() {
        None
    } else {
        match write_agent_descriptor(&config, &snapshot.runtime.connect_args, Path::new(".")).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(
                    group = GROUP,
                    "Failed creating customized agent descriptor, passing connect options on the command line: {:#}",
                    e
                );
                None
            }
        }
    };

    let args = build_command_line(&snapshot, descriptor.as_deref());
    let java = snapshot.client.java.clone();

    tracing::info!(
        group = GROUP,
        "Starting: {}",
        process::filtered_command_line(&java, &args).iter().join(" ")
    );

    let mut child = match process::spawn_client_process(&java, &args) {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(group = GROUP, "{:#}", e);
            discard_agent_descriptor(descriptor).await;
            lifecycle.mark_stopped();
            return;
        }
    };

    let on_restart = {
        let lifecycle = lifecycle.clone();
        move || {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CONSOLE_RESTART_DELAY).await;
                lifecycle.stop().await;
            });
        }
    };
    let scanner = ConsoleScanner::new(
        snapshot.console.clone(),
        snapshot.client.monitoring.console.enabled,
        on_restart,
    );

    let redirect = match process::redirect_console_output(
        &mut child,
        &snapshot.client.name,
        &snapshot.logging.directory,
        scanner,
    )
    .await
    {
        Ok((log_path, task)) => {
            tracing::debug!(group = GROUP, "Client console is logged to {}", log_path.display());
            Some(task)
        }
        Err(e) => {
            tracing::error!(group = GROUP, "Cannot redirect client console: {:#}", e);
            None
        }
    };

    lifecycle.mark_started();

    tokio::select! {
        result = child.wait() => {
            match result {
                Ok(status) if status.success() => {
                    tracing::info!(group = GROUP, "Client process ended.");
                }
                Ok(status) => {
                    tracing::warn!(group = GROUP, "Client process quit with {}", status);
                }
                Err(e) => {
                    tracing::error!(group = GROUP, "Error waiting for the client process: {}", e);
                }
            }
        }
        _ = lifecycle.stop_requested() => {
            let pid = child.id();
            match child.start_kill() {
                Ok(()) => tracing::info!(group = GROUP, "Sent kill signal to client process {:?}", pid),
                Err(e) => tracing::warn!(group = GROUP, "Failed to kill client process {:?}: {}", pid, e),
            }

            match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(group = GROUP, "Client process {:?} exited with {}", pid, status);
                }
                Ok(Err(e)) => {
                    tracing::error!(group = GROUP, "Error waiting for client process {:?}: {}", pid, e);
                }
                Err(_) => {
                    tracing::warn!(group = GROUP, "Client process {:?} did not exit within timeout", pid);
                }
            }
            tokio::time::sleep(KILL_GRACE_PERIOD).await;
        }
    }

    if let Some(task) = redirect
        && tokio::time::timeout(KILL_TIMEOUT, task).await.is_err()
    {
        tracing::debug!(group = GROUP, "Console redirect still busy after the client ended");
    }

    discard_agent_descriptor(descriptor).await;
    lifecycle.mark_stopped();
}

#[async_trait]
impl Mode for ClientMode {
    fn name(&self) -> &'static str {
        CLIENT_MODE_NAME
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn is_config_acceptable(&self, config: &SharedConfig, ci: &CiClient) -> bool {
        let snapshot = config.load_full();
        if !snapshot.ci.has_connection() {
            tracing::error!(group = GROUP, "{}", errors::mode::NO_CI_URL);
            return false;
        }

        if !snapshot.client.secret_key.is_empty() {
            return true;
        }

        match ci.fetch_secret().await {
            Ok(Some(secret)) => {
                tracing::info!(group = GROUP, "Fetched the secret key of node {}", snapshot.client.name);
                update_config(config, |c| c.client.secret_key = secret.clone());
                true
            }
            result => {
                if let Err(e) = result {
                    tracing::debug!(group = GROUP, "Fetching secret failed: {:#}", e);
                }
                if snapshot.client.pass_auth && snapshot.ci.auth.is_set() {
                    return true;
                }
                tracing::error!(group = GROUP, "{}", errors::mode::no_secret(&snapshot.client.name));
                false
            }
        }
    }

    fn start(&self, config: SharedConfig) -> Result<(), ModeError> {
        self.lifecycle.begin_start(self.name())?;
        tokio::spawn(execute(self.lifecycle.clone(), config));
        Ok(())
    }
}
