use super::{Environment, Preparer};
use crate::config::{Config, update_config};
use crate::errors::FatalConfigurationError;
use async_trait::async_trait;
use std::sync::Arc;

const GROUP: &str = "naming";

/// Finds the node name the CI server knows this machine by and creates the node if allowed.
pub struct NodeNameHandler;

/// Picks the registered node matching `client_name`: an exact (case-insensitive) match wins,
/// otherwise a node named `client_name.` followed by a domain.
pub fn pick_node_name(client_name: &str, registered: &[String]) -> Option<String> {
    let wanted = client_name.to_lowercase();
    let mut prefixed = None;

    for candidate in registered {
        let name = candidate.to_lowercase();
        if name == wanted {
            return Some(candidate.clone());
        }
        if !wanted.is_empty() && name.starts_with(&format!("{}.", wanted)) {
            prefixed = Some(candidate.clone());
        }
    }

    prefixed
}

async fn verify_node_name(env: &Environment) -> anyhow::Result<bool> {
    let registered = env.ci.registered_nodes().await?;
    let client_name = env.config.load().client.name.clone();

    match pick_node_name(&client_name, &registered) {
        Some(name) => {
            if name != client_name {
                update_config(&env.config, |c| c.client.name = name.clone());
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn create_node(env: &Environment) -> anyhow::Result<()> {
    let name = env.config.load().client.name.clone();
    let remote_fs = std::env::current_dir()?.display().to_string();
    env.ci.create_node(&name, &remote_fs).await
}

#[async_trait]
impl Preparer for NodeNameHandler {
    fn name(&self) -> &'static str {
        "node name normalizer"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        config.ci.has_connection()
    }

    async fn configure(&self, env: &Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let mut found = match verify_node_name(env).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(group = GROUP, "Failed to verify the client node name: {:#}", e);
                return Ok(());
            }
        };

        let config = env.config.load_full();
        if !found {
            if config.client.create_if_missing {
                match create_node(env).await {
                    Ok(()) => tracing::info!(group = GROUP, "Created node '{}'.", config.client.name),
                    Err(e) => tracing::warn!(
                        group = GROUP,
                        "Tried to create node '{}' but failed: {:#}",
                        config.client.name,
                        e
                    ),
                }
                found = verify_node_name(env).await.unwrap_or(false);
            } else {
                tracing::info!(
                    group = GROUP,
                    "Will not create node '{}'. Enable this with '--create' or 'client.create_if_missing'.",
                    config.client.name
                );
            }
        }

        let name = env.config.load().client.name.clone();
        if found {
            tracing::info!(group = GROUP, "Found client node name, using '{}'.", name);
        } else {
            tracing::warn!(
                group = GROUP,
                "Client node name '{}' was NOT FOUND on the CI server. Likely the next operations will fail.",
                name
            );
        }
        Ok(())
    }

    async fn prepare(&self, _env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        Ok(())
    }
}
