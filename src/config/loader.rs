use crate::config::Config;
use crate::errors;
use anyhow::Context;
use std::path::Path;
use tokio::fs;

/// Prefix of environment variables that override file values, e.g. `LAUNCHER__CI__URL`.
pub const ENV_PREFIX: &str = "LAUNCHER";

/// Loads the configuration at `path`, creating it with defaults when missing.
///
/// A file that is not valid YAML is backed up next to the original and replaced with defaults.
pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let default_config = Config::default();
            save_config(path, &default_config).await.with_context(|| {
                errors::config::failed_to_create_default(&path.display().to_string())
            })?;
            tracing::info!("Created default configuration at {}", path.display());
            return apply_env_overrides("");
        }
        Err(e) => {
            return Err(e)
                .with_context(|| errors::config::failed_to_read(&path.display().to_string()));
        }
    };

    if let Err(parse_error) = serde_yaml::from_str::<Config>(&contents) {
        tracing::error!(
            "{}",
            errors::config::corrupted_yaml(&path.display().to_string(), &parse_error.to_string())
        );

        let backup_path = path.with_extension("yaml.bak");
        if let Err(e) = fs::copy(path, &backup_path).await {
            tracing::warn!("Failed to create backup of corrupted config: {}", e);
        } else {
            tracing::info!(
                "{}",
                errors::config::backup_created(&backup_path.display().to_string())
            );
        }

        save_config(path, &Config::default()).await.with_context(|| {
            format!(
                "Failed to create new config after corruption at {}",
                path.display()
            )
        })?;

        return Err(anyhow::anyhow!(errors::config::corrupted(
            &backup_path.display().to_string(),
            &parse_error.to_string()
        )));
    }

    let config = apply_env_overrides(&contents)?;
    config.validate().with_context(|| {
        errors::config::validation_failed(&path.display().to_string())
    })?;

    Ok(config)
}

/// Layers `LAUNCHER__*` environment variables on top of the YAML document.
fn apply_env_overrides(yaml: &str) -> anyhow::Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to merge configuration sources")?;

    settings
        .try_deserialize::<Config>()
        .context("Failed to deserialize configuration")
}

// Atomic write with temp file
pub async fn save_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let yaml_content =
        serde_yaml::to_string(config).context(errors::config::failed_to_serialize())?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .await
        .with_context(|| errors::config::failed_to_create_dir(&parent.display().to_string()))?;

    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, yaml_content.as_bytes())
        .await
        .with_context(|| errors::config::failed_to_write_temp(&tmp_path.display().to_string()))
        .map_err(|e| {
            if e.to_string().contains("No space left on device")
                || e.to_string().contains("disk full")
            {
                anyhow::anyhow!(errors::disk::FULL)
            } else {
                e
            }
        })?;

    #[cfg(unix)]
    {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .context(errors::config::FAILED_TO_OPEN_TEMP)?;
        file.sync_all().await.context(errors::config::FAILED_TO_FSYNC)?;
    }

    fs::rename(&tmp_path, path).await.with_context(|| {
        errors::config::failed_to_rename(
            &tmp_path.display().to_string(),
            &path.display().to_string(),
        )
    })?;

    Ok(())
}
