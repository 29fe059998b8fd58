// CI Client Launcher
// Keeps a CI build agent connected: prepares the environment, runs the agent and restarts it.

use anyhow::{Context, Result};
use ci_launcher::ci::CiClient;
use ci_launcher::config::{self, Config};
use ci_launcher::constants::{APP_NAME, CONFIG_FILE_NAME};
use ci_launcher::environment::{Environment, PreparerRegistry};
use ci_launcher::errors;
use ci_launcher::launcher::{self, Launcher};
use ci_launcher::modes::ModeRegistry;
use ci_launcher::modes::mock::MOCK_MODE_NAME;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ci_launcher")]
#[command(about = "Launcher that keeps a CI build agent connected to its server")]
struct Args {
    #[arg(long, help = "Path to the configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Working directory, created if missing")]
    directory: Option<PathBuf>,

    #[arg(long, help = "Mode to run (client, mock, ssh-server)")]
    run_mode: Option<String>,

    #[arg(long, help = "URL of the CI server")]
    url: Option<String>,

    #[arg(long, help = "Node name of this client on the CI server")]
    name: Option<String>,

    #[arg(long, help = "Secret key of the node")]
    secret: Option<String>,

    #[arg(long, help = "Create the node on the CI server if it is missing")]
    create: bool,

    #[arg(long, help = "Accept any TLS certificate of the CI server")]
    any_cert: bool,

    #[arg(long, help = "Save the command line overrides into the configuration file")]
    persist: bool,

    #[arg(long, help = "Log to stdout as JSON")]
    json: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(run_mode) = &self.run_mode {
            config.run_mode = run_mode.clone();
        }
        if let Some(url) = &self.url {
            config.ci.url = url.clone();
        }
        if let Some(name) = &self.name {
            config.client.name = name.clone();
        }
        if let Some(secret) = &self.secret {
            config.client.secret_key = secret.clone();
        }
        if self.create {
            config.client.create_if_missing = true;
        }
        if self.any_cert {
            config.ci.accept_any_cert = true;
        }
        if std::env::var("LAUNCHER_MOCK").is_ok() {
            config.run_mode = MOCK_MODE_NAME.to_string();
        }
    }
}

fn setup_tracing(log_directory: &Path, json: bool) -> Result<()> {
    std::fs::create_dir_all(log_directory).context("Failed to create log directory")?;

    let file_appender = tracing_appender::rolling::daily(log_directory, "launcher.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().compact().with_writer(std::io::stdout))
            .init();
    }

    std::mem::forget(_guard);

    Ok(())
}

fn handle_working_directory(directory: &Path) -> Result<()> {
    let display = directory.display().to_string();
    if directory.exists() {
        anyhow::ensure!(
            directory.is_dir(),
            errors::working_dir::not_a_directory(&display)
        );
    } else {
        std::fs::create_dir_all(directory)
            .with_context(|| errors::working_dir::failed_to_create(&display))?;
    }
    std::env::set_current_dir(directory)
        .with_context(|| errors::working_dir::failed_to_change(&display))
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(directory) = &args.directory {
        handle_working_directory(directory)?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    let mut loaded = runtime.block_on(config::loader::load_config(&config_path))?;
    args.apply_overrides(&mut loaded);
    loaded.validate()?;

    setup_tracing(&loaded.logging.directory, args.json).context("Failed to initialize tracing")?;

    tracing::info!("{} starting", APP_NAME);
    tracing::info!("Config path: {}", config_path.display());

    let persist = args.persist;
    let result = runtime.block_on(async move {
        let config = config::shared(loaded);
        let ci = Arc::new(CiClient::new(config.clone())?);
        let modes = ModeRegistry::with_defaults();
        let mode = modes.get(&config.load().run_mode)?;
        tracing::info!("Running mode '{}' (available: {})", mode.name(), modes.names().join(", "));

        let env = Arc::new(Environment::new(config.clone(), ci, mode));
        let launcher = Launcher::new(env.clone(), PreparerRegistry::with_defaults());

        launcher::spawn_signal_handler(&env);

        let prepared = launcher.prepare().await;

        if persist {
            let snapshot = config.load_full();
            config::loader::save_config(&config_path, &snapshot).await?;
            tracing::info!("Saved configuration to {}", config_path.display());
        }

        prepared?;

        launcher::spawn_keyboard_listener(&env);
        launcher.run().await?;

        tracing::info!("{} stopped", APP_NAME);
        Ok::<_, anyhow::Error>(())
    });

    // The keyboard listener may still block on stdin.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    result
}
