use crate::config::ConsoleSettings;
use crate::errors;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const GROUP: &str = "client";

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Options whose following value must never show up in logs.
fn is_sensitive_option(arg: &str) -> bool {
    let arg = arg.to_ascii_lowercase();
    arg.starts_with('-')
        && (arg.contains("auth") || arg.contains("credentials") || arg.contains("password"))
}

/// Renders a command line for logging, masking values that follow credential options.
pub fn filtered_command_line(program: &Path, args: &[String]) -> Vec<String> {
    let mut filtered = Vec::with_capacity(args.len() + 1);
    filtered.push(program.display().to_string());

    let mut mask_next = false;
    for arg in args {
        if mask_next {
            filtered.push("***".to_string());
            mask_next = false;
        } else {
            mask_next = is_sensitive_option(arg);
            filtered.push(arg.clone());
        }
    }
    filtered
}

pub fn spawn_client_process(program: &Path, args: &[String]) -> Result<Child> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        let path = program.display().to_string();
        match e.kind() {
            std::io::ErrorKind::NotFound => anyhow::anyhow!(errors::process::not_found(&path)),
            std::io::ErrorKind::PermissionDenied => {
                anyhow::anyhow!(errors::process::permission_denied(&path))
            }
            _ => anyhow::anyhow!(errors::process::spawn_failed(&e.to_string())),
        }
    })?;

    Ok(child)
}

/// Watches console lines for restart tokens and fires `on_restart` once per matching line.
#[derive(Clone)]
pub struct ConsoleScanner {
    console: Arc<ConsoleSettings>,
    enabled: bool,
    on_restart: Arc<dyn Fn() + Send + Sync>,
}

impl ConsoleScanner {
    pub fn new(
        console: ConsoleSettings,
        enabled: bool,
        on_restart: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            console: Arc::new(console),
            enabled,
            on_restart: Arc::new(on_restart),
        }
    }

    pub fn inspect(&self, line: &str) -> bool {
        if !self.enabled || !self.console.is_restart_triggered(line) {
            return false;
        }
        tracing::warn!(group = GROUP, "Restart token found in console output: {}", line);
        (self.on_restart)();
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "STDOUT",
            Stream::Stderr => "STDERR",
        }
    }
}

type SharedLog = Arc<Mutex<BufWriter<tokio::fs::File>>>;

async fn forward_lines<R, W>(
    reader: R,
    mut echo: W,
    stream: Stream,
    scanner: ConsoleScanner,
    log: SharedLog,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // JVM consoles are not always UTF-8, so lines are decoded lossily.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(['\n', '\r']);
                scanner.inspect(line);

                let _ = echo.write_all(format!("{}\n", line).as_bytes()).await;
                let _ = echo.flush().await;

                let timestamp =
                    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
                let log_line = format!("[{}] [{}] {}\n", timestamp, stream.label(), line);
                if let Err(e) = log.lock().await.write_all(log_line.as_bytes()).await {
                    tracing::error!(group = GROUP, "Failed writing client console log: {}", e);
                }
            }
            Err(e) => {
                tracing::error!(group = GROUP, "Error reading {}: {}", stream.label(), e);
                break;
            }
        }
    }
}

/// Takes stdout/stderr of `child` and forwards them line by line to the launcher's own
/// console and to a per-run log file, feeding every line through `scanner`.
///
/// The returned task completes once both streams are closed.
pub async fn redirect_console_output(
    child: &mut Child,
    name: &str,
    log_directory: &PathBuf,
    scanner: ConsoleScanner,
) -> Result<(PathBuf, JoinHandle<()>)> {
    let pid = child.id().unwrap_or_default();
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_path = log_directory.join(format!("{}-{}-{}.log", sanitize_filename(name), pid, timestamp));

    tokio::fs::create_dir_all(log_directory)
        .await
        .with_context(|| format!("Failed to create log directory {}", log_directory.display()))?;

    let log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

    let stdout = child
        .stdout
        .take()
        .context(errors::process::FAILED_TO_CAPTURE_STDOUT)?;
    let stderr = child
        .stderr
        .take()
        .context(errors::process::FAILED_TO_CAPTURE_STDERR)?;

    let log: SharedLog = Arc::new(Mutex::new(BufWriter::new(log_file)));
    let log_path_clone = log_path.clone();

    let task = tokio::spawn(async move {
        tokio::join!(
            forward_lines(
                stdout,
                tokio::io::stdout(),
                Stream::Stdout,
                scanner.clone(),
                log.clone()
            ),
            forward_lines(stderr, tokio::io::stderr(), Stream::Stderr, scanner, log.clone()),
        );

        if let Err(e) = log.lock().await.flush().await {
            tracing::error!(
                group = GROUP,
                "Failed to flush {}: {}",
                log_path_clone.display(),
                e
            );
        }
    });

    Ok((log_path, task))
}
