//! The `ssh-server` mode: a small password-protected SSH endpoint on the build machine.
//!
//! Clients get an echoing console whose input is written to the launcher log. With
//! `allow_tcp_forwarding` they may also open `direct-tcpip` channels (`ssh -L`). The mode is
//! `Started` while the listener accepts connections and `Stopped` once it closed.

use super::{Lifecycle, Mode};
use crate::ci::CiClient;
use crate::config::{SharedConfig, SshServerSettings};
use crate::errors::{self, ModeError};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::KeyPair;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const SSH_SERVER_MODE_NAME: &str = "ssh-server";

const GROUP: &str = "ssh-server";

const PROMPT: &[u8] = b"> ";

const HOST_KEY_FILES: [&str; 2] = ["id_ed25519", "id_rsa"];

/// Where a host key is looked for: the configured file only, or the working directory
/// followed by the user's `.ssh` directory.
fn host_key_candidates(settings: &SshServerSettings) -> Vec<PathBuf> {
    if let Some(path) = &settings.host_key {
        return vec![path.clone()];
    }

    let mut candidates: Vec<PathBuf> = HOST_KEY_FILES.iter().map(PathBuf::from).collect();
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let ssh_dir = PathBuf::from(home).join(".ssh");
        candidates.extend(HOST_KEY_FILES.iter().map(|name| ssh_dir.join(name)));
    }
    candidates
}

/// Loads the first existing candidate. A key that exists but cannot be read is an error,
/// later candidates are not tried.
pub fn load_host_key(settings: &SshServerSettings) -> Result<KeyPair> {
    for path in host_key_candidates(settings) {
        if !path.exists() {
            continue;
        }
        let key = russh_keys::load_secret_key(&path, None)
            .with_context(|| errors::ssh_server::unreadable_host_key(&path))?;
        tracing::info!(group = GROUP, "Using SSH host key {}", path.display());
        return Ok(key);
    }
    Err(anyhow!(errors::ssh_server::NO_HOST_KEY))
}

fn server_config(key: KeyPair) -> server::Config {
    server::Config {
        methods: MethodSet::PASSWORD,
        auth_rejection_time: Duration::from_secs(1),
        keys: vec![key],
        ..Default::default()
    }
}

/// One client connection.
struct ConsoleSession {
    peer: SocketAddr,
    settings: Arc<SshServerSettings>,
    consoles: HashMap<ChannelId, LineEditor>,
    token: CancellationToken,
}

impl ConsoleSession {
    fn new(peer: SocketAddr, settings: Arc<SshServerSettings>, token: CancellationToken) -> Self {
        Self {
            peer,
            settings,
            consoles: HashMap::new(),
            token,
        }
    }
}

/// Input state of one console channel.
#[derive(Debug, Default)]
struct LineEditor {
    line: Vec<u8>,
    after_cr: bool,
}

/// What a chunk of console input produced.
#[derive(Debug, Default, PartialEq)]
struct Edit {
    echo: Vec<u8>,
    completed: Vec<String>,
    hangup: bool,
}

impl LineEditor {
    fn feed(&mut self, data: &[u8]) -> Edit {
        let mut edit = Edit::default();

        for &byte in data {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                // "\r\n" from line-mode clients ends one line, not two.
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    edit.completed
                        .push(String::from_utf8_lossy(&self.line).into_owned());
                    self.line.clear();
                    edit.echo.extend_from_slice(b"\r\n");
                    edit.echo.extend_from_slice(PROMPT);
                }
                0x08 | 0x7f => {
                    if self.line.pop().is_some() {
                        edit.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                0x03 | 0x04 => {
                    edit.hangup = true;
                    break;
                }
                _ => {
                    self.line.push(byte);
                    edit.echo.push(byte);
                }
            }
        }

        edit
    }
}

#[async_trait]
impl server::Handler for ConsoleSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let auth = &self.settings.auth;
        if user == auth.user && password == auth.password {
            tracing::info!(group = GROUP, "{} authenticated as '{}'", self.peer, user);
            Ok(Auth::Accept)
        } else {
            tracing::warn!(group = GROUP, "Rejected password of '{}' from {}", user, self.peer);
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.consoles.insert(channel.id(), LineEditor::default());
        Ok(true)
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.channel_success(channel);
        session.data(channel, CryptoVec::from_slice(PROMPT));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::info!(
            group = GROUP,
            "Refused command '{}' from {}",
            String::from_utf8_lossy(data),
            self.peer
        );
        session.channel_failure(channel);
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let Some(console) = self.consoles.get_mut(&channel) else {
            return Ok(());
        };

        let edit = console.feed(data);
        for input in &edit.completed {
            tracing::info!(group = GROUP, "INPUT-SSH [{}]: {}", self.peer, input);
        }
        if !edit.echo.is_empty() {
            session.data(channel, CryptoVec::from_slice(&edit.echo));
        }
        if edit.hangup {
            self.consoles.remove(&channel);
            session.close(channel);
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.consoles.remove(&channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.settings.allow_tcp_forwarding {
            tracing::info!(
                group = GROUP,
                "Refused forwarding to {}:{} from {}",
                host_to_connect,
                port_to_connect,
                self.peer
            );
            return Ok(false);
        }
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };

        let host = host_to_connect.to_string();
        let token = self.token.child_token();
        tokio::spawn(async move {
            let mut target = match TcpStream::connect((host.as_str(), port)).await {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!(group = GROUP, "Forwarding to {}:{} failed: {}", host, port, e);
                    return;
                }
            };
            let mut stream = channel.into_stream();
            tokio::select! {
                _ = token.cancelled() => {}
                result = tokio::io::copy_bidirectional(&mut stream, &mut target) => {
                    if let Err(e) = result {
                        tracing::debug!(group = GROUP, "Forwarding to {}:{} ended: {}", host, port, e);
                    }
                }
            }
        });
        Ok(true)
    }
}

#[derive(Default)]
pub struct ServerMode {
    lifecycle: Arc<Lifecycle>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl ServerMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// The address the current run listens on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }
}

async fn run_session(
    config: Arc<server::Config>,
    socket: TcpStream,
    peer: SocketAddr,
    handler: ConsoleSession,
    token: CancellationToken,
) {
    let session = match server::run_stream(config, socket, handler).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(group = GROUP, "SSH handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let handle = session.handle();
    tokio::select! {
        _ = token.cancelled() => {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, String::new(), "en".to_string())
                .await;
        }
        result = session => {
            if let Err(e) = result {
                tracing::debug!(group = GROUP, "SSH session with {} ended: {}", peer, e);
            }
        }
    }
}

async fn serve(
    lifecycle: Arc<Lifecycle>,
    listener: TcpListener,
    config: Arc<server::Config>,
    settings: Arc<SshServerSettings>,
) {
    let token = CancellationToken::new();
    lifecycle.mark_started();

    loop {
        tokio::select! {
            _ = lifecycle.stop_requested() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(group = GROUP, "Incoming SSH connection from {}", peer);
                    let handler = ConsoleSession::new(peer, settings.clone(), token.child_token());
                    tokio::spawn(run_session(config.clone(), socket, peer, handler, token.child_token()));
                }
                Err(e) => {
                    tracing::info!(
                        group = GROUP,
                        "Failed to accept next incoming SSH connection, assuming connection was closed: {}",
                        e
                    );
                    break;
                }
            }
        }
    }

    token.cancel();
    drop(listener);
    tracing::info!(group = GROUP, "SSH server stopped.");
    lifecycle.mark_stopped();
}

async fn execute(
    lifecycle: Arc<Lifecycle>,
    settings: SshServerSettings,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
) {
    let key = match load_host_key(&settings) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(group = GROUP, "{:#}", e);
            lifecycle.mark_stopped();
            return;
        }
    };

    let listener = match TcpListener::bind((settings.address.as_str(), settings.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(
                group = GROUP,
                "Failed to listen on {}:{}: {}",
                settings.address,
                settings.port,
                e
            );
            lifecycle.mark_stopped();
            return;
        }
    };

    let bound = listener.local_addr().ok();
    if let Ok(mut addr) = local_addr.lock() {
        *addr = bound;
    }
    tracing::info!(
        group = GROUP,
        "Listening for SSH connections @ {}",
        bound.map(|a| a.to_string()).unwrap_or_default()
    );

    serve(
        lifecycle,
        listener,
        Arc::new(server_config(key)),
        Arc::new(settings),
    )
    .await;
}

#[async_trait]
impl Mode for ServerMode {
    fn name(&self) -> &'static str {
        SSH_SERVER_MODE_NAME
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn is_config_acceptable(&self, config: &SharedConfig, _ci: &CiClient) -> bool {
        let snapshot = config.load_full();
        let settings = &snapshot.ssh_server;
        if !settings.auth.is_set() {
            tracing::error!(group = GROUP, "{}", errors::ssh_server::NO_CREDENTIALS);
            return false;
        }
        match load_host_key(settings) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(group = GROUP, "{:#}", e);
                false
            }
        }
    }

    fn start(&self, config: SharedConfig) -> Result<(), ModeError> {
        self.lifecycle.begin_start(self.name())?;
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = None;
        }

        let settings = config.load().ssh_server.clone();
        tokio::spawn(execute(
            self.lifecycle.clone(),
            settings,
            self.local_addr.clone(),
        ));
        Ok(())
    }
}
