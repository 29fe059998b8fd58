//! Tunnels the agent's HTTP and JNLP traffic through an SSH server.
//!
//! When the client mode starts, an SSH session is opened and two local listeners forward
//! connections to the CI server's HTTP endpoint and its JNLP port. The CI URL in the shared
//! configuration is rewritten to the local HTTP listener and the agent receives `-url` and
//! `-tunnel` arguments pointing at the two listeners. Everything is undone when the mode stops.
//!
//! A heartbeat detects a dead tunnel: a poller marks the connection alive whenever the node
//! status can be read through it, a ticker counts expected beats and stops the mode once
//! the two drift apart by more than one.

use super::{Environment, Preparer};
use crate::ci::CiClient;
use crate::config::{Config, SharedConfig, SshTunnelSettings, update_config};
use crate::errors::{self, FatalConfigurationError};
use crate::modes::client::CLIENT_MODE_NAME;
use crate::modes::{Mode, ModeListener, Status};
use crate::util::{AtomicCounter, AtomicFlag};
use anyhow::{Context, Result, anyhow, ensure};
use async_trait::async_trait;
use itertools::Itertools;
use regex::{Captures, Regex};
use russh::client;
use russh_keys::PublicKeyBase64;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

const GROUP: &str = "ssh-tunnel";

/// Agent option naming the local JNLP endpoint.
pub const TUNNEL_ARG: &str = "-tunnel";

/// Agent option naming the CI URL the agent talks HTTP to.
pub const URL_ARG: &str = "-url";

/// Fingerprint value that disables host key verification.
pub const ANY_FINGERPRINT: &str = "-";

static TUNNEL_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(<tunnel>)(.*?)(</tunnel>)").expect("valid tunnel pattern"));

static SELF_CLOSING_LAUNCHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(<launcher[^>]+?)(/>)").expect("valid launcher pattern")
});

static LAUNCHER_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(</launcher>)").expect("valid launcher pattern"));

/// MD5 over the wire encoding of a host key, as lowercase colon separated hex.
pub fn format_host_fingerprint(key_blob: &[u8]) -> String {
    md5::compute(key_blob)
        .0
        .iter()
        .map(|b| format!("{:02x}", b))
        .join(":")
}

/// Decides whether a host key with fingerprint `actual` may be trusted.
pub fn verify_fingerprint(host: &str, expected: &str, actual: &str) -> Result<(), String> {
    let expected = expected.trim().to_ascii_lowercase();
    if expected == ANY_FINGERPRINT || expected == actual {
        Ok(())
    } else if expected.is_empty() {
        Err(errors::tunnel::fingerprint_unknown(host, actual))
    } else {
        Err(errors::tunnel::fingerprint_mismatch(host, actual, &expected))
    }
}

/// The host and port to forward to for `url`, filling in the scheme's default port.
fn http_target(url: &Url) -> (String, u16) {
    let host = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => "localhost".to_string(),
    };
    (host, url.port_or_known_default().unwrap_or(80))
}

/// `host:port` of `url`, IPv6 hosts in brackets.
pub fn format_http_host_and_port(url: &Url) -> String {
    let port = url.port_or_known_default().unwrap_or(80);
    match url.host() {
        Some(host) => format!("{}:{}", host, port),
        None => format!("localhost:{}", port),
    }
}

/// Sets (or clears, with an empty address) the `<tunnel>` element of a node's launcher.
pub fn update_or_add_tunnel_address(node_config: &str, address: &str) -> String {
    if TUNNEL_ELEMENT.is_match(node_config) {
        return TUNNEL_ELEMENT
            .replace_all(node_config, |caps: &Captures| {
                format!("{}{}{}", &caps[1], address, &caps[3])
            })
            .into_owned();
    }

    if address.is_empty() {
        return node_config.to_string();
    }

    if SELF_CLOSING_LAUNCHER.is_match(node_config) {
        return SELF_CLOSING_LAUNCHER
            .replace(node_config, |caps: &Captures| {
                format!(
                    "{}>\n    <tunnel>{}</tunnel>\n  </launcher>",
                    &caps[1], address
                )
            })
            .into_owned();
    }

    LAUNCHER_END
        .replace(node_config, |caps: &Captures| {
            format!("  <tunnel>{}</tunnel>\n  {}", address, &caps[1])
        })
        .into_owned()
}

/// Counts heartbeats. `expected` advances with every tick, `last_alive` catches up whenever
/// the server answered through the tunnel.
#[derive(Debug, Default)]
pub struct Heartbeat {
    expected: AtomicCounter,
    last_alive: AtomicCounter,
}

impl Heartbeat {
    pub fn mark_alive(&self) {
        self.last_alive.set(self.expected.get());
    }

    /// Advances the expected counter and reports whether the tunnel should be considered dead.
    pub fn tick(&self) -> bool {
        let expected = self.expected.increment();
        (expected - self.last_alive.get()).abs() > 1
    }

    pub fn reset(&self) {
        self.expected.set(0);
        self.last_alive.set(0);
    }
}

pub(crate) struct HostKeyVerifier {
    host: String,
    expected: String,
    rejection: Arc<std::sync::Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = format_host_fingerprint(&server_public_key.public_key_bytes());
        match verify_fingerprint(&self.host, &self.expected, &actual) {
            Ok(()) => Ok(true),
            Err(reason) => {
                if let Ok(mut rejection) = self.rejection.lock() {
                    *rejection = Some(reason);
                }
                Ok(false)
            }
        }
    }
}

pub(crate) type Session = client::Handle<HostKeyVerifier>;

fn describe_connect_error(address: &str, error: russh::Error) -> anyhow::Error {
    match error {
        russh::Error::NoCommonKeyAlgo => anyhow!(errors::tunnel::unsupported_host_key(address)),
        e => anyhow!(e).context(format!("Failed connecting to {}", address)),
    }
}

pub(crate) async fn connect(ssh: &SshTunnelSettings) -> Result<Session> {
    let address = format!("{}:{}", ssh.address, ssh.port);
    let rejection = Arc::new(std::sync::Mutex::new(None));
    let verifier = HostKeyVerifier {
        host: address.clone(),
        expected: ssh.fingerprint.clone(),
        rejection: rejection.clone(),
    };

    let config = Arc::new(client::Config::default());
    let connecting = client::connect(config, (ssh.address.clone(), ssh.port), verifier);
    let mut session = match tokio::time::timeout(ssh.connect_timeout(), connecting)
        .await
        .with_context(|| format!("Timed out connecting to {}", address))?
    {
        Ok(session) => session,
        Err(e) => {
            let rejected = rejection.lock().ok().and_then(|mut r| r.take());
            return Err(match rejected {
                Some(reason) => anyhow!(reason),
                None => describe_connect_error(&address, e),
            });
        }
    };

    let authenticated = session
        .authenticate_password(ssh.auth.user.clone(), ssh.auth.password.clone())
        .await
        .with_context(|| format!("SSH authentication with {} failed", address))?;
    ensure!(
        authenticated,
        errors::tunnel::auth_failed(&ssh.auth.user, &address)
    );

    Ok(session)
}

async fn pump(
    mut socket: TcpStream,
    peer: SocketAddr,
    session: Arc<Session>,
    host: String,
    port: u16,
    token: CancellationToken,
) {
    let channel = match session
        .channel_open_direct_tcpip(host.clone(), port as u32, peer.ip().to_string(), peer.port() as u32)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(group = GROUP, "Failed to open tunnel to {}:{}: {}", host, port, e);
            return;
        }
    };

    let mut remote = channel.into_stream();
    tokio::select! {
        _ = token.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut remote) => {
            if let Err(e) = result {
                tracing::debug!(group = GROUP, "Forwarding {} -> {}:{} ended: {}", peer, host, port, e);
            }
        }
    }
}

async fn accept_connections(
    listener: TcpListener,
    session: Arc<Session>,
    host: String,
    port: u16,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tokio::spawn(pump(socket, peer, session.clone(), host.clone(), port, token.child_token()));
                }
                Err(e) => {
                    tracing::info!(
                        group = GROUP,
                        "Failed accepting next incoming local connection, assuming connection was closed: {}",
                        e
                    );
                    break;
                }
            }
        }
    }
}

/// Something opened during setup that teardown must close.
enum TunnelResource {
    Session(Arc<Session>),
    Listener {
        address: SocketAddr,
        token: CancellationToken,
        task: JoinHandle<()>,
    },
}

impl TunnelResource {
    async fn close(self) {
        match self {
            TunnelResource::Session(session) => {
                if !session.is_closed()
                    && let Err(e) = session
                        .disconnect(russh::Disconnect::ByApplication, "", "en")
                        .await
                {
                    tracing::debug!(group = GROUP, "Disconnecting SSH session failed: {}", e);
                }
            }
            TunnelResource::Listener {
                address,
                token,
                task,
            } => {
                token.cancel();
                let _ = task.await;
                tracing::debug!(group = GROUP, "Closed local listener {}", address);
            }
        }
    }
}

async fn open_forwarding_listener(
    session: Arc<Session>,
    host: String,
    port: u16,
) -> Result<(SocketAddr, TunnelResource)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to open local tunnel listener")?;
    let address = listener.local_addr()?;
    let token = CancellationToken::new();

    tracing::info!(group = GROUP, "Forwarding {} -> {}:{}", address, host, port);
    let task = tokio::spawn(accept_connections(listener, session, host, port, token.clone()));

    Ok((
        address,
        TunnelResource::Listener {
            address,
            token,
            task,
        },
    ))
}

fn local_ci_url(original: &Url, local: SocketAddr) -> Result<String> {
    let mut url = original.clone();
    url.set_host(Some(&local.ip().to_string()))
        .context("Cannot rewrite CI url host")?;
    url.set_port(Some(local.port()))
        .map_err(|_| anyhow!("Cannot rewrite CI url port"))?;
    Ok(url.to_string())
}

#[derive(Default)]
struct TunnelState {
    resources: Vec<TunnelResource>,
    original_url: Option<String>,
    patched_node_config: bool,
}

/// Tunnel setup, teardown and heartbeat, driven by mode transitions.
#[derive(Default)]
pub struct SshTunnel {
    state: Mutex<TunnelState>,
    connected: AtomicFlag,
    heartbeat: Heartbeat,
    ci: OnceLock<Arc<CiClient>>,
}

impl SshTunnel {
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn applies_to(mode: &dyn Mode, config: &Config) -> bool {
        let ssh = &config.ci.tunnel.ssh;
        ssh.enabled
            && !ssh.address.is_empty()
            && mode.name() == CLIENT_MODE_NAME
            && config.ci.has_connection()
    }

    async fn setup(&self, config: &SharedConfig) {
        let mut state = self.state.lock().await;
        self.teardown_locked(&mut state, config).await;

        if let Err(e) = self.setup_locked(&mut state, config).await {
            tracing::error!(group = GROUP, "Failed establishing SSH tunnel: {:#}", e);
            self.teardown_locked(&mut state, config).await;
        }
    }

    async fn setup_locked(&self, state: &mut TunnelState, config: &SharedConfig) -> Result<()> {
        let snapshot = config.load_full();
        let ssh = &snapshot.ci.tunnel.ssh;
        let ci_url = Url::parse(&snapshot.ci.url)
            .with_context(|| errors::ci::invalid_url(&snapshot.ci.url))?;

        tracing::info!(group = GROUP, "Opening SSH tunnel to {}:{}", ssh.address, ssh.port);
        let session = Arc::new(connect(ssh).await?);
        state.resources.push(TunnelResource::Session(session.clone()));
        tracing::info!(
            group = GROUP,
            "Successfully connected with '{}:{}'.",
            ssh.address,
            ssh.port
        );

        let (http_host, http_port) = http_target(&ci_url);
        let (http_address, http) =
            open_forwarding_listener(session.clone(), http_host.clone(), http_port).await?;
        state.resources.push(http);
        let local_url = local_ci_url(&ci_url, http_address)?;

        state.original_url = Some(snapshot.ci.url.clone());
        update_config(config, |c| c.ci.url = local_url.clone());
        tracing::info!(
            group = GROUP,
            "CI url {} is reachable through {}",
            format_http_host_and_port(&ci_url),
            local_url
        );

        let ci = self.ci.get().context("Tunnel is not attached to a CI client")?;
        let jnlp_port = ci.jnlp_port().await?;

        let (jnlp_address, jnlp) = open_forwarding_listener(session, http_host, jnlp_port).await?;
        state.resources.push(jnlp);
        let jnlp_address = jnlp_address.to_string();

        update_config(config, |c| {
            c.runtime
                .connect_args
                .insert(TUNNEL_ARG.to_string(), jnlp_address.clone());
            c.runtime
                .connect_args
                .insert(URL_ARG.to_string(), local_url.clone());
        });

        if ssh.patch_node_config {
            apply_tunnel_address(ci, &jnlp_address).await?;
            state.patched_node_config = true;
        }

        self.heartbeat.reset();
        self.connected.set(true);
        tracing::info!(group = GROUP, "SSH tunnel established, JNLP via {}", jnlp_address);
        Ok(())
    }

    async fn teardown(&self, config: &SharedConfig) {
        let mut state = self.state.lock().await;
        self.teardown_locked(&mut state, config).await;
    }

    /// Closes everything setup opened, newest first, and restores the configuration.
    async fn teardown_locked(&self, state: &mut TunnelState, config: &SharedConfig) {
        if state.resources.is_empty() && state.original_url.is_none() && !self.connected.get() {
            return;
        }

        if state.patched_node_config {
            state.patched_node_config = false;
            if let Some(ci) = self.ci.get()
                && let Err(e) = apply_tunnel_address(ci, "").await
            {
                tracing::warn!(group = GROUP, "Failed resetting the node tunnel address: {:#}", e);
            }
        }

        while let Some(resource) = state.resources.pop() {
            resource.close().await;
        }

        self.heartbeat.reset();

        let original_url = state.original_url.take();
        update_config(config, |c| {
            if let Some(url) = &original_url {
                c.ci.url = url.clone();
            }
            c.runtime.connect_args.remove(TUNNEL_ARG);
            c.runtime.connect_args.remove(URL_ARG);
        });

        self.connected.set(false);
        tracing::info!(group = GROUP, "SSH tunnel closed.");
    }
}

async fn apply_tunnel_address(ci: &CiClient, address: &str) -> Result<()> {
    let current = ci.node_config().await?;
    let updated = update_or_add_tunnel_address(&current, address);
    if updated != current {
        ci.update_node_config(updated).await?;
    }
    Ok(())
}

#[async_trait]
impl ModeListener for SshTunnel {
    async fn on_mode_transition(&self, mode: &dyn Mode, next: Status, config: &SharedConfig) {
        if !Self::applies_to(mode, &config.load_full()) {
            return;
        }

        match next {
            Status::Starting => self.setup(config).await,
            Status::Stopped => self.teardown(config).await,
            _ => {}
        }
    }
}

/// Registers the tunnel as mode listener and runs the heartbeat.
pub struct SshTunnelEstablisher {
    tunnel: Arc<SshTunnel>,
}

impl Default for SshTunnelEstablisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTunnelEstablisher {
    pub fn new() -> Self {
        Self {
            tunnel: Arc::new(SshTunnel::default()),
        }
    }
}

async fn run_heartbeat_poller(tunnel: Arc<SshTunnel>, ci: Arc<CiClient>, interval: std::time::Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if !tunnel.is_connected() {
                    continue;
                }
                match ci.node_status().await {
                    Ok(_) => tunnel.heartbeat.mark_alive(),
                    Err(e) => tracing::debug!(group = GROUP, "Heartbeat through tunnel failed: {:#}", e),
                }
            }
        }
    }
}

async fn run_heartbeat_checker(tunnel: Arc<SshTunnel>, env: Arc<Environment>, interval: std::time::Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = env.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !tunnel.is_connected() {
                    continue;
                }
                if tunnel.heartbeat.tick() {
                    tracing::warn!(group = GROUP, "SSH tunnel heartbeat lost, restarting the client.");
                    env.mode.stop().await;
                }
            }
        }
    }
}

#[async_trait]
impl Preparer for SshTunnelEstablisher {
    fn name(&self) -> &'static str {
        "SSH tunnel"
    }

    fn is_config_acceptable(&self, config: &Config) -> bool {
        let ssh = &config.ci.tunnel.ssh;
        if !ssh.enabled {
            return false;
        }
        if ssh.address.is_empty() {
            tracing::error!(group = GROUP, "{}", errors::tunnel::ADDRESS_EMPTY);
            return false;
        }
        if !config.ci.has_connection() {
            tracing::error!(group = GROUP, "{}", errors::tunnel::NO_CI_URL);
            return false;
        }
        true
    }

    async fn configure(&self, env: &Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let _ = self.tunnel.ci.set(env.ci.clone());
        env.listeners.register(self.tunnel.clone());
        Ok(())
    }

    async fn prepare(&self, env: Arc<Environment>) -> Result<(), FatalConfigurationError> {
        let interval = env.config.load().ci.tunnel.ssh.heartbeat_interval();
        tokio::spawn(run_heartbeat_poller(
            self.tunnel.clone(),
            env.ci.clone(),
            interval,
            env.shutdown.child_token(),
        ));
        tokio::spawn(run_heartbeat_checker(self.tunnel.clone(), env.clone(), interval));
        Ok(())
    }
}
