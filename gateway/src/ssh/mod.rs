//! The russh side of the gateway. Clients log in as `upstream` or
//! `user+upstream` with a key allowed for that upstream; the gateway then
//! opens its own connection there and hands both to the relay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::keys::{compute_fingerprint_from_pubkey, AuthorizedKeys};

pub mod channel;
pub mod codec;
pub mod handler;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testkit;

pub use handler::ConnectionHandler;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,

    /// Keys allowed per upstream: the shared file plus the upstream's own.
    authorized: HashMap<String, AuthorizedKeys>,
}

impl ServerState {
    pub async fn new(config: Arc<GatewayConfig>) -> Result<Self> {
        let shared = match &config.authorized_keys {
            Some(path) => AuthorizedKeys::load(path).await?,
            None => AuthorizedKeys::default(),
        };
        Ok(Self::with_shared_keys(config, shared))
    }

    fn with_shared_keys(config: Arc<GatewayConfig>, shared: AuthorizedKeys) -> Self {
        let mut authorized = HashMap::new();
        for (name, upstream) in &config.upstreams {
            let mut keys = shared.clone();
            keys.extend(AuthorizedKeys::from_lines(
                upstream.authorized_keys.iter().map(String::as_str),
            ));
            if keys.is_empty() {
                warn!("No keys may use upstream '{}'", name);
            } else {
                info!("{} keys authorized for upstream '{}'", keys.len(), name);
            }
            authorized.insert(name.clone(), keys);
        }
        Self { config, authorized }
    }

    pub fn is_authorized(&self, upstream: &str, public_key: &str) -> bool {
        self.authorized
            .get(upstream)
            .is_some_and(|keys| keys.contains(public_key))
    }
}

/// Accept clients on the configured address until the listener fails.
pub async fn run_server(config: Arc<GatewayConfig>) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key(&config.host_key_path).await?],
        ..Default::default()
    });
    let state = Arc::new(ServerState::new(config).await?);

    let listener = TcpListener::bind(addr).await?;
    info!("Accepting SSH clients on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(serve(russh_config.clone(), state.clone(), stream, peer));
    }
}

/// Run one client connection to completion.
pub async fn serve<S>(russh_config: Arc<russh::server::Config>, state: Arc<ServerState>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = ConnectionHandler::new(state, peer);
    let session = match russh::server::run_stream(russh_config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, "SSH handshake failed: {}", e);
            return;
        }
    };
    if let Err(e) = session.await {
        warn!(%peer, "SSH session ended with error: {}", e);
    }
}

/// The gateway's host key, created on first start.
async fn host_key(path: &Path) -> Result<PrivateKey> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to read host key {}", path.display()))?;
        info!(fingerprint = %compute_fingerprint_from_pubkey(key.public_key()), "Using host key {}", path.display());
        return Ok(key);
    }

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context("Failed to generate host key")?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, pem.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    info!(fingerprint = %compute_fingerprint_from_pubkey(key.public_key()), "Created host key {}", path.display());
    Ok(key)
}
