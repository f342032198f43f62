//! Real SSH connections for exercising the russh bridge: a scripted
//! upstream server on a loopback socket and a gateway served over an
//! in-memory stream.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{client, Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::net::TcpListener;

use crate::config::{GatewayConfig, RelayConfig, UpstreamConfig};
use crate::keys::{public_key_to_openssh, AuthorizedKeys};
use crate::ssh::{serve, ServerState};

/// `env` requests for this variable are refused.
pub const REFUSED_ENV: &str = "REFUSED";
/// Port reported for `tcpip-forward` on port 0.
pub const BOUND_PORT: u32 = 4242;
/// `tcpip-forward` on this port is refused.
pub const DENIED_PORT: u32 = 1;

const WAIT: Duration = Duration::from_secs(5);

pub fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// What the scripted upstream was asked to do, in order.
#[derive(Clone, Default)]
pub struct Seen(Arc<Mutex<Vec<String>>>);

impl Seen {
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }

    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }
}

/// Accepts any key, then:
/// - refuses `env` for [`REFUSED_ENV`]
/// - answers `exec` with "out" on stdout, "err" on stderr and status 3
/// - echoes `shell` input and exits 0 on EOF
/// - binds port 0 forwards to [`BOUND_PORT`], refuses [`DENIED_PORT`]
/// - refuses `direct-tcpip`
struct ScriptedUpstream {
    seen: Seen,
}

impl server::Handler for ScriptedUpstream {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, _public_key: &PublicKey) -> Result<Auth, Self::Error> {
        self.seen.push(format!("login {user}"));
        Ok(Auth::Accept)
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.seen.push(format!("direct-tcpip {host_to_connect}:{port_to_connect}"));
        Ok(false)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.seen.push(format!("env {variable_name}={variable_value}"));
        if variable_name == REFUSED_ENV {
            session.channel_failure(channel)
        } else {
            session.channel_success(channel)
        }
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        self.seen.push(format!("exec {}", String::from_utf8_lossy(data)));
        session.channel_success(channel)?;
        session.data(channel, CryptoVec::from_slice(b"out"))?;
        session.extended_data(channel, 1, CryptoVec::from_slice(b"err"))?;
        session.exit_status_request(channel, 3)?;
        session.eof(channel)?;
        session.close(channel)
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(data))
    }

    async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.exit_status_request(channel, 0)?;
        session.eof(channel)?;
        session.close(channel)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        self.seen.push(format!("tcpip-forward {address}:{port}"));
        match *port {
            DENIED_PORT => Ok(false),
            0 => {
                *port = BOUND_PORT;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        self.seen.push(format!("cancel-tcpip-forward {address}:{port}"));
        Ok(true)
    }
}

/// Start a scripted upstream on a loopback port.
pub async fn spawn_upstream() -> (SocketAddr, Seen) {
    let config = Arc::new(server::Config {
        inactivity_timeout: None,
        auth_rejection_time: Duration::from_millis(10),
        keys: vec![random_key()],
        ..Default::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Seen::default();

    let log = seen.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = ScriptedUpstream { seen: log.clone() };
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });
    (addr, seen)
}

/// Upstream settings for `addr`, with a fresh gateway identity in `dir`.
pub fn upstream_config(addr: SocketAddr, dir: &Path) -> UpstreamConfig {
    let identity_file = dir.join("gateway_id_ed25519");
    let pem = random_key().to_openssh(LineEnding::LF).unwrap();
    std::fs::write(&identity_file, pem.as_bytes()).unwrap();
    UpstreamConfig {
        address: addr.to_string(),
        identity_file,
        ..Default::default()
    }
}

pub struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A gateway serving one upstream named `test`.
pub struct TestGateway {
    state: Arc<ServerState>,
    russh_config: Arc<server::Config>,
}

impl TestGateway {
    /// `client_key` is the only key allowed to use the upstream.
    pub fn new(mut upstream: UpstreamConfig, client_key: &PrivateKey, relay: RelayConfig) -> Self {
        upstream.authorized_keys = vec![public_key_to_openssh(client_key.public_key())];
        let mut config = GatewayConfig {
            relay,
            ..Default::default()
        };
        config.upstreams.insert("test".to_string(), upstream);

        let state = ServerState::with_shared_keys(Arc::new(config), AuthorizedKeys::default());
        let russh_config = server::Config {
            inactivity_timeout: None,
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![random_key()],
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
            russh_config: Arc::new(russh_config),
        }
    }

    /// Open a client connection over an in-memory stream.
    pub async fn connect(&self) -> client::Handle<TestClient> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:50022".parse().unwrap();
        tokio::spawn(serve(self.russh_config.clone(), self.state.clone(), server_io, peer));
        let config = Arc::new(client::Config::default());
        client::connect_stream(config, client_io, TestClient).await.unwrap()
    }

    /// Connect and authenticate as `user`. Returns whether the gateway
    /// let the client in.
    pub async fn login(&self, user: &str, key: &PrivateKey) -> (client::Handle<TestClient>, bool) {
        let mut handle = self.connect().await;
        let key = PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None);
        let auth = handle.authenticate_publickey(user, key).await.unwrap();
        (handle, auth.success())
    }
}

/// What a client saw on one channel until it closed.
#[derive(Debug, Default)]
pub struct Transcript {
    pub replies: Vec<bool>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
    pub eof: bool,
}

impl Transcript {
    pub async fn record(channel: &mut russh::Channel<client::Msg>) -> Self {
        let mut transcript = Self::default();
        while let Some(msg) = next_message(channel).await {
            match msg {
                ChannelMsg::Success => transcript.replies.push(true),
                ChannelMsg::Failure => transcript.replies.push(false),
                ChannelMsg::Data { data } => transcript.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => transcript.stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => transcript.exit_status = Some(exit_status),
                ChannelMsg::Eof => transcript.eof = true,
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        transcript
    }
}

/// The next message on `channel`, skipping window updates.
pub async fn next_message(channel: &mut russh::Channel<client::Msg>) -> Option<ChannelMsg> {
    loop {
        let msg = tokio::time::timeout(WAIT, channel.wait())
            .await
            .expect("channel went quiet");
        if !matches!(msg, Some(ChannelMsg::WindowAdjusted { .. })) {
            return msg;
        }
    }
}
