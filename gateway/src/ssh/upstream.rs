//! The gateway's sessions as seen by the relay: the outbound connection to
//! an upstream server, and the client connection for channels the
//! upstream opens back towards the client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{client, server, ChannelOpenFailure, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::error::{OpenFailureReason, RelayError, Result};
use crate::keys::compute_fingerprint_from_pubkey;
use crate::lifetime::Lifetime;
use crate::request::Reply;
use crate::ssh::channel::{bridge, ChannelSide, IncomingChannel, RusshChannel};
use crate::ssh::codec::{u32_payload, ForwardRequest, TcpipEndpoints};
use crate::transport::{NewChannel, OpenedChannel, Session};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Channels an upstream server opens towards the client.
pub type ForwardedChannels = mpsc::Receiver<IncomingChannel<client::Msg>>;

/// An authenticated connection to an upstream server.
pub struct Upstream {
    /// Locked for the length of each call, as russh needs `&mut` to
    /// request a port forward.
    handle: Mutex<client::Handle<UpstreamHandler>>,
    depth: usize,
    gone: Lifetime,
}

impl Upstream {
    /// Connect to `upstream` and log in as `user` with its identity file.
    pub async fn connect(
        name: &str,
        upstream: &UpstreamConfig,
        user: &str,
        depth: usize,
    ) -> anyhow::Result<(Self, ForwardedChannels)> {
        let stream = TcpStream::connect(upstream.address.as_str())
            .await
            .with_context(|| format!("Failed to connect to upstream {} at {}", name, upstream.address))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(upstream = %name, "Cannot disable Nagle: {}", e);
        }
        Self::connect_stream(name, upstream, user, depth, stream).await
    }

    /// Log in over an already connected stream.
    pub async fn connect_stream<S>(
        name: &str,
        upstream: &UpstreamConfig,
        user: &str,
        depth: usize,
        stream: S,
    ) -> anyhow::Result<(Self, ForwardedChannels)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });

        let (forwarded_tx, forwarded_rx) = mpsc::channel(depth);
        let gone = Lifetime::new();
        let handler = UpstreamHandler {
            name: name.to_string(),
            expected_fingerprint: upstream.host_key_fingerprint.clone(),
            forwarded: forwarded_tx,
            depth,
            gone: gone.clone(),
        };

        let mut handle = client::connect_stream(config, stream, handler)
            .await
            .with_context(|| format!("SSH handshake with upstream {} failed", name))?;

        let key = russh::keys::load_secret_key(&upstream.identity_file, None).with_context(|| {
            format!("Failed to load identity file {}", upstream.identity_file.display())
        })?;
        let hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        let auth = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
            .await
            .with_context(|| format!("Authentication to upstream {} failed", name))?;
        if !auth.success() {
            return Err(anyhow!("Upstream {} rejected the gateway key for user '{}'", name, user));
        }

        info!(upstream = %name, user = %user, "Connected to upstream");
        let connected = Self {
            handle: Mutex::new(handle),
            depth,
            gone,
        };
        Ok((connected, forwarded_rx))
    }

    /// Cancelled with a reason once the upstream connection has ended.
    pub fn lifetime(&self) -> &Lifetime {
        &self.gone
    }
}

impl Session for Upstream {
    type Channel = RusshChannel;

    // russh always asks for a reply to the forwarding requests it sends.
    async fn send_global_request(&self, kind: &str, _want_reply: bool, payload: &Bytes) -> Result<Reply> {
        match kind {
            "tcpip-forward" => {
                let req = ForwardRequest::decode(payload)?;
                let mut handle = self.handle.lock().await;
                match handle.tcpip_forward(req.address, req.port).await {
                    Ok(bound) if req.port == 0 => Ok(Reply::accepted(u32_payload(bound))),
                    Ok(_) => Ok(Reply::accepted(Bytes::new())),
                    Err(russh::Error::RequestDenied) => Ok(Reply::rejected()),
                    Err(e) => Err(RelayError::transport(e)),
                }
            }
            "cancel-tcpip-forward" => {
                let req = ForwardRequest::decode(payload)?;
                let handle = self.handle.lock().await;
                match handle.cancel_tcpip_forward(req.address, req.port).await {
                    Ok(()) => Ok(Reply::accepted(Bytes::new())),
                    Err(russh::Error::RequestDenied) => Ok(Reply::rejected()),
                    Err(e) => Err(RelayError::transport(e)),
                }
            }
            other => {
                debug!(kind = %other, "No upstream mapping for global request");
                Ok(Reply::rejected())
            }
        }
    }

    async fn open_channel(&self, channel_type: &str, extra_data: &Bytes) -> Result<OpenedChannel<RusshChannel>> {
        let handle = self.handle.lock().await;
        let opened = match channel_type {
            "session" => handle.channel_open_session().await,
            "direct-tcpip" => {
                let to = TcpipEndpoints::decode(extra_data)?;
                handle
                    .channel_open_direct_tcpip(to.host, to.port, to.originator_address, to.originator_port)
                    .await
            }
            other => return Err(unknown_channel_type(other)),
        };
        drop(handle);
        let channel = opened.map_err(open_error)?;
        Ok(bridge(channel, ChannelSide::Upstream, self.depth).0)
    }

    async fn close(&self) {
        let _ = self
            .handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "client disconnected", "en")
            .await;
    }
}

/// russh client callbacks for one upstream connection.
pub struct UpstreamHandler {
    name: String,
    expected_fingerprint: Option<String>,
    forwarded: mpsc::Sender<IncomingChannel<client::Msg>>,
    depth: usize,
    gone: Lifetime,
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        self.gone.cancel_with("upstream disconnected");
    }
}

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = compute_fingerprint_from_pubkey(server_public_key);
        match &self.expected_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(
                    upstream = %self.name,
                    expected = %expected,
                    actual = %fingerprint,
                    "Upstream host key mismatch"
                );
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                info!(upstream = %self.name, fingerprint = %fingerprint, "Accepting upstream host key");
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            upstream = %self.name,
            "Forwarded connection to {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let extra_data = TcpipEndpoints {
            host: connected_address.to_string(),
            port: connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        }
        .encode();
        let incoming = IncomingChannel::confirmed(
            channel,
            ChannelSide::Upstream,
            "forwarded-tcpip",
            extra_data,
            self.depth,
        );
        if let Err(mpsc::error::SendError(incoming)) = self.forwarded.send(incoming).await {
            let _ = incoming
                .reject(OpenFailureReason::AdministrativelyProhibited, "client not connected")
                .await;
        }
        Ok(())
    }
}

/// The client connection, used to open the channels an upstream server
/// forwards back to the client.
pub struct Downstream {
    handle: server::Handle,
    depth: usize,
}

impl Downstream {
    pub fn new(handle: server::Handle, depth: usize) -> Self {
        Self { handle, depth }
    }
}

impl Session for Downstream {
    type Channel = RusshChannel;

    async fn send_global_request(&self, kind: &str, _want_reply: bool, _payload: &Bytes) -> Result<Reply> {
        debug!(kind = %kind, "Not relaying global request to client");
        Ok(Reply::rejected())
    }

    async fn open_channel(&self, channel_type: &str, extra_data: &Bytes) -> Result<OpenedChannel<RusshChannel>> {
        if channel_type != "forwarded-tcpip" {
            return Err(unknown_channel_type(channel_type));
        }
        let from = TcpipEndpoints::decode(extra_data)?;
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(from.host, from.port, from.originator_address, from.originator_port)
            .await
            .map_err(open_error)?;
        Ok(bridge(channel, ChannelSide::Downstream(self.handle.clone()), self.depth).0)
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "upstream disconnected".into(), "en".into())
            .await;
    }
}

fn unknown_channel_type(channel_type: &str) -> RelayError {
    RelayError::OpenRefused {
        reason: OpenFailureReason::UnknownChannelType,
        message: format!("unsupported channel type {}", channel_type),
    }
}

/// Turn a failed russh channel open into a refusal the source can be
/// given verbatim, or a transport error.
pub fn open_error(err: russh::Error) -> RelayError {
    match err {
        russh::Error::ChannelOpenFailure(failure) => {
            let reason = match failure {
                ChannelOpenFailure::AdministrativelyProhibited => OpenFailureReason::AdministrativelyProhibited,
                ChannelOpenFailure::ConnectFailed => OpenFailureReason::ConnectFailed,
                ChannelOpenFailure::UnknownChannelType => OpenFailureReason::UnknownChannelType,
                ChannelOpenFailure::ResourceShortage => OpenFailureReason::ResourceShortage,
                ChannelOpenFailure::Unknown => OpenFailureReason::Other(0),
            };
            RelayError::OpenRefused {
                reason,
                message: reason.to_string(),
            }
        }
        other => RelayError::transport(other),
    }
}
