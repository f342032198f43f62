//! Per-connection russh server handler.
//!
//! Authenticates the client against the upstream it asked for, connects
//! that upstream and then feeds everything the client does into the
//! relay: global requests, channel opens and channel requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Pty, Sig};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::keys::{compute_fingerprint_from_pubkey, parse_ssh_username, public_key_to_openssh};
use crate::lifetime::Lifetime;
use crate::relay::{forward_channels, forward_global_requests, RelayContext};
use crate::request::{ChannelRequest, GlobalRequest, Reply, RequestKind};
use crate::ssh::channel::{ChannelSide, Decision, IncomingChannel};
use crate::ssh::codec::{
    read_u32_payload, sig_name, string_payload, ForwardRequest, PtyRequest, TcpipEndpoints, WindowChange,
    X11Request,
};
use crate::ssh::upstream::{Downstream, ForwardedChannels, Upstream};
use crate::ssh::ServerState;
use crate::wire::env_payload;

/// How long channels get to flush after the upstream went away.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream a client asked for and the user to log in there as.
#[derive(Debug, Clone)]
struct Target {
    name: String,
    user: String,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Set once the client's key was verified and the upstream connected.
    target: Option<Target>,
    upstream: Option<Arc<Upstream>>,

    /// Channels the upstream forwards back, until the relay takes them.
    forwarded: Option<ForwardedChannels>,

    /// Relay inputs, present after authentication.
    global_tx: Option<mpsc::Sender<GlobalRequest>>,
    channel_tx: Option<mpsc::Sender<IncomingChannel<Msg>>>,

    /// Request queues of the client's accepted channels.
    channels: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,

    lifetime: Lifetime,
}

impl ConnectionHandler {
    pub fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            target: None,
            upstream: None,
            forwarded: None,
            global_tx: None,
            channel_tx: None,
            channels: HashMap::new(),
            lifetime: Lifetime::new(),
        }
    }

    /// Resolve "upstream" or "user+upstream" to a configured upstream.
    fn resolve(&self, user: &str) -> Option<Target> {
        let (name, user_hint) = parse_ssh_username(user);
        let Some(upstream) = self.server.config.upstream(&name) else {
            warn!("Unknown upstream '{}' requested from {}", name, self.peer_addr);
            return None;
        };
        let Some(user) = upstream.user.clone().or(user_hint) else {
            warn!("No remote user for upstream '{}': use user+{}", name, name);
            return None;
        };
        Some(Target { name, user })
    }

    fn key_allowed(&self, target: &Target, public_key: &PublicKey) -> bool {
        let fingerprint = compute_fingerprint_from_pubkey(public_key);
        let allowed = self
            .server
            .is_authorized(&target.name, &public_key_to_openssh(public_key));
        if allowed {
            debug!("Key {} authorized for upstream '{}'", fingerprint, target.name);
        } else {
            info!("Key {} not authorized for upstream '{}'", fingerprint, target.name);
        }
        allowed
    }

    /// Hand a client's channel-open to the dispatcher and wait for its
    /// decision.
    async fn offer_channel(
        &mut self,
        channel: Channel<Msg>,
        channel_type: &str,
        extra_data: Bytes,
        session: &mut Session,
    ) -> Result<bool> {
        let Some(channel_tx) = self.channel_tx.clone() else {
            warn!("Channel opened before authentication from {}", self.peer_addr);
            return Ok(false);
        };

        let id = channel.id();
        let (incoming, decision) = IncomingChannel::pending(
            channel,
            ChannelSide::Downstream(session.handle()),
            channel_type,
            extra_data,
            self.server.config.relay.request_queue_depth,
        );
        if channel_tx.send(incoming).await.is_err() {
            debug!(channel_type, "Channel dispatch has stopped");
            return Ok(false);
        }

        match decision.await {
            Ok(Decision::Accept(requests)) => {
                self.channels.insert(id, requests);
                Ok(true)
            }
            Ok(Decision::Reject(reason, message)) => {
                info!(channel_type, %reason, "Channel refused: {}", message);
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    /// Route a client's channel request into the relay and wait for the
    /// upstream's answer. russh only passes the answer on to clients that
    /// asked for one.
    async fn relay_request(&mut self, channel: ChannelId, kind: RequestKind, payload: Bytes) -> bool {
        let Some(requests) = self.channels.get(&channel) else {
            debug!(kind = %kind, "Request for unknown channel {:?}", channel);
            return false;
        };

        let (request, reply) = ChannelRequest::with_reply(kind, payload);
        if requests.send(request).await.is_err() {
            return false;
        }
        reply.await.map(|reply| reply.accepted).unwrap_or(false)
    }

    async fn answer_request(
        &mut self,
        channel: ChannelId,
        kind: RequestKind,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<()> {
        if self.relay_request(channel, kind, payload).await {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    /// Send a global request through the relay and wait for its reply.
    async fn relay_global(&self, kind: &str, payload: Bytes) -> Option<Reply> {
        let global_tx = self.global_tx.as_ref()?;
        let (request, reply) = GlobalRequest::with_reply(kind.to_string(), payload);
        global_tx.send(request).await.ok()?;
        reply.await.ok()
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.lifetime.cancel_with("client disconnected");
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
        partial_success: false,
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Check an offered key before the client proves it owns it.
    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr);

        let Some(target) = self.resolve(user) else {
            return Ok(reject());
        };
        if !self.key_allowed(&target, public_key) {
            return Ok(reject());
        }
        Ok(Auth::Accept)
    }

    /// The client signed with an allowed key: connect its upstream.
    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        debug!("Public key auth (with signature) for user '{}'", user);

        if self.upstream.is_some() {
            return Ok(Auth::Accept);
        }
        let Some(target) = self.resolve(user) else {
            return Ok(reject());
        };
        if !self.key_allowed(&target, public_key) {
            return Ok(reject());
        }

        let config = self
            .server
            .config
            .upstream(&target.name)
            .ok_or_else(|| anyhow!("Upstream '{}' disappeared", target.name))?;
        let depth = self.server.config.relay.request_queue_depth;
        match Upstream::connect(&target.name, config, &target.user, depth).await {
            Ok((upstream, forwarded)) => {
                self.upstream = Some(Arc::new(upstream));
                self.forwarded = Some(forwarded);
                self.target = Some(target);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!("Upstream connection for {} failed: {:#}", self.peer_addr, e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    /// Start relaying the connection.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let upstream = self
            .upstream
            .clone()
            .ok_or_else(|| anyhow!("Authenticated without an upstream"))?;
        let target = self
            .target
            .clone()
            .ok_or_else(|| anyhow!("Authenticated without a target"))?;

        let config = &self.server.config;
        let environment = config
            .upstream(&target.name)
            .map(|u| u.environment.clone())
            .unwrap_or_default();
        let ctx = RelayContext::new(self.lifetime.clone(), environment, config.relay.clone());
        let depth = ctx.config.request_queue_depth;

        let (global_tx, global_rx) = mpsc::channel(depth);
        let (channel_tx, channel_rx) = mpsc::channel(depth);
        self.global_tx = Some(global_tx);
        self.channel_tx = Some(channel_tx);

        info!(
            "Client {} connected to upstream '{}' as '{}'",
            self.peer_addr, target.name, target.user
        );
        let span = info_span!("connection", peer = %self.peer_addr, upstream = %target.name);

        tokio::spawn(
            {
                let upstream = upstream.clone();
                async move {
                    if let Err(e) = forward_global_requests(Some(upstream), Some(global_rx)).await {
                        warn!("Global request relay stopped: {}", e);
                    }
                }
            }
            .instrument(span.clone()),
        );

        tokio::spawn(
            {
                let ctx = ctx.clone();
                let upstream = upstream.clone();
                async move {
                    match forward_channels(Some(upstream), Some(channel_rx), &ctx).await {
                        Ok(summary) => debug!(?summary, "Channel dispatch finished"),
                        Err(e) => warn!("Channel dispatch stopped: {}", e),
                    }
                }
            }
            .instrument(span.clone()),
        );

        let downstream = Arc::new(Downstream::new(session.handle(), depth));
        let forwarded = self.forwarded.take();
        tokio::spawn(
            {
                let ctx = ctx.clone();
                async move {
                    match forward_channels(Some(downstream), forwarded, &ctx).await {
                        Ok(summary) => debug!(?summary, "Forwarded channel dispatch finished"),
                        Err(e) => warn!("Forwarded channel dispatch stopped: {}", e),
                    }
                }
            }
            .instrument(span.clone()),
        );

        let client = session.handle();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = upstream.lifetime().cancelled() => {
                        let reason = upstream.lifetime().reason().unwrap_or_default();
                        ctx.lifetime.cancel_with(reason.clone());
                        ctx.registry.close_all(&reason);
                        if tokio::time::timeout(CLOSE_TIMEOUT, ctx.registry.wait_idle()).await.is_err() {
                            warn!("Channels still open after upstream disconnect");
                        }
                        let _ = client
                            .disconnect(Disconnect::ByApplication, reason.into(), "en".into())
                            .await;
                    }
                    _ = ctx.lifetime.cancelled() => {
                        for entry in ctx.registry.list().await {
                            debug!(
                                id = entry.id,
                                channel_type = %entry.channel_type,
                                opened_at = %entry.opened_at,
                                "Channel open at disconnect"
                            );
                        }
                    }
                }
                debug!(
                    reason = ?ctx.lifetime.reason(),
                    open_channels = ctx.registry.active(),
                    "Connection ended"
                );
            }
            .instrument(span),
        );

        Ok(())
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, session: &mut Session) -> Result<bool, Self::Error> {
        debug!("Session channel requested: {:?}", channel.id());
        self.offer_channel(channel, "session", Bytes::new(), session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Direct-tcpip request: {}:{} from {}:{}",
            host_to_connect, port_to_connect, originator_address, originator_port
        );
        let extra_data = TcpipEndpoints {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        }
        .encode();
        self.offer_channel(channel, "direct-tcpip", extra_data, session).await
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel, term, col_width, row_height
        );
        let payload = PtyRequest {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        }
        .encode();
        self.answer_request(channel, RequestKind::PtyReq, payload, session).await
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = X11Request {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen_number: x11_screen_number,
        }
        .encode();
        self.answer_request(channel, RequestKind::X11Req, payload, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = env_payload(variable_name, variable_value);
        self.answer_request(channel, RequestKind::Env, payload, session).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.answer_request(channel, RequestKind::Shell, Bytes::new(), session).await
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        debug!("Exec request on {:?}: {}", channel, String::from_utf8_lossy(data));
        self.answer_request(channel, RequestKind::Exec, string_payload(data), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_request(channel, RequestKind::Subsystem, string_payload(name), session)
            .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        }
        .encode();
        self.answer_request(channel, RequestKind::WindowChange, payload, session)
            .await
    }

    async fn signal(&mut self, channel: ChannelId, signal: Sig, _session: &mut Session) -> Result<(), Self::Error> {
        let payload = string_payload(sig_name(&signal));
        self.relay_request(channel, RequestKind::Signal, payload).await;
        Ok(())
    }

    /// russh answers agent forwarding requests from our return value.
    async fn agent_request(&mut self, channel: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(self
            .relay_request(channel, RequestKind::AgentForward, Bytes::new())
            .await)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        let payload = ForwardRequest {
            address: address.to_string(),
            port: *port,
        }
        .encode();
        let Some(reply) = self.relay_global("tcpip-forward", payload).await else {
            return Ok(false);
        };

        if reply.accepted && *port == 0 {
            match read_u32_payload(&reply.payload) {
                Ok(bound) => *port = bound,
                Err(e) => warn!("Upstream sent no bound port for {}: {}", address, e),
            }
        }
        info!(accepted = reply.accepted, "Remote forward on {}:{}", address, port);
        Ok(reply.accepted)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let payload = ForwardRequest {
            address: address.to_string(),
            port,
        }
        .encode();
        let accepted = self
            .relay_global("cancel-tcpip-forward", payload)
            .await
            .is_some_and(|reply| reply.accepted);
        info!(accepted, "Cancelled remote forward on {}:{}", address, port);
        Ok(accepted)
    }
}
