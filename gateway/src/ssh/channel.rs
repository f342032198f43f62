//! Bridges russh channels to the relay's `Channel` traits.
//!
//! Each channel gets a task that owns the russh `Channel`. It copies
//! channel data and stderr into in-memory duplex streams the relay reads
//! and writes. Relay requests become russh calls, and the peer's
//! success/failure replies are matched to them in order.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use russh::server;
use russh::{ChannelId, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OpenFailureReason, RelayError, Result};
use crate::request::{ChannelRequest, RequestKind};
use crate::ssh::codec::{
    bool_payload, read_bool_payload, read_string_payload, read_u32_payload, sig_from_name, sig_name,
    u32_payload, ExitSignal, PtyRequest, WindowChange, X11Request,
};
use crate::transport::{Channel, ChannelControl, NewChannel, OpenedChannel};
use crate::wire::Reader;

const STREAM_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 32 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR: u32 = 1;

/// Which connection a russh channel belongs to.
#[derive(Clone)]
pub enum ChannelSide {
    /// A channel on the gateway's client connection to an upstream server.
    Upstream,
    /// A channel on a client's connection to the gateway.
    Downstream(server::Handle),
}

struct Command {
    kind: RequestKind,
    want_reply: bool,
    payload: Bytes,
    reply: oneshot::Sender<Result<bool>>,
}

/// Request and close handle of a bridged channel.
#[derive(Clone)]
pub struct RusshControl {
    commands: mpsc::Sender<Command>,
    closing: CancellationToken,
}

impl ChannelControl for RusshControl {
    async fn send_request(&self, kind: &RequestKind, want_reply: bool, payload: &Bytes) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command {
                kind: kind.clone(),
                want_reply,
                payload: payload.clone(),
                reply,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;
        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    async fn close(&self) {
        self.closing.cancel();
    }
}

/// The relay's end of a bridged channel.
pub struct RusshChannel {
    control: RusshControl,
    stream: DuplexStream,
    stderr: Option<DuplexStream>,
}

impl Channel for RusshChannel {
    type Control = RusshControl;
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn split(self) -> (RusshControl, Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.stream);
        (self.control, reader, writer)
    }

    fn take_stderr(&mut self) -> Option<(Self::Reader, Self::Writer)> {
        self.stderr.take().map(tokio::io::split)
    }
}

/// Start the task that serves `channel` and return the relay's end of it.
///
/// The returned sender feeds the channel's request stream, which stays
/// open until the channel closes and every sender is gone. Upstream
/// channels produce their own requests (exit status and the like); for
/// client-opened channels the connection handler routes the client's
/// requests through the sender.
pub fn bridge<S>(
    channel: russh::Channel<S>,
    side: ChannelSide,
    depth: usize,
) -> (OpenedChannel<RusshChannel>, mpsc::Sender<ChannelRequest>)
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
    let (stderr_ours, stderr_theirs) = tokio::io::duplex(STREAM_BUFFER);
    let (commands_tx, commands_rx) = mpsc::channel(depth);
    let (requests_tx, requests_rx) = mpsc::channel(depth);
    let closing = CancellationToken::new();

    let task = ChannelTask {
        channel,
        side,
        requests: requests_tx.clone(),
        pending: VecDeque::new(),
    };
    tokio::spawn(task.run(commands_rx, closing.clone(), theirs, stderr_theirs));

    let opened = OpenedChannel {
        channel: RusshChannel {
            control: RusshControl {
                commands: commands_tx,
                closing,
            },
            stream: ours,
            stderr: Some(stderr_ours),
        },
        requests: requests_rx,
    };
    (opened, requests_tx)
}

struct ChannelTask<S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static> {
    channel: russh::Channel<S>,
    side: ChannelSide,
    /// Keeps the request stream open for as long as the channel is.
    requests: mpsc::Sender<ChannelRequest>,
    /// Reply sinks of sent requests, oldest first.
    pending: VecDeque<oneshot::Sender<Result<bool>>>,
}

impl<S> ChannelTask<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        closing: CancellationToken,
        stream: DuplexStream,
        stderr: DuplexStream,
    ) {
        let id = self.channel.id();
        let (mut outbound, mut inbound) = tokio::io::split(stream);
        let (mut outbound_err, mut inbound_err) = tokio::io::split(stderr);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut sending = true;
        let mut sending_err = true;
        // Set once the relay is done with the channel: bytes it already
        // wrote are still flushed to the peer before closing.
        let mut drain_until: Option<Instant> = None;

        loop {
            let draining = drain_until.is_some();
            if draining && !sending && !sending_err {
                break;
            }
            let deadline = drain_until.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = closing.cancelled(), if !draining => {
                    drain_until = Some(Instant::now() + DRAIN_TIMEOUT);
                }
                _ = tokio::time::sleep_until(deadline), if draining => {
                    debug!(channel = ?id, "Dropping unsent channel data");
                    break;
                }
                msg = self.channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if !draining {
                            deliver(&mut inbound, &data, &closing).await;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: STDERR }) => {
                        if !draining {
                            deliver(&mut inbound_err, &data, &closing).await;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { ext, .. }) => {
                        debug!(channel = ?id, ext, "Dropping unknown extended data");
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = inbound.shutdown().await;
                        let _ = inbound_err.shutdown().await;
                    }
                    Some(ChannelMsg::Success) => self.answer(true),
                    Some(ChannelMsg::Failure) => self.answer(false),
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        self.receive(RequestKind::ExitStatus, u32_payload(exit_status)).await;
                    }
                    Some(ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    }) => {
                        let payload = ExitSignal {
                            signal_name: sig_name(&signal_name).to_string(),
                            core_dumped,
                            error_message,
                            lang_tag,
                        }
                        .encode();
                        self.receive(RequestKind::ExitSignal, payload).await;
                    }
                    Some(ChannelMsg::XonXoff { client_can_do }) => {
                        self.receive(RequestKind::XonXoff, bool_payload(client_can_do)).await;
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                read = outbound.read(&mut buf), if sending => match read {
                    Ok(0) | Err(_) => {
                        sending = false;
                        if !sending_err {
                            let _ = self.channel.eof().await;
                        }
                    }
                    Ok(n) => {
                        if self.channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                read = outbound_err.read(&mut err_buf), if sending_err => match read {
                    Ok(0) | Err(_) => {
                        sending_err = false;
                        if !sending {
                            let _ = self.channel.eof().await;
                        }
                    }
                    Ok(n) => {
                        if self.channel.extended_data(STDERR, &err_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                command = commands.recv(), if !draining => match command {
                    Some(command) => self.send(command).await,
                    None => drain_until = Some(Instant::now() + DRAIN_TIMEOUT),
                },
            }
        }

        debug!(channel = ?id, "Channel task finished");
        let _ = inbound.shutdown().await;
        let _ = inbound_err.shutdown().await;
        let _ = self.channel.close().await;
    }

    fn answer(&mut self, accepted: bool) {
        match self.pending.pop_front() {
            Some(reply) => {
                let _ = reply.send(Ok(accepted));
            }
            None => debug!(accepted, "Unsolicited channel reply"),
        }
    }

    /// Queue a request the remote party sent on this channel. Only
    /// upstream servers send these as channel messages; client requests
    /// arrive through the connection handler.
    async fn receive(&self, kind: RequestKind, payload: Bytes) {
        let _ = self.requests.send(ChannelRequest::new(kind, payload)).await;
    }

    async fn send(&mut self, command: Command) {
        let Command {
            kind,
            want_reply,
            payload,
            reply,
        } = command;
        let sent = match &self.side {
            ChannelSide::Upstream => send_upstream(&self.channel, &kind, want_reply, &payload).await,
            ChannelSide::Downstream(handle) => send_downstream(handle, self.channel.id(), &kind, &payload).await,
        };
        match sent {
            Ok(Sent::AwaitingReply) => self.pending.push_back(reply),
            Ok(Sent::Answered(accepted)) => {
                let _ = reply.send(Ok(accepted));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Hand bytes from the peer to the relay. A departed reader just means
/// nobody wants them.
async fn deliver(inbound: &mut WriteHalf<DuplexStream>, data: &[u8], closing: &CancellationToken) {
    tokio::select! {
        _ = inbound.write_all(data) => {}
        _ = closing.cancelled() => {}
    }
}

enum Sent {
    /// The peer will answer with success or failure.
    AwaitingReply,
    Answered(bool),
}

/// Send a client's request to an upstream server.
async fn send_upstream<S>(
    channel: &russh::Channel<S>,
    kind: &RequestKind,
    want_reply: bool,
    payload: &[u8],
) -> Result<Sent>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let sent = match kind {
        RequestKind::Shell => channel.request_shell(want_reply).await,
        RequestKind::Exec => {
            let command = read_string_payload(payload)?.to_vec();
            channel.exec(want_reply, command).await
        }
        RequestKind::Env => {
            let mut r = Reader::new(payload);
            let name = r.read_str()?;
            let value = r.read_str()?;
            channel.set_env(want_reply, name, value).await
        }
        RequestKind::PtyReq => {
            let pty = PtyRequest::decode(payload)?;
            channel
                .request_pty(
                    want_reply,
                    &pty.term,
                    pty.col_width,
                    pty.row_height,
                    pty.pix_width,
                    pty.pix_height,
                    &pty.modes,
                )
                .await
        }
        RequestKind::Subsystem => {
            let name = String::from_utf8_lossy(read_string_payload(payload)?).into_owned();
            channel.request_subsystem(want_reply, name).await
        }
        RequestKind::X11Req => {
            let x11 = X11Request::decode(payload)?;
            channel
                .request_x11(
                    want_reply,
                    x11.single_connection,
                    x11.auth_protocol,
                    x11.auth_cookie,
                    x11.screen_number,
                )
                .await
        }
        RequestKind::AgentForward => channel.agent_forward(want_reply).await,
        RequestKind::WindowChange => {
            let size = WindowChange::decode(payload)?;
            channel
                .window_change(size.col_width, size.row_height, size.pix_width, size.pix_height)
                .await
                .map_err(RelayError::transport)?;
            return Ok(Sent::Answered(true));
        }
        RequestKind::Signal => {
            let name = String::from_utf8_lossy(read_string_payload(payload)?).into_owned();
            channel
                .signal(sig_from_name(&name))
                .await
                .map_err(RelayError::transport)?;
            return Ok(Sent::Answered(true));
        }
        other => {
            debug!(kind = %other, "No upstream mapping for channel request");
            return Ok(Sent::Answered(false));
        }
    };
    sent.map_err(RelayError::transport)?;
    Ok(if want_reply {
        Sent::AwaitingReply
    } else {
        Sent::Answered(true)
    })
}

/// Send an upstream server's request to the client. The client never
/// replies to these.
async fn send_downstream(handle: &server::Handle, id: ChannelId, kind: &RequestKind, payload: &[u8]) -> Result<Sent> {
    let sent = match kind {
        RequestKind::ExitStatus => handle.exit_status_request(id, read_u32_payload(payload)?).await,
        RequestKind::ExitSignal => {
            let signal = ExitSignal::decode(payload)?;
            handle
                .exit_signal_request(
                    id,
                    sig_from_name(&signal.signal_name),
                    signal.core_dumped,
                    signal.error_message,
                    signal.lang_tag,
                )
                .await
        }
        RequestKind::XonXoff => handle.xon_xoff_request(id, read_bool_payload(payload)?).await,
        other => {
            debug!(kind = %other, "No downstream mapping for channel request");
            return Ok(Sent::Answered(false));
        }
    };
    sent.map_err(|_| RelayError::ChannelClosed)?;
    Ok(Sent::Answered(true))
}

/// How the connection handler learns the fate of a client's channel.
#[derive(Debug)]
pub enum Decision {
    /// Route the client's requests for this channel into the sender.
    Accept(mpsc::Sender<ChannelRequest>),
    Reject(OpenFailureReason, String),
}

enum Admission {
    /// The opener is waiting for our answer.
    Pending(oneshot::Sender<Decision>),
    /// russh already confirmed the channel; rejecting it means closing it.
    Confirmed,
}

/// A channel-open from either connection, waiting for the dispatcher.
pub struct IncomingChannel<S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static> {
    channel: russh::Channel<S>,
    side: ChannelSide,
    channel_type: String,
    extra_data: Bytes,
    depth: usize,
    admission: Admission,
}

impl<S> IncomingChannel<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    /// A channel the opener is still waiting on. The receiver resolves
    /// once the dispatcher accepted or rejected it.
    pub fn pending(
        channel: russh::Channel<S>,
        side: ChannelSide,
        channel_type: impl Into<String>,
        extra_data: Bytes,
        depth: usize,
    ) -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        let incoming = Self {
            channel,
            side,
            channel_type: channel_type.into(),
            extra_data,
            depth,
            admission: Admission::Pending(tx),
        };
        (incoming, rx)
    }

    pub fn confirmed(
        channel: russh::Channel<S>,
        side: ChannelSide,
        channel_type: impl Into<String>,
        extra_data: Bytes,
        depth: usize,
    ) -> Self {
        Self {
            channel,
            side,
            channel_type: channel_type.into(),
            extra_data,
            depth,
            admission: Admission::Confirmed,
        }
    }
}

impl<S> NewChannel for IncomingChannel<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    type Channel = RusshChannel;

    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }

    async fn accept(self) -> Result<OpenedChannel<RusshChannel>> {
        match self.admission {
            Admission::Pending(decision) => {
                if decision.is_closed() {
                    return Err(RelayError::ChannelClosed);
                }
                let (opened, requests) = bridge(self.channel, self.side, self.depth);
                decision
                    .send(Decision::Accept(requests))
                    .map_err(|_| RelayError::ChannelClosed)?;
                Ok(opened)
            }
            Admission::Confirmed => Ok(bridge(self.channel, self.side, self.depth).0),
        }
    }

    async fn reject(self, reason: OpenFailureReason, message: &str) -> Result<()> {
        match self.admission {
            Admission::Pending(decision) => decision
                .send(Decision::Reject(reason, message.to_string()))
                .map_err(|_| RelayError::ChannelClosed),
            Admission::Confirmed => {
                debug!(channel_type = %self.channel_type, %reason, message, "Closing refused channel");
                self.channel.close().await.map_err(RelayError::transport)
            }
        }
    }
}
