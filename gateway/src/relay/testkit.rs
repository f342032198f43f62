//! In-memory sessions and channels for exercising the relay without sockets.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{OpenFailureReason, RelayError, Result};
use crate::request::{ChannelRequest, Reply, RequestKind};
use crate::transport::{Channel, ChannelControl, NewChannel, OpenedChannel, Session};

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub kind: RequestKind,
    pub want_reply: bool,
    pub payload: Bytes,
}

#[derive(Default)]
struct ControlState {
    sent: Mutex<Vec<SentRequest>>,
    refused: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    closes: AtomicUsize,
    closed: CancellationToken,
}

/// Records what the relay does to one end of a channel.
#[derive(Clone, Default)]
pub struct MockControl(Arc<ControlState>);

impl MockControl {
    pub fn sent(&self) -> Vec<SentRequest> {
        self.0.sent.lock().unwrap().clone()
    }

    /// Answer requests of this kind with failure.
    pub fn refuse(&self, kind: &str) {
        self.0.refused.lock().unwrap().insert(kind.to_string());
    }

    /// Make sending requests of this kind error out.
    pub fn fail(&self, kind: &str) {
        self.0.failing.lock().unwrap().insert(kind.to_string());
    }

    pub fn close_count(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    /// Resolves once the channel has been closed at least once.
    pub async fn closed(&self) {
        self.0.closed.cancelled().await
    }
}

impl ChannelControl for MockControl {
    async fn send_request(&self, kind: &RequestKind, want_reply: bool, payload: &Bytes) -> Result<bool> {
        self.0.sent.lock().unwrap().push(SentRequest {
            kind: kind.clone(),
            want_reply,
            payload: payload.clone(),
        });
        if self.0.failing.lock().unwrap().contains(kind.as_str()) {
            return Err(RelayError::transport(format!("{kind} failed")));
        }
        Ok(!self.0.refused.lock().unwrap().contains(kind.as_str()))
    }

    async fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.0.closed.cancel();
    }
}

/// The relay's view of a mock channel.
pub struct MockChannel {
    control: MockControl,
    stream: DuplexStream,
    stderr: Option<DuplexStream>,
}

impl Channel for MockChannel {
    type Control = MockControl;
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn split(self) -> (MockControl, Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.stream);
        (self.control, reader, writer)
    }

    fn take_stderr(&mut self) -> Option<(Self::Reader, Self::Writer)> {
        self.stderr.take().map(tokio::io::split)
    }
}

/// The remote party's view of a mock channel.
pub struct MockPeer {
    pub control: MockControl,
    pub stream: DuplexStream,
    pub stderr: Option<DuplexStream>,
    pub requests: mpsc::Sender<ChannelRequest>,
}

impl MockPeer {
    /// Send EOF and stop sending requests.
    pub async fn finish(&mut self) {
        let _ = self.stream.shutdown().await;
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.shutdown().await;
        }
        let (closed, _) = mpsc::channel(1);
        self.requests = closed;
    }
}

pub fn mock_channel() -> (OpenedChannel<MockChannel>, MockPeer) {
    build_channel(false)
}

/// A mock channel that also carries a stderr stream.
pub fn mock_channel_with_stderr() -> (OpenedChannel<MockChannel>, MockPeer) {
    build_channel(true)
}

fn build_channel(with_stderr: bool) -> (OpenedChannel<MockChannel>, MockPeer) {
    let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
    let (stderr_ours, stderr_theirs) = if with_stderr {
        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        (Some(ours), Some(theirs))
    } else {
        (None, None)
    };
    let (requests_tx, requests_rx) = mpsc::channel(16);
    let control = MockControl::default();
    let opened = OpenedChannel {
        channel: MockChannel {
            control: control.clone(),
            stream: ours,
            stderr: stderr_ours,
        },
        requests: requests_rx,
    };
    let peer = MockPeer {
        control,
        stream: theirs,
        stderr: stderr_theirs,
        requests: requests_tx,
    };
    (opened, peer)
}

/// Scripted result of one `open_channel` call.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Accept,
    Refuse(OpenFailureReason, String),
    Fail,
}

/// A target session that answers from a script.
pub struct MockSession {
    globals: Mutex<Vec<(String, bool, Bytes)>>,
    fail_global_at: Option<usize>,
    outcomes: Mutex<VecDeque<OpenOutcome>>,
    opened: Mutex<Vec<(String, Bytes)>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: Mutex<Option<mpsc::UnboundedReceiver<MockPeer>>>,
    closes: AtomicUsize,
}

impl MockSession {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            globals: Mutex::new(Vec::new()),
            fail_global_at: None,
            outcomes: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: Mutex::new(Some(peers_rx)),
            closes: AtomicUsize::new(0),
        }
    }

    /// Fail the global request with this zero-based index.
    pub fn fail_global_at(mut self, index: usize) -> Self {
        self.fail_global_at = Some(index);
        self
    }

    /// Queue the outcome of the next channel open. Opens past the script
    /// succeed.
    pub fn then_open(self, outcome: OpenOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn global_requests(&self) -> Vec<(String, bool, Bytes)> {
        self.globals.lock().unwrap().clone()
    }

    pub fn open_attempts(&self) -> Vec<(String, Bytes)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Remote ends of the channels opened so far and later.
    pub fn peers(&self) -> mpsc::UnboundedReceiver<MockPeer> {
        self.peers_rx.lock().unwrap().take().unwrap()
    }
}

impl Session for MockSession {
    type Channel = MockChannel;

    async fn send_global_request(&self, kind: &str, want_reply: bool, payload: &Bytes) -> Result<Reply> {
        let index = {
            let mut globals = self.globals.lock().unwrap();
            globals.push((kind.to_string(), want_reply, payload.clone()));
            globals.len() - 1
        };
        if self.fail_global_at == Some(index) {
            return Err(RelayError::transport("connection reset"));
        }
        Ok(Reply::accepted(payload.clone()))
    }

    async fn open_channel(&self, channel_type: &str, extra_data: &Bytes) -> Result<OpenedChannel<MockChannel>> {
        self.opened
            .lock()
            .unwrap()
            .push((channel_type.to_string(), extra_data.clone()));
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenOutcome::Accept);
        match outcome {
            OpenOutcome::Accept => {
                let (opened, peer) = mock_channel();
                let _ = self.peers_tx.send(peer);
                Ok(opened)
            }
            OpenOutcome::Refuse(reason, message) => Err(RelayError::OpenRefused { reason, message }),
            OpenOutcome::Fail => Err(RelayError::transport("connection lost")),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a mock channel-open notification was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Rejected(OpenFailureReason, String),
}

/// A channel-open notification from a mock source.
pub struct MockNewChannel {
    channel_type: String,
    extra_data: Bytes,
    accept_fails: bool,
    decision: oneshot::Sender<Decision>,
    peer: oneshot::Sender<MockPeer>,
}

/// Test side of a `MockNewChannel`.
pub struct NewChannelHandle {
    pub decision: oneshot::Receiver<Decision>,
    pub peer: oneshot::Receiver<MockPeer>,
}

impl MockNewChannel {
    pub fn new(channel_type: &str, extra_data: impl Into<Bytes>) -> (Self, NewChannelHandle) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (peer_tx, peer_rx) = oneshot::channel();
        let notification = Self {
            channel_type: channel_type.to_string(),
            extra_data: extra_data.into(),
            accept_fails: false,
            decision: decision_tx,
            peer: peer_tx,
        };
        let handle = NewChannelHandle {
            decision: decision_rx,
            peer: peer_rx,
        };
        (notification, handle)
    }

    /// Make `accept` fail as if the source went away mid-handshake.
    pub fn failing_accept(mut self) -> Self {
        self.accept_fails = true;
        self
    }
}

impl NewChannel for MockNewChannel {
    type Channel = MockChannel;

    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }

    async fn accept(self) -> Result<OpenedChannel<MockChannel>> {
        if self.accept_fails {
            return Err(RelayError::ChannelClosed);
        }
        let (opened, peer) = mock_channel();
        let _ = self.decision.send(Decision::Accepted);
        let _ = self.peer.send(peer);
        Ok(opened)
    }

    async fn reject(self, reason: OpenFailureReason, message: &str) -> Result<()> {
        let _ = self
            .decision
            .send(Decision::Rejected(reason, message.to_string()));
        Ok(())
    }
}
