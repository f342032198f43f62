//! What the relay needs from an SSH implementation.
//!
//! The relay core never touches sockets or the SSH wire format. It drives
//! sessions and channels through these traits; `crate::ssh` implements them
//! on top of russh and `relay::testkit` implements them in memory.

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{OpenFailureReason, Result};
use crate::request::{ChannelRequest, GlobalRequest, Reply, RequestKind};

/// Requests arriving on one channel, in order. Closed by the producer when
/// the channel goes away.
pub type RequestStream = mpsc::Receiver<ChannelRequest>;

/// Global requests arriving on a session.
pub type GlobalRequestStream = mpsc::Receiver<GlobalRequest>;

/// An established, authenticated SSH session.
pub trait Session: Send + Sync + 'static {
    type Channel: Channel;

    fn send_global_request(
        &self,
        kind: &str,
        want_reply: bool,
        payload: &Bytes,
    ) -> impl Future<Output = Result<Reply>> + Send;

    /// Open a channel of the given type. A structured refusal from the peer
    /// is reported as `RelayError::OpenRefused`.
    fn open_channel(
        &self,
        channel_type: &str,
        extra_data: &Bytes,
    ) -> impl Future<Output = Result<OpenedChannel<Self::Channel>>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A freshly opened channel and the requests its peer sends on it.
pub struct OpenedChannel<C> {
    pub channel: C,
    pub requests: RequestStream,
}

/// One side of a multiplexed byte-stream tunnel.
pub trait Channel: Send + 'static {
    type Control: ChannelControl;
    type Reader: AsyncRead + Send + Unpin + 'static;
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Split into a cloneable control handle and the two stream halves.
    /// Shutting down the writer half-closes the channel (SSH EOF).
    fn split(self) -> (Self::Control, Self::Reader, Self::Writer);

    /// Take the extended data (stderr) streams, for channels that carry
    /// them. Shutting down this writer does not end the channel.
    fn take_stderr(&mut self) -> Option<(Self::Reader, Self::Writer)> {
        None
    }
}

/// Request and teardown side of a channel.
pub trait ChannelControl: Clone + Send + Sync + 'static {
    /// Send a channel request. Resolves to the peer's success flag, or to
    /// `true` immediately when no reply was asked for.
    fn send_request(
        &self,
        kind: &RequestKind,
        want_reply: bool,
        payload: &Bytes,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Fully close the channel. Closing twice is harmless.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A channel-open attempt from the source peer awaiting a decision.
pub trait NewChannel: Send + 'static {
    type Channel: Channel;

    fn channel_type(&self) -> &str;

    fn extra_data(&self) -> &Bytes;

    fn accept(self) -> impl Future<Output = Result<OpenedChannel<Self::Channel>>> + Send;

    fn reject(
        self,
        reason: OpenFailureReason,
        message: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}
