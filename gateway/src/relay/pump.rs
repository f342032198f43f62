//! Per-channel relay between a source channel and its target counterpart.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;
use crate::relay::Environment;
use crate::request::{Reply, RequestKind};
use crate::transport::{Channel, ChannelControl, OpenedChannel, RequestStream};
use crate::wire;

/// The two halves of one negotiated channel.
pub struct ChannelPair<S, T> {
    pub source: OpenedChannel<S>,
    pub target: OpenedChannel<T>,
}

/// What a pump did before it finished.
#[derive(Debug)]
pub struct PumpReport {
    pub requests_to_target: Result<usize>,
    pub requests_to_source: Result<usize>,
    pub bytes_to_target: Result<u64>,
    pub bytes_to_source: Result<u64>,
    pub stderr_to_target: Result<u64>,
    pub stderr_to_source: Result<u64>,
}

struct Side<C: Channel> {
    control: C::Control,
    reader: C::Reader,
    writer: C::Writer,
    stderr_reader: Option<C::Reader>,
    stderr_writer: Option<C::Writer>,
    requests: RequestStream,
}

impl<C: Channel> Side<C> {
    fn new(opened: OpenedChannel<C>) -> Self {
        let mut channel = opened.channel;
        let (stderr_reader, stderr_writer) = channel.take_stderr().unzip();
        let (control, reader, writer) = channel.split();
        Self {
            control,
            reader,
            writer,
            stderr_reader,
            stderr_writer,
            requests: opened.requests,
        }
    }
}

/// Relays requests and bytes in both directions for one channel pair.
pub struct ChannelPump<S: Channel, T: Channel> {
    source: Side<S>,
    target: Side<T>,
    environment: std::sync::Arc<Environment>,
}

impl<S: Channel, T: Channel> ChannelPump<S, T> {
    pub fn new(pair: ChannelPair<S, T>, environment: std::sync::Arc<Environment>) -> Self {
        Self {
            source: Side::new(pair.source),
            target: Side::new(pair.target),
            environment,
        }
    }

    /// Control handles of both ends, for closing them from outside the pump.
    pub fn controls(&self) -> (S::Control, T::Control) {
        (self.source.control.clone(), self.target.control.clone())
    }

    /// Run the relay flows until every one of them has finished.
    ///
    /// The flows are independent: one failing does not stop the others,
    /// each keeps going until its own input ends. Stderr is copied only
    /// between ends that both carry it.
    pub async fn run(self) -> PumpReport {
        let Self {
            source,
            target,
            environment,
        } = self;

        debug!("Accept channel");

        let (
            requests_to_target,
            requests_to_source,
            bytes_to_target,
            bytes_to_source,
            stderr_to_target,
            stderr_to_source,
        ) = tokio::join!(
            forward_channel_requests(&target.control, source.requests, &environment),
            forward_channel_requests(&source.control, target.requests, &environment),
            copy_then_half_close(source.reader, target.writer),
            copy_then_half_close(target.reader, source.writer),
            copy_stderr(source.stderr_reader, target.stderr_writer),
            copy_stderr(target.stderr_reader, source.stderr_writer),
        );

        let report = PumpReport {
            requests_to_target,
            requests_to_source,
            bytes_to_target,
            bytes_to_source,
            stderr_to_target,
            stderr_to_source,
        };
        report.log();
        debug!("Close channel");
        report
    }
}

impl PumpReport {
    fn log(&self) {
        if let Err(e) = &self.requests_to_target {
            debug!("Request relay to target ended: {}", e);
        }
        if let Err(e) = &self.requests_to_source {
            debug!("Request relay to source ended: {}", e);
        }
        if let Err(e) = &self.bytes_to_target {
            debug!("Data copy to target ended: {}", e);
        }
        if let Err(e) = &self.bytes_to_source {
            debug!("Data copy to source ended: {}", e);
        }
        if let Err(e) = &self.stderr_to_target {
            debug!("Stderr copy to target ended: {}", e);
        }
        if let Err(e) = &self.stderr_to_source {
            debug!("Stderr copy to source ended: {}", e);
        }
    }
}

/// Forward requests to `destination` in arrival order, then close it.
pub(crate) async fn forward_channel_requests<C: ChannelControl>(
    destination: &C,
    requests: RequestStream,
    environment: &Environment,
) -> Result<usize> {
    let result = relay_requests(destination, requests, environment).await;
    destination.close().await;
    result
}

async fn relay_requests<C: ChannelControl>(
    destination: &C,
    mut requests: RequestStream,
    environment: &Environment,
) -> Result<usize> {
    let mut forwarded = 0;
    while let Some(request) = requests.recv().await {
        if request.kind().starts_program() {
            inject_environment(destination, environment).await;
        }

        let accepted = destination
            .send_request(request.kind(), request.want_reply(), request.payload())
            .await?;
        let kind = request.kind().clone();
        if request.want_reply() {
            request.reply(Reply {
                accepted,
                payload: Bytes::new(),
            })?;
        }
        debug!(kind = %kind, accepted, "Forward channel request");
        forwarded += 1;
    }
    Ok(forwarded)
}

async fn inject_environment<C: ChannelControl>(destination: &C, environment: &Environment) {
    for (name, value) in environment {
        let payload = wire::env_payload(name, value);
        if let Err(e) = destination
            .send_request(&RequestKind::Env, false, &payload)
            .await
        {
            debug!("Failed to set {}: {}", name, e);
        }
    }
}

/// Copy until `reader` ends, then half-close `writer`.
async fn copy_then_half_close<R, W>(mut reader: R, mut writer: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    Ok(copied?)
}

/// An unpaired stderr end is dropped, so its writer sees a broken pipe.
async fn copy_stderr<R, W>(reader: Option<R>, writer: Option<W>) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match (reader, writer) {
        (Some(reader), Some(writer)) => copy_then_half_close(reader, writer).await,
        _ => Ok(0),
    }
}
