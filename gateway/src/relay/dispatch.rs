//! Channel negotiation: every channel the source opens is opened on the
//! target first, and only accepted once the target agreed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info_span, warn, Instrument};

use crate::config::OpenFailurePolicy;
use crate::error::{OpenFailureReason, RelayError, Result};
use crate::relay::pump::{ChannelPair, ChannelPump};
use crate::relay::supervisor::supervise;
use crate::relay::RelayContext;
use crate::transport::{Channel, ChannelControl, NewChannel, Session};

/// Counts of how channel-open attempts were answered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub accepted: usize,
    pub refused: usize,
    pub accept_failures: usize,
}

/// Answer the source's channel-open notifications by mirroring each one
/// on `target`, then start a pump for every pair that came up.
///
/// Pumps are spawned and tracked in `ctx.registry`; this returns without
/// waiting for them.
pub async fn forward_channels<T, N>(
    target: Option<Arc<T>>,
    channels: Option<mpsc::Receiver<N>>,
    ctx: &RelayContext,
) -> Result<DispatchSummary>
where
    T: Session,
    N: NewChannel,
{
    let target = target.ok_or(RelayError::TargetMissing)?;
    let mut channels = channels.ok_or(RelayError::ChannelsMissing)?;
    let mut summary = DispatchSummary::default();

    while let Some(notification) = channels.recv().await {
        if ctx.lifetime.is_cancelled() {
            let reason = ctx.lifetime.reason().unwrap_or_default();
            notification
                .reject(OpenFailureReason::AdministrativelyProhibited, &reason)
                .await?;
            return Err(RelayError::Cancelled(reason));
        }

        let channel_type = notification.channel_type().to_string();
        let target_channel = match target
            .open_channel(&channel_type, notification.extra_data())
            .await
        {
            Ok(opened) => opened,
            Err(err) => {
                let (reason, message) = err.rejection();
                notification.reject(reason, &message).await?;
                summary.refused += 1;
                match ctx.config.on_open_failure {
                    OpenFailurePolicy::Terminate => return Err(err),
                    OpenFailurePolicy::Continue => {
                        warn!(channel_type = %channel_type, "Upstream refused channel: {}", err);
                        continue;
                    }
                }
            }
        };

        let source_channel = match notification.accept().await {
            Ok(opened) => opened,
            Err(err) => {
                error!(channel_type = %channel_type, "Failed to accept channel: {}", err);
                let (control, _, _) = target_channel.channel.split();
                control.close().await;
                summary.accept_failures += 1;
                continue;
            }
        };

        summary.accepted += 1;
        spawn_pump(
            ctx,
            channel_type,
            ChannelPair {
                source: source_channel,
                target: target_channel,
            },
        );
    }

    Ok(summary)
}

fn spawn_pump<S: Channel, T: Channel>(ctx: &RelayContext, channel_type: String, pair: ChannelPair<S, T>) {
    let pump = ChannelPump::new(pair, ctx.environment.clone());
    let (source, target) = pump.controls();
    let span = info_span!("channel", kind = %channel_type);
    tokio::spawn(supervise(ctx.clone(), channel_type, pump.run(), source, target).instrument(span));
}
