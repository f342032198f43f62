//! Watches a channel pump against the lifetime of its session.
//!
//! Cancelling a session does not interrupt its pumps mid-transfer. The
//! supervisor reports pumps that outlive their session and, when a grace
//! period is configured, closes both ends of the channel once it runs out.
//! Closing the ends makes the pump's blocked reads return, so the pump
//! still finishes on its own.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::relay::RelayContext;
use crate::transport::ChannelControl;

/// Run `pump` to completion under a child of the relay lifetime.
///
/// The pump is listed in the context's registry while it runs.
pub async fn supervise<F, A, B>(
    ctx: RelayContext,
    channel_type: String,
    pump: F,
    source: A,
    target: B,
) -> F::Output
where
    F: Future,
    A: ChannelControl,
    B: ChannelControl,
{
    let scope = ctx.lifetime.child();
    let registry = ctx.registry.clone();
    let id = registry.register(&channel_type).await;
    let closing = registry.closing().clone();
    tokio::pin!(pump);

    let output = tokio::select! {
        output = &mut pump => output,
        _ = scope.cancelled() => {
            let reason = scope.reason().unwrap_or_default();
            warn!(id, channel_type = %channel_type, reason = %reason, "Channel is still active");

            let grace = ctx.config.cancel_grace();
            tokio::select! {
                output = &mut pump => output,
                _ = grace_expired(grace) => {
                    warn!(id, ?grace, "Channel outlived its grace period, closing it");
                    close_both(&source, &target).await;
                    pump.await
                }
                _ = closing.cancelled() => {
                    close_both(&source, &target).await;
                    pump.await
                }
            }
        }
        _ = closing.cancelled() => {
            debug!(id, reason = ?closing.reason(), "Closing channel");
            close_both(&source, &target).await;
            pump.await
        }
    };

    scope.cancel_with("channel finished");
    registry.deregister(id).await;
    output
}

async fn grace_expired(grace: Option<Duration>) {
    match grace {
        Some(grace) => tokio::time::sleep(grace).await,
        None => std::future::pending().await,
    }
}

async fn close_both<A: ChannelControl, B: ChannelControl>(source: &A, target: &B) {
    tokio::join!(source.close(), target.close());
}
