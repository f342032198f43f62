//! Bookkeeping for the channel pumps of one session pair.
//!
//! The dispatcher spawns pumps and moves on; the registry is what lets the
//! gateway later see which channels are still open, wait for them to drain
//! or close them all at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};

use crate::lifetime::Lifetime;

/// A channel pump that has not finished yet.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub id: u64,
    pub channel_type: String,
    pub opened_at: DateTime<Utc>,
}

/// Thread-safe set of in-flight channel pumps.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<u64, ChannelEntry>>,
    next_id: AtomicU64,
    active: watch::Sender<usize>,
    closing: Lifetime,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active,
            closing: Lifetime::new(),
        }
    }

    /// Record a new pump and return its id.
    pub async fn register(&self, channel_type: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ChannelEntry {
            id,
            channel_type: channel_type.to_string(),
            opened_at: Utc::now(),
        };
        let mut channels = self.channels.write().await;
        channels.insert(id, entry);
        self.active.send_replace(channels.len());
        id
    }

    /// Forget a finished pump.
    pub async fn deregister(&self, id: u64) -> Option<ChannelEntry> {
        let mut channels = self.channels.write().await;
        let removed = channels.remove(&id);
        self.active.send_replace(channels.len());
        removed
    }

    /// Snapshot of the open channels, oldest first.
    pub async fn list(&self) -> Vec<ChannelEntry> {
        let channels = self.channels.read().await;
        let mut entries: Vec<_> = channels.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolve once no pump is registered.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Ask every supervised channel to close both of its ends now.
    pub fn close_all(&self, reason: &str) {
        self.closing.cancel_with(reason);
    }

    pub(crate) fn closing(&self) -> &Lifetime {
        &self.closing
    }
}
