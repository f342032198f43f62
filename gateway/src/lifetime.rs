//! Cancellation scopes for a relay and the channels it spawns.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

const DEFAULT_REASON: &str = "context canceled";

/// A cancellable scope that remembers why it was cancelled.
///
/// Cancelling a lifetime cancels every lifetime derived from it with
/// [`Lifetime::child`]; cancelling a child leaves the parent alone.
#[derive(Debug, Clone)]
pub struct Lifetime {
    token: CancellationToken,
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    reason: OnceLock<String>,
    parent: Option<Lifetime>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a scope that ends when this one does, or earlier on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.cancel_with(DEFAULT_REASON);
    }

    /// Cancel with a reason. Only the first reason given sticks.
    pub fn cancel_with(&self, reason: impl Into<String>) {
        let _ = self.inner.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why this scope ended, if it has. A scope cancelled through its
    /// parent reports the parent's reason.
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(reason) = self.inner.reason.get() {
            return Some(reason.clone());
        }
        match &self.inner.parent {
            Some(parent) if parent.is_cancelled() => parent.reason(),
            _ => Some(DEFAULT_REASON.to_string()),
        }
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
