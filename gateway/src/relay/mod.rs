//! The relay core: global requests, channel negotiation, per-channel pumps
//! and their supervision.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::lifetime::Lifetime;

pub mod dispatch;
pub mod global;
pub mod pump;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testkit;

pub use dispatch::{forward_channels, DispatchSummary};
pub use global::forward_global_requests;
pub use pump::{ChannelPair, ChannelPump, PumpReport};
pub use registry::{ChannelEntry, ChannelRegistry};

/// Variables injected as `env` requests ahead of `shell` and `exec`.
pub type Environment = BTreeMap<String, String>;

/// Everything a relay needs besides its sessions, passed explicitly.
#[derive(Clone)]
pub struct RelayContext {
    /// Cancelling this stops channel intake and starts channel supervision.
    pub lifetime: Lifetime,
    pub environment: Arc<Environment>,
    pub registry: Arc<ChannelRegistry>,
    pub config: RelayConfig,
}

impl RelayContext {
    pub fn new(lifetime: Lifetime, environment: Environment, config: RelayConfig) -> Self {
        Self {
            lifetime,
            environment: Arc::new(environment),
            registry: Arc::new(ChannelRegistry::new()),
            config,
        }
    }
}
