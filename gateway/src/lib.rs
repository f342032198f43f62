//! SSH gateway that relays client sessions to configured upstream servers.
//!
//! Clients pick an upstream through their SSH username (`user+upstream`).
//! After authentication the gateway opens its own connection to that
//! upstream and the relay moves global requests, channel opens, channel
//! data and channel requests between the two.

pub mod config;
pub mod error;
pub mod keys;
pub mod lifetime;
pub mod relay;
pub mod request;
pub mod ssh;
pub mod transport;
pub mod wire;
