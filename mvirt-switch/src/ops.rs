//! Pluggable per-bridge forwarding policy.

use crate::error::{Result, SwitchError};
use crate::port::Port;

/// Where a frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A single port of the bridge, on the given receive ring.
    Port { index: usize, ring: usize },
    /// Every active port except the sender, on ring 0.
    Broadcast,
    Drop,
}

/// What a lookup knows about the sender.
pub struct LookupContext<'a> {
    pub port: &'a Port,
    /// The sender's index on the bridge.
    pub port_index: usize,
    /// The transmit ring the frame came from. Lookups that do not care
    /// about ring steering return it unchanged.
    pub ring: usize,
}

/// Forwarding policy of a bridge.
///
/// `lookup` runs on the forwarding path with the bridge's read lock held and
/// must not block. Implementations keep their private state inside `self`.
pub trait BridgeOps: Send + Sync {
    /// Decide the destination of `frame`, which starts at the Ethernet
    /// header (the sender's virtio header already skipped).
    fn lookup(&self, frame: &[u8], ctx: &LookupContext<'_>) -> Destination;

    /// Handle a configuration request addressed to the bridge.
    fn config(&self, _request: &serde_json::Value) -> Result<serde_json::Value> {
        Err(SwitchError::NotSupported("bridge configuration".into()))
    }

    /// Called with the bridge's write lock held when a port leaves.
    fn dtor(&self, _port: &Port) {}
}
