//! mvirt-switch: a software Ethernet switch fabric over shared slot rings.
//!
//! Ports (virtual ports owned by applications, or NICs wrapped through a
//! bridge-wrap adapter) are attached to named bridges. Every transmit sync
//! on a port forwards its queued frames in batches to the other ports of
//! the bridge, using a pluggable lookup that defaults to MAC learning.

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod fabric;
pub mod forward;
pub mod learning;
pub mod lease;
pub mod nic;
pub mod ops;
pub mod polling;
pub mod port;
pub mod ring;
pub mod test_util;
mod wrap;

pub use config::FabricConfig;
pub use control::{Request, Response, RingRequest};
pub use error::{Result, SwitchError};
pub use fabric::{AuthToken, Fabric};
pub use nic::{NicAdapter, NicDriver, NotifyOutcome};
pub use ops::{BridgeOps, Destination, LookupContext};
pub use port::PortHandle;
