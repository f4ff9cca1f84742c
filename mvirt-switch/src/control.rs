//! Control-plane requests and replies.
//!
//! Requests are tagged JSON objects (`{"op": "attach", "name": "sw0:a"}`),
//! which is also the form bootstrap entries take in the configuration file.

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_SLOTS, MAX_RINGS, MAX_SLOTS, bound_var};
use crate::polling::{PollingMode, PollingPlan};
use crate::port::{Port, PortStatsSnapshot};

/// Requested ring geometry. Zero fields fall back to the fabric defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingRequest {
    pub tx_rings: usize,
    pub rx_rings: usize,
    pub tx_slots: u32,
    pub rx_slots: u32,
}

impl RingRequest {
    /// One ring per direction with the default slot count.
    pub const STANDARD: RingRequest = RingRequest {
        tx_rings: 1,
        rx_rings: 1,
        tx_slots: DEFAULT_SLOTS,
        rx_slots: DEFAULT_SLOTS,
    };

    /// Apply `defaults` to unset fields and clamp to the switch limits.
    pub fn resolve(&self, defaults: &RingRequest) -> RingRequest {
        RingRequest {
            tx_rings: bound_var(self.tx_rings, defaults.tx_rings, 1, MAX_RINGS),
            rx_rings: bound_var(self.rx_rings, defaults.rx_rings, 1, MAX_RINGS),
            tx_slots: bound_var(self.tx_slots, defaults.tx_slots, 2, MAX_SLOTS),
            rx_slots: bound_var(self.rx_slots, defaults.rx_slots, 2, MAX_SLOTS),
        }
    }

    /// Whether every field is within the switch limits.
    pub fn is_valid(&self) -> bool {
        (1..=MAX_RINGS).contains(&self.tx_rings)
            && (1..=MAX_RINGS).contains(&self.rx_rings)
            && (2..=MAX_SLOTS).contains(&self.tx_slots)
            && (2..=MAX_SLOTS).contains(&self.rx_slots)
    }
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Attach `bridge:port`, creating the bridge if needed. `host` also
    /// attaches the host-stack rings of a NIC.
    Attach {
        name: String,
        #[serde(default)]
        host: bool,
        #[serde(default)]
        rings: RingRequest,
    },
    Detach {
        name: String,
    },
    /// Look up a port by name, or return the first port at or after the
    /// cursor `(bridge_idx, port_idx)`.
    List {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        bridge_idx: usize,
        #[serde(default)]
        port_idx: usize,
    },
    PollingEnable {
        name: String,
        mode: PollingMode,
        #[serde(default)]
        first_cpu: usize,
        #[serde(default = "one")]
        num_cpus: usize,
    },
    PollingDisable {
        name: String,
    },
    CreatePort {
        name: String,
        #[serde(default)]
        rings: RingRequest,
    },
    DeletePort {
        name: String,
    },
    SetVnetHdr {
        name: String,
        hdr_len: usize,
    },
    /// Pass an opaque request to the bridge's lookup implementation.
    Config {
        name: String,
        request: serde_json::Value,
    },
}

/// Description of a port as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    /// Bridge the port is attached to.
    pub bridge: Option<String>,
    pub bridge_idx: Option<usize>,
    pub port_index: Option<usize>,
    pub tx_rings: usize,
    pub rx_rings: usize,
    pub tx_slots: u32,
    pub rx_slots: u32,
    pub mem_id: u32,
    pub virt_hdr_len: usize,
    pub persistent: bool,
    pub wrap: bool,
    pub stats: PortStatsSnapshot,
}

impl PortInfo {
    pub(crate) fn from_port(port: &Port) -> Self {
        let link = port.link();
        let (name, bridge, bridge_idx, port_index) = match &link {
            Some(l) => (
                l.name.clone(),
                l.name.split_once(':').map(|(b, _)| b.to_string()),
                Some(l.bridge.index()),
                Some(l.index),
            ),
            None => (port.name().to_string(), None, None, None),
        };
        Self {
            name,
            bridge,
            bridge_idx,
            port_index,
            tx_rings: port.num_tx_rings(),
            rx_rings: port.num_rx_rings(),
            tx_slots: port.tx_slots(),
            rx_slots: port.rx_slots(),
            mem_id: port.mem_id(),
            virt_hdr_len: port.virt_hdr_len(),
            persistent: port.is_persistent(),
            wrap: port.is_wrap(),
            stats: port.stats().snapshot(),
        }
    }
}

/// Summary of an active bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeInfo {
    pub index: usize,
    pub name: String,
    pub exclusive: bool,
    pub ports: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Attached {
        port: PortInfo,
        /// The host sub-port, when requested.
        host: Option<PortInfo>,
    },
    Detached {
        name: String,
    },
    Listed {
        port: PortInfo,
        bridge_idx: usize,
        port_idx: usize,
    },
    Polling {
        plan: PollingPlan,
    },
    PollingStopped {
        name: String,
    },
    PortCreated {
        port: PortInfo,
    },
    PortDeleted {
        name: String,
    },
    VnetHdrSet {
        name: String,
        hdr_len: usize,
    },
    Config {
        reply: serde_json::Value,
    },
}
