//! Test harness for switch fabric integration tests
//!
//! Builds fabrics with small limits and opens ports by name.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mvirt_switch::test_util::MockNic;
use mvirt_switch::{Fabric, FabricConfig, PortHandle, RingRequest};

pub use mvirt_switch::test_util::frames::{BROADCAST, build_frame, src_mac};

/// Locally administered MAC for host `n`.
pub fn mac(n: u8) -> [u8; 6] {
    [0x02, 0x00, 0x00, 0x00, 0x00, n]
}

/// Small ring geometry keeping test memory low.
pub const SMALL_RINGS: RingRequest = RingRequest {
    tx_rings: 1,
    rx_rings: 1,
    tx_slots: 256,
    rx_slots: 256,
};

pub fn fabric(max_ports: usize) -> Fabric {
    let _ = tracing_subscriber::fmt::try_init();
    Fabric::new(FabricConfig {
        max_bridges: 4,
        max_ports,
        default_rings: SMALL_RINGS,
        ..FabricConfig::default()
    })
    .expect("valid test config")
}

/// Attach an ephemeral port and open it.
pub fn attach_open(fabric: &Fabric, name: &str) -> PortHandle {
    fabric
        .attach(name, false, &RingRequest::default(), None)
        .expect("attach");
    fabric.open_port(name).expect("open")
}

/// Attach an ephemeral port with its own ring geometry and open it.
pub fn attach_open_with(fabric: &Fabric, name: &str, rings: RingRequest) -> PortHandle {
    fabric.attach(name, false, &rings, None).expect("attach");
    fabric.open_port(name).expect("open")
}

/// Register a mock NIC with small rings.
pub fn register_mock(fabric: &Fabric, name: &str) -> Arc<MockNic> {
    let mock = Arc::new(MockNic::new(name));
    fabric
        .register_nic(mock.clone(), &SMALL_RINGS)
        .expect("register nic");
    mock
}

/// Receive on ring 0 until at least `n` frames arrived or `timeout` passed.
pub fn recv_at_least(port: &PortHandle, n: usize, timeout: Duration) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut got = port.recv(0).expect("recv");
    while got.len() < n && Instant::now() < deadline {
        let _ = port.wait(Duration::from_millis(20));
        got.extend(port.recv(0).expect("recv"));
    }
    got
}
