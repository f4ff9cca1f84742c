//! Bridge-wrap adapter: moves frames between a NIC and its wrap ports.
//!
//! A wrap port's transmit rings are the NIC's receive rings and its receive
//! rings are the NIC's transmit rings. Frames the NIC receives are forwarded
//! into the bridge straight out of the NIC ring ([`intr_notify`]); frames the
//! bridge delivers to the wrap port are handed to the NIC's transmit sync
//! ([`tx_notify`]). Both run from interrupt or polling context and never
//! block on a busy NIC ring.

use tracing::{trace, warn};

use crate::nic::{NicAdapter, NotifyOutcome};
use crate::port::{Port, WrapSide};
use crate::ring::{KRing, SyncState};

/// The bridge published frames on receive ring `ring` of wrap port `port`:
/// transmit them on the matching NIC ring.
///
/// Producers that find the NIC ring busy leave a pending mark; the context
/// holding the ring keeps transmitting until no mark is left.
pub(crate) fn tx_notify(port: &Port, nic: &NicAdapter, side: WrapSide, ring: usize) {
    let hw_ring = match side {
        WrapSide::Hw => ring,
        WrapSide::Host => nic.num_tx_rings(),
    };
    let hw_kring = nic.tx_ring(hw_ring);
    hw_kring.set_pending();
    loop {
        let Some(mut hw_sync) = hw_kring.try_lock_sync() else {
            trace!(nic = %nic.name(), ring = hw_ring, "NIC ring busy, transmit left to holder");
            return;
        };
        while hw_kring.take_pending() {
            tx_pass(port, nic, hw_ring, hw_kring, &mut hw_sync, ring);
        }
        drop(hw_sync);
        // Marked between the last pass and the unlock.
        if !hw_kring.has_pending() {
            return;
        }
    }
}

fn tx_pass(
    port: &Port,
    nic: &NicAdapter,
    hw_ring: usize,
    hw_kring: &KRing,
    hw_sync: &mut SyncState,
    ring: usize,
) {
    let kring = port.rx_ring(ring);
    let mut sync = kring.lock_sync();
    // Release whatever a previous pass left consumed.
    port.rxsync(ring, sync.head);

    hw_sync.head = kring.cursors().hwtail;
    if let Err(e) = nic.txsync(hw_ring, hw_sync.head) {
        warn!(nic = %nic.name(), ring = hw_ring, error = %e, "NIC transmit sync failed");
    }

    // Slots the NIC finished with go back to the bridge. hwtail itself is
    // the reserved slot of the NIC ring.
    sync.head = {
        let c = hw_kring.cursors();
        c.next(c.hwtail)
    };
    port.rxsync(ring, sync.head);
}

/// Receive interrupt on NIC ring `nic_ring`: forward the new frames through
/// transmit ring `ring` of wrap port `port`.
pub(crate) fn intr_notify(
    port: &Port,
    nic: &NicAdapter,
    nic_ring: usize,
    ring: usize,
) -> NotifyOutcome {
    let hw_kring = nic.rx_ring(nic_ring);
    let Some(mut hw_sync) = hw_kring.try_lock_sync() else {
        trace!(nic = %nic.name(), ring = nic_ring, "NIC ring busy, interrupt deferred");
        return NotifyOutcome::Completed;
    };

    if let Err(e) = nic.rxsync(nic_ring, hw_sync.head) {
        warn!(nic = %nic.name(), ring = nic_ring, error = %e, "NIC receive sync failed");
        return NotifyOutcome::Completed;
    }
    let hwtail = {
        let c = hw_kring.cursors();
        if c.hwcur == c.hwtail {
            return NotifyOutcome::Completed;
        }
        c.hwtail
    };

    let done = {
        let kring = port.tx_ring(ring);
        let mut sync = kring.lock_sync();
        sync.head = hwtail;
        port.txsync(ring, &mut sync);
        kring.cursors().hwcur
    };
    if done != hwtail {
        trace!(port = %port.name(), done, hwtail, "Partial forward from NIC ring");
    }

    // Give the forwarded slots back to the NIC.
    hw_sync.head = done;
    if let Err(e) = nic.rxsync(nic_ring, done) {
        warn!(nic = %nic.name(), ring = nic_ring, error = %e, "NIC receive sync failed");
        return NotifyOutcome::Completed;
    }
    if hw_kring.cursors().hwtail != done {
        NotifyOutcome::Reschedule
    } else {
        NotifyOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bridge::{Bridge, Tunables};
    use crate::nic::{NicGeometry, WrapHook};
    use crate::port::{BridgeLink, PortHandle};
    use crate::test_util::MockNic;
    use crate::test_util::frames::{BROADCAST, build_frame};

    const MAC_V: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const MAC_N: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    struct Setup {
        mock: Arc<MockNic>,
        nic: Arc<NicAdapter>,
        vport: PortHandle,
        _bridge: Arc<Bridge>,
    }

    fn link(bridge: &Arc<Bridge>, port: &Arc<Port>, index: usize) {
        port.set_link(Some(Arc::new(BridgeLink {
            bridge: bridge.clone(),
            index,
            name: port.name().to_string(),
        })));
    }

    fn setup() -> Setup {
        let mock = Arc::new(MockNic::new("eth0"));
        let geometry = NicGeometry {
            tx_rings: 1,
            rx_rings: 1,
            tx_slots: 64,
            rx_slots: 64,
            buf_size: 2048,
        };
        let nic = Arc::new(NicAdapter::new(mock.clone(), &geometry, 1).unwrap());
        let bridge = Arc::new(Bridge::new(0, Arc::new(Tunables::new(64, 114, 8))));

        let hw = Arc::new(Port::new_wrap("sw0:eth0", nic.clone(), WrapSide::Hw));
        let host = Arc::new(Port::new_wrap("sw0:eth0^", nic.clone(), WrapSide::Host));
        let vport = Arc::new(Port::test_virtual("sw0:v"));
        {
            let mut state = bridge.write();
            let (h, s) = state.attach_common(hw.clone(), Some(host.clone()));
            link(&bridge, &hw, h);
            if let Some(s) = s {
                link(&bridge, &host, s);
            }
            let (v, _) = state.attach_common(vport.clone(), None);
            link(&bridge, &vport, v);
        }
        nic.set_hook(Some(Arc::new(WrapHook {
            hw,
            host: Some(host),
        })));
        Setup {
            mock,
            nic,
            vport: PortHandle::new(vport),
            _bridge: bridge,
        }
    }

    #[test]
    fn test_nic_receive_reaches_bridge() {
        let s = setup();
        let frame = build_frame(BROADCAST, MAC_N, b"from wire");
        s.mock.inject(0, frame.clone());
        assert_eq!(s.nic.interrupt(0), NotifyOutcome::Completed);

        assert_eq!(s.vport.recv(0).unwrap(), vec![frame.clone()]);
        // Flooded to the host stack as well.
        assert_eq!(s.mock.transmitted(1), vec![frame]);
    }

    #[test]
    fn test_bridge_delivery_transmits_on_nic() {
        let s = setup();
        let frame = build_frame(BROADCAST, MAC_V, b"to wire");
        s.vport.send(0, &[&frame]).unwrap();
        assert_eq!(s.mock.transmitted(0), vec![frame.clone()]);
        assert_eq!(s.mock.transmitted(1), vec![frame]);
    }

    #[test]
    fn test_repeated_traffic_recycles_slots() {
        let s = setup();
        for round in 0..5u8 {
            let frames: Vec<Vec<u8>> = (0..30)
                .map(|i| build_frame(BROADCAST, MAC_V, &[round, i]))
                .collect();
            let refs: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
            assert_eq!(s.vport.send(0, &refs).unwrap(), 30);
            assert_eq!(s.mock.transmitted(0).len(), 30);

            for f in &frames {
                s.mock.inject(0, f.clone());
            }
            s.nic.interrupt(0);
            assert_eq!(s.vport.recv(0).unwrap().len(), 30);
            s.mock.transmitted(1);
        }
    }

    #[test]
    fn test_host_stack_frames_reach_wire() {
        let s = setup();
        let frame = build_frame(BROADCAST, MAC_N, b"from host");
        s.mock.inject(1, frame.clone());
        assert_eq!(s.nic.interrupt(1), NotifyOutcome::Completed);
        assert_eq!(s.mock.transmitted(0), vec![frame.clone()]);
        assert_eq!(s.vport.recv(0).unwrap(), vec![frame]);
    }

    #[test]
    fn test_delivery_during_busy_transmit_is_sent() {
        let s = setup();
        let other = Arc::new(Port::test_virtual("sw0:w"));
        {
            let bridge = &s._bridge;
            let (idx, _) = bridge.write().attach_common(other.clone(), None);
            link(bridge, &other, idx);
        }
        let other = PortHandle::new(other);

        let first = build_frame(BROADCAST, MAC_V, b"first");
        let second = build_frame(BROADCAST, [0x02, 0, 0, 0, 0, 0x03], b"second");
        let (entered, release) = s.mock.gate_next_txsync(0);
        let vport = s.vport;
        let sender = std::thread::spawn(move || {
            vport.send(0, &[&first]).unwrap();
            first
        });

        // The first transmit is parked inside the NIC with the ring held.
        entered.recv().unwrap();
        assert!(s.nic.tx_ring(0).try_lock_sync().is_none());
        other.send(0, &[&second]).unwrap();
        assert!(s.nic.tx_ring(0).has_pending());
        release.send(()).unwrap();
        let first = sender.join().unwrap();

        assert_eq!(s.mock.transmitted(0), vec![first, second]);
        assert!(!s.nic.tx_ring(0).has_pending());
    }

    #[test]
    fn test_busy_nic_ring_defers() {
        let s = setup();
        let guard = s.nic.rx_ring(0).lock_sync();
        s.mock.inject(0, build_frame(BROADCAST, MAC_N, b"x"));
        assert_eq!(s.nic.interrupt(0), NotifyOutcome::Completed);
        drop(guard);
        assert!(s.vport.recv(0).unwrap().is_empty());
        s.nic.interrupt(0);
        assert_eq!(s.vport.recv(0).unwrap().len(), 1);
    }
}
