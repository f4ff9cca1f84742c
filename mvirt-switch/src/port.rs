//! Switch ports.
//!
//! A [`Port`] is anything that can sit in a bridge slot: an ephemeral or
//! persistent virtual port owned by an application, or one side of a
//! bridge-wrap adapter fronting a NIC (its hardware rings or its host-stack
//! rings). Applications drive virtual ports through a [`PortHandle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::debug;

use crate::bridge::Bridge;
use crate::error::{Result, SwitchError};
use crate::forward;
use crate::nic::NicAdapter;
use crate::ring::{Direction, KRing, Ring, SyncState, Waker};
use crate::wrap;

/// Which rings of a NIC a wrap port fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapSide {
    Hw,
    Host,
}

pub enum PortKind {
    Virtual,
    Wrap {
        nic: Arc<NicAdapter>,
        side: WrapSide,
    },
}

/// Back-reference from an attached port to its bridge.
pub struct BridgeLink {
    pub bridge: Arc<Bridge>,
    /// Slot of the port in the bridge table.
    pub index: usize,
    /// Name the port is attached under (`bridge:port`).
    pub name: String,
}

/// Ring geometry of a new port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortGeometry {
    pub tx_rings: usize,
    pub rx_rings: usize,
    pub tx_slots: u32,
    pub rx_slots: u32,
    pub buf_size: usize,
    pub mfs: usize,
}

/// Forwarding counters of a port, seen as the sender.
#[derive(Debug, Default)]
pub struct PortStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    nomem: AtomicU64,
    truncated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortStatsSnapshot {
    pub forwarded: u64,
    pub dropped: u64,
    pub nomem: u64,
    /// Forwarded packets cut down to fit a destination buffer.
    pub truncated: u64,
}

impl PortStats {
    pub(crate) fn add_forwarded(&self, n: u64) {
        self.forwarded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_nomem(&self) {
        self.nomem.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_truncated(&self, n: u64) {
        self.truncated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            nomem: self.nomem.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
        }
    }
}

const NO_MAC: u64 = u64::MAX;

pub struct Port {
    name: String,
    kind: PortKind,
    tx_rings: Vec<KRing>,
    rx_rings: Vec<KRing>,
    virt_hdr_len: AtomicUsize,
    mfs: usize,
    mem_id: u32,
    persistent: bool,
    link: ArcSwapOption<BridgeLink>,
    last_src_mac: AtomicU64,
    stats: PortStats,
    waker: Option<Waker>,
    users: AtomicUsize,
}

impl Port {
    /// Create a virtual port with its own rings.
    pub fn new_virtual(
        name: &str,
        geometry: &PortGeometry,
        mem_id: u32,
        persistent: bool,
    ) -> Result<Self> {
        let make = |dir: Direction, count: usize, slots: u32| {
            (0..count)
                .map(|i| {
                    let ring = Arc::new(Ring::new(slots, geometry.buf_size));
                    KRing::new(format!("{name} {dir:?}{i}"), i, dir, ring)
                })
                .collect::<Vec<_>>()
        };
        Ok(Self {
            name: name.to_string(),
            kind: PortKind::Virtual,
            tx_rings: make(Direction::Tx, geometry.tx_rings, geometry.tx_slots),
            rx_rings: make(Direction::Rx, geometry.rx_rings, geometry.rx_slots),
            virt_hdr_len: AtomicUsize::new(0),
            mfs: geometry.mfs,
            mem_id,
            persistent,
            link: ArcSwapOption::empty(),
            last_src_mac: AtomicU64::new(NO_MAC),
            stats: PortStats::default(),
            waker: Some(Waker::new()?),
            users: AtomicUsize::new(0),
        })
    }

    /// Create one side of a bridge-wrap adapter.
    ///
    /// The port's transmit rings share memory with the NIC's receive rings
    /// and its receive rings with the NIC's transmit rings, so that frames
    /// move between the two without a copy.
    pub fn new_wrap(name: &str, nic: Arc<NicAdapter>, side: WrapSide) -> Self {
        let (tx_range, rx_range) = match side {
            WrapSide::Hw => (0..nic.num_rx_rings(), 0..nic.num_tx_rings()),
            WrapSide::Host => (
                nic.num_rx_rings()..nic.num_rx_rings() + 1,
                nic.num_tx_rings()..nic.num_tx_rings() + 1,
            ),
        };
        let tx_rings = tx_range
            .enumerate()
            .map(|(i, r)| {
                let ring = nic.rx_ring(r).ring().clone();
                KRing::new(format!("{name} Tx{i}"), i, Direction::Tx, ring)
            })
            .collect();
        let rx_rings = rx_range
            .enumerate()
            .map(|(i, r)| {
                let ring = nic.tx_ring(r).ring().clone();
                KRing::new(format!("{name} Rx{i}"), i, Direction::Rx, ring)
            })
            .collect();
        Self {
            name: name.to_string(),
            virt_hdr_len: AtomicUsize::new(nic.virt_hdr_len()),
            mfs: nic.mfs(),
            mem_id: nic.mem_id(),
            kind: PortKind::Wrap { nic, side },
            tx_rings,
            rx_rings,
            persistent: false,
            link: ArcSwapOption::empty(),
            last_src_mac: AtomicU64::new(NO_MAC),
            stats: PortStats::default(),
            waker: None,
            users: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    pub fn is_wrap(&self) -> bool {
        matches!(self.kind, PortKind::Wrap { .. })
    }

    /// Whether forwarding from this port may block on the bridge lock.
    /// Wrap ports run from interrupt or polling context and may not.
    pub fn may_sleep(&self) -> bool {
        !self.is_wrap()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn num_tx_rings(&self) -> usize {
        self.tx_rings.len()
    }

    pub fn num_rx_rings(&self) -> usize {
        self.rx_rings.len()
    }

    pub fn tx_ring(&self, i: usize) -> &KRing {
        &self.tx_rings[i]
    }

    pub fn rx_ring(&self, i: usize) -> &KRing {
        &self.rx_rings[i]
    }

    pub fn tx_slots(&self) -> u32 {
        self.tx_rings.first().map_or(0, |k| k.num_slots())
    }

    pub fn rx_slots(&self) -> u32 {
        self.rx_rings.first().map_or(0, |k| k.num_slots())
    }

    pub fn virt_hdr_len(&self) -> usize {
        self.virt_hdr_len.load(Ordering::Relaxed)
    }

    pub(crate) fn set_virt_hdr_len(&self, len: usize) {
        self.virt_hdr_len.store(len, Ordering::Relaxed);
    }

    pub fn mfs(&self) -> usize {
        self.mfs
    }

    pub fn mem_id(&self) -> u32 {
        self.mem_id
    }

    pub fn link(&self) -> Option<Arc<BridgeLink>> {
        self.link.load_full()
    }

    /// Attach to or detach from a bridge. The cached source address only
    /// holds for the table of the old bridge and is forgotten.
    pub(crate) fn set_link(&self, link: Option<Arc<BridgeLink>>) {
        self.forget_src_mac();
        self.link.store(link);
    }

    pub fn last_src_mac(&self) -> u64 {
        self.last_src_mac.load(Ordering::Relaxed)
    }

    pub fn set_last_src_mac(&self, mac: u64) {
        self.last_src_mac.store(mac, Ordering::Relaxed);
    }

    pub(crate) fn forget_src_mac(&self) {
        self.set_last_src_mac(NO_MAC);
    }

    pub fn stats(&self) -> &PortStats {
        &self.stats
    }

    pub fn waker(&self) -> Option<&Waker> {
        self.waker.as_ref()
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    /// Stop or restart every ring of the port.
    pub(crate) fn set_rings_stopped(&self, stopped: bool) {
        for k in self.tx_rings.iter().chain(self.rx_rings.iter()) {
            k.set_stopped(stopped);
        }
    }

    /// Transmit sync: forward everything the user queued up to `sync.head`.
    ///
    /// A port that is not attached drops what it is given.
    pub(crate) fn txsync(&self, ring: usize, sync: &mut SyncState) {
        let kring = &self.tx_rings[ring];
        let head = sync.head;
        let done = forward::preflush(self, ring, kring, sync, head);
        if done != head {
            debug!(port = %self.name, ring, done, head, "Early break in transmit sync");
        }
        let mut c = kring.cursors();
        c.hwcur = done;
        c.hwtail = c.prev(done);
    }

    /// Receive sync: return the slots the user consumed.
    pub(crate) fn rxsync(&self, ring: usize, head: u32) {
        self.rx_rings[ring].release_rx(head);
    }

    /// Called after the switch published new frames on receive ring `ring`.
    pub(crate) fn notify_rx(&self, ring: usize) {
        match &self.kind {
            PortKind::Virtual => {
                if let Some(w) = &self.waker {
                    w.wake();
                }
            }
            PortKind::Wrap { nic, side } => {
                wrap::tx_notify(self, nic, *side, ring);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_virtual(name: &str) -> Self {
        let geometry = PortGeometry {
            tx_rings: 1,
            rx_rings: 1,
            tx_slots: 64,
            rx_slots: 64,
            buf_size: 2048,
            mfs: crate::config::DEFAULT_MFS,
        };
        Self::new_virtual(name, &geometry, 0, false).expect("eventfd")
    }
}

/// An application's open reference to a virtual port.
///
/// Holding a handle keeps the port alive across detach; frames sent on a
/// detached port are dropped.
pub struct PortHandle {
    port: Arc<Port>,
}

impl PortHandle {
    pub(crate) fn new(port: Arc<Port>) -> Self {
        port.users.fetch_add(1, Ordering::AcqRel);
        Self { port }
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    fn check_ring(&self, ring: usize, count: usize) -> Result<()> {
        if ring >= count {
            return Err(SwitchError::InvalidArgument(format!(
                "ring {ring} out of range for {} ({count} rings)",
                self.port.name
            )));
        }
        Ok(())
    }

    /// Send each frame as one packet on transmit ring `ring`. Frames larger
    /// than a buffer span several slots. Returns how many frames were
    /// queued before the ring filled up.
    pub fn send(&self, ring: usize, frames: &[&[u8]]) -> Result<usize> {
        self.check_ring(ring, self.port.num_tx_rings())?;
        let kring = self.port.tx_ring(ring);
        let mut sync = kring.lock_sync();
        let mut queued = 0;
        for frame in frames {
            if !kring.push_packet(&mut sync, &[*frame]) {
                break;
            }
            queued += 1;
        }
        self.port.txsync(ring, &mut sync);
        Ok(queued)
    }

    /// Send one packet laid out over the given fragments, one slot each.
    pub fn send_fragments(&self, ring: usize, frags: &[&[u8]]) -> Result<bool> {
        self.check_ring(ring, self.port.num_tx_rings())?;
        let kring = self.port.tx_ring(ring);
        let mut sync = kring.lock_sync();
        let queued = kring.push_packet(&mut sync, frags);
        self.port.txsync(ring, &mut sync);
        Ok(queued)
    }

    /// Receive every pending packet on `ring`, fragments concatenated.
    pub fn recv(&self, ring: usize) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .recv_fragments(ring)?
            .into_iter()
            .map(|frags| frags.concat())
            .collect())
    }

    /// Receive every pending packet on `ring` as its slot fragments.
    pub fn recv_fragments(&self, ring: usize) -> Result<Vec<Vec<Vec<u8>>>> {
        self.check_ring(ring, self.port.num_rx_rings())?;
        let kring = self.port.rx_ring(ring);
        let mut sync = kring.lock_sync();
        let packets = kring.pop_packets(&mut sync);
        self.port.rxsync(ring, sync.head);
        Ok(packets)
    }

    /// Wait for the switch to deliver something, up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        match self.port.waker() {
            Some(w) => Ok(w.wait(timeout)?),
            None => Ok(false),
        }
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        self.port.users.fetch_sub(1, Ordering::AcqRel);
    }
}
