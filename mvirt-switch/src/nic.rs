//! NIC boundary.
//!
//! A driver exposes its rings through [`NicDriver`]; the fabric wraps it in a
//! [`NicAdapter`] that owns the ring memory, one extra ring pair for the host
//! network stack, and the interrupt routing. While the NIC is attached to a
//! bridge its receive interrupts are diverted into the switch; otherwise they
//! wake whoever opened the NIC directly.

use std::io;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DEFAULT_MFS;
use crate::error::{Result, SwitchError};
use crate::polling::PollingHandle;
use crate::port::Port;
use crate::ring::{Direction, KRing, Ring, SyncContext, Waker};
use crate::wrap;

/// Result of handling a receive interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Completed,
    /// More frames arrived while handling; call again.
    Reschedule,
}

/// A device driver's view of its rings.
///
/// Ring indices passed to the sync calls include the host rings, which
/// follow the hardware rings.
pub trait NicDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum frame size the device accepts.
    fn mfs(&self) -> usize {
        DEFAULT_MFS
    }

    /// Length of the virtio-net header the device expects.
    fn virt_hdr_len(&self) -> usize {
        0
    }

    /// Transmit slots `[hwcur, head)` and reclaim completed ones by moving
    /// `hwtail`.
    fn txsync(&self, ring: usize, ctx: &mut SyncContext<'_>) -> io::Result<()>;

    /// Release slots up to `head` and import newly received frames by
    /// moving `hwtail`.
    fn rxsync(&self, ring: usize, ctx: &mut SyncContext<'_>) -> io::Result<()>;

    fn set_interrupts(&self, enable: bool);
}

/// Ring layout of a registered NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicGeometry {
    pub tx_rings: usize,
    pub rx_rings: usize,
    pub tx_slots: u32,
    pub rx_slots: u32,
    pub buf_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Free,
    User,
    Bridge,
}

/// Wrap ports currently intercepting a NIC.
pub(crate) struct WrapHook {
    pub hw: Arc<Port>,
    pub host: Option<Arc<Port>>,
}

pub struct NicAdapter {
    driver: Arc<dyn NicDriver>,
    num_tx: usize,
    num_rx: usize,
    tx_rings: Vec<KRing>,
    rx_rings: Vec<KRing>,
    mem_id: u32,
    owner: Mutex<Owner>,
    hook: ArcSwapOption<WrapHook>,
    polling: Mutex<Option<PollingHandle>>,
    waker: Waker,
}

impl NicAdapter {
    pub fn new(driver: Arc<dyn NicDriver>, geometry: &NicGeometry, mem_id: u32) -> Result<Self> {
        let name = driver.name().to_string();
        let make = |dir: Direction, count: usize, slots: u32| {
            (0..=count)
                .map(|i| {
                    let ring = Arc::new(Ring::new(slots, geometry.buf_size));
                    let label = if i == count { "host" } else { "hw" };
                    KRing::new(format!("{name} {label} {dir:?}{i}"), i, dir, ring)
                })
                .collect::<Vec<_>>()
        };
        Ok(Self {
            num_tx: geometry.tx_rings,
            num_rx: geometry.rx_rings,
            tx_rings: make(Direction::Tx, geometry.tx_rings, geometry.tx_slots),
            rx_rings: make(Direction::Rx, geometry.rx_rings, geometry.rx_slots),
            driver,
            mem_id,
            owner: Mutex::new(Owner::Free),
            hook: ArcSwapOption::empty(),
            polling: Mutex::new(None),
            waker: Waker::new()?,
        })
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn driver(&self) -> &Arc<dyn NicDriver> {
        &self.driver
    }

    /// Hardware transmit rings (host ring excluded).
    pub fn num_tx_rings(&self) -> usize {
        self.num_tx
    }

    /// Hardware receive rings (host ring excluded).
    pub fn num_rx_rings(&self) -> usize {
        self.num_rx
    }

    /// Transmit kring `i`; index `num_tx_rings()` is the host ring.
    pub fn tx_ring(&self, i: usize) -> &KRing {
        &self.tx_rings[i]
    }

    /// Receive kring `i`; index `num_rx_rings()` is the host ring.
    pub fn rx_ring(&self, i: usize) -> &KRing {
        &self.rx_rings[i]
    }

    pub fn mfs(&self) -> usize {
        self.driver.mfs()
    }

    pub fn virt_hdr_len(&self) -> usize {
        self.driver.virt_hdr_len()
    }

    pub fn mem_id(&self) -> u32 {
        self.mem_id
    }

    pub fn waker(&self) -> &Waker {
        &self.waker
    }

    pub fn set_interrupts(&self, enable: bool) {
        debug!(nic = %self.name(), enable, "Setting interrupts");
        self.driver.set_interrupts(enable);
    }

    pub fn is_polling(&self) -> bool {
        self.polling.lock().is_some()
    }

    pub(crate) fn polling(&self) -> &Mutex<Option<PollingHandle>> {
        &self.polling
    }

    pub(crate) fn owner(&self) -> Owner {
        *self.owner.lock()
    }

    /// Take ownership if the NIC is free.
    pub(crate) fn claim(&self, owner: Owner) -> bool {
        let mut cur = self.owner.lock();
        if *cur != Owner::Free {
            return false;
        }
        *cur = owner;
        true
    }

    pub(crate) fn release(&self) {
        *self.owner.lock() = Owner::Free;
    }

    pub(crate) fn set_hook(&self, hook: Option<Arc<WrapHook>>) {
        self.hook.store(hook);
    }

    pub(crate) fn hook(&self) -> Option<Arc<WrapHook>> {
        self.hook.load_full()
    }

    /// Receive interrupt on ring `ring` (the host ring is `num_rx_rings()`).
    pub fn interrupt(&self, ring: usize) -> NotifyOutcome {
        if ring > self.num_rx {
            warn!(nic = %self.name(), ring, "Interrupt on unknown ring");
            return NotifyOutcome::Completed;
        }
        let hook = self.hook.load_full();
        let target = hook.as_ref().and_then(|h| {
            if ring < self.num_rx {
                Some((&h.hw, ring))
            } else {
                h.host.as_ref().map(|host| (host, 0))
            }
        });
        match target {
            Some((port, wrap_ring)) => wrap::intr_notify(port, self, ring, wrap_ring),
            None => {
                self.waker.wake();
                NotifyOutcome::Completed
            }
        }
    }

    /// Run the driver's transmit sync on kring `ring` up to `head`.
    pub(crate) fn txsync(&self, ring: usize, head: u32) -> io::Result<()> {
        let mut ctx = SyncContext::new(&self.tx_rings[ring], head);
        self.driver.txsync(ring, &mut ctx)
    }

    /// Run the driver's receive sync on kring `ring` up to `head`.
    pub(crate) fn rxsync(&self, ring: usize, head: u32) -> io::Result<()> {
        let mut ctx = SyncContext::new(&self.rx_rings[ring], head);
        self.driver.rxsync(ring, &mut ctx)
    }
}

/// Direct, non-switched use of a NIC. The NIC cannot be attached to a
/// bridge while a handle is open.
pub struct NicHandle {
    nic: Arc<NicAdapter>,
}

impl NicHandle {
    pub(crate) fn open(nic: Arc<NicAdapter>) -> Result<Self> {
        if !nic.claim(Owner::User) {
            return Err(SwitchError::PortBusy(nic.name().to_string()));
        }
        Ok(Self { nic })
    }

    pub fn nic(&self) -> &Arc<NicAdapter> {
        &self.nic
    }

    /// Transmit frames on `ring` (the host ring delivers to the host stack).
    pub fn send(&self, ring: usize, frames: &[&[u8]]) -> Result<usize> {
        if ring > self.nic.num_tx {
            return Err(SwitchError::InvalidArgument(format!("tx ring {ring}")));
        }
        let kring = self.nic.tx_ring(ring);
        let mut sync = kring.lock_sync();
        let mut queued = 0;
        for frame in frames {
            if !kring.push_packet(&mut sync, &[*frame]) {
                break;
            }
            queued += 1;
        }
        self.nic.txsync(ring, sync.head)?;
        Ok(queued)
    }

    /// Receive pending frames on `ring`.
    pub fn recv(&self, ring: usize) -> Result<Vec<Vec<u8>>> {
        if ring > self.nic.num_rx {
            return Err(SwitchError::InvalidArgument(format!("rx ring {ring}")));
        }
        let kring = self.nic.rx_ring(ring);
        let mut sync = kring.lock_sync();
        self.nic.rxsync(ring, sync.head)?;
        let packets = kring.pop_packets(&mut sync);
        self.nic.rxsync(ring, sync.head)?;
        Ok(packets.into_iter().map(|p| p.concat()).collect())
    }
}

impl Drop for NicHandle {
    fn drop(&mut self) {
        self.nic.release();
    }
}
