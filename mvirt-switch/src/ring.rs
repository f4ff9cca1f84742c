//! Slot rings shared between the switch, its ports and NIC drivers.
//!
//! A [`Ring`] is the memory: a circular array of [`Slot`] descriptors and
//! one fixed-size buffer per slot. A [`KRing`] is one party's view of a ring
//! with its own cursors. Two krings may share a ring (a bridge-wrap port and
//! the NIC it fronts); each then owns complementary slot regions.
//!
//! # Ownership protocol
//!
//! Slot and buffer contents are not locked. Access is partitioned by the
//! cursors instead:
//!
//! - on a receive kring, `[hwcur, hwtail)` belongs to the consumer and
//!   `[hwtail, hwlease)` to producers holding a lease;
//! - on a transmit kring, `[hwcur, head)` belongs to whoever runs the sync
//!   pass (serialized by the sync lock) and `[head, hwtail)` to the user.
//!
//! Every unsafe accessor below relies on the caller owning the slots it
//! touches under this protocol.

use std::cell::UnsafeCell;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::{Mutex, MutexGuard};

use crate::forward::ForwardBatch;
use crate::lease::RingCursors;

/// The slot's buffer was replaced by the user.
pub const NS_BUF_CHANGED: u16 = 0x0001;
/// More fragments of the same packet follow in the next slot.
pub const NS_MOREFRAG: u16 = 0x0020;

/// A ring slot descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    pub buf_idx: u32,
    pub len: u16,
    pub flags: u16,
}

/// Direction of a kring, seen from the party that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Slot and buffer storage of one ring.
pub struct Ring {
    num_slots: u32,
    buf_size: usize,
    slots: Box<[UnsafeCell<Slot>]>,
    bufs: Box<[UnsafeCell<u8>]>,
}

// SAFETY: concurrent access to slots and buffers is partitioned by the
// cursor protocol described in the module documentation.
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(num_slots: u32, buf_size: usize) -> Self {
        let slots = (0..num_slots)
            .map(|i| {
                UnsafeCell::new(Slot {
                    buf_idx: i,
                    len: 0,
                    flags: 0,
                })
            })
            .collect();
        let bufs = (0..num_slots as usize * buf_size)
            .map(|_| UnsafeCell::new(0u8))
            .collect();
        Self {
            num_slots,
            buf_size,
            slots,
            bufs,
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// # Safety
    ///
    /// The caller must own slot `i`.
    pub(crate) unsafe fn slot(&self, i: u32) -> Slot {
        unsafe { *self.slots[i as usize].get() }
    }

    /// # Safety
    ///
    /// The caller must own slot `i`.
    pub(crate) unsafe fn set_slot(&self, i: u32, slot: Slot) {
        unsafe { *self.slots[i as usize].get() = slot }
    }

    /// # Safety
    ///
    /// The caller must own slot `i`.
    pub(crate) unsafe fn set_len_flags(&self, i: u32, len: u16, flags: u16) {
        unsafe {
            let slot = &mut *self.slots[i as usize].get();
            slot.len = len;
            slot.flags = flags;
        }
    }

    /// # Safety
    ///
    /// The caller must own slot `i`.
    pub(crate) unsafe fn clear_flags(&self, i: u32, mask: u16) {
        unsafe { (*self.slots[i as usize].get()).flags &= !mask }
    }

    fn buf_ptr(&self, buf_idx: u32) -> *mut u8 {
        let off = buf_idx as usize * self.buf_size;
        assert!(off + self.buf_size <= self.bufs.len(), "buffer index out of range");
        // SAFETY: offset is within the allocation (checked above).
        unsafe { UnsafeCell::raw_get(self.bufs.as_ptr().add(off)) }
    }

    /// The whole buffer attached to a slot.
    ///
    /// # Safety
    ///
    /// The caller must own the slot referring to `buf_idx` and nobody may
    /// write the buffer while the returned slice lives.
    pub(crate) unsafe fn buffer(&self, buf_idx: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf_ptr(buf_idx), self.buf_size) }
    }

    /// Copy `data` into a buffer at `offset`. Bytes past the buffer end are
    /// silently dropped; the number of bytes written is returned.
    ///
    /// # Safety
    ///
    /// The caller must own the slot referring to `buf_idx`.
    pub(crate) unsafe fn write_buffer(&self, buf_idx: u32, offset: usize, data: &[u8]) -> usize {
        if offset >= self.buf_size {
            return 0;
        }
        let n = data.len().min(self.buf_size - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.buf_ptr(buf_idx).add(offset), n);
        }
        n
    }

    /// Zero `len` bytes of a buffer starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot referring to `buf_idx`.
    pub(crate) unsafe fn zero_buffer(&self, buf_idx: u32, offset: usize, len: usize) {
        if offset >= self.buf_size {
            return;
        }
        let n = len.min(self.buf_size - offset);
        unsafe { std::ptr::write_bytes(self.buf_ptr(buf_idx).add(offset), 0, n) }
    }
}

/// State serialized by a kring's sync lock.
#[derive(Default)]
pub struct SyncState {
    /// Producer-side head: the user has handed over everything before it.
    pub head: u32,
    /// Forwarding scratch, allocated on first use of a transmit kring.
    pub(crate) batch: Option<ForwardBatch>,
}

/// One party's view of a ring.
pub struct KRing {
    name: String,
    id: usize,
    dir: Direction,
    ring: Arc<Ring>,
    sync: Mutex<SyncState>,
    cursors: Mutex<RingCursors>,
    stopped: AtomicBool,
    /// Work was offered while another context held the sync lock.
    pending: AtomicBool,
}

impl KRing {
    pub fn new(name: String, id: usize, dir: Direction, ring: Arc<Ring>) -> Self {
        let n = ring.num_slots();
        let hwtail = match dir {
            Direction::Tx => n - 1,
            Direction::Rx => 0,
        };
        Self {
            name,
            id,
            dir,
            ring,
            sync: Mutex::new(SyncState::default()),
            cursors: Mutex::new(RingCursors::new(n, hwtail)),
            stopped: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    pub fn num_slots(&self) -> u32 {
        self.ring.num_slots()
    }

    /// Block until the sync lock is free.
    pub fn lock_sync(&self) -> MutexGuard<'_, SyncState> {
        self.sync.lock()
    }

    /// Take the sync lock only if nobody holds it.
    pub fn try_lock_sync(&self) -> Option<MutexGuard<'_, SyncState>> {
        self.sync.try_lock()
    }

    /// Record work for whoever holds, or next takes, the sync lock.
    pub fn set_pending(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Claim recorded work, clearing the flag.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// The short lock protecting cursors and leases.
    pub fn cursors(&self) -> MutexGuard<'_, RingCursors> {
        self.cursors.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn set_stopped(&self, stopped: bool) {
        // Taken under the short lock so a producer that saw the ring running
        // finishes its lease before the flag flips.
        let _cursors = self.cursors.lock();
        self.stopped.store(stopped, Ordering::Release);
    }

    /// Release receive slots up to `head` back to producers.
    pub(crate) fn release_rx(&self, head: u32) {
        let mut c = self.cursors.lock();
        let mut i = c.hwcur;
        while i != head {
            // SAFETY: [hwcur, head) is consumer-owned and being returned.
            unsafe { self.ring.clear_flags(i, NS_BUF_CHANGED) };
            i = c.next(i);
        }
        c.hwcur = head;
    }

    /// Queue one packet made of `frags` on a transmit kring, starting at the
    /// user head. Fragments larger than a buffer are split. Returns `false`
    /// when the free region cannot hold the packet.
    pub(crate) fn push_packet(&self, sync: &mut SyncState, frags: &[&[u8]]) -> bool {
        let buf_size = self.ring.buf_size();
        let needed: usize = frags
            .iter()
            .map(|f| f.len().div_ceil(buf_size).max(1))
            .sum();
        let (hwtail, n) = {
            let c = self.cursors.lock();
            (c.hwtail, c.num_slots())
        };
        let free = ((hwtail + n - sync.head) % n) as usize;
        if needed == 0 || needed > free {
            return false;
        }

        let mut j = sync.head;
        let mut remaining = needed;
        for frag in frags {
            let mut chunks: Vec<&[u8]> = frag.chunks(buf_size).collect();
            if chunks.is_empty() {
                chunks.push(&[]);
            }
            for chunk in chunks {
                remaining -= 1;
                let flags = if remaining > 0 { NS_MOREFRAG } else { 0 };
                // SAFETY: [head, hwtail) is user-owned and we hold the sync lock.
                unsafe {
                    let slot = self.ring.slot(j);
                    self.ring.write_buffer(slot.buf_idx, 0, chunk);
                    self.ring.set_len_flags(j, chunk.len() as u16, flags);
                }
                j = (j + 1) % n;
            }
        }
        sync.head = j;
        true
    }

    /// Copy out every published packet on a receive kring as its list of
    /// fragments and advance the user head past them. Zero-length
    /// single-slot entries (holes left by a producer) are skipped.
    pub(crate) fn pop_packets(&self, sync: &mut SyncState) -> Vec<Vec<Vec<u8>>> {
        let (hwtail, n) = {
            let c = self.cursors.lock();
            (c.hwtail, c.num_slots())
        };
        let mut packets = Vec::new();
        let mut current: Vec<Vec<u8>> = Vec::new();
        let mut j = sync.head;
        while j != hwtail {
            // SAFETY: [head, hwtail) is published to the consumer.
            let (slot, data) = unsafe {
                let slot = self.ring.slot(j);
                let buf = self.ring.buffer(slot.buf_idx);
                (slot, buf[..slot.len as usize].to_vec())
            };
            current.push(data);
            if slot.flags & NS_MOREFRAG == 0 {
                let packet = std::mem::take(&mut current);
                if !(packet.len() == 1 && packet[0].is_empty()) {
                    packets.push(packet);
                }
            }
            j = (j + 1) % n;
        }
        if !current.is_empty() {
            packets.push(current);
        }
        sync.head = hwtail;
        packets
    }
}

/// Sync pass view handed to a NIC driver.
///
/// Created while the kring's sync lock is held; the driver owns the kernel
/// side of the ring for the lifetime of the context.
pub struct SyncContext<'a> {
    kring: &'a KRing,
    head: u32,
}

impl<'a> SyncContext<'a> {
    pub(crate) fn new(kring: &'a KRing, head: u32) -> Self {
        Self { kring, head }
    }

    /// Position up to which the other side has handed slots over.
    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn num_slots(&self) -> u32 {
        self.kring.num_slots()
    }

    pub fn hwcur(&self) -> u32 {
        self.kring.cursors().hwcur
    }

    pub fn hwtail(&self) -> u32 {
        self.kring.cursors().hwtail
    }

    pub fn set_hwcur(&mut self, pos: u32) {
        self.kring.cursors().hwcur = pos;
    }

    pub fn set_hwtail(&mut self, pos: u32) {
        self.kring.cursors().hwtail = pos;
    }

    pub fn next(&self, i: u32) -> u32 {
        (i + 1) % self.num_slots()
    }

    pub fn prev(&self, i: u32) -> u32 {
        (i + self.num_slots() - 1) % self.num_slots()
    }

    pub fn slot(&self, i: u32) -> Slot {
        // SAFETY: the driver owns the kernel region during the sync pass.
        unsafe { self.kring.ring.slot(i) }
    }

    /// Payload of slot `i`.
    pub fn packet(&self, i: u32) -> &[u8] {
        // SAFETY: the driver owns the kernel region during the sync pass.
        unsafe {
            let slot = self.kring.ring.slot(i);
            &self.kring.ring.buffer(slot.buf_idx)[..slot.len as usize]
        }
    }

    /// Store `data` into slot `i`, truncating to the buffer size.
    pub fn store(&mut self, i: u32, data: &[u8], flags: u16) {
        // SAFETY: the driver owns the kernel region during the sync pass.
        unsafe {
            let slot = self.kring.ring.slot(i);
            let n = self.kring.ring.write_buffer(slot.buf_idx, 0, data);
            self.kring.ring.set_len_flags(i, n as u16, flags);
        }
    }
}

/// Eventfd-backed wakeup for a ring consumer.
pub struct Waker {
    fd: EventFd,
}

impl Waker {
    pub fn new() -> std::io::Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Signal the consumer.
    pub fn wake(&self) {
        // Counter overflow is the only failure; the consumer is awake then.
        let _ = self.fd.write(1);
    }

    /// Consume pending wakeups. Returns `true` if there was one.
    pub fn drain(&self) -> bool {
        self.fd.read().is_ok()
    }

    /// Wait until woken or `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> std::io::Result<bool> {
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, timeout)?;
        Ok(ready > 0 && self.drain())
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
