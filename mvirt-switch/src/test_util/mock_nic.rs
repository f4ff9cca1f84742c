//! In-memory NIC driver.
//!
//! Transmitted frames are captured per ring; received frames are queued with
//! [`MockNic::inject`] and show up on the next receive sync.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::nic::NicDriver;
use crate::ring::SyncContext;

pub struct MockNic {
    name: String,
    virt_hdr_len: usize,
    pending: Mutex<HashMap<usize, VecDeque<Vec<u8>>>>,
    sent: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    interrupts: AtomicBool,
    tx_gate: Mutex<Option<TxGate>>,
}

/// Parks one transmit sync on a ring until released.
struct TxGate {
    ring: usize,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl MockNic {
    pub fn new(name: &str) -> Self {
        Self::with_virt_hdr_len(name, 0)
    }

    pub fn with_virt_hdr_len(name: &str, virt_hdr_len: usize) -> Self {
        Self {
            name: name.to_string(),
            virt_hdr_len,
            pending: Mutex::new(HashMap::new()),
            sent: Mutex::new(HashMap::new()),
            interrupts: AtomicBool::new(true),
            tx_gate: Mutex::new(None),
        }
    }

    /// Queue a frame to be received on `ring`.
    pub fn inject(&self, ring: usize, frame: Vec<u8>) {
        self.pending.lock().entry(ring).or_default().push_back(frame);
    }

    /// Take the frames transmitted on `ring` so far.
    pub fn transmitted(&self, ring: usize) -> Vec<Vec<u8>> {
        self.sent.lock().remove(&ring).unwrap_or_default()
    }

    /// Frames injected on `ring` that did not fit the ring yet.
    pub fn pending(&self, ring: usize) -> usize {
        self.pending.lock().get(&ring).map_or(0, |q| q.len())
    }

    /// Make the next transmit sync on `ring` signal the returned receiver
    /// and block until the returned sender fires.
    pub fn gate_next_txsync(&self, ring: usize) -> (Receiver<()>, Sender<()>) {
        let (entered, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release) = crossbeam_channel::bounded(1);
        *self.tx_gate.lock() = Some(TxGate {
            ring,
            entered,
            release,
        });
        (entered_rx, release_tx)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl NicDriver for MockNic {
    fn name(&self) -> &str {
        &self.name
    }

    fn virt_hdr_len(&self) -> usize {
        self.virt_hdr_len
    }

    fn txsync(&self, ring: usize, ctx: &mut SyncContext<'_>) -> io::Result<()> {
        let gate = {
            let mut gate = self.tx_gate.lock();
            if gate.as_ref().is_some_and(|g| g.ring == ring) {
                gate.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }

        let head = ctx.head();
        let mut i = ctx.hwcur();
        let mut out = Vec::new();
        while i != head {
            out.push(ctx.packet(i).to_vec());
            i = ctx.next(i);
        }
        if !out.is_empty() {
            self.sent.lock().entry(ring).or_default().extend(out);
        }
        // Transmission completes immediately.
        ctx.set_hwcur(head);
        let tail = ctx.prev(head);
        ctx.set_hwtail(tail);
        Ok(())
    }

    fn rxsync(&self, ring: usize, ctx: &mut SyncContext<'_>) -> io::Result<()> {
        let head = ctx.head();
        ctx.set_hwcur(head);
        let mut pending = self.pending.lock();
        let Some(queue) = pending.get_mut(&ring) else {
            return Ok(());
        };
        let mut t = ctx.hwtail();
        while ctx.next(t) != head {
            let Some(frame) = queue.pop_front() else {
                break;
            };
            ctx.store(t, &frame, 0);
            t = ctx.next(t);
        }
        ctx.set_hwtail(t);
        Ok(())
    }

    fn set_interrupts(&self, enable: bool) {
        self.interrupts.store(enable, Ordering::SeqCst);
    }
}
