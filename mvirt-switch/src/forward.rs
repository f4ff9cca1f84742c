//! Batched forwarding from one transmit ring to the rest of the bridge.
//!
//! A sync pass on a transmit ring collects the queued slots into a batch of
//! [`FwdEntry`] records, classifies each packet through the bridge's lookup
//! and delivers the batch destination by destination. Per-destination
//! queues are singly linked lists threaded through the batch array by
//! index, with [`FT_NULL`] as terminator; since entries are appended in
//! batch order, merging a unicast queue with the broadcast queue by index
//! preserves classification order.
//!
//! Delivery reserves slots on the destination ring with a lease (see
//! [`crate::lease`]), copies without holding any ring lock and then reports
//! completion.

use std::collections::TryReserveError;

use tracing::{debug, trace, warn};

use crate::bridge::BridgeState;
use crate::config::{MAX_BATCH, MAX_FRAGS, MAX_RINGS};
use crate::ops::{Destination, LookupContext};
use crate::port::Port;
use crate::ring::{KRing, NS_BUF_CHANGED, NS_MOREFRAG, Ring, SyncState};

/// Null link in a destination queue.
pub(crate) const FT_NULL: u32 = u32::MAX;

/// Length copied for a fragment that does not fit the destination buffer.
const OVERSIZE_COPY_LEN: usize = 64;

/// One collected slot.
#[derive(Debug, Clone, Copy)]
struct FwdEntry {
    /// Slot position in the source ring.
    slot: u32,
    len: u16,
    flags: u16,
    /// Where the frame starts for the lookup.
    offset: u16,
    /// Slot count of the packet; only meaningful on its first entry.
    frags: u16,
    next: u32,
}

impl Default for FwdEntry {
    fn default() -> Self {
        Self {
            slot: 0,
            len: 0,
            flags: 0,
            offset: 0,
            frags: 1,
            next: FT_NULL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DstQueue {
    head: u32,
    tail: u32,
    /// Slots queued.
    slots: u32,
    packets: u32,
}

impl DstQueue {
    const EMPTY: DstQueue = DstQueue {
        head: FT_NULL,
        tail: FT_NULL,
        slots: 0,
        packets: 0,
    };
}

/// Per transmit ring forwarding scratch.
pub struct ForwardBatch {
    entries: Vec<FwdEntry>,
    /// `port * MAX_RINGS + ring`, plus one broadcast queue at the end.
    queues: Vec<DstQueue>,
    dsts: Vec<usize>,
}

impl ForwardBatch {
    pub(crate) fn try_new(max_ports: usize) -> Result<Self, TryReserveError> {
        let n_entries = MAX_BATCH + MAX_FRAGS;
        let n_queues = max_ports * MAX_RINGS + 1;

        let mut entries = Vec::new();
        entries.try_reserve_exact(n_entries)?;
        entries.resize(n_entries, FwdEntry::default());

        let mut queues = Vec::new();
        queues.try_reserve_exact(n_queues)?;
        queues.resize(n_queues, DstQueue::EMPTY);

        let mut dsts = Vec::new();
        dsts.try_reserve_exact(n_queues)?;

        Ok(Self {
            entries,
            queues,
            dsts,
        })
    }

    fn broadcast_queue(&self) -> usize {
        self.queues.len() - 1
    }
}

/// Forward the slots `[hwcur, head)` of transmit ring `ring` of `port`.
///
/// Returns the position up to which slots were consumed. This is `head`
/// unless the port may not sleep and the bridge lock was contended.
pub(crate) fn preflush(
    port: &Port,
    ring: usize,
    kring: &KRing,
    sync: &mut SyncState,
    head: u32,
) -> u32 {
    let Some(link) = port.link() else {
        return head;
    };
    let bridge = &link.bridge;
    let state = if port.may_sleep() {
        bridge.read()
    } else {
        match bridge.try_read() {
            Some(state) => state,
            None => {
                trace!(port = %port.name(), "Bridge busy, deferring forwarding");
                return kring.cursors().hwcur;
            }
        }
    };
    // Detached between loading the link and taking the lock.
    if !state
        .port(link.index)
        .is_some_and(|p| std::ptr::eq(p.as_ref(), port))
    {
        return head;
    }

    let tunables = bridge.tunables();
    if sync.batch.is_none() {
        match ForwardBatch::try_new(tunables.max_ports()) {
            Ok(batch) => sync.batch = Some(batch),
            Err(e) => {
                port.stats().add_nomem();
                debug!(port = %port.name(), error = %e, "Failed to allocate forwarding batch");
                return head;
            }
        }
    }
    let Some(batch) = sync.batch.as_mut() else {
        return head;
    };
    let batch_size = tunables.batch_size();
    let gso_header_len = tunables.gso_header_len();

    let mem = kring.ring();
    let n = kring.num_slots();
    let mut j = kring.cursors().hwcur;
    let mut ft_i = 0usize;
    let mut frags = 1usize;

    while j != head {
        // SAFETY: [hwcur, head) was handed over by the user and we hold the
        // ring's sync lock.
        let slot = unsafe { mem.slot(j) };
        unsafe { mem.clear_flags(j, NS_BUF_CHANGED) };
        batch.entries[ft_i] = FwdEntry {
            slot: j,
            len: slot.len,
            flags: slot.flags & !NS_BUF_CHANGED,
            ..FwdEntry::default()
        };
        ft_i += 1;
        j = (j + 1) % n;

        if slot.flags & NS_MOREFRAG != 0 {
            if frags < MAX_FRAGS {
                frags += 1;
                continue;
            }
            debug!(port = %port.name(), "Fragment chain too long, cutting");
            batch.entries[ft_i - 1].flags &= !NS_MOREFRAG;
        }
        batch.entries[ft_i - frags].frags = frags as u16;
        frags = 1;
        if ft_i >= batch_size {
            flush(port, link.index, ring, kring, batch, ft_i, &state, gso_header_len);
            ft_i = 0;
        }
    }
    if frags > 1 {
        // The last packet claims more fragments than were handed over.
        frags -= 1;
        batch.entries[ft_i - 1].flags &= !NS_MOREFRAG;
        batch.entries[ft_i - frags].frags = frags as u16;
        debug!(port = %port.name(), frags, "Truncated incomplete fragment chain");
    }
    if ft_i > 0 {
        flush(port, link.index, ring, kring, batch, ft_i, &state, gso_header_len);
    }
    j
}

/// Classify `n` collected entries and deliver them.
#[allow(clippy::too_many_arguments)]
fn flush(
    port: &Port,
    me: usize,
    src_ring: usize,
    kring: &KRing,
    batch: &mut ForwardBatch,
    n: usize,
    state: &BridgeState,
    gso_header_len: usize,
) {
    let src = kring.ring();
    let bcast = batch.broadcast_queue();
    let capacity = state.capacity();
    let hdr = port.virt_hdr_len();
    let mut dropped = 0u64;
    let mut forwarded = 0u64;
    let mut truncated = 0u64;

    batch.dsts.clear();

    // First pass: find a destination for each packet.
    let mut i = 0;
    while i < n {
        let cur = i;
        let first = batch.entries[cur];
        let frags = first.frags.max(1) as usize;
        i += frags;

        let lookup_at = if hdr < first.len as usize {
            batch.entries[cur].offset = hdr as u16;
            cur
        } else if hdr == first.len as usize && first.flags & NS_MOREFRAG != 0 {
            batch.entries[cur].offset = first.len;
            cur + 1
        } else {
            // The header is neither in the first fragment nor exactly fills it.
            dropped += 1;
            continue;
        };

        let e = batch.entries[lookup_at];
        // SAFETY: the collected slots stay owned by this sync pass.
        let frame = unsafe {
            let buf = src.buffer(src.slot(e.slot).buf_idx);
            let end = (e.len as usize).min(buf.len());
            &buf[(e.offset as usize).min(end)..end]
        };
        let ctx = LookupContext {
            port,
            port_index: me,
            ring: src_ring,
        };
        let d_i = match state.ops().lookup(frame, &ctx) {
            Destination::Drop => {
                dropped += 1;
                continue;
            }
            Destination::Broadcast => bcast,
            Destination::Port { index, ring } => {
                if index == me || index >= capacity || state.port(index).is_none() {
                    dropped += 1;
                    continue;
                }
                index * MAX_RINGS + ring % MAX_RINGS
            }
        };

        let q = &mut batch.queues[d_i];
        if q.head == FT_NULL {
            q.head = cur as u32;
            if d_i != bcast {
                batch.dsts.push(d_i);
            }
        } else {
            batch.entries[q.tail as usize].next = cur as u32;
        }
        q.tail = cur as u32;
        q.slots += frags as u32;
        q.packets += 1;
    }

    // Broadcast traffic reaches ring 0 of every other active port.
    if batch.queues[bcast].head != FT_NULL {
        for &p in state.active_indices() {
            if p == me {
                continue;
            }
            let d_i = p * MAX_RINGS;
            if batch.queues[d_i].head == FT_NULL {
                batch.dsts.push(d_i);
            }
        }
    }

    // Second pass: deliver per destination. Broadcast traffic only rides
    // along with the ring 0 queue of each port.
    let brd = batch.queues[bcast];
    for k in 0..batch.dsts.len() {
        let d_i = batch.dsts[k];
        let q = batch.queues[d_i];
        let brd_here = if d_i % MAX_RINGS == 0 {
            brd
        } else {
            DstQueue::EMPTY
        };
        let total = (q.packets + brd_here.packets) as u64;
        let sent = match state.port(d_i / MAX_RINGS) {
            Some(dst) => deliver(
                port,
                src,
                &batch.entries,
                q,
                brd_here,
                dst,
                d_i % MAX_RINGS,
                gso_header_len,
            ),
            None => Delivery::default(),
        };
        forwarded += sent.packets;
        truncated += sent.truncated;
        dropped += total - sent.packets;
        batch.queues[d_i] = DstQueue::EMPTY;
    }
    batch.queues[bcast] = DstQueue::EMPTY;

    // Reset links for the next batch.
    for e in &mut batch.entries[..n] {
        e.next = FT_NULL;
    }

    if forwarded > 0 {
        port.stats().add_forwarded(forwarded);
    }
    if dropped > 0 {
        port.stats().add_dropped(dropped);
        trace!(port = %port.name(), dropped, "Dropped packets in forwarding pass");
    }
    if truncated > 0 {
        port.stats().add_truncated(truncated);
    }
}

/// Outcome of delivering to one destination ring.
#[derive(Debug, Default, Clone, Copy)]
struct Delivery {
    packets: u64,
    /// Delivered packets with a fragment cut to fit the destination buffer.
    truncated: u64,
}

/// Deliver one destination's share of the batch.
#[allow(clippy::too_many_arguments)]
fn deliver(
    src_port: &Port,
    src: &Ring,
    entries: &[FwdEntry],
    q: DstQueue,
    brd: DstQueue,
    dst: &Port,
    ring: usize,
    gso_header_len: usize,
) -> Delivery {
    let mut needed = q.slots + brd.slots;
    let mismatch = src_port.virt_hdr_len() != dst.virt_hdr_len();
    if mismatch {
        trace!(
            src = src_port.virt_hdr_len(),
            dst = dst.virt_hdr_len(),
            "Virtio header mismatch"
        );
        if dst.mfs() < src_port.mfs() {
            // Payload re-chunked into smaller frames needs more slots.
            let per_slot = dst.mfs().saturating_sub(gso_header_len).max(1);
            needed = (needed as usize * src_port.mfs() / per_slot + 1) as u32;
        }
    }

    if dst.num_rx_rings() == 0 {
        return Delivery::default();
    }
    let dst_nr = ring % dst.num_rx_rings();
    let kring = dst.rx_ring(dst_nr);
    let mem = kring.ring();

    let (lease, mut howmany) = {
        let mut c = kring.cursors();
        if kring.is_stopped() {
            return Delivery::default();
        }
        let howmany = needed.min(c.space(true));
        (c.lease(howmany, true), howmany)
    };

    let n = kring.num_slots();
    let mut j = lease.start;
    let mut next = q.head;
    let mut brd_next = brd.head;
    let mut sent = Delivery::default();

    while howmany > 0 {
        // FT_NULL compares above every index, so an empty list never wins.
        let idx = if next < brd_next {
            let idx = next as usize;
            next = entries[idx].next;
            idx
        } else {
            let idx = brd_next as usize;
            brd_next = entries[idx].next;
            idx
        };

        let cnt = entries[idx].frags.max(1) as usize;
        let packet = &entries[idx..idx + cnt];
        let used = if mismatch {
            let copied = copy_mismatch(
                src,
                packet,
                src_port.virt_hdr_len(),
                mem,
                j,
                dst.virt_hdr_len(),
                howmany,
            );
            match copied {
                Some(used) => used,
                None => break,
            }
        } else {
            if cnt as u32 > howmany {
                break;
            }
            if copy_same(src, packet, mem, j) {
                sent.truncated += 1;
            }
            cnt as u32
        };
        howmany -= used;
        j = (j + used) % n;
        sent.packets += 1;

        if next == FT_NULL && brd_next == FT_NULL {
            break;
        }
    }

    let published = {
        let mut c = kring.cursors();
        if howmany > 0 {
            if c.is_newest(&lease) {
                c.rollback(j);
            } else {
                // Leave empty packets so later leases stay in place.
                while howmany > 0 {
                    // SAFETY: still inside our lease.
                    unsafe { mem.set_len_flags(j, 0, 0) };
                    j = c.next(j);
                    howmany -= 1;
                }
            }
        }
        c.report(&lease, j);
        c.collect(&lease)
    };
    if published.is_some() {
        dst.notify_rx(dst_nr);
    }
    sent
}

/// Copy one packet slot by slot. The destination layout matches the source.
///
/// Returns `true` if a fragment had to be cut to fit a destination buffer.
fn copy_same(src: &Ring, packet: &[FwdEntry], dst: &Ring, start: u32) -> bool {
    let n = dst.num_slots();
    let last = packet.len() - 1;
    let mut j = start;
    let mut truncated = false;
    for (f, e) in packet.iter().enumerate() {
        // SAFETY: source slots belong to this pass, destination slots to
        // our lease.
        unsafe {
            let sbuf = src.buffer(src.slot(e.slot).buf_idx);
            let mut len = (e.len as usize).min(sbuf.len());
            if len > dst.buf_size() {
                warn!(len, "Fragment exceeds destination buffer, truncating");
                len = OVERSIZE_COPY_LEN.min(len);
                truncated = true;
            }
            let dslot = dst.slot(j);
            dst.write_buffer(dslot.buf_idx, 0, &sbuf[..len]);
            let flags = if f < last { NS_MOREFRAG } else { 0 };
            dst.set_len_flags(j, len as u16, flags);
        }
        j = (j + 1) % n;
    }
    truncated
}

/// Copy one packet between ports with different virtio header sizes: the
/// source header is stripped, the destination header is rebuilt from the
/// overlapping prefix of the source one and zero-filled, and the payload is
/// re-chunked into destination buffers.
///
/// Returns the slots used, or `None` if the packet needs more than
/// `available`.
fn copy_mismatch(
    src: &Ring,
    packet: &[FwdEntry],
    src_hdr: usize,
    dst: &Ring,
    start: u32,
    dst_hdr: usize,
    available: u32,
) -> Option<u32> {
    let frag = |e: &FwdEntry| source_fragment(src, e);

    let first = frag(&packet[0]);
    let header = &first[..src_hdr.min(first.len())];
    let payload_len: usize = packet
        .iter()
        .enumerate()
        .map(|(f, e)| if f == 0 { first.len() - header.len() } else { frag(e).len() })
        .sum();

    let buf_size = dst.buf_size();
    let slots = (dst_hdr + payload_len).div_ceil(buf_size).max(1) as u32;
    if slots > available {
        return None;
    }

    let mut w = SlotWriter::new(dst, start);
    let overlap = header.len().min(dst_hdr);
    w.write(&header[..overlap]);
    w.zero(dst_hdr - overlap);
    w.write(&first[header.len()..]);
    for e in &packet[1..] {
        w.write(frag(e));
    }
    Some(w.finish())
}

fn source_fragment<'a>(src: &'a Ring, e: &FwdEntry) -> &'a [u8] {
    // SAFETY: source slots belong to the running sync pass.
    unsafe {
        let buf = src.buffer(src.slot(e.slot).buf_idx);
        &buf[..(e.len as usize).min(buf.len())]
    }
}

/// Sequential writer over consecutive destination slots.
struct SlotWriter<'a> {
    ring: &'a Ring,
    j: u32,
    off: usize,
    used: u32,
}

impl<'a> SlotWriter<'a> {
    fn new(ring: &'a Ring, start: u32) -> Self {
        Self {
            ring,
            j: start,
            off: 0,
            used: 0,
        }
    }

    fn advance_if_full(&mut self) {
        if self.off == self.ring.buf_size() {
            // SAFETY: slot is inside the caller's lease.
            unsafe {
                self.ring
                    .set_len_flags(self.j, self.off as u16, NS_MOREFRAG)
            };
            self.j = (self.j + 1) % self.ring.num_slots();
            self.off = 0;
            self.used += 1;
        }
    }

    fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            self.advance_if_full();
            // SAFETY: slot is inside the caller's lease.
            let n = unsafe {
                let buf_idx = self.ring.slot(self.j).buf_idx;
                self.ring.write_buffer(buf_idx, self.off, data)
            };
            self.off += n;
            data = &data[n..];
        }
    }

    fn zero(&mut self, mut len: usize) {
        while len > 0 {
            self.advance_if_full();
            let n = len.min(self.ring.buf_size() - self.off);
            // SAFETY: slot is inside the caller's lease.
            unsafe {
                let buf_idx = self.ring.slot(self.j).buf_idx;
                self.ring.zero_buffer(buf_idx, self.off, n);
            }
            self.off += n;
            len -= n;
        }
    }

    fn finish(self) -> u32 {
        // SAFETY: slot is inside the caller's lease.
        unsafe { self.ring.set_len_flags(self.j, self.off as u16, 0) };
        self.used + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bridge::{Bridge, Tunables};
    use crate::port::{BridgeLink, PortGeometry, PortHandle};
    use crate::test_util::frames::build_frame;

    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0a];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0b];
    const MAC_C: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0c];

    struct TestBridge {
        bridge: Arc<Bridge>,
        ports: Vec<PortHandle>,
    }

    fn bridge_with(names: &[&str]) -> TestBridge {
        let bridge = Arc::new(Bridge::new(0, Arc::new(Tunables::new(MAX_BATCH, 114, 8))));
        let mut ports = Vec::new();
        for name in names {
            let port = Arc::new(Port::test_virtual(name));
            let (idx, _) = bridge.write().attach_common(port.clone(), None);
            port.set_link(Some(Arc::new(BridgeLink {
                bridge: bridge.clone(),
                index: idx,
                name: name.to_string(),
            })));
            ports.push(PortHandle::new(port));
        }
        TestBridge { bridge, ports }
    }

    #[test]
    fn test_unknown_unicast_floods() {
        let t = bridge_with(&["sw0:a", "sw0:b", "sw0:c"]);
        let frame = build_frame(MAC_B, MAC_A, b"hello");
        assert_eq!(t.ports[0].send(0, &[&frame]).unwrap(), 1);

        assert!(t.ports[0].recv(0).unwrap().is_empty());
        assert_eq!(t.ports[1].recv(0).unwrap(), vec![frame.clone()]);
        assert_eq!(t.ports[2].recv(0).unwrap(), vec![frame]);
        assert_eq!(t.ports[0].port().stats().snapshot().forwarded, 2);
    }

    #[test]
    fn test_learned_unicast_reaches_only_target() {
        let t = bridge_with(&["sw0:a", "sw0:b", "sw0:c"]);
        t.ports[1].send(0, &[&build_frame(MAC_A, MAC_B, b"hi")]).unwrap();
        t.ports[0].recv(0).unwrap();
        t.ports[2].recv(0).unwrap();

        let frame = build_frame(MAC_B, MAC_A, b"reply");
        t.ports[0].send(0, &[&frame]).unwrap();
        assert_eq!(t.ports[1].recv(0).unwrap(), vec![frame]);
        assert!(t.ports[2].recv(0).unwrap().is_empty());
    }

    #[test]
    fn test_order_preserved_with_broadcast_interleaved() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        // Teach the bridge where B lives.
        t.ports[1].send(0, &[&build_frame(MAC_C, MAC_B, b"x")]).unwrap();
        t.ports[0].recv(0).unwrap();

        let f1 = build_frame(MAC_B, MAC_A, b"1");
        let f2 = build_frame([0xff; 6], MAC_A, b"2");
        let f3 = build_frame(MAC_B, MAC_A, b"3");
        assert_eq!(t.ports[0].send(0, &[&f1, &f2, &f3]).unwrap(), 3);
        assert_eq!(t.ports[1].recv(0).unwrap(), vec![f1, f2, f3]);
    }

    #[test]
    fn test_multi_fragment_packet() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        let frame = build_frame(MAC_B, MAC_A, &[7u8; 100]);
        let (head, tail) = frame.split_at(20);
        assert!(t.ports[0].send_fragments(0, &[head, tail]).unwrap());

        let packets = t.ports[1].recv_fragments(0).unwrap();
        assert_eq!(packets, vec![vec![head.to_vec(), tail.to_vec()]]);
    }

    #[test]
    fn test_truncated_fragment_chain_is_closed() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        let frame = build_frame(MAC_B, MAC_A, b"partial");
        let port = t.ports[0].port();
        let kring = port.tx_ring(0);
        {
            let mut sync = kring.lock_sync();
            assert!(kring.push_packet(&mut sync, &[&frame]));
            // Pretend the user left MOREFRAG on the last slot.
            unsafe { kring.ring().set_len_flags(0, frame.len() as u16, NS_MOREFRAG) };
            port.txsync(0, &mut sync);
        }
        assert_eq!(t.ports[1].recv(0).unwrap(), vec![frame]);
    }

    #[test]
    fn test_full_destination_drops_excess() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        let frame = build_frame([0xff; 6], MAC_A, b"flood");
        let frames: Vec<&[u8]> = (0..40).map(|_| frame.as_slice()).collect();

        // 64-slot rings: the receiver keeps one slot empty.
        t.ports[0].send(0, &frames).unwrap();
        t.ports[0].send(0, &frames).unwrap();
        let got = t.ports[1].recv(0).unwrap();
        assert_eq!(got.len(), 63);
        let stats = t.ports[0].port().stats().snapshot();
        assert_eq!(stats.forwarded, 63);
        assert_eq!(stats.dropped, 17);
    }

    #[test]
    fn test_header_mismatch_strips_and_rebuilds() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        t.ports[0].port().set_virt_hdr_len(10);
        let frame = build_frame([0xff; 6], MAC_A, b"payload");
        let mut with_hdr = vec![0xeeu8; 10];
        with_hdr.extend_from_slice(&frame);
        t.ports[0].send(0, &[&with_hdr]).unwrap();

        // Destination has no header: only the frame arrives.
        assert_eq!(t.ports[1].recv(0).unwrap(), vec![frame.clone()]);

        // Reverse direction: a zeroed header is prepended.
        t.ports[0].recv(0).unwrap();
        t.ports[1].send(0, &[&frame]).unwrap();
        let mut expected = vec![0u8; 10];
        expected.extend_from_slice(&frame);
        assert_eq!(t.ports[0].recv(0).unwrap(), vec![expected]);
    }

    #[test]
    fn test_header_filling_first_fragment() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        t.ports[0].port().set_virt_hdr_len(12);
        t.ports[1].port().set_virt_hdr_len(12);
        let hdr = [0x11u8; 12];
        let frame = build_frame([0xff; 6], MAC_A, b"body");
        assert!(t.ports[0].send_fragments(0, &[&hdr, &frame]).unwrap());
        assert_eq!(
            t.ports[1].recv_fragments(0).unwrap(),
            vec![vec![hdr.to_vec(), frame]]
        );
    }

    #[test]
    fn test_header_longer_than_first_fragment_dropped() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        t.ports[0].port().set_virt_hdr_len(12);
        t.ports[1].port().set_virt_hdr_len(12);
        assert!(t.ports[0].send_fragments(0, &[&[0u8; 4], &[0u8; 40]]).unwrap());
        assert!(t.ports[1].recv(0).unwrap().is_empty());
        assert_eq!(t.ports[0].port().stats().snapshot().dropped, 1);
    }

    #[test]
    fn test_stopped_destination_skipped() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        t.ports[1].port().rx_ring(0).set_stopped(true);
        t.ports[0].send(0, &[&build_frame([0xff; 6], MAC_A, b"x")]).unwrap();
        t.ports[1].port().rx_ring(0).set_stopped(false);
        assert!(t.ports[1].recv(0).unwrap().is_empty());
        assert_eq!(t.ports[0].port().stats().snapshot().dropped, 1);
    }

    #[test]
    fn test_small_batch_size_still_delivers_everything() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        t.bridge.tunables().set_batch_size(2);
        let frame = build_frame([0xff; 6], MAC_A, b"x");
        let frames: Vec<&[u8]> = (0..7).map(|_| frame.as_slice()).collect();
        assert_eq!(t.ports[0].send(0, &frames).unwrap(), 7);
        assert_eq!(t.ports[1].recv(0).unwrap().len(), 7);
    }

    #[test]
    fn test_oversized_fragment_counted_as_truncated() {
        let t = bridge_with(&["sw0:a"]);
        let geometry = PortGeometry {
            tx_rings: 1,
            rx_rings: 1,
            tx_slots: 64,
            rx_slots: 64,
            buf_size: 128,
            mfs: 128,
        };
        let small = Arc::new(Port::new_virtual("sw0:small", &geometry, 0, false).unwrap());
        let (idx, _) = t.bridge.write().attach_common(small.clone(), None);
        small.set_link(Some(Arc::new(BridgeLink {
            bridge: t.bridge.clone(),
            index: idx,
            name: "sw0:small".to_string(),
        })));
        let small = PortHandle::new(small);

        let frame = build_frame([0xff; 6], MAC_A, &[5u8; 300]);
        t.ports[0].send(0, &[&frame]).unwrap();
        assert_eq!(small.recv(0).unwrap(), vec![frame[..OVERSIZE_COPY_LEN].to_vec()]);

        let stats = t.ports[0].port().stats().snapshot();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.truncated, 1);
    }

    #[test]
    fn test_broadcast_from_second_ring_not_duplicated() {
        let t = bridge_with(&["sw0:b"]);
        let geometry = PortGeometry {
            tx_rings: 2,
            rx_rings: 1,
            tx_slots: 64,
            rx_slots: 64,
            buf_size: 2048,
            mfs: crate::config::DEFAULT_MFS,
        };
        let a = Arc::new(Port::new_virtual("sw0:a", &geometry, 0, false).unwrap());
        let (idx, _) = t.bridge.write().attach_common(a.clone(), None);
        a.set_link(Some(Arc::new(BridgeLink {
            bridge: t.bridge.clone(),
            index: idx,
            name: "sw0:a".to_string(),
        })));
        let a = PortHandle::new(a);
        let b = &t.ports[0];
        b.send(0, &[&build_frame([0xff; 6], MAC_B, b"x")]).unwrap();
        a.recv(0).unwrap();

        let unicast = build_frame(MAC_B, MAC_A, b"u");
        let bcast = build_frame([0xff; 6], MAC_A, b"b");
        a.send(1, &[&unicast, &bcast]).unwrap();
        // Ring 1 collapses onto b's only ring next to the broadcast queue.
        assert_eq!(b.recv(0).unwrap(), vec![unicast, bcast]);
    }

    #[test]
    fn test_wakes_receiver() {
        let t = bridge_with(&["sw0:a", "sw0:b"]);
        t.ports[0].send(0, &[&build_frame([0xff; 6], MAC_A, b"x")]).unwrap();
        assert!(t.ports[1].wait(std::time::Duration::from_millis(100)).unwrap());
    }
}
