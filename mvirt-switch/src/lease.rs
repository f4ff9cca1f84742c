//! Ring cursor block and lease bookkeeping.
//!
//! Several producers may deliver into the same receive ring concurrently.
//! Each one reserves a contiguous range of slots (a *lease*) under the ring's
//! short lock, copies into it with the lock released, and then reports the
//! end position of what it actually wrote. The visible tail only moves once
//! every earlier lease has been reported: whichever producer completes the
//! run that touches the tail advances it past all contiguous completed
//! leases and takes over the notification.
//!
//! All of this state lives in [`RingCursors`], which is only ever accessed
//! with the ring's short lock held.

/// Marker for a lease that has not reported completion yet.
pub const NO_SLOT: u32 = u32::MAX;

/// A reservation of slots `[start, start + n)` in a receive ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Position in the completion report array.
    pub index: u32,
    /// First reserved slot.
    pub start: u32,
}

/// Cursors of one ring side plus its lease book.
#[derive(Debug)]
pub struct RingCursors {
    /// First slot owned by the consumer side (next to be released).
    pub hwcur: u32,
    /// First slot not yet published to the consumer.
    pub hwtail: u32,
    num_slots: u32,
    hwlease: u32,
    next_lease: u32,
    reports: Box<[u32]>,
}

impl RingCursors {
    /// Create the cursor block for a ring of `num_slots` slots with the given
    /// initial tail (0 for receive rings, `num_slots - 1` for transmit).
    pub fn new(num_slots: u32, hwtail: u32) -> Self {
        assert!(num_slots >= 2, "ring needs at least two slots");
        Self {
            hwcur: 0,
            hwtail,
            num_slots,
            hwlease: hwtail,
            next_lease: 0,
            reports: vec![NO_SLOT; num_slots as usize].into_boxed_slice(),
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    pub fn hwlease(&self) -> u32 {
        self.hwlease
    }

    #[inline]
    pub fn next(&self, i: u32) -> u32 {
        if i + 1 == self.num_slots { 0 } else { i + 1 }
    }

    #[inline]
    pub fn prev(&self, i: u32) -> u32 {
        if i == 0 { self.num_slots - 1 } else { i - 1 }
    }

    /// Slots a producer may still lease.
    ///
    /// On a receive ring one slot always stays empty so that a full ring can
    /// be told apart from an empty one.
    pub fn space(&self, for_receive: bool) -> u32 {
        let n = self.num_slots;
        if for_receive {
            let busy = (self.hwlease + n - self.hwcur) % n;
            n - 1 - busy
        } else {
            (self.hwtail + n - self.hwlease) % n
        }
    }

    /// Reserve `n` slots starting at the current lease cursor.
    ///
    /// # Panics
    ///
    /// Requesting more than [`space`](Self::space) slots is a broken
    /// invariant in the caller and aborts.
    pub fn lease(&mut self, n: u32, for_receive: bool) -> Lease {
        let index = self.next_lease;
        self.reports[index as usize] = NO_SLOT;
        self.next_lease = self.next(index);

        let space = self.space(for_receive);
        if n > space {
            panic!("invalid lease request for {n} slots, only {space} available");
        }
        let start = self.hwlease;
        self.hwlease = (self.hwlease + n) % self.num_slots;
        Lease { index, start }
    }

    /// Whether `lease` is the most recent one handed out.
    pub fn is_newest(&self, lease: &Lease) -> bool {
        self.next(lease.index) == self.next_lease
    }

    /// Return unused slots of the newest lease to the pool.
    pub fn rollback(&mut self, pos: u32) {
        self.hwlease = pos;
    }

    /// Record that `lease` has been filled up to (excluding) `end`.
    pub fn report(&mut self, lease: &Lease, end: u32) {
        self.reports[lease.index as usize] = end;
    }

    /// If `lease` starts at the published tail, advance the tail through
    /// every contiguous completed lease.
    ///
    /// Returns the new tail when it moved; the caller then owns the
    /// notification of the consumer.
    pub fn collect(&mut self, lease: &Lease) -> Option<u32> {
        if lease.start != self.hwtail {
            return None;
        }
        let mut idx = lease.index;
        let mut pos = lease.start;
        while idx != self.next_lease && self.reports[idx as usize] != NO_SLOT {
            pos = self.reports[idx as usize];
            self.reports[idx as usize] = NO_SLOT;
            idx = self.next(idx);
        }
        if pos != lease.start {
            self.hwtail = pos;
            Some(pos)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_receive_space_keeps_one_slot() {
        let c = RingCursors::new(8, 0);
        assert_eq!(c.space(true), 7);
    }

    #[test]
    fn test_lease_advances_and_wraps() {
        let mut c = RingCursors::new(8, 6);
        c.hwcur = 6;
        let lease = c.lease(4, true);
        assert_eq!(lease.start, 6);
        assert_eq!(c.hwlease(), 2);
        assert_eq!(c.space(true), 3);
    }

    #[test]
    #[should_panic(expected = "invalid lease request")]
    fn test_lease_over_space_panics() {
        let mut c = RingCursors::new(4, 0);
        c.lease(4, true);
    }

    #[test]
    fn test_in_order_completion() {
        let mut c = RingCursors::new(16, 0);
        let a = c.lease(3, true);
        c.report(&a, 3);
        assert_eq!(c.collect(&a), Some(3));
        assert_eq!(c.hwtail, 3);
    }

    #[test]
    fn test_out_of_order_completion_hands_off_tail() {
        let mut c = RingCursors::new(16, 0);
        let a = c.lease(2, true);
        let b = c.lease(3, true);

        // The later producer finishes first: it may only report.
        c.report(&b, 5);
        assert_eq!(c.collect(&b), None);
        assert_eq!(c.hwtail, 0);

        // The earlier producer publishes both ranges.
        c.report(&a, 2);
        assert_eq!(c.collect(&a), Some(5));
        assert_eq!(c.hwtail, 5);
    }

    #[test]
    fn test_rollback_of_newest_lease() {
        let mut c = RingCursors::new(16, 0);
        let a = c.lease(4, true);
        assert!(c.is_newest(&a));
        c.rollback(2);
        c.report(&a, 2);
        assert_eq!(c.collect(&a), Some(2));
        assert_eq!(c.hwlease(), 2);
        assert_eq!(c.space(true), 13);
    }

    #[test]
    fn test_older_lease_is_not_newest() {
        let mut c = RingCursors::new(16, 0);
        let a = c.lease(4, true);
        let _b = c.lease(1, true);
        assert!(!c.is_newest(&a));
    }

    #[test]
    fn test_transmit_space() {
        let c = RingCursors::new(8, 7);
        assert_eq!(c.space(false), 0);
    }

    proptest! {
        /// Outstanding leases never overlap and tile the ring contiguously,
        /// and the tail ends up after the last lease whatever the completion
        /// order.
        #[test]
        fn prop_leases_disjoint_and_contiguous(
            sizes in proptest::collection::vec(0u32..6, 1..8),
            order_seed in any::<u64>(),
        ) {
            let mut c = RingCursors::new(64, 0);
            let mut leases = Vec::new();
            let mut expected_start = 0u32;
            for n in &sizes {
                let n = (*n).min(c.space(true));
                let lease = c.lease(n, true);
                prop_assert_eq!(lease.start, expected_start);
                expected_start = (expected_start + n) % 64;
                leases.push((lease, expected_start));
            }

            // Complete in a pseudo-random order.
            let mut order: Vec<usize> = (0..leases.len()).collect();
            let mut seed = order_seed;
            for i in (1..order.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (seed >> 33) as usize % (i + 1);
                order.swap(i, j);
            }
            for i in order {
                let (lease, end) = leases[i];
                c.report(&lease, end);
                c.collect(&lease);
            }
            prop_assert_eq!(c.hwtail, expected_start);
        }
    }
}
