//! Default MAC-learning lookup.
//!
//! A fixed 1024-entry table indexed by a hash of the MAC address. Entries are
//! written without synchronization against readers: a stale or overwritten
//! entry only costs a broadcast.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use smoltcp::wire::{EthernetAddress, EthernetFrame};
use tracing::trace;

use crate::error::{Result, SwitchError};
use crate::ops::{BridgeOps, Destination, LookupContext};

/// Number of entries in the learning table.
pub const HASH_SIZE: usize = 1024;

const VALID: u64 = 1 << 63;
const MAC_MASK: u64 = (1 << 48) - 1;

/// Hash a MAC address into a table index.
pub fn rthash(addr: &[u8; 6]) -> usize {
    let mut a: u32 = 0x9e37_79b9;
    let mut b: u32 = 0x9e37_79b9;
    let mut c: u32 = 0;

    b = b.wrapping_add((addr[5] as u32) << 8);
    b = b.wrapping_add(addr[4] as u32);
    a = a.wrapping_add((addr[3] as u32) << 24);
    a = a.wrapping_add((addr[2] as u32) << 16);
    a = a.wrapping_add((addr[1] as u32) << 8);
    a = a.wrapping_add(addr[0] as u32);

    a = a.wrapping_sub(b).wrapping_sub(c);
    a ^= c >> 13;
    b = b.wrapping_sub(c).wrapping_sub(a);
    b ^= a << 8;
    c = c.wrapping_sub(a).wrapping_sub(b);
    c ^= b >> 13;
    a = a.wrapping_sub(b).wrapping_sub(c);
    a ^= c >> 12;
    b = b.wrapping_sub(c).wrapping_sub(a);
    b ^= a << 16;
    c = c.wrapping_sub(a).wrapping_sub(b);
    c ^= b >> 5;
    a = a.wrapping_sub(b).wrapping_sub(c);
    a ^= c >> 3;
    b = b.wrapping_sub(c).wrapping_sub(a);
    b ^= a << 10;
    c = c.wrapping_sub(a).wrapping_sub(b);
    c ^= b >> 15;

    (c as usize) & (HASH_SIZE - 1)
}

/// Pack a MAC address into the low 48 bits of a u64.
pub fn mac_to_u64(addr: &EthernetAddress) -> u64 {
    let b = addr.as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0])
}

fn mac_bytes(addr: &EthernetAddress) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(addr.as_bytes());
    out
}

/// MAC address to port table.
pub struct LearningTable {
    entries: Box<[AtomicU64]>,
}

impl LearningTable {
    pub fn new() -> Self {
        Self {
            entries: (0..HASH_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Forget every learned address.
    pub fn clear(&self) {
        for e in self.entries.iter() {
            e.store(0, Ordering::Relaxed);
        }
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.load(Ordering::Relaxed) & VALID != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Port the address was last seen on, if its slot still holds it.
    pub fn get(&self, addr: &EthernetAddress) -> Option<usize> {
        let e = self.entries[rthash(&mac_bytes(addr))].load(Ordering::Relaxed);
        if e & VALID != 0 && e & MAC_MASK == mac_to_u64(addr) {
            Some(((e >> 48) & 0x7fff) as usize)
        } else {
            None
        }
    }

    fn learn(&self, addr: &EthernetAddress, port: usize) {
        let e = VALID | ((port as u64 & 0x7fff) << 48) | mac_to_u64(addr);
        self.entries[rthash(&mac_bytes(addr))].store(e, Ordering::Relaxed);
    }
}

impl Default for LearningTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeOps for LearningTable {
    fn lookup(&self, frame: &[u8], ctx: &LookupContext<'_>) -> Destination {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return Destination::Drop;
        };
        let src = eth.src_addr();
        let dst = eth.dst_addr();

        if src.is_unicast() {
            let smac = mac_to_u64(&src);
            // The per-port cache spares the store, but the table may have
            // been flushed or the slot taken by another address since.
            if ctx.port.last_src_mac() != smac || self.get(&src) != Some(ctx.port_index) {
                self.learn(&src, ctx.port_index);
                ctx.port.set_last_src_mac(smac);
                trace!(mac = %src, port = ctx.port_index, "Learned source address");
            }
        }

        if dst.is_unicast()
            && let Some(index) = self.get(&dst)
        {
            return Destination::Port {
                index,
                ring: ctx.ring,
            };
        }
        Destination::Broadcast
    }

    fn config(&self, request: &serde_json::Value) -> Result<serde_json::Value> {
        match request.get("cmd").and_then(|c| c.as_str()) {
            Some("flush") => {
                self.clear();
                Ok(json!({ "flushed": true }))
            }
            Some("entries") => Ok(json!({ "entries": self.len() })),
            _ => Err(SwitchError::InvalidArgument(format!(
                "unknown learning table command: {request}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use crate::test_util::frames::build_frame;

    const MAC_A: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x0a];
    const MAC_B: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x0b];

    fn ctx(port: &Port, index: usize) -> LookupContext<'_> {
        LookupContext {
            port,
            port_index: index,
            ring: 0,
        }
    }

    #[test]
    fn test_rthash_in_range_and_stable() {
        let h = rthash(&MAC_A);
        assert!(h < HASH_SIZE);
        assert_eq!(h, rthash(&MAC_A));
        assert_eq!(rthash(&[0; 6]), rthash(&[0; 6]));
    }

    #[test]
    fn test_short_frame_dropped() {
        let table = LearningTable::new();
        let port = Port::test_virtual("sw0:a");
        assert_eq!(table.lookup(&[0u8; 13], &ctx(&port, 0)), Destination::Drop);
    }

    #[test]
    fn test_unknown_destination_broadcasts_and_learns() {
        let table = LearningTable::new();
        let port = Port::test_virtual("sw0:a");
        let frame = build_frame(MAC_B, MAC_A, b"hello");

        assert_eq!(table.lookup(&frame, &ctx(&port, 3)), Destination::Broadcast);
        assert_eq!(table.get(&EthernetAddress(MAC_A)), Some(3));
        assert_eq!(port.last_src_mac(), mac_to_u64(&EthernetAddress(MAC_A)));
    }

    #[test]
    fn test_learned_destination_is_unicast() {
        let table = LearningTable::new();
        let a = Port::test_virtual("sw0:a");
        let b = Port::test_virtual("sw0:b");

        table.lookup(&build_frame(MAC_B, MAC_A, b"x"), &ctx(&a, 0));
        let dst = table.lookup(&build_frame(MAC_A, MAC_B, b"y"), &ctx(&b, 1));
        assert_eq!(dst, Destination::Port { index: 0, ring: 0 });
    }

    #[test]
    fn test_multicast_source_not_learned() {
        let table = LearningTable::new();
        let port = Port::test_virtual("sw0:a");
        let mcast = [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01];
        table.lookup(&build_frame(MAC_B, mcast, b"x"), &ctx(&port, 0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_config_commands() {
        let table = LearningTable::new();
        let port = Port::test_virtual("sw0:a");
        table.lookup(&build_frame(MAC_B, MAC_A, b"x"), &ctx(&port, 0));

        let reply = table.config(&json!({ "cmd": "entries" })).unwrap();
        assert_eq!(reply["entries"], 1);
        table.config(&json!({ "cmd": "flush" })).unwrap();
        assert!(table.is_empty());
        assert!(table.config(&json!({ "cmd": "bogus" })).is_err());
    }

    #[test]
    fn test_relearn_same_source_after_flush() {
        let table = LearningTable::new();
        let a = Port::test_virtual("sw0:a");
        let frame = build_frame(MAC_B, MAC_A, b"x");

        table.lookup(&frame, &ctx(&a, 0));
        table.clear();
        table.lookup(&frame, &ctx(&a, 0));
        assert_eq!(table.get(&EthernetAddress(MAC_A)), Some(0));
    }

    #[test]
    fn test_source_moving_ports_is_relearned() {
        let table = LearningTable::new();
        let a = Port::test_virtual("sw0:a");
        let b = Port::test_virtual("sw0:b");
        let frame = build_frame(MAC_B, MAC_A, b"x");

        table.lookup(&frame, &ctx(&a, 0));
        table.lookup(&frame, &ctx(&b, 1));
        assert_eq!(table.get(&EthernetAddress(MAC_A)), Some(1));
        // Back on the first port, whose cache still names the address.
        table.lookup(&frame, &ctx(&a, 0));
        assert_eq!(table.get(&EthernetAddress(MAC_A)), Some(0));
    }
}
