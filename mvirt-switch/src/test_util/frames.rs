//! Ethernet frame builders.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};

pub const BROADCAST: [u8; 6] = [0xff; 6];

/// Build a raw Ethernet frame
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src),
        dst_addr: EthernetAddress::from_bytes(&dst),
        ethertype: EthernetProtocol::from(ethertype),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build an IPv4-typed Ethernet frame carrying `payload`
pub fn build_frame(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
    ethernet_frame(dst, src, 0x0800, payload)
}

/// Source MAC of a frame
pub fn src_mac(frame: &[u8]) -> Option<[u8; 6]> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    let mut mac = [0u8; 6];
    mac.copy_from_slice(eth.src_addr().as_bytes());
    Some(mac)
}
