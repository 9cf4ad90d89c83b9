//! IPv4 header (RFC 791) as a zero-copy view over packet bytes.
//!
//! Options are accepted on input (the IHL field is honored when stripping
//! the header) but never generated on output.

use std::net::Ipv4Addr;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::buffer::Packet;
use crate::ip::Protocol;
use crate::util::checksum;

/// Option-less header length.
pub const HEADER_LEN: usize = 20;

/// Don't Fragment flag in `flags_frag`.
pub const FLAG_DF: u16 = 0x4000;

/// More Fragments flag in `flags_frag`.
pub const FLAG_MF: u16 = 0x2000;

/// Fragment-offset mask in `flags_frag`.
pub const FRAG_OFFSET_MASK: u16 = 0x1fff;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_length: U16,
    pub id: U16,
    pub flags_frag: U16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: U16,
    pub saddr: [u8; 4],
    pub daddr: [u8; 4],
}

impl Ipv4Header {
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Header length in bytes, options included.
    pub fn ihl_bytes(&self) -> usize {
        usize::from(self.version_ihl & 0x0f) * 4
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.saddr)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.daddr)
    }

    pub fn set_src(&mut self, addr: Ipv4Addr) {
        self.saddr = addr.octets();
    }

    pub fn set_dst(&mut self, addr: Ipv4Addr) {
        self.daddr = addr.octets();
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol)
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_frag.get() & FLAG_DF != 0
    }

    pub fn set_dont_fragment(&mut self, df: bool) {
        let mut flags = self.flags_frag.get();
        if df {
            flags |= FLAG_DF;
        } else {
            flags &= !FLAG_DF;
        }
        self.flags_frag = U16::new(flags);
    }

    /// True for any fragment other than a whole datagram.
    pub fn is_fragment(&self) -> bool {
        let ff = self.flags_frag.get();
        ff & FLAG_MF != 0 || ff & FRAG_OFFSET_MASK != 0
    }

    /// Non-initial fragment (offset > 0).
    pub fn is_tail_fragment(&self) -> bool {
        self.flags_frag.get() & FRAG_OFFSET_MASK != 0
    }
}

/// Immutable header view at the packet's data cursor.
pub fn view(pkt: &Packet) -> Option<&Ipv4Header> {
    Ipv4Header::ref_from_prefix(pkt.data()).ok().map(|(h, _)| h)
}

/// Mutable header view at the packet's data cursor.
pub fn view_mut(pkt: &mut Packet) -> Option<&mut Ipv4Header> {
    Ipv4Header::mut_from_prefix(pkt.data_mut()).ok().map(|(h, _)| h)
}

/// Prepend a fresh option-less header in front of the packet's current
/// data. TTL and checksum are left zero for the IP layer to finalize.
pub fn prepend(pkt: &mut Packet, proto: Protocol, src: Ipv4Addr, dst: Ipv4Addr) {
    let total = (pkt.len() + HEADER_LEN) as u16;
    let bytes = pkt.push_front(HEADER_LEN);
    let header = Ipv4Header {
        version_ihl: 0x45,
        dscp_ecn: 0,
        total_length: U16::new(total),
        id: U16::new(0),
        flags_frag: U16::new(0),
        ttl: 0,
        protocol: proto.as_u8(),
        checksum: U16::new(0),
        saddr: src.octets(),
        daddr: dst.octets(),
    };
    bytes.copy_from_slice(header.as_bytes());
}

/// Compute and store the header checksum over `ihl` bytes.
pub fn finalize_checksum(pkt: &mut Packet) {
    let ihl = match view(pkt) {
        Some(h) => h.ihl_bytes().min(pkt.len()),
        None => return,
    };
    if let Some(h) = view_mut(pkt) {
        h.checksum = U16::new(0);
    }
    let sum = checksum::checksum(&pkt.data()[..ihl]);
    if let Some(h) = view_mut(pkt) {
        h.checksum = U16::new(sum);
    }
}

/// Verify the header checksum over `ihl` bytes.
pub fn verify_checksum(data: &[u8], ihl: usize) -> bool {
    ihl <= data.len() && checksum::finalize(checksum::sum(0, &data[..ihl])) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStore;

    #[test]
    fn test_prepend_and_view_round_trip() {
        let store = BufferStore::new(1, 256);
        let mut pkt = store.alloc(64).unwrap();
        pkt.append(&[0xabu8; 8]);
        prepend(
            &mut pkt,
            Protocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        let h = view(&pkt).unwrap();
        assert_eq!(h.version(), 4);
        assert_eq!(h.ihl_bytes(), 20);
        assert_eq!(h.total_length.get(), 28);
        assert_eq!(h.protocol(), Protocol::Udp);
        assert_eq!(h.src(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(h.dst(), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_checksum_round_trip() {
        let store = BufferStore::new(1, 256);
        let mut pkt = store.alloc(64).unwrap();
        pkt.append(&[0u8; 16]);
        prepend(
            &mut pkt,
            Protocol::Tcp,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
        );
        if let Some(h) = view_mut(&mut pkt) {
            h.ttl = 64;
        }
        finalize_checksum(&mut pkt);
        assert!(verify_checksum(pkt.data(), 20));
        // flip a bit, checksum must fail
        pkt.data_mut()[8] ^= 0xff;
        assert!(!verify_checksum(pkt.data(), 20));
    }

    #[test]
    fn test_df_flag() {
        let store = BufferStore::new(1, 256);
        let mut pkt = store.alloc(64).unwrap();
        prepend(&mut pkt, Protocol::Icmp, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        let h = view_mut(&mut pkt).unwrap();
        assert!(!h.dont_fragment());
        h.set_dont_fragment(true);
        assert!(h.dont_fragment());
        assert!(!h.is_fragment());
    }
}
