//! ICMPv6 (RFC 4443): echo service and error messages, plus dispatch of
//! the NDP and MLD message families to their handlers.

use std::net::Ipv6Addr;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use tracing::trace;

use crate::buffer::{BufferStore, Packet};
use crate::ethernet;
use crate::util::checksum;

use super::HEADER_LEN as IP6_HEADER_LEN;

pub const HEADER_LEN: usize = 4;

pub const TYPE_DEST_UNREACHABLE: u8 = 1;
pub const TYPE_PACKET_TOO_BIG: u8 = 2;
pub const TYPE_TIME_EXCEEDED: u8 = 3;
pub const TYPE_PARAMETER_PROBLEM: u8 = 4;
pub const TYPE_ECHO_REQUEST: u8 = 128;
pub const TYPE_ECHO_REPLY: u8 = 129;
pub const TYPE_MLD_QUERY: u8 = 130;
pub const TYPE_MLD_REPORT: u8 = 131;
pub const TYPE_MLD_DONE: u8 = 132;
pub const TYPE_ROUTER_SOLICITATION: u8 = 133;
pub const TYPE_ROUTER_ADVERTISEMENT: u8 = 134;
pub const TYPE_NEIGHBOR_SOLICITATION: u8 = 135;
pub const TYPE_NEIGHBOR_ADVERTISEMENT: u8 = 136;
pub const TYPE_MLD2_REPORT: u8 = 143;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Icmp6Header {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: U16,
}

/// Classified incoming ICMPv6 message, cursor at the ICMPv6 header.
pub enum Icmp6Deliver {
    /// Send the enclosed reply `(packet, source, destination)`.
    Transmit(Packet, Ipv6Addr, Ipv6Addr),
    /// Neighbor discovery traffic, for [`super::ndp::Ndp`].
    Ndp(Packet, Ipv6Addr),
    /// Listener-discovery traffic, for [`super::mld::Mld`].
    Mld(Packet, Ipv6Addr),
    /// Packet Too Big: the PMTU plane wants to know.
    TooBig { mtu: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Icmp6Stats {
    pub requests_rx: u64,
    pub replies_tx: u64,
    pub errors_rx: u64,
    pub dropped: u64,
}

pub struct Icmp6 {
    store: BufferStore,
    stats: Icmp6Stats,
}

impl Icmp6 {
    pub fn new(store: BufferStore) -> Self {
        Icmp6 {
            store,
            stats: Icmp6Stats::default(),
        }
    }

    pub fn stats(&self) -> Icmp6Stats {
        self.stats
    }

    /// Handle an ICMPv6 message (cursor at the ICMPv6 header).
    pub fn receive(&mut self, pkt: Packet, src: Ipv6Addr, dst: Ipv6Addr) -> Option<Icmp6Deliver> {
        let message = pkt.data();
        if message.len() < HEADER_LEN {
            self.stats.dropped += 1;
            return None;
        }
        let pseudo = checksum::pseudo_ipv6(src, dst, 58, message.len() as u32);
        if checksum::finalize(checksum::sum(pseudo, message)) != 0 {
            self.stats.dropped += 1;
            return None;
        }

        match message[0] {
            TYPE_ECHO_REQUEST => {
                self.stats.requests_rx += 1;
                let id_seq: [u8; 4] = message.get(4..8)?.try_into().ok()?;
                let payload = message.get(8..)?.to_vec();
                let reply = self.build_echo_reply(&id_seq, &payload, src, dst)?;
                self.stats.replies_tx += 1;
                Some(Icmp6Deliver::Transmit(reply, dst, src))
            }
            TYPE_PACKET_TOO_BIG => {
                self.stats.errors_rx += 1;
                let mtu = u32::from_be_bytes(message.get(4..8)?.try_into().ok()?);
                Some(Icmp6Deliver::TooBig { mtu })
            }
            TYPE_DEST_UNREACHABLE | TYPE_TIME_EXCEEDED | TYPE_PARAMETER_PROBLEM => {
                self.stats.errors_rx += 1;
                trace!(icmp_type = message[0], "icmp6: error received");
                None
            }
            TYPE_ROUTER_SOLICITATION
            | TYPE_ROUTER_ADVERTISEMENT
            | TYPE_NEIGHBOR_SOLICITATION
            | TYPE_NEIGHBOR_ADVERTISEMENT => Some(Icmp6Deliver::Ndp(pkt, src)),
            TYPE_MLD_QUERY | TYPE_MLD_REPORT | TYPE_MLD_DONE | TYPE_MLD2_REPORT => {
                Some(Icmp6Deliver::Mld(pkt, src))
            }
            other => {
                trace!(icmp_type = other, "icmp6: unhandled type");
                self.stats.dropped += 1;
                None
            }
        }
    }

    fn build_echo_reply(
        &mut self,
        id_seq: &[u8; 4],
        payload: &[u8],
        dst: Ipv6Addr,
        our_addr: Ipv6Addr,
    ) -> Option<Packet> {
        let mut pkt = self
            .store
            .alloc(ethernet::HEADER_LEN + IP6_HEADER_LEN)?;
        pkt.append(&[TYPE_ECHO_REPLY, 0, 0, 0]);
        pkt.append(id_seq);
        pkt.append(payload);
        finalize_checksum(&mut pkt, our_addr, dst);
        Some(pkt)
    }
}

/// Compute the ICMPv6 checksum over the message at the packet cursor.
pub fn finalize_checksum(pkt: &mut Packet, src: Ipv6Addr, dst: Ipv6Addr) {
    let pseudo = checksum::pseudo_ipv6(src, dst, 58, pkt.len() as u32);
    pkt.data_mut()[2..4].copy_from_slice(&[0, 0]);
    let sum = checksum::finalize(checksum::sum(pseudo, pkt.data()));
    pkt.data_mut()[2..4].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "fe80::2";
    const DST: &str = "fe80::1";

    fn message(icmp_type: u8, body: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> Packet {
        let store = BufferStore::new(4, 2048);
        let mut pkt = store.alloc(ethernet::HEADER_LEN + IP6_HEADER_LEN).unwrap();
        pkt.append(&[icmp_type, 0, 0, 0]);
        pkt.append(body);
        finalize_checksum(&mut pkt, src, dst);
        pkt
    }

    #[test]
    fn test_echo_reply_mirrors_request() {
        let src: Ipv6Addr = SRC.parse().unwrap();
        let dst: Ipv6Addr = DST.parse().unwrap();
        let store = BufferStore::new(8, 2048);
        let mut icmp6 = Icmp6::new(store);

        let mut body = vec![0, 1, 0, 7]; // id 1, seq 7
        body.extend_from_slice(b"ping6");
        let req = message(TYPE_ECHO_REQUEST, &body, src, dst);
        let out = icmp6.receive(req, src, dst);
        let Some(Icmp6Deliver::Transmit(reply, from, to)) = out else {
            panic!("expected reply");
        };
        assert_eq!(from, dst);
        assert_eq!(to, src);
        assert_eq!(reply.data()[0], TYPE_ECHO_REPLY);
        assert_eq!(&reply.data()[4..8], &[0, 1, 0, 7]);
        assert_eq!(&reply.data()[8..], b"ping6");
        // reply checksum verifies against the reversed pseudo header
        let pseudo = checksum::pseudo_ipv6(dst, src, 58, reply.len() as u32);
        assert_eq!(checksum::finalize(checksum::sum(pseudo, reply.data())), 0);
    }

    #[test]
    fn test_too_big_reports_mtu() {
        let src: Ipv6Addr = SRC.parse().unwrap();
        let dst: Ipv6Addr = DST.parse().unwrap();
        let store = BufferStore::new(8, 2048);
        let mut icmp6 = Icmp6::new(store);

        let body = 1280u32.to_be_bytes();
        let msg = message(TYPE_PACKET_TOO_BIG, &body, src, dst);
        let out = icmp6.receive(msg, src, dst);
        assert!(matches!(out, Some(Icmp6Deliver::TooBig { mtu: 1280 })));
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let src: Ipv6Addr = SRC.parse().unwrap();
        let dst: Ipv6Addr = DST.parse().unwrap();
        let store = BufferStore::new(8, 2048);
        let mut icmp6 = Icmp6::new(store);

        let mut msg = message(TYPE_ECHO_REQUEST, &[0, 1, 0, 1], src, dst);
        let n = msg.len() - 1;
        msg.data_mut()[n] ^= 0xff;
        assert!(icmp6.receive(msg, src, dst).is_none());
        assert_eq!(icmp6.stats().dropped, 1);
    }
}
