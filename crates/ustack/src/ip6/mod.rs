//! IPv6 (RFC 8200): header handling, extension-header walk, address
//! classification and the neighbor-discovery/SLAAC machinery needed to
//! bring interface addresses up.
//!
//! Transports in this stack run over IPv4; the v6 plane carries ICMPv6
//! with NDP and MLD, which is what address autoconfiguration needs.

pub mod icmp6;
pub mod mld;
pub mod ndp;
pub mod slaac;

use std::cell::RefCell;
use std::net::Ipv6Addr;
use std::rc::Rc;

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use tracing::trace;

use crate::addr::MacAddr;
use crate::buffer::Packet;

pub const HEADER_LEN: usize = 40;

/// Default hop limit for outgoing packets.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

// extension headers we skip over on input
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTS: u8 = 60;
const NO_NEXT_HEADER: u8 = 59;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Ipv6Header {
    /// Version (4 bits), traffic class (8), flow label (20).
    pub vtc_flow: U32,
    pub payload_length: U16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
}

impl Ipv6Header {
    pub fn version(&self) -> u8 {
        (self.vtc_flow.get() >> 28) as u8
    }

    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.saddr)
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.daddr)
    }
}

pub fn view(pkt: &Packet) -> Option<&Ipv6Header> {
    Ipv6Header::ref_from_prefix(pkt.data()).ok().map(|(h, _)| h)
}

/// Prepend a fresh IPv6 header in front of the current packet data.
pub fn prepend(pkt: &mut Packet, next_header: u8, src: Ipv6Addr, dst: Ipv6Addr) {
    let payload_length = pkt.len() as u16;
    let bytes = pkt.push_front(HEADER_LEN);
    let header = Ipv6Header {
        vtc_flow: U32::new(6 << 28),
        payload_length: U16::new(payload_length),
        next_header,
        hop_limit: DEFAULT_HOP_LIMIT,
        saddr: src.octets(),
        daddr: dst.octets(),
    };
    bytes.copy_from_slice(header.as_bytes());
}

/// Address classification per RFC 4291.
pub fn is_linklocal(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

pub fn is_multicast(addr: Ipv6Addr) -> bool {
    addr.octets()[0] == 0xff
}

pub fn is_loopback(addr: Ipv6Addr) -> bool {
    addr == Ipv6Addr::LOCALHOST
}

/// Solicited-node multicast group for `addr` (RFC 4291 2.7.1).
pub fn solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | u16::from(o[13]),
        (u16::from(o[14]) << 8) | u16::from(o[15]),
    )
}

/// The all-nodes group `ff02::1`.
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// The all-routers group `ff02::2`.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Modified EUI-64 interface identifier from a MAC (RFC 4291 app. A).
pub fn eui64(mac: MacAddr) -> [u8; 8] {
    let m = mac.octets();
    [m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]]
}

/// Combine a /64 prefix with an interface id.
pub fn addr_from_prefix(prefix: Ipv6Addr, iid: [u8; 8]) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[8..].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}

/// Interface address state shared with the v6 sub-layers.
#[derive(Debug, Clone, Default)]
pub struct Ip6Config {
    pub linklocal: Option<Ipv6Addr>,
    pub global: Option<Ipv6Addr>,
    pub gateway: Option<Ipv6Addr>,
}

impl Ip6Config {
    pub fn is_our_addr(&self, addr: Ipv6Addr) -> bool {
        self.linklocal == Some(addr) || self.global == Some(addr)
    }

    /// Best source address for talking to `dst`.
    pub fn source_for(&self, dst: Ipv6Addr) -> Ipv6Addr {
        if is_linklocal(dst) || is_multicast(dst) {
            self.linklocal.or(self.global)
        } else {
            self.global.or(self.linklocal)
        }
        .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }
}

pub type SharedIp6Config = Rc<RefCell<Ip6Config>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct Ip6Stats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub packets_dropped: u64,
}

/// Where a validated v6 packet goes next. The payload cursor has been
/// advanced past the fixed header and any extension headers.
#[derive(Debug)]
pub enum Ip6Deliver {
    /// `(packet at the ICMPv6 header, src, dst)`
    Icmp6(Packet, Ipv6Addr, Ipv6Addr),
}

pub struct Ip6 {
    config: SharedIp6Config,
    stats: Ip6Stats,
}

impl Ip6 {
    pub fn new(config: SharedIp6Config) -> Self {
        Ip6 {
            config,
            stats: Ip6Stats::default(),
        }
    }

    pub fn stats(&self) -> Ip6Stats {
        self.stats
    }

    pub fn config(&self) -> SharedIp6Config {
        self.config.clone()
    }

    /// Upstream input from the link layer. Walks extension headers and
    /// hands ICMPv6 onward; other protocols are dropped (transports are
    /// v4 in this stack).
    pub fn receive(&mut self, mut pkt: Packet) -> Option<Ip6Deliver> {
        let (src, dst, mut next, payload_length) = {
            let hdr = match view(&pkt) {
                Some(h) if h.version() == 6 => *h,
                _ => {
                    self.stats.packets_dropped += 1;
                    return None;
                }
            };
            (hdr.src(), hdr.dst(), hdr.next_header, hdr.payload_length.get() as usize)
        };
        if HEADER_LEN + payload_length > pkt.len() {
            self.stats.packets_dropped += 1;
            return None;
        }
        pkt.truncate(HEADER_LEN + payload_length);

        // destination filter: ours, or a group we implicitly belong to
        let for_us = {
            let cfg = self.config.borrow();
            cfg.is_our_addr(dst)
                || dst == ALL_NODES
                || (is_multicast(dst)
                    && (cfg.linklocal.map(solicited_node) == Some(dst)
                        || cfg.global.map(solicited_node) == Some(dst)))
                || cfg.linklocal.is_none() // still unconfigured (DAD phase)
        };
        if !for_us {
            self.stats.packets_dropped += 1;
            return None;
        }

        self.stats.packets_rx += 1;
        pkt.trim_front(HEADER_LEN);

        // extension-header chain
        loop {
            match next {
                EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTS => {
                    let data = pkt.data();
                    if data.len() < 8 {
                        self.stats.packets_dropped += 1;
                        return None;
                    }
                    let ext_len = 8 + usize::from(data[1]) * 8;
                    if ext_len > data.len() {
                        self.stats.packets_dropped += 1;
                        return None;
                    }
                    next = data[0];
                    pkt.trim_front(ext_len);
                }
                EXT_FRAGMENT | NO_NEXT_HEADER => {
                    // reassembly is out of scope; drop quietly
                    self.stats.packets_dropped += 1;
                    return None;
                }
                58 => return Some(Ip6Deliver::Icmp6(pkt, src, dst)),
                other => {
                    trace!(next_header = other, "ip6: unhandled protocol");
                    self.stats.packets_dropped += 1;
                    return None;
                }
            }
        }
    }

    /// Frame an outgoing payload: the packet must be positioned at its
    /// upper-layer header. Returns the packet and the IPv6 next hop.
    pub fn transmit(
        &mut self,
        mut pkt: Packet,
        next_header: u8,
        dst: Ipv6Addr,
        src_override: Option<Ipv6Addr>,
    ) -> (Packet, Ipv6Addr) {
        let src = src_override.unwrap_or_else(|| self.config.borrow().source_for(dst));
        prepend(&mut pkt, next_header, src, dst);
        self.stats.packets_tx += 1;

        let next_hop = if is_multicast(dst) || is_linklocal(dst) {
            dst
        } else {
            self.config.borrow().gateway.unwrap_or(dst)
        };
        pkt.set_next_hop(next_hop.into());
        (pkt, next_hop)
    }
}
