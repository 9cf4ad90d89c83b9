//! Ethernet II framing: header prepend on transmit, EtherType demux on
//! receive.

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use tracing::trace;

use crate::addr::MacAddr;
use crate::buffer::Packet;

/// Ethernet header length: `[6 dst | 6 src | 2 ethertype]`.
pub const HEADER_LEN: usize = 14;

/// Minimum Ethernet payload; shorter frames are padded on the wire.
pub const MINIMUM_PAYLOAD: usize = 46;

/// EtherType values this stack dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ip4,
    Arp,
    Ip6,
    Vlan,
    Unknown(u16),
}

impl EtherType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0800 => Self::Ip4,
            0x0806 => Self::Arp,
            0x86dd => Self::Ip6,
            0x8100 => Self::Vlan,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Ip4 => 0x0800,
            Self::Arp => 0x0806,
            Self::Ip6 => 0x86dd,
            Self::Vlan => 0x8100,
            Self::Unknown(other) => *other,
        }
    }
}

/// Wire layout of the Ethernet II header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct EthHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: U16,
}

/// Where a received frame goes next.
#[derive(Debug)]
pub enum EthDeliver {
    Arp(Packet),
    Ip4 {
        pkt: Packet,
        /// Frame arrived on the link broadcast address.
        link_bcast: bool,
    },
    Ip6(Packet),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EthStats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub packets_dropped: u64,
}

/// The link framing layer for one NIC.
pub struct Ethernet {
    mac: MacAddr,
    stats: EthStats,
}

impl Ethernet {
    pub fn new(mac: MacAddr) -> Self {
        Ethernet {
            mac,
            stats: EthStats::default(),
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn stats(&self) -> EthStats {
        self.stats
    }

    /// Validate and demux a received frame. The header is stripped before
    /// handing the packet upward. `None` means the frame was dropped.
    pub fn receive(&mut self, mut pkt: Packet) -> Option<EthDeliver> {
        if pkt.len() < HEADER_LEN {
            self.stats.packets_dropped += 1;
            trace!(len = pkt.len(), "eth: runt frame");
            return None;
        }

        let (dst, ethertype) = {
            let Ok((hdr, _)) = EthHeader::ref_from_prefix(pkt.data()) else {
                self.stats.packets_dropped += 1;
                return None;
            };
            (MacAddr(hdr.dst), EtherType::from_u16(hdr.ethertype.get()))
        };

        // Not for this station: a real NIC filters most of this in
        // hardware, but drivers in promiscuous mode will not.
        if dst != self.mac && !dst.is_broadcast() && !dst.is_multicast() {
            self.stats.packets_dropped += 1;
            return None;
        }

        pkt.trim_front(HEADER_LEN);
        self.stats.packets_rx += 1;

        match ethertype {
            EtherType::Arp => Some(EthDeliver::Arp(pkt)),
            EtherType::Ip4 => Some(EthDeliver::Ip4 {
                pkt,
                link_bcast: dst.is_broadcast(),
            }),
            EtherType::Ip6 => Some(EthDeliver::Ip6(pkt)),
            other => {
                self.stats.packets_dropped += 1;
                trace!(ethertype = other.as_u16(), "eth: unhandled ethertype");
                None
            }
        }
    }

    /// Frame an outgoing packet: prepend the header with our source MAC.
    /// The returned packet is ready for the NIC.
    pub fn transmit(&mut self, mut pkt: Packet, dst: MacAddr, ethertype: EtherType) -> Packet {
        let hdr = pkt.push_front(HEADER_LEN);
        hdr[0..6].copy_from_slice(&dst.octets());
        hdr[6..12].copy_from_slice(&self.mac.octets());
        hdr[12..14].copy_from_slice(&ethertype.as_u16().to_be_bytes());
        self.stats.packets_tx += 1;
        pkt
    }
}
