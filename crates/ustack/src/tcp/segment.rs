//! TCP wire format (RFC 793): header, option walk, segment parsing and
//! construction. Options follow the kinds from RFC 793/7323/2018: End (0),
//! NOP (1), MSS (2), WindowScale (3), SACK-Permitted (4), SACK (5),
//! Timestamp (8).

use std::net::Ipv4Addr;

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::addr::Socket;
use crate::buffer::{BufferStore, Packet};
use crate::ethernet;
use crate::ip::Protocol;
use crate::ip4::header as ip4_header;
use crate::tcp::sack::Block;
use crate::util::checksum;

pub const HEADER_LEN: usize = 20;

/// Largest option block a header can carry (data offset is 4 bits).
pub const MAX_OPTIONS_LEN: usize = 40;

// Control bits.
pub const FIN: u16 = 1 << 0;
pub const SYN: u16 = 1 << 1;
pub const RST: u16 = 1 << 2;
pub const PSH: u16 = 1 << 3;
pub const ACK: u16 = 1 << 4;
pub const URG: u16 = 1 << 5;

// Option kinds.
pub const OPT_END: u8 = 0;
pub const OPT_NOP: u8 = 1;
pub const OPT_MSS: u8 = 2;
pub const OPT_WS: u8 = 3;
pub const OPT_SACK_PERM: u8 = 4;
pub const OPT_SACK: u8 = 5;
pub const OPT_TS: u8 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct TcpHeader {
    pub sport: U16,
    pub dport: U16,
    pub seq: U32,
    pub ack: U32,
    /// Data offset (4 bits), reserved (3), NS, and the 8 control bits.
    pub offset_flags: U16,
    pub window: U16,
    pub checksum: U16,
    pub urgent: U16,
}

impl TcpHeader {
    pub fn data_offset_bytes(&self) -> usize {
        usize::from(self.offset_flags.get() >> 12) * 4
    }

    pub fn flags(&self) -> u16 {
        self.offset_flags.get() & 0x01ff
    }
}

/// Iterator over TCP options: yields `(kind, payload)`. Stops at End or on
/// a malformed length.
pub struct OptionIter<'a> {
    data: &'a [u8],
}

impl<'a> OptionIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        OptionIter { data }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (&kind, rest) = self.data.split_first()?;
            match kind {
                OPT_END => return None,
                OPT_NOP => {
                    self.data = rest;
                    continue;
                }
                _ => {
                    let &len = rest.first()?;
                    let len = len as usize;
                    if len < 2 || len > self.data.len() {
                        return None;
                    }
                    let payload = &self.data[2..len];
                    self.data = &self.data[len..];
                    return Some((kind, payload));
                }
            }
        }
    }
}

/// The options a peer can negotiate or attach, decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: Vec<Block>,
    pub timestamp: Option<(u32, u32)>,
}

pub fn parse_options(data: &[u8]) -> ParsedOptions {
    let mut opts = ParsedOptions::default();
    for (kind, payload) in OptionIter::new(data) {
        match kind {
            OPT_MSS if payload.len() == 2 => {
                opts.mss = Some(u16::from_be_bytes([payload[0], payload[1]]));
            }
            OPT_WS if payload.len() == 1 => {
                // RFC 7323 2.3: shift is capped at 14.
                opts.window_scale = Some(payload[0].min(14));
            }
            OPT_SACK_PERM if payload.is_empty() => {
                opts.sack_permitted = true;
            }
            OPT_SACK if payload.len() % 8 == 0 => {
                for chunk in payload.chunks_exact(8) {
                    opts.sack_blocks.push(Block {
                        start: u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                        end: u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                    });
                }
            }
            OPT_TS if payload.len() == 8 => {
                opts.timestamp = Some((
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                ));
            }
            _ => {}
        }
    }
    opts
}

/// Everything the connection engine needs from a received segment, lifted
/// out of the packet so the buffer can move independently.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub src: Socket,
    pub dst: Socket,
    pub seq: u32,
    pub ack: u32,
    pub flags: u16,
    /// Raw (unscaled) window field.
    pub window: u16,
    pub opts: ParsedOptions,
    /// Offset of the TCP payload within the packet data.
    pub payload_off: usize,
    pub payload_len: usize,
}

impl SegmentMeta {
    pub fn isset(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn has_data(&self) -> bool {
        self.payload_len > 0
    }

    /// Sequence space the segment occupies (payload + SYN/FIN).
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload_len as u32;
        if self.isset(SYN) {
            len += 1;
        }
        if self.isset(FIN) {
            len += 1;
        }
        len
    }
}

/// Parse and checksum-verify a TCP segment inside an IPv4 packet
/// positioned at its IP header.
pub fn parse(pkt: &Packet) -> Option<SegmentMeta> {
    let (src_ip, dst_ip, ihl) = {
        let hdr = ip4_header::view(pkt)?;
        (hdr.src(), hdr.dst(), hdr.ihl_bytes())
    };
    let segment = pkt.data().get(ihl..)?;
    let (hdr, _) = TcpHeader::ref_from_prefix(segment).ok()?;
    let doff = hdr.data_offset_bytes();
    if doff < HEADER_LEN || doff > segment.len() {
        return None;
    }
    let pseudo = checksum::pseudo_ipv4(src_ip, dst_ip, Protocol::Tcp.as_u8(), segment.len() as u16);
    if checksum::finalize(checksum::sum(pseudo, segment)) != 0 {
        return None;
    }
    Some(SegmentMeta {
        src: Socket::v4(src_ip, hdr.sport.get()),
        dst: Socket::v4(dst_ip, hdr.dport.get()),
        seq: hdr.seq.get(),
        ack: hdr.ack.get(),
        flags: hdr.flags(),
        window: hdr.window.get(),
        opts: parse_options(&segment[HEADER_LEN..doff]),
        payload_off: ihl + doff,
        payload_len: segment.len() - doff,
    })
}

/// Options to attach to an outgoing segment, encoded in order.
#[derive(Debug, Clone, Default)]
pub struct OptionsOut {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: Vec<Block>,
    pub timestamp: Option<(u32, u32)>,
}

impl OptionsOut {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(mss) = self.mss {
            buf.push(OPT_MSS);
            buf.push(4);
            buf.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(shift) = self.window_scale {
            buf.extend_from_slice(&[OPT_NOP, OPT_WS, 3, shift]);
        }
        if self.sack_permitted {
            buf.extend_from_slice(&[OPT_NOP, OPT_NOP, OPT_SACK_PERM, 2]);
        }
        if let Some((val, ecr)) = self.timestamp {
            buf.extend_from_slice(&[OPT_NOP, OPT_NOP, OPT_TS, 10]);
            buf.extend_from_slice(&val.to_be_bytes());
            buf.extend_from_slice(&ecr.to_be_bytes());
        }
        if !self.sack_blocks.is_empty() {
            let blocks = &self.sack_blocks[..self.sack_blocks.len().min(3)];
            buf.extend_from_slice(&[OPT_NOP, OPT_NOP, OPT_SACK, 2 + 8 * blocks.len() as u8]);
            for b in blocks {
                buf.extend_from_slice(&b.start.to_be_bytes());
                buf.extend_from_slice(&b.end.to_be_bytes());
            }
        }
        while buf.len() % 4 != 0 {
            buf.push(OPT_END);
        }
        debug_assert!(buf.len() <= MAX_OPTIONS_LEN);
        buf
    }
}

/// Build a complete IPv4/TCP segment ready for the IP layer.
#[allow(clippy::too_many_arguments)]
pub fn build(
    store: &BufferStore,
    src: Socket,
    dst: Socket,
    seq: u32,
    ack: u32,
    flags: u16,
    window: u16,
    opts: &OptionsOut,
    payload: &[u8],
) -> Option<Packet> {
    let (std::net::IpAddr::V4(src_ip), std::net::IpAddr::V4(dst_ip)) = (src.addr(), dst.addr())
    else {
        return None;
    };
    let options = opts.encode();
    let doff = HEADER_LEN + options.len();

    let mut pkt = store.alloc(ethernet::HEADER_LEN + ip4_header::HEADER_LEN)?;
    let header = TcpHeader {
        sport: U16::new(src.port()),
        dport: U16::new(dst.port()),
        seq: U32::new(seq),
        ack: U32::new(ack),
        offset_flags: U16::new(((doff as u16 / 4) << 12) | (flags & 0x01ff)),
        window: U16::new(window),
        checksum: U16::new(0),
        urgent: U16::new(0),
    };
    pkt.append(header.as_bytes());
    pkt.append(&options);
    pkt.append(payload);

    finalize_checksum(&mut pkt, src_ip, dst_ip);
    ip4_header::prepend(&mut pkt, Protocol::Tcp, src_ip, dst_ip);
    Some(pkt)
}

/// Compute the TCP checksum for a packet whose cursor sits at the TCP
/// header (before the IP header is prepended).
pub fn finalize_checksum(pkt: &mut Packet, src: Ipv4Addr, dst: Ipv4Addr) {
    let len = pkt.len() as u16;
    let pseudo = checksum::pseudo_ipv4(src, dst, Protocol::Tcp.as_u8(), len);
    let sum = checksum::finalize(checksum::sum(pseudo, pkt.data()));
    pkt.data_mut()[16..18].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Socket = Socket::v4(Ipv4Addr::new(10, 0, 0, 1), 49152);
    const B: Socket = Socket::v4(Ipv4Addr::new(10, 0, 0, 2), 80);

    fn store() -> BufferStore {
        BufferStore::new(8, 2048)
    }

    #[test]
    fn test_build_parse_round_trip() {
        let opts = OptionsOut {
            mss: Some(1460),
            window_scale: Some(7),
            sack_permitted: true,
            timestamp: Some((123456, 0)),
            ..Default::default()
        };
        let pkt = build(&store(), A, B, 1000, 0, SYN, 0xffff, &opts, &[]).unwrap();
        let seg = parse(&pkt).unwrap();
        assert_eq!(seg.src, A);
        assert_eq!(seg.dst, B);
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.flags, SYN);
        assert_eq!(seg.window, 0xffff);
        assert_eq!(seg.opts.mss, Some(1460));
        assert_eq!(seg.opts.window_scale, Some(7));
        assert!(seg.opts.sack_permitted);
        assert_eq!(seg.opts.timestamp, Some((123456, 0)));
        assert_eq!(seg.payload_len, 0);
        assert_eq!(seg.seq_len(), 1);
    }

    #[test]
    fn test_payload_and_flags() {
        let pkt = build(
            &store(),
            A,
            B,
            5,
            77,
            ACK | PSH,
            512,
            &OptionsOut::default(),
            b"hello tcp",
        )
        .unwrap();
        let seg = parse(&pkt).unwrap();
        assert!(seg.isset(ACK));
        assert!(seg.isset(PSH));
        assert!(!seg.isset(SYN));
        assert_eq!(seg.ack, 77);
        assert_eq!(seg.payload_len, 9);
        let payload = &pkt.data()[seg.payload_off..seg.payload_off + seg.payload_len];
        assert_eq!(payload, b"hello tcp");
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut pkt = build(&store(), A, B, 5, 0, ACK, 512, &OptionsOut::default(), b"x").unwrap();
        let last = pkt.len() - 1;
        pkt.data_mut()[last] ^= 0xff;
        assert!(parse(&pkt).is_none());
    }

    #[test]
    fn test_sack_blocks_round_trip() {
        let opts = OptionsOut {
            sack_blocks: vec![
                Block { start: 100, end: 200 },
                Block { start: 300, end: 400 },
            ],
            ..Default::default()
        };
        let pkt = build(&store(), A, B, 1, 1, ACK, 512, &opts, &[]).unwrap();
        let seg = parse(&pkt).unwrap();
        assert_eq!(seg.opts.sack_blocks.len(), 2);
        assert_eq!(seg.opts.sack_blocks[0], Block { start: 100, end: 200 });
    }

    #[test]
    fn test_option_iter_stops_on_garbage() {
        // kind=2 with an impossible length
        let data = [OPT_NOP, OPT_MSS, 0xff, 0x05];
        assert_eq!(OptionIter::new(&data).count(), 0);
    }

    #[test]
    fn test_window_scale_capped_at_14() {
        let data = [OPT_WS, 3, 17, OPT_END];
        let opts = parse_options(&data);
        assert_eq!(opts.window_scale, Some(14));
    }
}
