//! ICMPv4 (RFC 792): echo service, error generation and an outgoing ping
//! client with per-request timeouts.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use tracing::{debug, trace};

use crate::addr::Socket;
use crate::buffer::{BufferStore, Packet};
use crate::error::NetworkError;
use crate::ethernet;
use crate::ip::Protocol;
use crate::ip4::header as ip4_header;
use crate::timer::{TimerId, Timers};
use crate::util::checksum;

pub const HEADER_LEN: usize = 8;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const TYPE_TIME_EXCEEDED: u8 = 11;
pub const TYPE_PARAMETER_PROBLEM: u8 = 12;

/// Destination-unreachable code for "fragmentation needed and DF set".
pub const CODE_FRAG_NEEDED: u8 = 4;
/// Destination-unreachable code for "port unreachable".
pub const CODE_PORT_UNREACHABLE: u8 = 3;

/// How long an outgoing ping waits for its reply.
pub const PING_TIMEOUT: Duration = Duration::from_secs(40);

/// Offset reserved in freshly built ICMP packets for lower headers.
const PACKET_OFFSET: usize = ethernet::HEADER_LEN + ip4_header::HEADER_LEN;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: U16,
    /// Echo id/seq, or type-specific data (next-hop MTU for Frag Needed).
    pub rest: [u8; 4],
}

/// A received echo reply, handed to the ping callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub from: Ipv4Addr,
    pub id: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Invoked with `None` when the ping timed out.
pub type PingCallback = Box<dyn FnOnce(Option<EchoReply>)>;

/// An ICMP error routed back to the transport that caused it. Sockets are
/// those of the embedded (our original outgoing) datagram.
#[derive(Debug, Clone, Copy)]
pub struct ErrorReport {
    pub error: NetworkError,
    pub proto: Protocol,
    pub src: Socket,
    pub dst: Socket,
}

/// Results of processing one incoming ICMP message; the stack assembly
/// dispatches each after releasing the layer borrow.
pub enum IcmpOut {
    /// Hand to the IP layer for transmission.
    Transmit(Packet),
    /// Deliver an error to the owning transport.
    Report(ErrorReport),
    /// Fragmentation Needed: update the path estimate for `dest`.
    PmtuUpdate {
        dest: Socket,
        mtu: u16,
        total_length: u16,
    },
    /// A ping completed (or died); invoke outside the layer borrow.
    PingDone(PingCallback, Option<EchoReply>),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpStats {
    pub requests_rx: u64,
    pub replies_tx: u64,
    pub replies_rx: u64,
    pub errors_rx: u64,
    pub errors_tx: u64,
    pub dropped: u64,
}

struct PingEntry {
    callback: Option<PingCallback>,
    timer: TimerId,
}

pub struct Icmp {
    store: BufferStore,
    timers: Timers,
    self_ref: Weak<RefCell<Icmp>>,
    /// Fired with the callback of a timed-out ping.
    on_timeout: Option<Rc<dyn Fn(PingCallback)>>,
    ping_requests: HashMap<(u16, u16), PingEntry>,
    next_ping_id: u16,
    next_ping_seq: u16,
    stats: IcmpStats,
}

impl Icmp {
    pub fn new(store: BufferStore, timers: Timers) -> Rc<RefCell<Icmp>> {
        let icmp = Rc::new(RefCell::new(Icmp {
            store,
            timers,
            self_ref: Weak::new(),
            on_timeout: None,
            ping_requests: HashMap::new(),
            next_ping_id: 1,
            next_ping_seq: 1,
            stats: IcmpStats::default(),
        }));
        icmp.borrow_mut().self_ref = Rc::downgrade(&icmp);
        icmp
    }

    /// Wire the hook that runs timed-out ping callbacks.
    pub fn set_timeout_handler(&mut self, handler: Rc<dyn Fn(PingCallback)>) {
        self.on_timeout = Some(handler);
    }

    pub fn stats(&self) -> IcmpStats {
        self.stats
    }

    /// Handle an incoming ICMP datagram (positioned at its IP header).
    pub fn receive(&mut self, pkt: Packet) -> Vec<IcmpOut> {
        let mut out = Vec::new();

        let Some((src, ihl)) = ip4_header::view(&pkt).map(|h| (h.src(), h.ihl_bytes())) else {
            self.stats.dropped += 1;
            return out;
        };
        let Some(message) = pkt.data().get(ihl..) else {
            self.stats.dropped += 1;
            return out;
        };
        if message.len() < HEADER_LEN || checksum::checksum(message) != 0 {
            self.stats.dropped += 1;
            return out;
        }
        let Some((hdr, payload)) = IcmpHeader::ref_from_prefix(message).ok() else {
            self.stats.dropped += 1;
            return out;
        };
        let hdr = *hdr;

        match hdr.icmp_type {
            TYPE_ECHO_REQUEST => {
                self.stats.requests_rx += 1;
                let id = u16::from_be_bytes([hdr.rest[0], hdr.rest[1]]);
                let seq = u16::from_be_bytes([hdr.rest[2], hdr.rest[3]]);
                trace!(%src, id, seq, "icmp: echo request");
                if let Some(reply) = self.build_echo(TYPE_ECHO_REPLY, id, seq, payload, src) {
                    self.stats.replies_tx += 1;
                    out.push(IcmpOut::Transmit(reply));
                }
            }
            TYPE_ECHO_REPLY => {
                self.stats.replies_rx += 1;
                let id = u16::from_be_bytes([hdr.rest[0], hdr.rest[1]]);
                let seq = u16::from_be_bytes([hdr.rest[2], hdr.rest[3]]);
                if let Some(mut entry) = self.ping_requests.remove(&(id, seq)) {
                    self.timers.stop(entry.timer);
                    if let Some(cb) = entry.callback.take() {
                        out.push(IcmpOut::PingDone(
                            cb,
                            Some(EchoReply {
                                from: src,
                                id,
                                seq,
                                payload: payload.to_vec(),
                            }),
                        ));
                    }
                }
            }
            TYPE_DEST_UNREACHABLE | TYPE_TIME_EXCEEDED | TYPE_PARAMETER_PROBLEM => {
                self.stats.errors_rx += 1;
                if let Some(report) = Self::parse_error(&hdr, payload) {
                    if hdr.icmp_type == TYPE_DEST_UNREACHABLE && hdr.code == CODE_FRAG_NEEDED {
                        let mtu = u16::from_be_bytes([hdr.rest[2], hdr.rest[3]]);
                        let total_length = embedded_total_length(payload).unwrap_or(0);
                        out.push(IcmpOut::PmtuUpdate {
                            dest: report.dst,
                            mtu,
                            total_length,
                        });
                    }
                    out.push(IcmpOut::Report(report));
                }
            }
            other => {
                trace!(icmp_type = other, "icmp: unhandled type");
                self.stats.dropped += 1;
            }
        }
        out
    }

    /// Issue an echo request toward `target`. Returns the packet to
    /// transmit; the callback fires on reply or after [`PING_TIMEOUT`].
    pub fn ping(&mut self, target: Ipv4Addr, callback: PingCallback) -> Option<Packet> {
        let id = self.next_ping_id;
        let seq = self.next_ping_seq;
        self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
        if self.next_ping_seq == 0 {
            self.next_ping_id = self.next_ping_id.wrapping_add(1).max(1);
        }

        // Conventional ascii fill, same spirit as classic ping(8).
        let payload: Vec<u8> = (0..48u8).map(|b| 0x20 + b).collect();
        let pkt = self.build_echo(TYPE_ECHO_REQUEST, id, seq, &payload, target)?;

        let weak = self.self_ref.clone();
        let timer = self.timers.schedule(PING_TIMEOUT, move || {
            let Some(icmp) = weak.upgrade() else { return };
            let (cb, handler) = {
                let mut i = icmp.borrow_mut();
                let cb = i
                    .ping_requests
                    .remove(&(id, seq))
                    .and_then(|mut e| e.callback.take());
                (cb, i.on_timeout.clone())
            };
            if let Some(cb) = cb {
                debug!(id, seq, "icmp: ping timed out");
                match handler {
                    Some(run) => run(cb),
                    None => cb(None),
                }
            }
        });
        self.ping_requests.insert(
            (id, seq),
            PingEntry {
                callback: Some(callback),
                timer,
            },
        );
        Some(pkt)
    }

    /// Build Destination Unreachable carrying the offending datagram's
    /// header + 8 bytes. `None` when policy forbids replying.
    pub fn destination_unreachable(
        &mut self,
        offending: &Packet,
        code: u8,
        local_bcast: Ipv4Addr,
    ) -> Option<Packet> {
        self.build_error(offending, TYPE_DEST_UNREACHABLE, code, [0; 4], local_bcast)
    }

    pub fn time_exceeded(&mut self, offending: &Packet, code: u8, local_bcast: Ipv4Addr) -> Option<Packet> {
        self.build_error(offending, TYPE_TIME_EXCEEDED, code, [0; 4], local_bcast)
    }

    pub fn parameter_problem(
        &mut self,
        offending: &Packet,
        pointer: u8,
        local_bcast: Ipv4Addr,
    ) -> Option<Packet> {
        self.build_error(
            offending,
            TYPE_PARAMETER_PROBLEM,
            0,
            [pointer, 0, 0, 0],
            local_bcast,
        )
    }

    /// Fragmentation Needed with a next-hop MTU hint.
    pub fn too_big(&mut self, offending: &Packet, mtu: u16, local_bcast: Ipv4Addr) -> Option<Packet> {
        let m = mtu.to_be_bytes();
        self.build_error(
            offending,
            TYPE_DEST_UNREACHABLE,
            CODE_FRAG_NEEDED,
            [0, 0, m[0], m[1]],
            local_bcast,
        )
    }

    fn build_echo(
        &mut self,
        icmp_type: u8,
        id: u16,
        seq: u16,
        payload: &[u8],
        dst: Ipv4Addr,
    ) -> Option<Packet> {
        let mut pkt = self.store.alloc(PACKET_OFFSET)?;
        let id_b = id.to_be_bytes();
        let seq_b = seq.to_be_bytes();
        let header = IcmpHeader {
            icmp_type,
            code: 0,
            checksum: U16::new(0),
            rest: [id_b[0], id_b[1], seq_b[0], seq_b[1]],
        };
        pkt.append(header.as_bytes());
        pkt.append(payload);
        finalize_icmp_checksum(&mut pkt);
        ip4_header::prepend(&mut pkt, Protocol::Icmp, Ipv4Addr::UNSPECIFIED, dst);
        Some(pkt)
    }

    /// Common error construction. Per RFC 1122 §3.2.2, errors are never
    /// generated in response to: another ICMP error, a non-initial
    /// fragment, or a datagram sent to broadcast/multicast.
    fn build_error(
        &mut self,
        offending: &Packet,
        icmp_type: u8,
        code: u8,
        rest: [u8; 4],
        local_bcast: Ipv4Addr,
    ) -> Option<Packet> {
        let hdr = ip4_header::view(offending)?;
        let dst = hdr.dst();
        if dst == Ipv4Addr::BROADCAST || dst == local_bcast || dst.is_multicast() {
            return None;
        }
        if hdr.is_tail_fragment() {
            return None;
        }
        let ihl = hdr.ihl_bytes();
        if hdr.protocol() == Protocol::Icmp {
            let inner_type = offending.data().get(ihl).copied()?;
            if is_error_type(inner_type) {
                return None;
            }
        }
        let reply_to = hdr.src();
        let quoted_len = (ihl + 8).min(offending.data().len());
        let quoted = offending.data()[..quoted_len].to_vec();

        let mut pkt = self.store.alloc(PACKET_OFFSET)?;
        let header = IcmpHeader {
            icmp_type,
            code,
            checksum: U16::new(0),
            rest,
        };
        pkt.append(header.as_bytes());
        pkt.append(&quoted);
        finalize_icmp_checksum(&mut pkt);
        ip4_header::prepend(&mut pkt, Protocol::Icmp, Ipv4Addr::UNSPECIFIED, reply_to);
        self.stats.errors_tx += 1;
        Some(pkt)
    }

    /// Map a received error onto the transport sockets of the quoted
    /// datagram (which we originally sent).
    fn parse_error(hdr: &IcmpHeader, quoted: &[u8]) -> Option<ErrorReport> {
        let (inner, rest) = ip4_header::Ipv4Header::ref_from_prefix(quoted).ok()?;
        let proto = inner.protocol();
        let opts = inner.ihl_bytes().checked_sub(ip4_header::HEADER_LEN)?;
        let l4 = rest.get(opts..)?;
        let (sport, dport) = match proto {
            Protocol::Tcp | Protocol::Udp if l4.len() >= 4 => (
                u16::from_be_bytes([l4[0], l4[1]]),
                u16::from_be_bytes([l4[2], l4[3]]),
            ),
            _ => (0, 0),
        };
        let error = match hdr.icmp_type {
            TYPE_DEST_UNREACHABLE if hdr.code == CODE_FRAG_NEEDED => {
                NetworkError::TooBig(u16::from_be_bytes([hdr.rest[2], hdr.rest[3]]))
            }
            TYPE_DEST_UNREACHABLE => NetworkError::Unreachable(hdr.code),
            TYPE_TIME_EXCEEDED => NetworkError::TimeExceeded,
            _ => NetworkError::ParameterProblem,
        };
        Some(ErrorReport {
            error,
            proto,
            src: Socket::v4(inner.src(), sport),
            dst: Socket::v4(inner.dst(), dport),
        })
    }
}

fn embedded_total_length(quoted: &[u8]) -> Option<u16> {
    let (inner, _) = ip4_header::Ipv4Header::ref_from_prefix(quoted).ok()?;
    Some(inner.total_length.get())
}

fn is_error_type(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        TYPE_DEST_UNREACHABLE | TYPE_TIME_EXCEEDED | TYPE_PARAMETER_PROBLEM | 4 | 5
    )
}

/// Compute the ICMP checksum over the message at the packet cursor
/// (which must sit at the ICMP header).
fn finalize_icmp_checksum(pkt: &mut Packet) {
    let sum = checksum::checksum(pkt.data());
    let data = pkt.data_mut();
    data[2..4].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const BCAST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 255);

    fn fixture() -> (Rc<RefCell<Icmp>>, BufferStore, ManualClock, Timers) {
        let clock = ManualClock::new();
        let timers = Timers::new(Rc::new(clock.clone()));
        let store = BufferStore::new(32, 2048);
        let icmp = Icmp::new(store.clone(), timers.clone());
        (icmp, store, clock, timers)
    }

    fn echo_request(store: &BufferStore, id: u16, seq: u16, payload: &[u8]) -> Packet {
        let mut pkt = store.alloc(PACKET_OFFSET).unwrap();
        let id_b = id.to_be_bytes();
        let seq_b = seq.to_be_bytes();
        let header = IcmpHeader {
            icmp_type: TYPE_ECHO_REQUEST,
            code: 0,
            checksum: U16::new(0),
            rest: [id_b[0], id_b[1], seq_b[0], seq_b[1]],
        };
        pkt.append(header.as_bytes());
        pkt.append(payload);
        finalize_icmp_checksum(&mut pkt);
        ip4_header::prepend(&mut pkt, Protocol::Icmp, PEER_IP, OUR_IP);
        pkt
    }

    #[test]
    fn test_echo_request_mirrored_in_reply() {
        let (icmp, store, _clock, _timers) = fixture();
        let req = echo_request(&store, 1, 1, b"abcd");
        let out = icmp.borrow_mut().receive(req);
        assert_eq!(out.len(), 1);
        let IcmpOut::Transmit(reply) = &out[0] else {
            panic!("expected transmit");
        };
        let h = ip4_header::view(reply).unwrap();
        assert_eq!(h.dst(), PEER_IP);
        let msg = &reply.data()[20..];
        assert_eq!(msg[0], TYPE_ECHO_REPLY);
        assert_eq!(&msg[4..8], &[0, 1, 0, 1]);
        assert_eq!(&msg[8..], b"abcd");
        assert_eq!(checksum::checksum(msg), 0);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let (icmp, store, _clock, _timers) = fixture();
        let mut req = echo_request(&store, 1, 1, b"abcd");
        let len = req.len();
        req.data_mut()[len - 1] ^= 0xff;
        assert!(icmp.borrow_mut().receive(req).is_empty());
        assert_eq!(icmp.borrow().stats().dropped, 1);
    }

    #[test]
    fn test_ping_reply_round_trip() {
        let (icmp, store, _clock, _timers) = fixture();
        let seen: Rc<RefCell<Option<EchoReply>>> = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let request = icmp
            .borrow_mut()
            .ping(PEER_IP, Box::new(move |r| *s.borrow_mut() = r))
            .unwrap();

        // lift id/seq out of the request we sent
        let msg = &request.data()[20..];
        let id = u16::from_be_bytes([msg[4], msg[5]]);
        let seq = u16::from_be_bytes([msg[6], msg[7]]);

        // fabricate the peer's reply
        let mut reply = store.alloc(PACKET_OFFSET).unwrap();
        let header = IcmpHeader {
            icmp_type: TYPE_ECHO_REPLY,
            code: 0,
            checksum: U16::new(0),
            rest: msg[4..8].try_into().unwrap(),
        };
        reply.append(header.as_bytes());
        reply.append(&msg[8..]);
        finalize_icmp_checksum(&mut reply);
        ip4_header::prepend(&mut reply, Protocol::Icmp, PEER_IP, OUR_IP);

        let out = icmp.borrow_mut().receive(reply);
        assert_eq!(out.len(), 1);
        let Some(IcmpOut::PingDone(cb, echo)) = out.into_iter().next() else {
            panic!("expected ping completion");
        };
        cb(echo);
        let echo = seen.borrow_mut().take().unwrap();
        assert_eq!(echo.id, id);
        assert_eq!(echo.seq, seq);
        assert_eq!(echo.from, PEER_IP);
    }

    #[test]
    fn test_ping_timeout_fires_none() {
        let (icmp, _store, clock, timers) = fixture();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        icmp.borrow_mut()
            .ping(PEER_IP, Box::new(move |r| s.borrow_mut().push(r.is_none())))
            .unwrap();
        clock.advance(PING_TIMEOUT + Duration::from_secs(1));
        timers.process();
        assert_eq!(*seen.borrow(), vec![true]);
        assert!(icmp.borrow().ping_requests.is_empty());
    }

    #[test]
    fn test_no_error_for_broadcast_or_icmp_error() {
        let (icmp, store, _clock, _timers) = fixture();

        // offending datagram aimed at the subnet broadcast
        let mut bcast_pkt = store.alloc(PACKET_OFFSET).unwrap();
        bcast_pkt.append(&[0u8; 8]);
        ip4_header::prepend(&mut bcast_pkt, Protocol::Udp, PEER_IP, BCAST);
        assert!(icmp
            .borrow_mut()
            .destination_unreachable(&bcast_pkt, CODE_PORT_UNREACHABLE, BCAST)
            .is_none());

        // offending datagram that is itself an ICMP error
        let mut err_pkt = store.alloc(PACKET_OFFSET).unwrap();
        err_pkt.append(&[TYPE_DEST_UNREACHABLE, 0, 0, 0, 0, 0, 0, 0]);
        ip4_header::prepend(&mut err_pkt, Protocol::Icmp, PEER_IP, OUR_IP);
        assert!(icmp
            .borrow_mut()
            .destination_unreachable(&err_pkt, CODE_PORT_UNREACHABLE, BCAST)
            .is_none());
    }

    #[test]
    fn test_frag_needed_reports_pmtu() {
        let (icmp, store, _clock, _timers) = fixture();

        // quoted original: our UDP datagram to PEER:7777
        let mut original = store.alloc(PACKET_OFFSET).unwrap();
        original.append(&5555u16.to_be_bytes());
        original.append(&7777u16.to_be_bytes());
        original.append(&[0u8; 4]);
        ip4_header::prepend(&mut original, Protocol::Udp, OUR_IP, PEER_IP);

        let mtu = 1200u16.to_be_bytes();
        let mut err = store.alloc(PACKET_OFFSET).unwrap();
        let header = IcmpHeader {
            icmp_type: TYPE_DEST_UNREACHABLE,
            code: CODE_FRAG_NEEDED,
            checksum: U16::new(0),
            rest: [0, 0, mtu[0], mtu[1]],
        };
        err.append(header.as_bytes());
        err.append(original.data());
        finalize_icmp_checksum(&mut err);
        ip4_header::prepend(&mut err, Protocol::Icmp, Ipv4Addr::new(10, 0, 0, 254), OUR_IP);

        let out = icmp.borrow_mut().receive(err);
        assert_eq!(out.len(), 2);
        let IcmpOut::PmtuUpdate { dest, mtu, .. } = &out[0] else {
            panic!("expected pmtu update");
        };
        assert_eq!(*dest, Socket::v4(PEER_IP, 7777));
        assert_eq!(*mtu, 1200);
        let IcmpOut::Report(report) = &out[1] else {
            panic!("expected report");
        };
        assert_eq!(report.error, NetworkError::TooBig(1200));
        assert_eq!(report.proto, Protocol::Udp);
    }
}
