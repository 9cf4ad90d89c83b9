//! Connection tracking: every observed 5-tuple maps to a state record,
//! indexed in both directions once confirmed. Consulted by the IP layer
//! pre-input (`track_in`) and post-input (`confirm`); TCP promotes entries
//! to ESTABLISHED. A periodic flush removes expired entries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::addr::Socket;
use crate::buffer::Packet;
use crate::ip::Protocol;
use crate::ip4::header as ip4_header;

/// Interval at which expired entries are swept.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Source/destination socket pair, the direction-sensitive half of a
/// conntrack key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quadruple {
    pub src: Socket,
    pub dst: Socket,
}

impl Quadruple {
    pub fn new(src: Socket, dst: Socket) -> Self {
        Quadruple { src, dst }
    }

    /// The reverse direction.
    pub fn mirror(&self) -> Quadruple {
        Quadruple {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl std::fmt::Display for Quadruple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Tracking state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconfirmed,
    New,
    Established,
    Related,
}

/// Entry flag: no packet seen in the reply direction yet.
pub const FLAG_UNREPLIED: u8 = 1 << 0;
/// Entry flag: connection has seen traffic both ways and is trusted.
pub const FLAG_ASSURED: u8 = 1 << 1;

pub type EntryRef = Rc<RefCell<Entry>>;

/// A tracked connection.
pub struct Entry {
    pub first: Quadruple,
    pub second: Quadruple,
    pub proto: Protocol,
    pub state: State,
    pub flags: u8,
    /// Absolute expiry (monotonic clock).
    pub timeout: Duration,
    pub on_close: Option<Rc<dyn Fn(&Entry)>>,
}

impl Entry {
    fn new(quad: Quadruple, proto: Protocol, timeout: Duration) -> Self {
        Entry {
            first: quad,
            second: quad.mirror(),
            proto,
            state: State::Unconfirmed,
            flags: FLAG_UNREPLIED,
            timeout,
            on_close: None,
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.first.src == self.second.dst && self.first.dst == self.second.src
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn unset_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn isset(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("first", &self.first)
            .field("proto", &self.proto)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Per-protocol timeout durations.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSettings {
    pub tcp: Duration,
    pub udp: Duration,
    pub icmp: Duration,
}

impl TimeoutSettings {
    pub fn get(&self, proto: Protocol) -> Duration {
        match proto {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
            _ => self.icmp,
        }
    }
}

/// Timeout table keyed by entry state class.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub unconfirmed: TimeoutSettings,
    pub confirmed: TimeoutSettings,
    pub established: TimeoutSettings,
}

impl Default for Timeouts {
    fn default() -> Self {
        let secs = Duration::from_secs;
        Timeouts {
            unconfirmed: TimeoutSettings {
                tcp: secs(10),
                udp: secs(10),
                icmp: secs(10),
            },
            confirmed: TimeoutSettings {
                tcp: secs(30),
                udp: secs(10),
                icmp: secs(10),
            },
            established: TimeoutSettings {
                tcp: secs(300),
                udp: secs(10),
                icmp: secs(10),
            },
        }
    }
}

/// The connection tracker.
pub struct Conntrack {
    entries: HashMap<(Protocol, Quadruple), EntryRef>,
    /// 0 means unlimited. A confirmed connection occupies two keys.
    pub maximum_entries: usize,
    pub timeout: Timeouts,
}

impl Conntrack {
    pub fn new() -> Self {
        Conntrack {
            entries: HashMap::new(),
            maximum_entries: 0,
            timeout: Timeouts::default(),
        }
    }

    pub fn with_maximum_entries(maximum: usize) -> Self {
        let mut ct = Self::new();
        ct.maximum_entries = maximum;
        ct
    }

    pub fn number_of_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn reserve(&mut self, count: usize) {
        self.entries.reserve(count);
    }

    /// Extract `(protocol, quadruple)` from an IPv4 packet positioned at
    /// its IP header. ICMP uses the echo identifier for both ports.
    pub fn get_quadruple(pkt: &Packet) -> Option<(Protocol, Quadruple)> {
        let hdr = ip4_header::view(pkt)?;
        let proto = hdr.protocol();
        let src_ip = IpAddr::V4(hdr.src());
        let dst_ip = IpAddr::V4(hdr.dst());
        let payload = pkt.data().get(hdr.ihl_bytes()..)?;

        let (sport, dport) = match proto {
            Protocol::Tcp | Protocol::Udp => {
                if payload.len() < 4 {
                    return None;
                }
                (
                    u16::from_be_bytes([payload[0], payload[1]]),
                    u16::from_be_bytes([payload[2], payload[3]]),
                )
            }
            Protocol::Icmp => {
                // type(1) code(1) checksum(2) id(2)
                if payload.len() < 6 {
                    return None;
                }
                let id = u16::from_be_bytes([payload[4], payload[5]]);
                (id, id)
            }
            _ => (0, 0),
        };
        Some((
            proto,
            Quadruple::new(Socket::new(src_ip, sport), Socket::new(dst_ip, dport)),
        ))
    }

    pub fn get(&self, quad: &Quadruple, proto: Protocol) -> Option<EntryRef> {
        self.entries.get(&(proto, *quad)).cloned()
    }

    /// Pre-input hook. Refreshes a known entry or creates a new
    /// UNCONFIRMED one. Returns `None` when the table is full.
    pub fn track_in(&mut self, quad: Quadruple, proto: Protocol, now: Duration) -> Option<EntryRef> {
        if let Some(entry) = self.entries.get(&(proto, quad)).cloned() {
            {
                let mut e = entry.borrow_mut();
                let settings = match e.state {
                    State::Unconfirmed => self.timeout.unconfirmed,
                    State::Established => self.timeout.established,
                    _ => self.timeout.confirmed,
                };
                e.timeout = now + settings.get(proto);
                // Traffic in the reply direction answers the original.
                if quad == e.second && e.isset(FLAG_UNREPLIED) {
                    e.unset_flag(FLAG_UNREPLIED);
                    e.set_flag(FLAG_ASSURED);
                }
            }
            return Some(entry);
        }
        self.add_entry(quad, proto, now)
    }

    /// Create an UNCONFIRMED entry (single-direction index).
    pub fn add_entry(&mut self, quad: Quadruple, proto: Protocol, now: Duration) -> Option<EntryRef> {
        if self.maximum_entries != 0 && self.entries.len() + 2 > self.maximum_entries {
            trace!("conntrack: table full");
            return None;
        }
        let timeout = now + self.timeout.unconfirmed.get(proto);
        let entry = Rc::new(RefCell::new(Entry::new(quad, proto, timeout)));
        self.entries.insert((proto, quad), entry.clone());
        trace!(%quad, ?proto, "conntrack: new entry");
        Some(entry)
    }

    /// Post-input hook: promote to NEW and index the reverse direction.
    pub fn confirm_packet(&mut self, pkt: &Packet, now: Duration) -> Option<EntryRef> {
        let (proto, quad) = Self::get_quadruple(pkt)?;
        self.confirm(quad, proto, now)
    }

    pub fn confirm(&mut self, quad: Quadruple, proto: Protocol, now: Duration) -> Option<EntryRef> {
        let entry = self.entries.get(&(proto, quad)).cloned()?;
        let second = {
            let mut e = entry.borrow_mut();
            if e.state != State::Unconfirmed {
                return Some(entry.clone());
            }
            e.state = State::New;
            e.timeout = now + self.timeout.confirmed.get(proto);
            e.second
        };
        self.entries.insert((proto, second), entry.clone());
        Some(entry)
    }

    /// TCP's state callback: the three-way handshake completed.
    pub fn established(&mut self, quad: Quadruple, proto: Protocol, now: Duration) {
        if let Some(entry) = self.entries.get(&(proto, quad)) {
            let mut e = entry.borrow_mut();
            e.state = State::Established;
            e.timeout = now + self.timeout.established.get(proto);
        }
    }

    /// Re-key one direction of an entry (used by NAT).
    pub fn update_entry(
        &mut self,
        proto: Protocol,
        oldq: Quadruple,
        newq: Quadruple,
    ) -> Option<EntryRef> {
        let entry = self.entries.remove(&(proto, oldq))?;
        {
            let mut e = entry.borrow_mut();
            if e.first == oldq {
                e.first = newq;
            } else if e.second == oldq {
                e.second = newq;
            }
        }
        self.entries.insert((proto, newq), entry.clone());
        Some(entry)
    }

    /// Remove expired entries. The caller runs [`fire_on_close`] on the
    /// returned entries once it no longer holds the tracker borrow.
    #[must_use]
    pub fn remove_expired(&mut self, now: Duration) -> Vec<EntryRef> {
        let mut closed: Vec<EntryRef> = Vec::new();
        self.entries.retain(|_, entry| {
            let expired = entry.borrow().timeout <= now;
            if expired && !closed.iter().any(|c| Rc::ptr_eq(c, entry)) {
                closed.push(entry.clone());
            }
            !expired
        });
        closed
    }

    /// Minimal tracker for callers that already know the tuple.
    pub fn simple_track_in(
        &mut self,
        quad: Quadruple,
        proto: Protocol,
        now: Duration,
    ) -> Option<EntryRef> {
        self.track_in(quad, proto, now)
    }
}

impl Default for Conntrack {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke the `on_close` callback of entries returned by
/// [`Conntrack::remove_expired`], exactly once each.
pub fn fire_on_close(entries: &[EntryRef]) {
    for entry in entries {
        let cb = entry.borrow().on_close.clone();
        if let Some(cb) = cb {
            cb(&entry.borrow());
        }
    }
}

/// Helper for tests and transports: quadruple from explicit v4 parts.
pub fn quadruple_v4(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Quadruple {
    Quadruple::new(Socket::v4(src, sport), Socket::v4(dst, dport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quad() -> Quadruple {
        quadruple_v4(Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(10, 0, 0, 2), 80)
    }

    #[test]
    fn test_track_in_creates_unconfirmed() {
        let mut ct = Conntrack::new();
        let e = ct.track_in(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        assert_eq!(e.borrow().state, State::Unconfirmed);
        assert!(e.borrow().isset(FLAG_UNREPLIED));
        assert!(e.borrow().is_mirrored());
        assert_eq!(ct.number_of_entries(), 1);
    }

    #[test]
    fn test_confirm_indexes_both_directions() {
        let mut ct = Conntrack::new();
        ct.track_in(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        let e = ct.confirm(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        assert_eq!(e.borrow().state, State::New);
        assert_eq!(ct.number_of_entries(), 2);
        // reply direction resolves to the same entry
        let reverse = ct.get(&quad().mirror(), Protocol::Tcp).unwrap();
        assert!(Rc::ptr_eq(&e, &reverse));
    }

    #[test]
    fn test_reply_clears_unreplied() {
        let mut ct = Conntrack::new();
        ct.track_in(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        ct.confirm(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        let e = ct
            .track_in(quad().mirror(), Protocol::Tcp, Duration::from_secs(1))
            .unwrap();
        assert!(!e.borrow().isset(FLAG_UNREPLIED));
        assert!(e.borrow().isset(FLAG_ASSURED));
    }

    #[test]
    fn test_established_extends_timeout() {
        let mut ct = Conntrack::new();
        ct.track_in(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        ct.confirm(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        ct.established(quad(), Protocol::Tcp, Duration::ZERO);
        let e = ct.get(&quad(), Protocol::Tcp).unwrap();
        assert_eq!(e.borrow().state, State::Established);
        assert_eq!(e.borrow().timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_expiry_calls_on_close_once() {
        let mut ct = Conntrack::new();
        ct.track_in(quad(), Protocol::Udp, Duration::ZERO).unwrap();
        let e = ct.confirm(quad(), Protocol::Udp, Duration::ZERO).unwrap();
        let closes = Rc::new(Cell::new(0));
        {
            let closes = closes.clone();
            e.borrow_mut().on_close = Some(Rc::new(move |_| closes.set(closes.get() + 1)));
        }
        let closed = ct.remove_expired(Duration::from_secs(11));
        fire_on_close(&closed);
        assert_eq!(ct.number_of_entries(), 0);
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_capacity_limit_refuses() {
        let mut ct = Conntrack::with_maximum_entries(2);
        ct.track_in(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        ct.confirm(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        let other = quadruple_v4(
            Ipv4Addr::new(10, 0, 0, 3),
            1234,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
        );
        assert!(ct.track_in(other, Protocol::Tcp, Duration::ZERO).is_none());
    }

    #[test]
    fn test_update_entry_rekeys() {
        let mut ct = Conntrack::new();
        ct.track_in(quad(), Protocol::Tcp, Duration::ZERO).unwrap();
        let newq = quadruple_v4(
            Ipv4Addr::new(192, 168, 0, 9),
            5000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
        );
        let e = ct.update_entry(Protocol::Tcp, quad(), newq).unwrap();
        assert_eq!(e.borrow().first, newq);
        assert!(ct.get(&quad(), Protocol::Tcp).is_none());
        assert!(ct.get(&newq, Protocol::Tcp).is_some());
    }
}
