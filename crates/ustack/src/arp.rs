//! ARP (RFC 826): IPv4 → MAC resolution cache and pending-transmit queue.
//!
//! On a cache miss the outgoing packet parks in the waiting queue while a
//! broadcast REQUEST goes out; a 1-second resolver timer retries up to
//! three times before the queued packets are handed to the resolution-
//! failure hook (RFC 1122 §2.3.2.1/2.3.2.2: flood prevention + queueing).
//! Cache entries live five minutes and are purged by a periodic flush.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use tracing::{debug, trace};

use crate::addr::MacAddr;
use crate::buffer::{BufferStore, Packet};
use crate::ethernet::{self, EtherType};
use crate::ip4::SharedIp4Config;
use crate::timer::{TimerId, Timers};

/// ARP packet length for Ethernet/IPv4.
pub const HEADER_LEN: usize = 28;

/// Number of resolution retries before queued packets are dropped.
pub const ARP_RETRIES: i32 = 3;

const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

const CACHE_EXPIRY: Duration = Duration::from_secs(60 * 5);
const RESOLVE_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 5);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ArpHeader {
    pub htype: U16,
    pub ptype: U16,
    pub hlen: u8,
    pub plen: u8,
    pub opcode: U16,
    pub shwaddr: [u8; 6],
    pub sipaddr: [u8; 4],
    pub dhwaddr: [u8; 6],
    pub dipaddr: [u8; 4],
}

/// Predicate deciding whether to answer requests for a non-local IP
/// (proxy ARP). Injected by the stack's route checker.
pub type RouteChecker = Rc<dyn Fn(Ipv4Addr) -> bool>;

/// Downstream link output `(frame payload, destination MAC, ethertype)`.
pub type LinkOut = Rc<dyn Fn(Packet, MacAddr, EtherType)>;

/// Invoked with each queued packet once resolution retries are exhausted.
pub type ResolveFailFn = Rc<dyn Fn(Packet, Ipv4Addr)>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ArpStats {
    pub requests_rx: u64,
    pub requests_tx: u64,
    pub replies_rx: u64,
    pub replies_tx: u64,
    pub dropped: u64,
}

struct CacheEntry {
    mac: MacAddr,
    inserted: Duration,
}

struct WaitingEntry {
    packets: Vec<Packet>,
    tries_remaining: i32,
}

pub struct Arp {
    mac: MacAddr,
    config: SharedIp4Config,
    store: BufferStore,
    timers: Timers,
    cache: HashMap<Ipv4Addr, CacheEntry>,
    waiting: HashMap<Ipv4Addr, WaitingEntry>,
    resolve_timer: Option<TimerId>,
    self_ref: Weak<RefCell<Arp>>,
    proxy: Option<RouteChecker>,
    link_out: Option<LinkOut>,
    on_resolve_fail: Option<ResolveFailFn>,
    stats: ArpStats,
}

impl Arp {
    pub fn new(
        mac: MacAddr,
        config: SharedIp4Config,
        store: BufferStore,
        timers: Timers,
    ) -> Rc<RefCell<Arp>> {
        let arp = Rc::new(RefCell::new(Arp {
            mac,
            config,
            store,
            timers: timers.clone(),
            cache: HashMap::new(),
            waiting: HashMap::new(),
            resolve_timer: None,
            self_ref: Weak::new(),
            proxy: None,
            link_out: None,
            on_resolve_fail: None,
            stats: ArpStats::default(),
        }));
        arp.borrow_mut().self_ref = Rc::downgrade(&arp);

        let weak = Rc::downgrade(&arp);
        let clock = timers.clone();
        timers.periodic(FLUSH_INTERVAL, FLUSH_INTERVAL, move || {
            if let Some(arp) = weak.upgrade() {
                let now = clock.now();
                arp.borrow_mut().flush_expired(now);
            }
        });
        arp
    }

    /// Set the proxy-ARP policy. Unset (default) means proxying is off.
    pub fn set_proxy_policy(&mut self, checker: RouteChecker) {
        self.proxy = Some(checker);
    }

    /// Wire the link-layer output used by timer-driven retransmissions.
    pub fn set_linklayer_out(&mut self, out: LinkOut) {
        self.link_out = Some(out);
    }

    /// Wire the hook receiving packets whose resolution failed.
    pub fn set_resolve_fail(&mut self, hook: ResolveFailFn) {
        self.on_resolve_fail = Some(hook);
    }

    pub fn stats(&self) -> ArpStats {
        self.stats
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Look up a live cache entry.
    pub fn cached(&self, ip: Ipv4Addr, now: Duration) -> Option<MacAddr> {
        self.cache
            .get(&ip)
            .filter(|e| now < e.inserted + CACHE_EXPIRY)
            .map(|e| e.mac)
    }

    /// Insert or refresh a cache entry.
    pub fn cache(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Duration) {
        trace!(%ip, %mac, "arp: cache");
        self.cache.insert(ip, CacheEntry { mac, inserted: now });
    }

    pub fn flush_cache(&mut self) {
        self.cache.clear();
    }

    /// Drop entries older than the cache TTL.
    pub fn flush_expired(&mut self, now: Duration) {
        self.cache.retain(|_, e| now < e.inserted + CACHE_EXPIRY);
    }

    /// Handle a received ARP packet. Returns frames to put on the wire:
    /// a reply, plus any queued packets unblocked by the sender mapping.
    pub fn receive(&mut self, mut pkt: Packet, now: Duration) -> Vec<(Packet, MacAddr, EtherType)> {
        let mut out = Vec::new();

        let Some(hdr) = ArpHeader::ref_from_prefix(pkt.data()).ok().map(|(h, _)| *h) else {
            self.stats.dropped += 1;
            return out;
        };
        if hdr.htype.get() != 1 || hdr.ptype.get() != 0x0800 || hdr.hlen != 6 || hdr.plen != 4 {
            self.stats.dropped += 1;
            return out;
        }

        let sender_ip = Ipv4Addr::from(hdr.sipaddr);
        let sender_mac = MacAddr(hdr.shwaddr);
        let target_ip = Ipv4Addr::from(hdr.dipaddr);

        // Any valid ARP packet teaches us the sender's mapping.
        self.cache(sender_ip, sender_mac, now);
        for (queued, mac) in self.flush_waiting(sender_ip) {
            out.push((queued, mac, EtherType::Ip4));
        }

        match hdr.opcode.get() {
            OP_REQUEST => {
                self.stats.requests_rx += 1;
                let ours = self.config.borrow().addr == target_ip;
                let proxied =
                    !ours && self.proxy.as_ref().is_some_and(|check| check(target_ip));
                if ours || proxied {
                    // Rewrite the request in place into a reply.
                    if let Some(h) = ArpHeader::mut_from_prefix(pkt.data_mut())
                        .ok()
                        .map(|(h, _)| h)
                    {
                        h.opcode = U16::new(OP_REPLY);
                        h.dhwaddr = hdr.shwaddr;
                        h.dipaddr = hdr.sipaddr;
                        h.shwaddr = self.mac.octets();
                        h.sipaddr = target_ip.octets();
                    }
                    pkt.truncate(HEADER_LEN);
                    self.stats.replies_tx += 1;
                    debug!(%target_ip, to = %sender_ip, "arp: replying");
                    out.push((pkt, sender_mac, EtherType::Arp));
                }
            }
            OP_REPLY => {
                self.stats.replies_rx += 1;
            }
            _ => {
                self.stats.dropped += 1;
            }
        }
        out
    }

    /// Downstream transmission of an IPv4 packet toward `next_hop`.
    /// Returns frames ready for the link: the packet itself when the MAC is
    /// known, otherwise a broadcast REQUEST while the packet waits.
    pub fn transmit(
        &mut self,
        pkt: Packet,
        next_hop: Ipv4Addr,
        now: Duration,
    ) -> Vec<(Packet, MacAddr, EtherType)> {
        let mut out = Vec::new();

        let bcast = {
            let cfg = self.config.borrow();
            next_hop == Ipv4Addr::BROADCAST || next_hop == cfg.broadcast_addr()
        };
        if bcast {
            out.push((pkt, MacAddr::BROADCAST, EtherType::Ip4));
            return out;
        }

        if let Some(mac) = self.cached(next_hop, now) {
            out.push((pkt, mac, EtherType::Ip4));
            return out;
        }

        // RFC 1122 2.3.2.2: queue, then (re-)solicit.
        let entry = self.waiting.entry(next_hop).or_insert(WaitingEntry {
            packets: Vec::new(),
            tries_remaining: ARP_RETRIES,
        });
        entry.packets.push(pkt);
        entry.tries_remaining = ARP_RETRIES;

        if let Some(request) = self.make_request(next_hop) {
            out.push((request, MacAddr::BROADCAST, EtherType::Arp));
        }
        self.start_resolve_timer();
        out
    }

    /// Release packets waiting on `ip`, pairing them with its fresh MAC.
    fn flush_waiting(&mut self, ip: Ipv4Addr) -> Vec<(Packet, MacAddr)> {
        let Some(entry) = self.waiting.remove(&ip) else {
            return Vec::new();
        };
        let Some(mac) = self.cache.get(&ip).map(|e| e.mac) else {
            return Vec::new();
        };
        debug!(%ip, n = entry.packets.len(), "arp: resolved, flushing queue");
        entry.packets.into_iter().map(|p| (p, mac)).collect()
    }

    fn make_request(&mut self, target: Ipv4Addr) -> Option<Packet> {
        let mut pkt = self.store.alloc(ethernet::HEADER_LEN)?;
        let header = ArpHeader {
            htype: U16::new(1),
            ptype: U16::new(0x0800),
            hlen: 6,
            plen: 4,
            opcode: U16::new(OP_REQUEST),
            shwaddr: self.mac.octets(),
            sipaddr: self.config.borrow().addr.octets(),
            dhwaddr: [0; 6],
            dipaddr: target.octets(),
        };
        pkt.append(header.as_bytes());
        self.stats.requests_tx += 1;
        Some(pkt)
    }

    fn start_resolve_timer(&mut self) {
        if self.resolve_timer.is_some() {
            return;
        }
        let weak = self.self_ref.clone();
        self.resolve_timer = Some(self.timers.schedule(RESOLVE_INTERVAL, move || {
            let Some(arp) = weak.upgrade() else { return };
            let (frames, failures, link_out, fail_hook) = {
                let mut a = arp.borrow_mut();
                a.resolve_timer = None;
                let (frames, failures) = a.resolve_waiting();
                if !a.waiting.is_empty() {
                    a.start_resolve_timer();
                }
                (frames, failures, a.link_out.clone(), a.on_resolve_fail.clone())
            };
            if let Some(out) = link_out {
                for (pkt, mac, et) in frames {
                    out(pkt, mac, et);
                }
            }
            match fail_hook {
                Some(hook) => {
                    for (pkt, ip) in failures {
                        hook(pkt, ip);
                    }
                }
                None => drop(failures),
            }
        }));
    }

    /// One resolver tick: retransmit requests for entries with tries left,
    /// expire the rest.
    fn resolve_waiting(&mut self) -> (Vec<(Packet, MacAddr, EtherType)>, Vec<(Packet, Ipv4Addr)>) {
        let mut frames = Vec::new();
        let mut failures = Vec::new();

        let targets: Vec<Ipv4Addr> = self.waiting.keys().copied().collect();
        for ip in targets {
            let expired = {
                let entry = match self.waiting.get_mut(&ip) {
                    Some(e) => e,
                    None => continue,
                };
                entry.tries_remaining -= 1;
                entry.tries_remaining < 0
            };
            if expired {
                if let Some(entry) = self.waiting.remove(&ip) {
                    debug!(%ip, n = entry.packets.len(), "arp: retries exhausted");
                    self.stats.dropped += entry.packets.len() as u64;
                    failures.extend(entry.packets.into_iter().map(|p| (p, ip)));
                }
            } else if let Some(request) = self.make_request(ip) {
                frames.push((request, MacAddr::BROADCAST, EtherType::Arp));
            }
        }
        (frames, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip4::Ip4Config;
    use crate::timer::ManualClock;

    const OUR_MAC: MacAddr = MacAddr::new(0x52, 0x54, 0, 0, 0, 1);
    const PEER_MAC: MacAddr = MacAddr::new(0x52, 0x54, 0, 0, 0, 2);
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn fixture() -> (Rc<RefCell<Arp>>, BufferStore, ManualClock, Timers) {
        let clock = ManualClock::new();
        let timers = Timers::new(Rc::new(clock.clone()));
        let config = Rc::new(RefCell::new(Ip4Config::new(
            OUR_IP,
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 254),
        )));
        let store = BufferStore::new(32, 2048);
        let arp = Arp::new(OUR_MAC, config, store.clone(), timers.clone());
        (arp, store, clock, timers)
    }

    fn request_packet(store: &BufferStore, target: Ipv4Addr) -> Packet {
        let header = ArpHeader {
            htype: U16::new(1),
            ptype: U16::new(0x0800),
            hlen: 6,
            plen: 4,
            opcode: U16::new(OP_REQUEST),
            shwaddr: PEER_MAC.octets(),
            sipaddr: PEER_IP.octets(),
            dhwaddr: [0; 6],
            dipaddr: target.octets(),
        };
        let mut pkt = store.alloc(0).unwrap();
        pkt.append(header.as_bytes());
        pkt
    }

    #[test]
    fn test_request_for_us_gets_reply() {
        let (arp, store, _clock, timers) = fixture();
        let pkt = request_packet(&store, OUR_IP);
        let out = arp.borrow_mut().receive(pkt, timers.now());
        assert_eq!(out.len(), 1);
        let (reply, dst, et) = &out[0];
        assert_eq!(*dst, PEER_MAC);
        assert_eq!(*et, EtherType::Arp);
        let (hdr, _) = ArpHeader::ref_from_prefix(reply.data()).unwrap();
        assert_eq!(hdr.opcode.get(), OP_REPLY);
        assert_eq!(hdr.shwaddr, OUR_MAC.octets());
        assert_eq!(hdr.sipaddr, OUR_IP.octets());
        assert_eq!(hdr.dipaddr, PEER_IP.octets());
        // sender got cached as a side effect
        assert_eq!(arp.borrow().cached(PEER_IP, timers.now()), Some(PEER_MAC));
    }

    #[test]
    fn test_request_for_other_ip_ignored_without_proxy() {
        let (arp, store, _clock, timers) = fixture();
        let pkt = request_packet(&store, Ipv4Addr::new(10, 0, 0, 99));
        let out = arp.borrow_mut().receive(pkt, timers.now());
        assert!(out.is_empty());
    }

    #[test]
    fn test_proxy_policy_answers() {
        let (arp, store, _clock, timers) = fixture();
        arp.borrow_mut()
            .set_proxy_policy(Rc::new(|ip| ip == Ipv4Addr::new(10, 0, 0, 99)));
        let pkt = request_packet(&store, Ipv4Addr::new(10, 0, 0, 99));
        let out = arp.borrow_mut().receive(pkt, timers.now());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_miss_queues_and_reply_flushes() {
        let (arp, store, _clock, timers) = fixture();
        let mut ip_pkt = store.alloc(ethernet::HEADER_LEN).unwrap();
        ip_pkt.append(&[0u8; 40]);

        let out = arp.borrow_mut().transmit(ip_pkt, PEER_IP, timers.now());
        // only a broadcast REQUEST goes out; the datagram is parked
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], (_, MacAddr::BROADCAST, EtherType::Arp)));
        assert_eq!(arp.borrow().waiting_len(), 1);

        // a reply arrives: the datagram is released to the learned MAC
        let reply = {
            let header = ArpHeader {
                htype: U16::new(1),
                ptype: U16::new(0x0800),
                hlen: 6,
                plen: 4,
                opcode: U16::new(OP_REPLY),
                shwaddr: PEER_MAC.octets(),
                sipaddr: PEER_IP.octets(),
                dhwaddr: OUR_MAC.octets(),
                dipaddr: OUR_IP.octets(),
            };
            let mut pkt = store.alloc(0).unwrap();
            pkt.append(header.as_bytes());
            pkt
        };
        let out = arp.borrow_mut().receive(reply, timers.now());
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], (_, mac, EtherType::Ip4) if mac == PEER_MAC));
        assert_eq!(arp.borrow().waiting_len(), 0);
    }

    #[test]
    fn test_retries_exhaust_to_failure_hook() {
        let (arp, store, clock, timers) = fixture();
        let failed = Rc::new(RefCell::new(Vec::new()));
        {
            let failed = failed.clone();
            arp.borrow_mut().set_resolve_fail(Rc::new(move |_pkt, ip| {
                failed.borrow_mut().push(ip);
            }));
            arp.borrow_mut().set_linklayer_out(Rc::new(|_p, _m, _e| {}));
        }
        let mut ip_pkt = store.alloc(ethernet::HEADER_LEN).unwrap();
        ip_pkt.append(&[0u8; 40]);
        arp.borrow_mut().transmit(ip_pkt, PEER_IP, timers.now());

        // three retry ticks then expiry on the fourth
        for _ in 0..4 {
            clock.advance(Duration::from_secs(1));
            timers.process();
        }
        assert_eq!(*failed.borrow(), vec![PEER_IP]);
        assert_eq!(arp.borrow().waiting_len(), 0);
    }

    #[test]
    fn test_cache_expires_after_flush() {
        let (arp, _store, clock, timers) = fixture();
        arp.borrow_mut().cache(PEER_IP, PEER_MAC, timers.now());
        clock.advance(Duration::from_secs(60 * 5 + 1));
        timers.process(); // periodic flush fires
        assert_eq!(arp.borrow().cache_size(), 0);
    }

    #[test]
    fn test_broadcast_skips_resolution() {
        let (arp, store, _clock, timers) = fixture();
        let mut pkt = store.alloc(ethernet::HEADER_LEN).unwrap();
        pkt.append(&[0u8; 20]);
        let out = arp
            .borrow_mut()
            .transmit(pkt, Ipv4Addr::new(10, 0, 0, 255), timers.now());
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], (_, MacAddr::BROADCAST, EtherType::Ip4)));
    }
}
