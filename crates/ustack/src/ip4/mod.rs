//! IPv4: input validation and demux, output routing, filter hooks,
//! conntrack hooks and Path-MTU discovery (RFC 1191).

pub mod header;
pub mod icmp;

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::addr::{self, Socket};
use crate::buffer::Packet;
use crate::conntrack::Conntrack;
use crate::error::{Error, Result};
use crate::filter::{FilterChain, Verdict};
use crate::ip::{Direction, Protocol};

/// Default TTL for outgoing datagrams.
pub const DEFAULT_TTL: u8 = 64;

/// RFC 1191 §7.1 plateau table (common internet MTUs). 68 is the official
/// minimum from RFC 791.
pub const PMTU_PLATEAUS: [u16; 6] = [68, 296, 508, 1006, 1492, 2002];

/// How often stale PMTU entries are re-examined.
pub const PMTU_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default staleness bound, in minutes, before a decreased PMTU is raised
/// back to its reset value. Zero means "never raise".
pub const DEFAULT_PMTU_AGED: u16 = 10;

/// Why the IP layer dropped a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BadLength,
    WrongVersion,
    WrongChecksum,
    TtlZero,
    BadDestination,
    UnknownProto,
    Filtered,
    TableFull,
}

/// Where a validated datagram goes next. Packets keep their IP header; the
/// transport reads addresses out of it and indexes past `ihl`.
#[derive(Debug)]
pub enum IpDeliver {
    Icmp(Packet),
    Udp(Packet),
    Tcp(Packet),
    Forward(Packet),
}

/// Interface configuration shared between IP4, ARP and the stack assembly.
#[derive(Debug, Clone)]
pub struct Ip4Config {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Addresses redirected back into the stack without touching the wire.
    pub virtual_loopback: Vec<Ipv4Addr>,
}

impl Ip4Config {
    pub fn new(addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Ip4Config {
            addr,
            netmask,
            gateway,
            virtual_loopback: Vec::new(),
        }
    }

    pub fn unconfigured() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        addr::ipv4_broadcast(self.addr, self.netmask)
    }

    pub fn is_on_network(&self, ip: Ipv4Addr) -> bool {
        addr::ipv4_in_network(ip, self.addr, self.netmask)
    }
}

pub type SharedIp4Config = Rc<RefCell<Ip4Config>>;

/// A PMTU change (decrease or reset) the packetization layers must hear
/// about.
pub type PmtuNotification = (Socket, u16);

/// Hook observing dropped packets. Runs inside the IP layer; it must not
/// transmit.
pub type DropHandlerFn = Rc<dyn Fn(&Packet, Direction, DropReason)>;

/// Delegate receiving not-for-us packets when forwarding is enabled.
pub type ForwardFn = Rc<dyn Fn(Packet)>;

#[derive(Debug, Default, Clone, Copy)]
pub struct Ip4Stats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub packets_dropped: u64,
}

struct PmtuEntry {
    pmtu: u16,
    reset_pmtu: u16,
    /// Set whenever the PMTU decreases in response to Fragmentation
    /// Needed; `None` keeps the entry out of the aging sweep.
    last_decrease: Option<Duration>,
}

pub struct Ip4 {
    config: SharedIp4Config,
    link_mtu: u16,
    stats: Ip4Stats,
    pub prerouting: FilterChain,
    pub input: FilterChain,
    pub output: FilterChain,
    pub postrouting: FilterChain,
    conntrack: Option<Rc<RefCell<Conntrack>>>,
    forward: Option<ForwardFn>,
    drop_handler: Option<DropHandlerFn>,
    path_mtu_discovery: bool,
    pmtu_aged: u16,
    paths: HashMap<Socket, PmtuEntry>,
}

impl Ip4 {
    pub fn new(config: SharedIp4Config, link_mtu: u16) -> Self {
        Ip4 {
            config,
            link_mtu,
            stats: Ip4Stats::default(),
            prerouting: FilterChain::new("prerouting"),
            input: FilterChain::new("input"),
            output: FilterChain::new("output"),
            postrouting: FilterChain::new("postrouting"),
            conntrack: None,
            forward: None,
            drop_handler: None,
            path_mtu_discovery: true,
            pmtu_aged: DEFAULT_PMTU_AGED,
            paths: HashMap::new(),
        }
    }

    pub fn stats(&self) -> Ip4Stats {
        self.stats
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.config.borrow().addr
    }

    /// Maximum Datagram Data Size: link MTU minus the IP header.
    pub fn mdds(&self) -> u16 {
        self.link_mtu - header::HEADER_LEN as u16
    }

    pub fn default_pmtu(&self) -> u16 {
        self.link_mtu
    }

    pub fn minimum_mtu(&self) -> u16 {
        PMTU_PLATEAUS[0]
    }

    pub fn set_conntrack(&mut self, ct: Rc<RefCell<Conntrack>>) {
        self.conntrack = Some(ct);
    }

    pub fn set_packet_forwarding(&mut self, fwd: ForwardFn) {
        self.forward = Some(fwd);
    }

    pub fn forward_handler(&self) -> Option<ForwardFn> {
        self.forward.clone()
    }

    pub fn set_drop_handler(&mut self, handler: DropHandlerFn) {
        self.drop_handler = Some(handler);
    }

    pub fn path_mtu_discovery(&self) -> bool {
        self.path_mtu_discovery
    }

    /// Enable/disable PMTU discovery. `aged` is the staleness bound in
    /// minutes; zero disables raising estimates again.
    pub fn set_path_mtu_discovery(&mut self, on: bool, aged: u16) {
        self.path_mtu_discovery = on;
        self.pmtu_aged = aged;
        if !on {
            self.paths.clear();
        }
    }

    fn dropped(&mut self, pkt: &Packet, direction: Direction, reason: DropReason) {
        self.stats.packets_dropped += 1;
        trace!(?reason, ?direction, "ip4: drop");
        if let Some(handler) = &self.drop_handler {
            handler(pkt, direction, reason);
        }
    }

    pub fn is_for_me(&self, dst: Ipv4Addr) -> bool {
        let cfg = self.config.borrow();
        dst == cfg.addr
            || dst == Ipv4Addr::BROADCAST
            || dst == cfg.broadcast_addr()
            || cfg.virtual_loopback.contains(&dst)
            || cfg.addr == Ipv4Addr::UNSPECIFIED
    }

    /// Upstream input from the link layer.
    pub fn receive(&mut self, mut pkt: Packet, _link_bcast: bool, now: Duration) -> Option<IpDeliver> {
        let (proto, dst, total_length) = {
            let Some(hdr) = header::view(&pkt) else {
                self.dropped(&pkt, Direction::Upstream, DropReason::BadLength);
                return None;
            };
            if hdr.version() != 4 {
                self.dropped(&pkt, Direction::Upstream, DropReason::WrongVersion);
                return None;
            }
            let ihl = hdr.ihl_bytes();
            let total_length = hdr.total_length.get() as usize;
            if ihl < header::HEADER_LEN || total_length < ihl || total_length > pkt.len() {
                self.dropped(&pkt, Direction::Upstream, DropReason::BadLength);
                return None;
            }
            if !header::verify_checksum(pkt.data(), ihl) {
                self.dropped(&pkt, Direction::Upstream, DropReason::WrongChecksum);
                return None;
            }
            if hdr.ttl == 0 {
                self.dropped(&pkt, Direction::Upstream, DropReason::TtlZero);
                return None;
            }
            (hdr.protocol(), hdr.dst(), total_length)
        };

        // Strip link-layer padding.
        pkt.truncate(total_length);
        self.stats.packets_rx += 1;

        if self.prerouting.exec(&pkt, Direction::Upstream) == Verdict::Drop {
            self.dropped(&pkt, Direction::Upstream, DropReason::Filtered);
            return None;
        }

        if let Some(ct) = self.conntrack.clone() {
            if let Some((proto, quad)) = Conntrack::get_quadruple(&pkt) {
                if ct.borrow_mut().track_in(quad, proto, now).is_none() {
                    self.dropped(&pkt, Direction::Upstream, DropReason::TableFull);
                    return None;
                }
            }
        }

        if !self.is_for_me(dst) {
            if self.forward.is_some() {
                return Some(IpDeliver::Forward(pkt));
            }
            self.dropped(&pkt, Direction::Upstream, DropReason::BadDestination);
            return None;
        }

        if self.input.exec(&pkt, Direction::Upstream) == Verdict::Drop {
            self.dropped(&pkt, Direction::Upstream, DropReason::Filtered);
            return None;
        }

        if let Some(ct) = self.conntrack.clone() {
            ct.borrow_mut().confirm_packet(&pkt, now);
        }

        match proto {
            Protocol::Icmp => Some(IpDeliver::Icmp(pkt)),
            Protocol::Udp => Some(IpDeliver::Udp(pkt)),
            Protocol::Tcp => Some(IpDeliver::Tcp(pkt)),
            _ => {
                self.dropped(&pkt, Direction::Upstream, DropReason::UnknownProto);
                None
            }
        }
    }

    /// Downstream output. The packet must start at its IP header with
    /// destination and protocol filled in. Returns the finalized packet
    /// and the next hop for link-layer resolution.
    pub fn transmit(&mut self, mut pkt: Packet) -> Result<Option<(Packet, Ipv4Addr)>> {
        if pkt.len() > self.link_mtu as usize {
            // Fragmenting on transmit is not supported; with PMTU
            // discovery the transport must respect the path estimate.
            return Err(Error::MsgTooBig {
                size: pkt.len(),
                pmtu: self.link_mtu,
            });
        }

        let dst = {
            let local = self.local_ip();
            let pmtud = self.path_mtu_discovery;
            let Some(hdr) = header::view_mut(&mut pkt) else {
                return Err(Error::Parse("short ipv4 header".into()));
            };
            if hdr.src() == Ipv4Addr::UNSPECIFIED {
                hdr.set_src(local);
            }
            if hdr.ttl == 0 {
                hdr.ttl = DEFAULT_TTL;
            }
            if pmtud {
                hdr.set_dont_fragment(true);
            }
            hdr.dst()
        };

        if self.output.exec(&pkt, Direction::Downstream) == Verdict::Drop
            || self.postrouting.exec(&pkt, Direction::Downstream) == Verdict::Drop
        {
            self.dropped(&pkt, Direction::Downstream, DropReason::Filtered);
            return Ok(None);
        }

        header::finalize_checksum(&mut pkt);
        self.stats.packets_tx += 1;

        let next_hop = {
            let cfg = self.config.borrow();
            if dst == Ipv4Addr::BROADCAST
                || dst == cfg.broadcast_addr()
                || cfg.is_on_network(dst)
            {
                dst
            } else {
                debug!(%dst, gateway = %cfg.gateway, "ip4: off-net, routing via gateway");
                cfg.gateway
            }
        };
        pkt.set_next_hop(next_hop.into());
        Ok(Some((pkt, next_hop)))
    }

    //
    // Path MTU discovery
    //

    /// Current estimate for a destination; 0 when no entry exists.
    pub fn pmtu(&self, dest: Socket) -> u16 {
        self.paths.get(&dest).map(|e| e.pmtu).unwrap_or(0)
    }

    /// Timestamp of the entry's last decrease, if it has ever decreased.
    pub fn pmtu_timestamp(&self, dest: Socket) -> Option<Duration> {
        self.paths.get(&dest).and_then(|e| e.last_decrease)
    }

    /// Record a new PMTU for `dest`. A zero `new_pmtu` means the router
    /// gave no hint and the next plateau below `total_length` is used
    /// (RFC 1191 §5). Returns the notification for the packetization
    /// layers, dispatched by the caller once the layer borrow is gone.
    #[must_use]
    pub fn update_path(
        &mut self,
        dest: Socket,
        new_pmtu: u16,
        received_too_big: bool,
        total_length: u16,
        now: Duration,
    ) -> Option<PmtuNotification> {
        if !self.path_mtu_discovery {
            return None;
        }
        let current = self.pmtu(dest);
        let mut pmtu = if new_pmtu == 0 {
            Self::plateau_below(total_length, if current == 0 { self.default_pmtu() } else { current })
        } else {
            new_pmtu
        };
        pmtu = pmtu.clamp(self.minimum_mtu(), self.default_pmtu());

        let reset = self.default_pmtu();
        let entry = self.paths.entry(dest).or_insert(PmtuEntry {
            pmtu,
            reset_pmtu: reset,
            last_decrease: None,
        });
        entry.pmtu = pmtu;
        if received_too_big {
            entry.last_decrease = Some(now);
        }
        debug!(%dest, pmtu, "ip4: path mtu updated");
        Some((dest, pmtu))
    }

    pub fn remove_path(&mut self, dest: Socket) {
        self.paths.remove(&dest);
    }

    pub fn flush_paths(&mut self) {
        self.paths.clear();
    }

    /// RFC 1191 §6.3: entries not decreased for `aged` minutes grow back
    /// to their reset value. The returned notifications go to the
    /// packetization layers.
    #[must_use]
    pub fn reset_stale_paths(&mut self, now: Duration) -> Vec<PmtuNotification> {
        let mut notifications = Vec::new();
        if self.pmtu_aged == 0 {
            return notifications;
        }
        let aged = Duration::from_secs(u64::from(self.pmtu_aged) * 60);
        for (dest, entry) in self.paths.iter_mut() {
            if let Some(t) = entry.last_decrease {
                if now >= t + aged && entry.pmtu < entry.reset_pmtu {
                    entry.pmtu = entry.reset_pmtu;
                    entry.last_decrease = None;
                    debug!(dest = %dest, pmtu = entry.pmtu, "ip4: stale path reset");
                    notifications.push((*dest, entry.pmtu));
                }
            }
        }
        notifications
    }

    fn plateau_below(total_length: u16, current: u16) -> u16 {
        let bound = if total_length > 0 { total_length } else { current };
        PMTU_PLATEAUS
            .iter()
            .rev()
            .copied()
            .find(|&p| p < bound)
            .unwrap_or(PMTU_PLATEAUS[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStore;
    use crate::ethernet;

    const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
    const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

    fn fixture() -> (Ip4, BufferStore) {
        let config = Rc::new(RefCell::new(Ip4Config::new(OUR_IP, NETMASK, GATEWAY)));
        (Ip4::new(config, 1500), BufferStore::new(16, 2048))
    }

    fn datagram(store: &BufferStore, proto: Protocol, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Packet {
        let mut pkt = store.alloc(ethernet::HEADER_LEN + header::HEADER_LEN).unwrap();
        pkt.append(payload);
        header::prepend(&mut pkt, proto, src, dst);
        if let Some(h) = header::view_mut(&mut pkt) {
            h.ttl = 64;
        }
        header::finalize_checksum(&mut pkt);
        pkt
    }

    #[test]
    fn test_receive_valid_udp() {
        let (mut ip, store) = fixture();
        let pkt = datagram(&store, Protocol::Udp, PEER_IP, OUR_IP, &[0u8; 12]);
        assert!(matches!(ip.receive(pkt, false, Duration::ZERO), Some(IpDeliver::Udp(_))));
        assert_eq!(ip.stats().packets_rx, 1);
    }

    #[test]
    fn test_receive_drops_bad_checksum() {
        let (mut ip, store) = fixture();
        let mut pkt = datagram(&store, Protocol::Udp, PEER_IP, OUR_IP, &[0u8; 12]);
        pkt.data_mut()[4] ^= 0x55;
        assert!(ip.receive(pkt, false, Duration::ZERO).is_none());
        assert_eq!(ip.stats().packets_dropped, 1);
    }

    #[test]
    fn test_receive_drops_ttl_zero() {
        let (mut ip, store) = fixture();
        let mut pkt = datagram(&store, Protocol::Udp, PEER_IP, OUR_IP, &[0u8; 12]);
        if let Some(h) = header::view_mut(&mut pkt) {
            h.ttl = 0;
        }
        header::finalize_checksum(&mut pkt);
        assert!(ip.receive(pkt, false, Duration::ZERO).is_none());
    }

    #[test]
    fn test_receive_wrong_destination_dropped_without_forwarder() {
        let (mut ip, store) = fixture();
        let pkt = datagram(&store, Protocol::Udp, PEER_IP, Ipv4Addr::new(10, 9, 9, 9), &[0u8; 4]);
        assert!(ip.receive(pkt, false, Duration::ZERO).is_none());
    }

    #[test]
    fn test_subnet_broadcast_is_for_me() {
        let (ip, _) = fixture();
        assert!(ip.is_for_me(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(ip.is_for_me(Ipv4Addr::BROADCAST));
        assert!(!ip.is_for_me(Ipv4Addr::new(10, 0, 1, 7)));
    }

    #[test]
    fn test_transmit_fills_and_routes_on_net() {
        let (mut ip, store) = fixture();
        let mut pkt = store.alloc(ethernet::HEADER_LEN + header::HEADER_LEN).unwrap();
        pkt.append(&[1, 2, 3, 4]);
        header::prepend(&mut pkt, Protocol::Udp, Ipv4Addr::UNSPECIFIED, PEER_IP);
        let (out, next_hop) = ip.transmit(pkt).unwrap().unwrap();
        assert_eq!(next_hop, PEER_IP);
        let h = header::view(&out).unwrap();
        assert_eq!(h.src(), OUR_IP);
        assert_eq!(h.ttl, DEFAULT_TTL);
        assert!(h.dont_fragment());
        assert!(header::verify_checksum(out.data(), 20));
    }

    #[test]
    fn test_transmit_off_net_goes_to_gateway() {
        let (mut ip, store) = fixture();
        let mut pkt = store.alloc(ethernet::HEADER_LEN + header::HEADER_LEN).unwrap();
        header::prepend(&mut pkt, Protocol::Udp, Ipv4Addr::UNSPECIFIED, Ipv4Addr::new(8, 8, 8, 8));
        let (_, next_hop) = ip.transmit(pkt).unwrap().unwrap();
        assert_eq!(next_hop, GATEWAY);
    }

    #[test]
    fn test_transmit_rejects_oversize() {
        let config = Rc::new(RefCell::new(Ip4Config::new(OUR_IP, NETMASK, GATEWAY)));
        let mut ip = Ip4::new(config, 100);
        let store = BufferStore::new(4, 2048);
        let mut pkt = store.alloc(ethernet::HEADER_LEN + header::HEADER_LEN).unwrap();
        pkt.append(&[0u8; 200]);
        header::prepend(&mut pkt, Protocol::Udp, Ipv4Addr::UNSPECIFIED, PEER_IP);
        assert!(matches!(ip.transmit(pkt), Err(Error::MsgTooBig { .. })));
    }

    #[test]
    fn test_pmtu_update_and_plateau_estimate() {
        let (mut ip, _) = fixture();
        let dest = Socket::v4(PEER_IP, 80);
        let note = ip.update_path(dest, 1200, true, 0, Duration::ZERO);
        assert_eq!(note, Some((dest, 1200)));
        assert_eq!(ip.pmtu(dest), 1200);

        // zero hint: step down through the plateau below the probed size
        let _ = ip.update_path(dest, 0, true, 1200, Duration::from_secs(1));
        assert_eq!(ip.pmtu(dest), 1006);

        // hints clamp to the official minimum
        let _ = ip.update_path(dest, 10, true, 0, Duration::from_secs(2));
        assert_eq!(ip.pmtu(dest), 68);
    }

    #[test]
    fn test_pmtu_stale_reset_notifies() {
        let (mut ip, _) = fixture();
        let dest = Socket::v4(PEER_IP, 80);
        let _ = ip.update_path(dest, 1200, true, 0, Duration::ZERO);
        assert!(ip.reset_stale_paths(Duration::from_secs(60 * 9)).is_empty());
        assert_eq!(ip.pmtu(dest), 1200);
        let notes = ip.reset_stale_paths(Duration::from_secs(60 * 10));
        assert_eq!(ip.pmtu(dest), 1500);
        assert_eq!(notes, vec![(dest, 1500)]);
    }
}
