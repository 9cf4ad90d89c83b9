//! The per-NIC stack assembly: owns every protocol layer, wires their
//! delegates together, and exposes the user-facing API (sockets,
//! connections, resolve, ping, configuration).
//!
//! Wiring rule: a layer's receive method returns a dispatch decision
//! instead of calling upward while self-borrowed, and the glue here
//! performs the next call. That lets a transport synchronously transmit
//! back down through the same layers without aliasing a `RefCell`.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::addr::{MacAddr, Socket};
use crate::buffer::{BufferStore, Packet};
use crate::conntrack::{self, Conntrack};
use crate::dns;
use crate::error::{NetworkError, Result};
use crate::ethernet::{self, EtherType, Ethernet};
use crate::ip::Protocol;
use crate::ip4::icmp::{Icmp, IcmpOut, PingCallback};
use crate::ip4::{Ip4, Ip4Config, IpDeliver, SharedIp4Config, header as ip4_header};
use crate::ip6::icmp6::{Icmp6, Icmp6Deliver};
use crate::ip6::mld::Mld;
use crate::ip6::ndp::{Ndp, NdpOut};
use crate::ip6::slaac::Slaac;
use crate::ip6::{Ip6, Ip6Config, Ip6Deliver, SharedIp6Config};
use crate::nic::Nic;
use crate::tcp::{Connection, Listener, Tcp};
use crate::timer::Timers;
use crate::udp::{Udp, UdpDeliver, UdpSocket};

/// Offset reserved in stack-created IP packets for the link header.
pub const IP_PACKET_OFFSET: usize = ethernet::HEADER_LEN;

pub struct InetShared {
    nic: Rc<dyn Nic>,
    store: BufferStore,
    timers: Timers,
    config4: SharedIp4Config,
    config6: SharedIp6Config,
    dns_server: RefCell<Ipv4Addr>,
    eth: Rc<RefCell<Ethernet>>,
    arp: Rc<RefCell<crate::arp::Arp>>,
    ip4: Rc<RefCell<Ip4>>,
    icmp: Rc<RefCell<Icmp>>,
    ip6: Rc<RefCell<Ip6>>,
    icmp6: Rc<RefCell<Icmp6>>,
    ndp: Rc<RefCell<Ndp>>,
    mld: Rc<RefCell<Mld>>,
    slaac: Rc<RefCell<Slaac>>,
    conntrack: Rc<RefCell<Conntrack>>,
    udp: Rc<RefCell<Udp>>,
    tcp: Rc<RefCell<Tcp>>,
    dns: Rc<RefCell<dns::Client>>,
    on_config: RefCell<Vec<Rc<dyn Fn()>>>,
}

/// One NIC's fully assembled stack. Cheap to clone.
#[derive(Clone)]
pub struct Inet {
    shared: Rc<InetShared>,
}

impl Inet {
    /// Assemble a stack on top of `nic`, unconfigured.
    pub fn new(nic: Rc<dyn Nic>, timers: Timers) -> Result<Inet> {
        let store = nic.buffer_store();
        let mac = nic.mac();
        let mtu = nic.mtu();
        let mdds = mtu - ip4_header::HEADER_LEN as u16;

        let config4: SharedIp4Config = Rc::new(RefCell::new(Ip4Config::unconfigured()));
        let config6: SharedIp6Config = Rc::new(RefCell::new(Ip6Config::default()));

        let eth = Rc::new(RefCell::new(Ethernet::new(mac)));
        let arp = crate::arp::Arp::new(mac, config4.clone(), store.clone(), timers.clone());
        let ip4 = Rc::new(RefCell::new(Ip4::new(config4.clone(), mtu)));
        let icmp = Icmp::new(store.clone(), timers.clone());
        let ip6 = Rc::new(RefCell::new(Ip6::new(config6.clone())));
        let icmp6 = Rc::new(RefCell::new(Icmp6::new(store.clone())));
        let ndp = Rc::new(RefCell::new(Ndp::new(mac, config6.clone(), store.clone())));
        let mld = Mld::new(config6.clone(), store.clone(), timers.clone());
        let slaac = Slaac::new(mac, config6.clone(), ndp.clone(), timers.clone());
        let conntrack = Rc::new(RefCell::new(Conntrack::new()));
        let udp = Udp::new(store.clone(), config4.clone(), timers.clone(), mdds);
        let tcp = Tcp::new(store.clone(), config4.clone(), timers.clone(), mdds);
        let dns_client = dns::Client::new(&udp, timers.clone())?;

        let shared = Rc::new(InetShared {
            nic,
            store,
            timers,
            config4,
            config6,
            dns_server: RefCell::new(Ipv4Addr::UNSPECIFIED),
            eth,
            arp,
            ip4,
            icmp,
            ip6,
            icmp6,
            ndp,
            mld,
            slaac,
            conntrack,
            udp,
            tcp,
            dns: dns_client,
            on_config: RefCell::new(Vec::new()),
        });
        Self::wire(&shared);
        Ok(Inet { shared })
    }

    //
    // Wiring
    //

    fn wire(shared: &Rc<InetShared>) {
        let weak = Rc::downgrade(shared);

        // NIC -> Ethernet
        {
            let weak = weak.clone();
            shared.nic.set_upstream(Rc::new(move |frame| {
                if let Some(sh) = weak.upgrade() {
                    link_receive(&sh, frame);
                }
            }));
        }

        // NIC backpressure -> TCP writeq + UDP sendq
        {
            let weak = weak.clone();
            shared.nic.on_queue_available(Rc::new(move |free| {
                let Some(sh) = weak.upgrade() else { return };
                let drained = sh.udp.borrow_mut().process_sendq(free);
                for pkt in drained {
                    ip4_transmit(&sh, pkt);
                }
                Tcp::process_writeq(&sh.tcp, free);
            }));
        }

        // ARP timer-driven output and resolution failure
        {
            let weak = weak.clone();
            shared
                .arp
                .borrow_mut()
                .set_linklayer_out(Rc::new(move |pkt, dst, et| {
                    if let Some(sh) = weak.upgrade() {
                        link_send(&sh, pkt, dst, et);
                    }
                }));
        }
        {
            let weak = weak.clone();
            shared
                .arp
                .borrow_mut()
                .set_resolve_fail(Rc::new(move |pkt, next_hop| {
                    if let Some(sh) = weak.upgrade() {
                        resolve_failed(&sh, pkt, next_hop);
                    }
                }));
        }

        // transports -> IP
        {
            let weak = weak.clone();
            shared
                .udp
                .borrow_mut()
                .set_network_out(Rc::new(move |pkt| {
                    if let Some(sh) = weak.upgrade() {
                        ip4_transmit(&sh, pkt);
                    }
                }));
        }
        {
            let nic = shared.nic.clone();
            shared
                .udp
                .borrow_mut()
                .set_tx_available(Rc::new(move || nic.transmit_queue_available()));
        }
        {
            let weak = weak.clone();
            shared
                .tcp
                .borrow_mut()
                .set_network_out(Rc::new(move |pkt| {
                    if let Some(sh) = weak.upgrade() {
                        ip4_transmit(&sh, pkt);
                    }
                }));
        }

        // conntrack hooks
        shared.ip4.borrow_mut().set_conntrack(shared.conntrack.clone());

        {
            let ct = shared.conntrack.clone();
            let timers = shared.timers.clone();
            shared
                .tcp
                .borrow_mut()
                .set_established_handler(Rc::new(move |local, remote| {
                    let quad = conntrack::Quadruple::new(remote, local);
                    ct.borrow_mut().established(quad, Protocol::Tcp, timers.now());
                }));
        }
        {
            let ct = Rc::downgrade(&shared.conntrack);
            let timers = shared.timers.clone();
            shared.timers.periodic(
                conntrack::FLUSH_INTERVAL,
                conntrack::FLUSH_INTERVAL,
                move || {
                    if let Some(ct) = ct.upgrade() {
                        let closed = ct.borrow_mut().remove_expired(timers.now());
                        conntrack::fire_on_close(&closed);
                    }
                },
            );
        }

        // PMTU sweep: stale entries grow back and TCP hears about it
        {
            let weak = weak.clone();
            let timers = shared.timers.clone();
            shared.timers.periodic(
                crate::ip4::PMTU_SWEEP_INTERVAL,
                crate::ip4::PMTU_SWEEP_INTERVAL,
                move || {
                    let Some(sh) = weak.upgrade() else { return };
                    let notes = sh.ip4.borrow_mut().reset_stale_paths(timers.now());
                    for (dest, pmtu) in notes {
                        Tcp::on_pmtu_change(&sh.tcp, dest, pmtu);
                    }
                },
            );
        }

        // v6 control-plane senders
        {
            let weak = weak.clone();
            shared
                .slaac
                .borrow_mut()
                .set_link_out(Rc::new(move |pkt, src, dst| {
                    if let Some(sh) = weak.upgrade() {
                        ip6_transmit(&sh, pkt, src, dst);
                    }
                }));
        }
        {
            let weak = weak.clone();
            shared
                .mld
                .borrow_mut()
                .set_link_out(Rc::new(move |pkt, src, dst| {
                    if let Some(sh) = weak.upgrade() {
                        ip6_transmit(&sh, pkt, src, dst);
                    }
                }));
        }

        // SLAAC completion feeds the configured-event list
        {
            let weak = weak.clone();
            shared.slaac.borrow_mut().on_complete(Rc::new(move |_addr| {
                if let Some(sh) = weak.upgrade() {
                    fire_on_config(&sh);
                }
            }));
        }
    }

    //
    // Configuration
    //

    /// Configure the v4 side statically and fire the config handlers
    /// (the same event DHCP/SLAAC completion fires).
    pub fn configure(
        &self,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns_server: Ipv4Addr,
    ) {
        {
            let mut cfg = self.shared.config4.borrow_mut();
            cfg.addr = addr;
            cfg.netmask = netmask;
            cfg.gateway = gateway;
        }
        *self.shared.dns_server.borrow_mut() = dns_server;
        debug!(%addr, %netmask, %gateway, "inet: configured");
        fire_on_config(&self.shared);
    }

    /// Register a handler fired once configuration completes.
    pub fn on_config(&self, handler: impl Fn() + 'static) {
        self.shared.on_config.borrow_mut().push(Rc::new(handler));
    }

    /// Kick off IPv6 stateless autoconfiguration.
    pub fn start_slaac(&self) {
        self.shared.slaac.borrow_mut().start();
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        self.shared.config4.borrow().addr
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.shared.config4.borrow().netmask
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.shared.config4.borrow().gateway
    }

    pub fn dns_addr(&self) -> Ipv4Addr {
        *self.shared.dns_server.borrow()
    }

    pub fn ip6_addr(&self) -> Option<Ipv6Addr> {
        self.shared.config6.borrow().global
    }

    pub fn ip6_linklocal(&self) -> Option<Ipv6Addr> {
        self.shared.config6.borrow().linklocal
    }

    pub fn link_addr(&self) -> MacAddr {
        self.shared.nic.mac()
    }

    pub fn mtu(&self) -> u16 {
        self.shared.nic.mtu()
    }

    /// Add a virtual loopback address: traffic to it short-circuits back
    /// into the stack without touching the wire.
    pub fn add_virtual_loopback(&self, addr: Ipv4Addr) {
        self.shared.config4.borrow_mut().virtual_loopback.push(addr);
    }

    //
    // Sub-layer access
    //

    pub fn tcp(&self) -> Rc<RefCell<Tcp>> {
        self.shared.tcp.clone()
    }

    pub fn udp(&self) -> Rc<RefCell<Udp>> {
        self.shared.udp.clone()
    }

    pub fn ip4(&self) -> Rc<RefCell<Ip4>> {
        self.shared.ip4.clone()
    }

    pub fn conntrack(&self) -> Rc<RefCell<Conntrack>> {
        self.shared.conntrack.clone()
    }

    pub fn mld(&self) -> Rc<RefCell<Mld>> {
        self.shared.mld.clone()
    }

    pub fn timers(&self) -> Timers {
        self.shared.timers.clone()
    }

    /// Draw a buffer from the NIC's pool, link-layer offset reserved.
    pub fn create_ip_packet(&self) -> Option<Packet> {
        self.shared
            .store
            .alloc(IP_PACKET_OFFSET + ip4_header::HEADER_LEN)
    }

    //
    // Application-facing operations
    //

    /// Open a TCP listener.
    pub fn tcp_bind(
        &self,
        port: u16,
        on_connect: impl Fn(Connection) + 'static,
    ) -> Result<Listener> {
        Tcp::bind(&self.shared.tcp, port, Some(Rc::new(on_connect)))
    }

    /// Open a TCP connection.
    pub fn tcp_connect(
        &self,
        remote: Socket,
        on_connect: impl Fn(Option<Connection>) + 'static,
    ) -> Result<Connection> {
        Tcp::connect(&self.shared.tcp, remote, on_connect)
    }

    /// Bind a UDP socket (ephemeral port when `None`).
    pub fn udp_bind(&self, port: Option<u16>) -> Result<UdpSocket> {
        Udp::bind(&self.shared.udp, port)
    }

    /// Resolve a hostname via the configured DNS server.
    pub fn resolve(&self, hostname: &str, callback: impl FnOnce(Result<IpAddr>) + 'static) {
        let server = self.dns_addr();
        dns::resolve(
            &self.shared.dns,
            server,
            hostname,
            Box::new(callback),
            dns::DEFAULT_RESOLVE_TIMEOUT,
            false,
        );
    }

    /// ICMP echo toward `target`; the callback gets the reply or `None`
    /// on timeout.
    pub fn ping(&self, target: Ipv4Addr, callback: PingCallback) {
        let request = self.shared.icmp.borrow_mut().ping(target, callback);
        if let Some(pkt) = request {
            ip4_transmit(&self.shared, pkt);
        }
    }

    /// Fire due timers; returns the number run. The event loop calls this
    /// when [`Timers::next_deadline`] passes.
    pub fn process_timers(&self) -> usize {
        self.shared.timers.process()
    }
}

//
// Upward dispatch
//

fn link_receive(sh: &Rc<InetShared>, frame: Packet) {
    let deliver = sh.eth.borrow_mut().receive(frame);
    match deliver {
        Some(ethernet::EthDeliver::Arp(pkt)) => {
            let now = sh.timers.now();
            let frames = sh.arp.borrow_mut().receive(pkt, now);
            for (pkt, dst, et) in frames {
                link_send(sh, pkt, dst, et);
            }
        }
        Some(ethernet::EthDeliver::Ip4 { pkt, link_bcast }) => {
            ip4_receive(sh, pkt, link_bcast);
        }
        Some(ethernet::EthDeliver::Ip6(pkt)) => {
            ip6_receive(sh, pkt);
        }
        None => {}
    }
}

fn ip4_receive(sh: &Rc<InetShared>, pkt: Packet, link_bcast: bool) {
    let now = sh.timers.now();
    let deliver = sh.ip4.borrow_mut().receive(pkt, link_bcast, now);
    match deliver {
        Some(IpDeliver::Icmp(pkt)) => icmp_receive(sh, pkt),
        Some(IpDeliver::Udp(pkt)) => udp_receive(sh, pkt),
        Some(IpDeliver::Tcp(pkt)) => Tcp::receive(&sh.tcp, pkt),
        Some(IpDeliver::Forward(pkt)) => {
            let forward = sh.ip4.borrow().forward_handler();
            if let Some(forward) = forward {
                forward(pkt);
            }
        }
        None => {}
    }
}

fn icmp_receive(sh: &Rc<InetShared>, pkt: Packet) {
    let outs = sh.icmp.borrow_mut().receive(pkt);
    for out in outs {
        match out {
            IcmpOut::Transmit(pkt) => ip4_transmit(sh, pkt),
            IcmpOut::PmtuUpdate {
                dest,
                mtu,
                total_length,
            } => {
                let now = sh.timers.now();
                let note = sh
                    .ip4
                    .borrow_mut()
                    .update_path(dest, mtu, true, total_length, now);
                if let Some((dest, pmtu)) = note {
                    Tcp::on_pmtu_change(&sh.tcp, dest, pmtu);
                }
            }
            IcmpOut::Report(report) => route_error(sh, report.error, report.proto, report.src, report.dst),
            IcmpOut::PingDone(cb, reply) => cb(reply),
        }
    }
}

fn udp_receive(sh: &Rc<InetShared>, pkt: Packet) {
    let deliver = sh.udp.borrow_mut().receive(pkt);
    match deliver {
        Some(UdpDeliver::Callback(cb, from, payload)) => cb(from, &payload),
        Some(UdpDeliver::PortUnreachable(pkt)) => {
            let bcast = sh.config4.borrow().broadcast_addr();
            let reply = sh.icmp.borrow_mut().destination_unreachable(
                &pkt,
                crate::ip4::icmp::CODE_PORT_UNREACHABLE,
                bcast,
            );
            if let Some(reply) = reply {
                ip4_transmit(sh, reply);
            }
        }
        None => {}
    }
}

fn ip6_receive(sh: &Rc<InetShared>, pkt: Packet) {
    let deliver = sh.ip6.borrow_mut().receive(pkt);
    let Some(Ip6Deliver::Icmp6(pkt, src, dst)) = deliver else {
        return;
    };
    let deliver = sh.icmp6.borrow_mut().receive(pkt, src, dst);
    match deliver {
        Some(Icmp6Deliver::Transmit(pkt, src, dst)) => ip6_transmit(sh, pkt, src, dst),
        Some(Icmp6Deliver::Ndp(pkt, src)) => {
            let now = sh.timers.now();
            let outs = sh.ndp.borrow_mut().receive(&pkt, src, now);
            for out in outs {
                match out {
                    NdpOut::Transmit(pkt, src, dst) => ip6_transmit(sh, pkt, src, dst),
                    NdpOut::Prefixes(prefixes) => {
                        sh.slaac.borrow_mut().prefixes(&prefixes);
                    }
                    NdpOut::NeighborUpdate { target, .. } => {
                        sh.slaac.borrow_mut().neighbor_update(target);
                    }
                }
            }
        }
        Some(Icmp6Deliver::Mld(pkt, src)) => {
            let outs = sh.mld.borrow_mut().receive(&pkt, src);
            for (pkt, src, dst) in outs {
                ip6_transmit(sh, pkt, src, dst);
            }
        }
        Some(Icmp6Deliver::TooBig { mtu }) => {
            trace!(mtu, "inet: v6 packet-too-big noted");
        }
        None => {}
    }
}

//
// Downward dispatch
//

fn link_send(sh: &Rc<InetShared>, pkt: Packet, dst: MacAddr, et: EtherType) {
    let frame = sh.eth.borrow_mut().transmit(pkt, dst, et);
    sh.nic.transmit(frame);
}

/// IPv4 output: finalize the header, short-circuit self-addressed
/// traffic, resolve the next hop, frame and send.
fn ip4_transmit(sh: &Rc<InetShared>, pkt: Packet) {
    // self-addressed (own address or virtual loopback) never hits the wire
    if let Some(dst) = ip4_header::view(&pkt).map(|h| h.dst()) {
        let local = {
            let cfg = sh.config4.borrow();
            dst == cfg.addr || cfg.virtual_loopback.contains(&dst)
        };
        if local {
            trace!(%dst, "inet: loopback delivery");
            let mut pkt = pkt;
            if let Some(hdr) = ip4_header::view_mut(&mut pkt) {
                if hdr.src() == Ipv4Addr::UNSPECIFIED {
                    let addr = sh.config4.borrow().addr;
                    hdr.set_src(addr);
                }
                if hdr.ttl == 0 {
                    hdr.ttl = crate::ip4::DEFAULT_TTL;
                }
            }
            ip4_header::finalize_checksum(&mut pkt);
            ip4_receive(sh, pkt, false);
            return;
        }
    }

    let routed = sh.ip4.borrow_mut().transmit(pkt);
    match routed {
        Ok(Some((pkt, next_hop))) => {
            let now = sh.timers.now();
            let frames = sh.arp.borrow_mut().transmit(pkt, next_hop, now);
            for (pkt, dst, et) in frames {
                link_send(sh, pkt, dst, et);
            }
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "inet: transmit failed"),
    }
}

/// IPv6 output for the control plane (ICMPv6/NDP/MLD).
fn ip6_transmit(sh: &Rc<InetShared>, pkt: Packet, src: Ipv6Addr, dst: Ipv6Addr) {
    let (pkt, next_hop) = sh
        .ip6
        .borrow_mut()
        .transmit(pkt, 58, dst, Some(src));
    let mac = if crate::ip6::is_multicast(next_hop) {
        Some(MacAddr::multicast_v6(next_hop))
    } else {
        let now = sh.timers.now();
        sh.ndp.borrow().cached(next_hop, now)
    };
    match mac {
        Some(mac) => link_send(sh, pkt, mac, EtherType::Ip6),
        None => {
            // unresolved unicast: solicit and drop; the control plane
            // retransmits on its own cadence
            let built = sh
                .ndp
                .borrow_mut()
                .build_neighbor_solicitation(next_hop, false);
            if let Some((ns, src, dst)) = built {
                ip6_transmit(sh, ns, src, dst);
            }
        }
    }
}

//
// Error routing
//

fn route_error(sh: &Rc<InetShared>, error: NetworkError, proto: Protocol, src: Socket, dst: Socket) {
    match proto {
        Protocol::Udp => {
            let hit = sh.udp.borrow_mut().error_report(error, dst);
            if let Some((cb, error, dest)) = hit {
                cb(error, dest);
            }
        }
        Protocol::Tcp => Tcp::error_report(&sh.tcp, error, src, dst),
        _ => {}
    }
}

/// ARP gave up on a next hop: report the dropped datagram back to its
/// transport so per-socket error callbacks fire.
fn resolve_failed(sh: &Rc<InetShared>, pkt: Packet, next_hop: Ipv4Addr) {
    let Some(hdr) = ip4_header::view(&pkt) else { return };
    let proto = hdr.protocol();
    let l4 = pkt.data().get(hdr.ihl_bytes()..).unwrap_or(&[]);
    let (sport, dport) = if l4.len() >= 4 {
        (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        )
    } else {
        (0, 0)
    };
    let src = Socket::v4(hdr.src(), sport);
    let dst = Socket::v4(hdr.dst(), dport);
    debug!(%next_hop, %dst, "inet: address resolution failed");
    route_error(
        sh,
        NetworkError::ResolveFailed(IpAddr::V4(next_hop)),
        proto,
        src,
        dst,
    );
}

fn fire_on_config(sh: &Rc<InetShared>) {
    let handlers: Vec<Rc<dyn Fn()>> = sh.on_config.borrow().clone();
    for handler in handlers {
        handler();
    }
}
