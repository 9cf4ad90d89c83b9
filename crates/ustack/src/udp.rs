//! UDP (RFC 768): connectionless socket demux, a send queue for link
//! backpressure, and per-destination error-callback delivery.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use tracing::{debug, trace};

use crate::addr::Socket;
use crate::buffer::{BufferStore, Packet};
use crate::error::{Error, NetworkError, Result};
use crate::ethernet;
use crate::ip::Protocol;
use crate::ip4::{SharedIp4Config, header as ip4_header};
use crate::port_util::PortUtil;
use crate::timer::Timers;
use crate::util::checksum;

pub const HEADER_LEN: usize = 8;

/// How long a sendto's error-callback registration stays alive.
const ERROR_CALLBACK_EXPIRY: Duration = Duration::from_secs(60 * 5);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct UdpHeader {
    pub sport: U16,
    pub dport: U16,
    pub length: U16,
    pub checksum: U16,
}

/// Datagram receive callback: `(sender, payload)`.
pub type RecvFn = Rc<dyn Fn(Socket, &[u8])>;

/// Per-socket error callback: `(error, destination it was sent to)`.
pub type ErrorFn = Rc<dyn Fn(NetworkError, Socket)>;

/// Downstream to the IP layer, wired by the stack assembly.
pub type NetworkOutFn = Rc<dyn Fn(Packet)>;

/// Current free depth of the NIC transmit queue.
pub type TxAvailableFn = Rc<dyn Fn() -> usize>;

struct SockInner {
    local_port: u16,
    on_read: Option<RecvFn>,
    on_error: Option<ErrorFn>,
    closed: bool,
}

/// A bound UDP socket handle. Clones share the socket.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Rc<RefCell<SockInner>>,
    udp: Weak<RefCell<Udp>>,
}

impl UdpSocket {
    pub fn local_port(&self) -> u16 {
        self.inner.borrow().local_port
    }

    /// Register the datagram receive callback.
    pub fn on_read(&self, f: impl Fn(Socket, &[u8]) + 'static) {
        self.inner.borrow_mut().on_read = Some(Rc::new(f));
    }

    /// Register the error callback fired when the network reports a
    /// problem with something this socket sent.
    pub fn on_error(&self, f: impl Fn(NetworkError, Socket) + 'static) {
        self.inner.borrow_mut().on_error = Some(Rc::new(f));
    }

    /// Send a datagram. Queued on the send queue when the link is
    /// saturated, transmitted immediately otherwise.
    pub fn sendto(&self, dst: Ipv4Addr, port: u16, data: &[u8]) -> Result<()> {
        let Some(udp) = self.udp.upgrade() else {
            return Err(Error::InvalidState("udp layer gone"));
        };
        let (pkt, out) = {
            let mut u = udp.borrow_mut();
            let pkt = u.build_datagram(self.local_port(), dst, port, data)?;
            let on_error = self.inner.borrow().on_error.clone();
            if let Some(cb) = on_error {
                u.register_error_callback(Socket::v4(dst, port), cb);
            }
            if u.link_saturated() {
                u.sendq.push_back(pkt);
                trace!(dport = port, "udp: link saturated, queueing");
                (None, None)
            } else {
                u.stats.datagrams_tx += 1;
                (Some(pkt), u.network_out.clone())
            }
        };
        if let (Some(pkt), Some(out)) = (pkt, out) {
            out(pkt);
        }
        Ok(())
    }

    /// Broadcast on the local subnet.
    pub fn bcast(&self, port: u16, data: &[u8]) -> Result<()> {
        self.sendto(Ipv4Addr::BROADCAST, port, data)
    }

    /// Release the port and stop delivering.
    pub fn close(&self) {
        let port = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.on_read = None;
            inner.on_error = None;
            inner.local_port
        };
        if let Some(udp) = self.udp.upgrade() {
            let mut u = udp.borrow_mut();
            u.sockets.remove(&port);
            u.ports.release(port);
        }
    }
}

/// What the UDP layer wants done with a received datagram, dispatched by
/// the stack assembly after the layer borrow is released.
pub enum UdpDeliver {
    /// Run the socket's receive callback.
    Callback(RecvFn, Socket, Vec<u8>),
    /// Nothing listens on the port: bounce via ICMP port-unreachable.
    PortUnreachable(Packet),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpStats {
    pub datagrams_rx: u64,
    pub datagrams_tx: u64,
    pub no_port: u64,
    pub dropped: u64,
}

pub struct Udp {
    store: BufferStore,
    config: SharedIp4Config,
    timers: Timers,
    mdds: u16,
    ports: PortUtil,
    sockets: HashMap<u16, Rc<RefCell<SockInner>>>,
    sendq: VecDeque<Packet>,
    error_callbacks: HashMap<Socket, (ErrorFn, Duration)>,
    network_out: Option<NetworkOutFn>,
    tx_available: Option<TxAvailableFn>,
    self_ref: Weak<RefCell<Udp>>,
    stats: UdpStats,
}

impl Udp {
    pub fn new(
        store: BufferStore,
        config: SharedIp4Config,
        timers: Timers,
        mdds: u16,
    ) -> Rc<RefCell<Udp>> {
        let udp = Rc::new(RefCell::new(Udp {
            store,
            config,
            timers,
            mdds,
            ports: PortUtil::new(),
            sockets: HashMap::new(),
            sendq: VecDeque::new(),
            error_callbacks: HashMap::new(),
            network_out: None,
            tx_available: None,
            self_ref: Weak::new(),
            stats: UdpStats::default(),
        }));
        udp.borrow_mut().self_ref = Rc::downgrade(&udp);
        udp
    }

    pub fn set_network_out(&mut self, out: NetworkOutFn) {
        self.network_out = Some(out);
    }

    pub fn set_tx_available(&mut self, avail: TxAvailableFn) {
        self.tx_available = Some(avail);
    }

    pub fn stats(&self) -> UdpStats {
        self.stats
    }

    pub fn open_ports(&self) -> usize {
        self.sockets.len()
    }

    /// Bind a socket to `port`, or to a fresh ephemeral port when `None`.
    pub fn bind(udp: &Rc<RefCell<Udp>>, port: Option<u16>) -> Result<UdpSocket> {
        let inner = {
            let mut u = udp.borrow_mut();
            let port = match port {
                Some(p) => {
                    u.ports.bind(p)?;
                    p
                }
                None => u.ports.bind_ephemeral()?,
            };
            let inner = Rc::new(RefCell::new(SockInner {
                local_port: port,
                on_read: None,
                on_error: None,
                closed: false,
            }));
            u.sockets.insert(port, inner.clone());
            debug!(port, "udp: bound");
            inner
        };
        Ok(UdpSocket {
            inner,
            udp: Rc::downgrade(udp),
        })
    }

    /// Upstream input (packet positioned at its IP header).
    pub fn receive(&mut self, pkt: Packet) -> Option<UdpDeliver> {
        let (src_ip, dst_ip, ihl) = {
            let hdr = ip4_header::view(&pkt)?;
            (hdr.src(), hdr.dst(), hdr.ihl_bytes())
        };
        let segment = pkt.data().get(ihl..)?;
        let Ok((hdr, payload)) = UdpHeader::ref_from_prefix(segment) else {
            self.stats.dropped += 1;
            return None;
        };
        let length = hdr.length.get() as usize;
        if length < HEADER_LEN || length > segment.len() {
            self.stats.dropped += 1;
            return None;
        }
        if hdr.checksum.get() != 0 {
            let pseudo = checksum::pseudo_ipv4(src_ip, dst_ip, Protocol::Udp.as_u8(), length as u16);
            if checksum::finalize(checksum::sum(pseudo, &segment[..length])) != 0 {
                self.stats.dropped += 1;
                return None;
            }
        }
        let sport = hdr.sport.get();
        let dport = hdr.dport.get();
        let payload = &payload[..length - HEADER_LEN];

        let Some(socket) = self.sockets.get(&dport) else {
            self.stats.no_port += 1;
            let bcast = {
                let cfg = self.config.borrow();
                dst_ip == Ipv4Addr::BROADCAST || dst_ip == cfg.broadcast_addr()
            };
            if bcast || dst_ip.is_multicast() {
                // RFC 1122 3.2.2: no ICMP errors for broadcast destinations.
                return None;
            }
            debug!(dport, "udp: no socket, port unreachable");
            return Some(UdpDeliver::PortUnreachable(pkt));
        };

        self.stats.datagrams_rx += 1;
        let on_read = socket.borrow().on_read.clone()?;
        Some(UdpDeliver::Callback(
            on_read,
            Socket::v4(src_ip, sport),
            payload.to_vec(),
        ))
    }

    /// Drain the send queue while transmit slots are available. Returns
    /// packets for the assembly to push down the IP layer.
    pub fn process_sendq(&mut self, mut available: usize) -> Vec<Packet> {
        let mut out = Vec::new();
        while available > 0 {
            match self.sendq.pop_front() {
                Some(pkt) => {
                    self.stats.datagrams_tx += 1;
                    out.push(pkt);
                    available -= 1;
                }
                None => break,
            }
        }
        out
    }

    pub fn sendq_len(&self) -> usize {
        self.sendq.len()
    }

    /// Route a network error to the callback registered for `dest`.
    /// Returns the invocation for the assembly to run unborrowed.
    pub fn error_report(
        &mut self,
        error: NetworkError,
        dest: Socket,
    ) -> Option<(ErrorFn, NetworkError, Socket)> {
        let now = self.timers.now();
        self.error_callbacks.retain(|_, (_, expiry)| *expiry > now);
        let (cb, _) = self.error_callbacks.get(&dest)?;
        Some((cb.clone(), error, dest))
    }

    fn register_error_callback(&mut self, dest: Socket, cb: ErrorFn) {
        // Expiry is refreshed on every send toward `dest`.
        let expiry = self.timers.now() + ERROR_CALLBACK_EXPIRY;
        self.error_callbacks.insert(dest, (cb, expiry));
    }

    fn link_saturated(&self) -> bool {
        match &self.tx_available {
            Some(avail) => avail() == 0,
            None => false,
        }
    }

    fn build_datagram(
        &mut self,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        data: &[u8],
    ) -> Result<Packet> {
        let length = HEADER_LEN + data.len();
        if length > self.mdds as usize {
            return Err(Error::MsgTooBig {
                size: length,
                pmtu: self.mdds + ip4_header::HEADER_LEN as u16,
            });
        }
        let mut pkt = self
            .store
            .alloc(ethernet::HEADER_LEN + ip4_header::HEADER_LEN)
            .ok_or(Error::OutOfBuffers)?;

        let src = self.config.borrow().addr;
        let header = UdpHeader {
            sport: U16::new(sport),
            dport: U16::new(dport),
            length: U16::new(length as u16),
            checksum: U16::new(0),
        };
        pkt.append(header.as_bytes());
        pkt.append(data);

        let pseudo = checksum::pseudo_ipv4(src, dst, Protocol::Udp.as_u8(), length as u16);
        let mut sum = checksum::finalize(checksum::sum(pseudo, pkt.data()));
        if sum == 0 {
            // 0 on the wire means "no checksum"; RFC 768 sends all-ones.
            sum = 0xffff;
        }
        pkt.data_mut()[6..8].copy_from_slice(&sum.to_be_bytes());

        ip4_header::prepend(&mut pkt, Protocol::Udp, src, dst);
        Ok(pkt)
    }
}
