//! TCP: the per-stack access point owning every connection and listener,
//! plus the sub-modules making up the connection engine.

pub mod connection;
pub mod listener;
pub mod read_buffer;
pub mod rttm;
pub mod sack;
pub mod segment;
pub mod state;
pub mod write_queue;

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::addr::Socket;
use crate::buffer::{BufferStore, Packet};
use crate::error::{NetworkError, Result};
use crate::ip4::SharedIp4Config;
use crate::ip4::header as ip4_header;
use crate::port_util::PortUtil;
use crate::timer::Timers;

pub use connection::{Connection, Disconnect};
pub use listener::Listener;
pub use state::State;

use connection::{ConnInner, ConnRef, Tcb, UserEvent};
use listener::ListenerInner;
use segment::{ACK, RST, SYN, SegmentMeta};

/// Default advertised window.
pub const DEFAULT_WINDOW_SIZE: u32 = 0xffff;

/// Default MSS when the peer offers none (RFC 879).
pub const DEFAULT_MSS: u16 = 536;

/// Default maximum of half-open connections per listener.
pub const DEFAULT_MAX_SYN_BACKLOG: usize = 64;

/// Default Maximum Segment Lifetime (TIME-WAIT is twice this).
pub const DEFAULT_MSL: Duration = Duration::from_secs(30);

/// Default delayed-ACK timeout (RFC 1122 p.96).
pub const DEFAULT_DACK_TIMEOUT: Duration = Duration::from_millis(40);

/// Advertised windows may not exceed this, scaled (RFC 7323).
const MAX_WINDOW_SIZE: u32 = 0x4000_0000;

/// Per-host tuning copied into each connection at creation.
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub msl: Duration,
    pub window_size: u32,
    pub wscale: u8,
    pub timestamps: bool,
    pub dack_timeout: Duration,
    pub max_syn_backlog: usize,
    /// Our MSS: MDDS minus the TCP header.
    pub mss: u16,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub incoming_connections: u64,
    pub outgoing_connections: u64,
    pub connection_attempts: u64,
    pub packets_dropped: u64,
}

/// Fired when a handshake completes, for conntrack promotion.
pub type EstablishedFn = Rc<dyn Fn(Socket, Socket)>;

/// The TCP instance of one stack.
pub struct Tcp {
    store: BufferStore,
    config: SharedIp4Config,
    timers: Timers,
    settings: TcpSettings,
    self_ref: Weak<RefCell<Tcp>>,
    listeners: HashMap<u16, Rc<RefCell<ListenerInner>>>,
    connections: HashMap<(Socket, Socket), ConnRef>,
    ports: PortUtil,
    network_out: Option<Rc<dyn Fn(Packet)>>,
    on_established: Option<EstablishedFn>,
    iss_counter: u32,
    stats: TcpStats,
}

impl Tcp {
    pub fn new(
        store: BufferStore,
        config: SharedIp4Config,
        timers: Timers,
        mdds: u16,
    ) -> Rc<RefCell<Tcp>> {
        let tcp = Rc::new(RefCell::new(Tcp {
            store,
            config,
            timers,
            settings: TcpSettings {
                msl: DEFAULT_MSL,
                window_size: DEFAULT_WINDOW_SIZE,
                wscale: 0,
                timestamps: false,
                dack_timeout: DEFAULT_DACK_TIMEOUT,
                max_syn_backlog: DEFAULT_MAX_SYN_BACKLOG,
                mss: mdds.saturating_sub(segment::HEADER_LEN as u16),
            },
            self_ref: Weak::new(),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            ports: PortUtil::new(),
            network_out: None,
            on_established: None,
            iss_counter: 0,
            stats: TcpStats::default(),
        }));
        tcp.borrow_mut().self_ref = Rc::downgrade(&tcp);
        tcp
    }

    //
    // Settings
    //

    pub fn set_msl(&mut self, msl: Duration) {
        self.settings.msl = msl;
    }

    pub fn msl(&self) -> Duration {
        self.settings.msl
    }

    /// Window advertised per connection; capped at 2^30.
    pub fn set_window_size(&mut self, wsize: u32) {
        self.settings.window_size = wsize.min(MAX_WINDOW_SIZE);
    }

    /// Window with a scale factor: advertises `wsize << factor`.
    pub fn set_window_size_scaled(&mut self, wsize: u32, factor: u8) {
        self.set_wscale(factor);
        self.set_window_size(wsize << factor);
    }

    pub fn window_size(&self) -> u32 {
        self.settings.window_size
    }

    /// RFC 7323 p.8: factor 0 turns window scaling off; 14 is the max.
    pub fn set_wscale(&mut self, factor: u8) {
        self.settings.wscale = factor.min(14);
    }

    pub fn uses_wscale(&self) -> bool {
        self.settings.wscale > 0
    }

    pub fn set_timestamps(&mut self, active: bool) {
        self.settings.timestamps = active;
    }

    pub fn uses_timestamps(&self) -> bool {
        self.settings.timestamps
    }

    pub fn set_dack_timeout(&mut self, timeout: Duration) {
        self.settings.dack_timeout = timeout;
    }

    pub fn set_max_syn_backlog(&mut self, limit: usize) {
        self.settings.max_syn_backlog = limit;
    }

    pub fn mss(&self) -> u16 {
        self.settings.mss
    }

    pub fn stats(&self) -> TcpStats {
        self.stats
    }

    pub fn open_ports(&self) -> usize {
        self.listeners.len()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn address(&self) -> IpAddr {
        IpAddr::V4(self.config.borrow().addr)
    }

    //
    // Wiring
    //

    pub fn set_network_out(&mut self, out: Rc<dyn Fn(Packet)>) {
        self.network_out = Some(out);
    }

    pub fn set_established_handler(&mut self, handler: EstablishedFn) {
        self.on_established = Some(handler);
    }

    fn generate_iss(&mut self) -> u32 {
        // clock-salted counter; good enough inside a single image
        self.iss_counter = self.iss_counter.wrapping_add(64_000);
        self.iss_counter
            .wrapping_add(self.timers.now().as_micros() as u32)
    }

    //
    // User interface
    //

    /// Bind a listener to `port`.
    pub fn bind(
        tcp: &Rc<RefCell<Tcp>>,
        port: u16,
        on_connect: Option<listener::ConnectFn>,
    ) -> Result<Listener> {
        let inner = {
            let mut t = tcp.borrow_mut();
            t.ports.bind(port)?;
            let local = Socket::new(t.address(), port);
            let inner = Rc::new(RefCell::new(ListenerInner {
                local,
                syn_queue: std::collections::VecDeque::new(),
                max_syn_backlog: t.settings.max_syn_backlog,
                on_accept: None,
                on_connect,
                host: Rc::downgrade(tcp),
            }));
            t.listeners.insert(port, inner.clone());
            debug!(port, "tcp: listening");
            inner
        };
        Ok(Listener { inner })
    }

    /// Unbind a listener, resetting every half-open connection.
    pub fn unbind(tcp: &Rc<RefCell<Tcp>>, port: u16) -> bool {
        let (listener, half_open) = {
            let mut t = tcp.borrow_mut();
            let Some(listener) = t.listeners.remove(&port) else {
                return false;
            };
            t.ports.release(port);
            let half_open: Vec<ConnRef> = listener.borrow_mut().syn_queue.drain(..).collect();
            (listener, half_open)
        };
        drop(listener);
        for conn in half_open {
            {
                let mut inner = conn.borrow_mut();
                inner.listener = None;
                inner.send_reset();
                inner.signal_close();
            }
            connection::flush(&conn);
        }
        true
    }

    /// Active open toward `remote`. The callback fires with the handle on
    /// success or `None` when the connect fails.
    pub fn connect(
        tcp: &Rc<RefCell<Tcp>>,
        remote: Socket,
        on_connect: impl Fn(Option<Connection>) + 'static,
    ) -> Result<Connection> {
        let conn = {
            let mut t = tcp.borrow_mut();
            let port = t.ports.bind_ephemeral()?;
            let local = Socket::new(t.address(), port);
            t.stats.connection_attempts += 1;
            t.stats.outgoing_connections += 1;
            drop(t);
            let conn = Self::create_connection(tcp, local, remote, None);
            conn.borrow_mut().on_connect = Some(Rc::new(on_connect));
            conn
        };
        {
            let mut inner = conn.borrow_mut();
            debug!(conn = %inner, "tcp: active open");
            inner.set_state(State::SynSent);
            inner.send_segment(SYN, &[]);
            inner.rtx_start();
        }
        connection::flush(&conn);
        Ok(Connection { inner: conn })
    }

    fn create_connection(
        tcp: &Rc<RefCell<Tcp>>,
        local: Socket,
        remote: Socket,
        listener: Option<Weak<RefCell<ListenerInner>>>,
    ) -> ConnRef {
        let (store, timers, settings, network_out, iss) = {
            let mut t = tcp.borrow_mut();
            (
                t.store.clone(),
                t.timers.clone(),
                t.settings.clone(),
                t.network_out.clone(),
                t.generate_iss(),
            )
        };
        let mut tcb = Tcb::new(settings.mss, settings.window_size);
        tcb.init(iss);
        let smss = settings.mss;
        let conn = Rc::new(RefCell::new(ConnInner {
            local,
            remote,
            store,
            timers,
            host: Rc::downgrade(tcp),
            self_ref: Weak::new(),
            listener,
            network_out,
            state: State::Closed,
            prev_state: State::Closed,
            tcb,
            rttm: rttm::Rttm::new(),
            writeq: write_queue::WriteQueue::new(),
            readq: None,
            readq_capacity: connection::DEFAULT_READQ_CAPACITY,
            sack_list: sack::SackList::new(),
            sack_perm: false,
            peer_sacked: Vec::new(),
            bytes_sacked: 0,
            rtx_timer: None,
            timewait_dack_timer: None,
            settings,
            smss,
            fast_recovery: false,
            reno_fpack_seen: false,
            limited_tx: true,
            dup_acks: 0,
            highest_ack: 0,
            prev_highest_ack: 0,
            rtx_attempt: 0,
            syn_rtx: 0,
            dack_count: 0,
            last_ack_sent: 0,
            fin_sent: false,
            fin_recv: false,
            fin_seq: 0,
            close_signaled: false,
            close_fired: false,
            on_connect: None,
            on_read: None,
            on_data: None,
            on_disconnect: None,
            on_close: None,
            on_write: None,
            pending_out: Vec::new(),
            pending_events: Vec::new(),
        }));
        conn.borrow_mut().self_ref = Rc::downgrade(&conn);
        tcp.borrow_mut()
            .connections
            .insert((local, remote), conn.clone());
        conn
    }

    //
    // Receive path
    //

    /// Upstream input (packet positioned at its IP header).
    pub fn receive(tcp: &Rc<RefCell<Tcp>>, pkt: Packet) {
        let Some(seg) = segment::parse(&pkt) else {
            let mut t = tcp.borrow_mut();
            t.stats.packets_dropped += 1;
            trace!("tcp: malformed segment dropped");
            return;
        };
        tcp.borrow_mut().stats.packets_rx += 1;

        let payload =
            pkt.data()[seg.payload_off..seg.payload_off + seg.payload_len].to_vec();
        let key = (seg.dst, seg.src);

        // established or half-open connection?
        let conn = tcp.borrow().connections.get(&key).cloned();
        if let Some(conn) = conn {
            connection::segment_arrived(&conn, &seg, &payload);
            return;
        }

        // a SYN for a listening port spawns a half-open connection
        let listener = tcp.borrow().listeners.get(&seg.dst.port()).cloned();
        if let Some(listener) = listener {
            if seg.isset(SYN) && !seg.isset(ACK) && !seg.isset(RST) {
                if listener.borrow().syn_queue_full() {
                    trace!(port = seg.dst.port(), "tcp: syn queue full, dropping");
                    tcp.borrow_mut().stats.packets_dropped += 1;
                    return;
                }
                let conn = Self::create_connection(
                    tcp,
                    seg.dst,
                    seg.src,
                    Some(Rc::downgrade(&listener)),
                );
                conn.borrow_mut().set_state(State::Listen);
                listener.borrow_mut().syn_queue.push_back(conn.clone());
                tcp.borrow_mut().stats.incoming_connections += 1;
                connection::segment_arrived(&conn, &seg, &payload);
                return;
            }
            // non-SYN for a listening port falls through to reset
        }

        // nothing owns this segment: RFC 793 p.36 reset
        if !seg.isset(RST) {
            Self::send_reset_for(tcp, &seg);
        }
        tcp.borrow_mut().stats.packets_dropped += 1;
    }

    fn send_reset_for(tcp: &Rc<RefCell<Tcp>>, seg: &SegmentMeta) {
        let (pkt, out) = {
            let mut t = tcp.borrow_mut();
            let (seq, ack, flags) = if seg.isset(ACK) {
                (seg.ack, 0, RST)
            } else {
                (0, seg.seq.wrapping_add(seg.seq_len()), RST | ACK)
            };
            let pkt = segment::build(
                &t.store,
                seg.dst,
                seg.src,
                seq,
                ack,
                flags,
                0,
                &segment::OptionsOut::default(),
                &[],
            );
            t.stats.packets_tx += 1;
            (pkt, t.network_out.clone())
        };
        if let (Some(pkt), Some(out)) = (pkt, out) {
            trace!(to = %seg.src, "tcp: reset for unowned segment");
            out(pkt);
        }
    }

    //
    // Hooks from the rest of the stack
    //

    /// The NIC freed transmit slots: let connections with queued data
    /// continue.
    pub fn process_writeq(tcp: &Rc<RefCell<Tcp>>, mut packets: usize) {
        let conns: Vec<ConnRef> = tcp.borrow().connections.values().cloned().collect();
        for conn in conns {
            if packets == 0 {
                break;
            }
            let had_work = {
                let mut inner = conn.borrow_mut();
                if inner.writeq.bytes_remaining() > 0 && inner.state.is_writable() {
                    inner.writeq_push();
                    true
                } else {
                    false
                }
            };
            if had_work {
                connection::flush(&conn);
                packets = packets.saturating_sub(1);
            }
        }
    }

    /// Path-MTU changed for `dest`: shrink the SMSS of its connections
    /// and retransmit anything in flight in smaller pieces.
    pub fn on_pmtu_change(tcp: &Rc<RefCell<Tcp>>, dest: Socket, pmtu: u16) {
        let affected: Vec<ConnRef> = tcp
            .borrow()
            .connections
            .iter()
            .filter(|((_, remote), _)| *remote == dest)
            .map(|(_, c)| c.clone())
            .collect();
        let smss = pmtu
            .saturating_sub((ip4_header::HEADER_LEN + segment::HEADER_LEN) as u16)
            .max(1);
        for conn in affected {
            {
                let mut inner = conn.borrow_mut();
                debug!(conn = %inner, smss, "tcp: smss updated from pmtu");
                inner.smss = smss;
                if inner.flight_size() > 0 {
                    inner.retransmit();
                }
            }
            connection::flush(&conn);
        }
    }

    /// ICMP error for one of our segments.
    pub fn error_report(tcp: &Rc<RefCell<Tcp>>, error: NetworkError, src: Socket, dst: Socket) {
        let conn = tcp.borrow().connections.get(&(src, dst)).cloned();
        let Some(conn) = conn else { return };
        let fatal = {
            let mut inner = conn.borrow_mut();
            match (inner.state, error) {
                // unreachable during connect: fail with REFUSED
                (
                    State::SynSent | State::SynReceived,
                    NetworkError::Unreachable(_) | NetworkError::ResolveFailed(_),
                ) => {
                    inner.pending_events.push(UserEvent::ConnectFailed);
                    inner.signal_close();
                    true
                }
                _ => false,
            }
        };
        if fatal {
            connection::flush(&conn);
        }
    }

    pub(crate) fn notify_established(tcp: &Rc<RefCell<Tcp>>, local: Socket, remote: Socket) {
        let handler = tcp.borrow().on_established.clone();
        if let Some(handler) = handler {
            handler(local, remote);
        }
    }

    /// Detach a finished connection and recycle its ephemeral port.
    pub(crate) fn close_connection(tcp: &Rc<RefCell<Tcp>>, tuple: (Socket, Socket)) {
        let mut t = tcp.borrow_mut();
        if t.connections.remove(&tuple).is_some() {
            trace!(local = %tuple.0, remote = %tuple.1, "tcp: connection closed");
        }
        let port = tuple.0.port();
        let still_used = t.listeners.contains_key(&port)
            || t.connections.keys().any(|(l, _)| l.port() == port);
        if !still_used {
            t.ports.release(port);
        }
    }
}
