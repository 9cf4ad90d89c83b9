//! A TCP connection between two sockets: the transmission control block,
//! congestion control (New Reno, RFC 5681/6582), retransmission, delayed
//! ACK, SACK bookkeeping and the user-facing event surface.
//!
//! Protocol code runs under one `RefCell` borrow and only *accumulates*
//! work: outgoing segments land in `pending_out`, user notifications in
//! `pending_events`. [`flush`] dispatches both after the borrow is
//! released, so a callback may re-enter the connection (write from
//! `on_read`, close from `on_disconnect`) without aliasing.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;

use tracing::{debug, trace};

use crate::addr::Socket;
use crate::buffer::BufferStore;
use crate::timer::{TimerId, Timers};
use crate::util::{seq_ge, seq_gt, seq_le, seq_lt};

use super::listener::ListenerInner;
use super::read_buffer::ReadRequest;
use super::rttm::Rttm;
use super::sack::{Block, SackList};
use super::segment::{self, ACK, FIN, OptionsOut, PSH, RST, SYN, SegmentMeta};
use super::state::State;
use super::write_queue::WriteQueue;
use super::{Tcp, TcpSettings};

/// Hard retry limits (RFC 1122 4.2.3.5 shaped): data vs initial SYN.
pub const MAX_RTX_ATTEMPTS: i8 = 14;
pub const MAX_SYN_RTX: i8 = 4;

/// Default receive-buffer capacity when the user never called `on_read`.
pub const DEFAULT_READQ_CAPACITY: usize = 16 * 1024;

/// Congestion window ceiling.
const CWND_MAX: u32 = 1 << 30;

/// Reason a connection was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Orderly close (FIN exchange).
    Closing,
    /// The remote (or retry exhaustion) refused us.
    Refused,
    /// RST received in a synchronized state.
    Reset,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closing => write!(f, "connection closing"),
            Self::Refused => write!(f, "connection refused"),
            Self::Reset => write!(f, "connection reset"),
        }
    }
}

/// Why an in-window segment was still discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Na,
    SeqOutOfOrder,
    AckNotSet,
    AckOutOfOrder,
    RcvWndZero,
    Rst,
}

/// Transmission Control Block (RFC 793 p.19).
#[derive(Debug, Clone)]
pub(crate) struct Tcb {
    // send sequence space
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    /// Peer's maximum segment size (RMSS).
    pub snd_mss: u16,
    /// Shift applied to the peer's advertised window.
    pub snd_wind_shift: u8,
    pub ts_ok: bool,
    pub iss: u32,
    // receive sequence space
    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    /// Shift we apply to our advertised window.
    pub rcv_wind_shift: u8,
    pub irs: u32,
    // congestion (RFC 5681 / 6582)
    pub ssthresh: u32,
    pub cwnd: u32,
    pub recover: u32,
    // RFC 7323
    pub ts_recent: u32,
}

impl Tcb {
    pub fn new(mss: u16, recvwin: u32) -> Self {
        Tcb {
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: recvwin,
            snd_wl1: 0,
            snd_wl2: 0,
            snd_mss: mss,
            snd_wind_shift: 0,
            ts_ok: false,
            iss: 0,
            rcv_nxt: 0,
            rcv_wnd: recvwin,
            rcv_wind_shift: 0,
            irs: 0,
            ssthresh: recvwin,
            cwnd: 0,
            recover: 0,
            ts_recent: 0,
        }
    }

    pub fn init(&mut self, iss: u32) {
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.recover = iss; // RFC 6582
    }

    pub fn slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

/// Deferred user notifications, fired by [`flush`].
pub(crate) enum UserEvent {
    Connected,
    ConnectFailed,
    Read(Bytes),
    DataAvailable,
    Write(usize),
    Disconnect(Disconnect),
    Close,
}

pub(crate) type ConnRef = Rc<RefCell<ConnInner>>;

pub(crate) struct ConnInner {
    pub local: Socket,
    pub remote: Socket,
    pub store: BufferStore,
    pub timers: Timers,
    pub host: Weak<RefCell<Tcp>>,
    pub self_ref: Weak<RefCell<ConnInner>>,
    pub listener: Option<Weak<RefCell<ListenerInner>>>,
    pub network_out: Option<Rc<dyn Fn(crate::buffer::Packet)>>,

    pub state: State,
    pub prev_state: State,
    pub tcb: Tcb,
    pub rttm: Rttm,
    pub writeq: WriteQueue,
    pub readq: Option<ReadRequest>,
    pub readq_capacity: usize,

    pub sack_list: SackList,
    pub sack_perm: bool,
    pub peer_sacked: Vec<Block>,
    pub bytes_sacked: u64,

    pub rtx_timer: Option<TimerId>,
    pub timewait_dack_timer: Option<TimerId>,

    pub settings: TcpSettings,
    /// Sender maximum segment size, reduced by Path-MTU discovery.
    pub smss: u16,

    pub fast_recovery: bool,
    pub reno_fpack_seen: bool,
    pub limited_tx: bool,
    pub dup_acks: u16,
    pub highest_ack: u32,
    pub prev_highest_ack: u32,
    pub rtx_attempt: i8,
    pub syn_rtx: i8,

    pub dack_count: u8,
    pub last_ack_sent: u32,

    pub fin_sent: bool,
    pub fin_recv: bool,
    pub fin_seq: u32,
    pub close_signaled: bool,
    pub close_fired: bool,

    pub on_connect: Option<Rc<dyn Fn(Option<Connection>)>>,
    pub on_read: Option<Rc<dyn Fn(Bytes)>>,
    pub on_data: Option<Rc<dyn Fn()>>,
    pub on_disconnect: Option<Rc<dyn Fn(Connection, Disconnect)>>,
    pub on_close: Option<Rc<dyn Fn()>>,
    pub on_write: Option<Rc<dyn Fn(usize)>>,

    pub pending_out: Vec<crate::buffer::Packet>,
    pub pending_events: Vec<UserEvent>,
}

impl ConnInner {
    pub fn now(&self) -> Duration {
        self.timers.now()
    }

    //
    // Window arithmetic
    //

    pub fn flight_size(&self) -> u32 {
        self.tcb.snd_nxt.wrapping_sub(self.tcb.snd_una)
    }

    pub fn send_window(&self) -> u32 {
        self.tcb.snd_wnd.min(self.tcb.cwnd)
    }

    pub fn usable_window(&self) -> u32 {
        self.send_window().saturating_sub(self.flight_size())
    }

    pub fn smss(&self) -> u16 {
        self.smss.min(self.tcb.snd_mss)
    }

    pub fn rmss(&self) -> u16 {
        self.tcb.snd_mss
    }

    fn can_send(&self) -> bool {
        let rem = self.writeq.bytes_remaining();
        if rem == 0 || !self.state.is_writable() {
            return false;
        }
        self.usable_window() as usize >= rem.min(self.smss() as usize)
    }

    pub fn calculate_rcv_wnd(&self) -> u32 {
        match &self.readq {
            Some(rq) => rq.fits(self.tcb.rcv_nxt) as u32,
            None => self.settings.window_size,
        }
    }

    fn advertised_window(&mut self) -> u16 {
        self.tcb.rcv_wnd = self.calculate_rcv_wnd();
        (self.tcb.rcv_wnd >> self.tcb.rcv_wind_shift).min(0xffff) as u16
    }

    //
    // Segment construction
    //

    fn ts_value(&self) -> u32 {
        self.now().as_millis() as u32
    }

    fn options_for(&self, flags: u16) -> OptionsOut {
        let mut opts = OptionsOut::default();
        if flags & SYN != 0 {
            opts.mss = Some(self.settings.mss);
            if self.settings.wscale > 0 {
                opts.window_scale = Some(self.settings.wscale);
            }
            opts.sack_permitted = true;
            if self.settings.timestamps {
                opts.timestamp = Some((self.ts_value(), 0));
            }
        } else {
            if self.tcb.ts_ok {
                opts.timestamp = Some((self.ts_value(), self.tcb.ts_recent));
            }
            if self.sack_perm && flags & ACK != 0 {
                opts.sack_blocks = self.sack_list.recent_entries();
            }
        }
        opts
    }

    /// Queue a bare segment carrying the current TCB values.
    pub fn send_segment(&mut self, flags: u16, payload: &[u8]) {
        let window = self.advertised_window();
        let opts = self.options_for(flags);
        let ack = if flags & ACK != 0 { self.tcb.rcv_nxt } else { 0 };
        let seq = self.tcb.snd_nxt;
        if let Some(pkt) = segment::build(
            &self.store,
            self.local,
            self.remote,
            seq,
            ack,
            flags,
            window,
            &opts,
            payload,
        ) {
            if flags & ACK != 0 {
                self.last_ack_sent = self.tcb.rcv_nxt;
            }
            self.pending_out.push(pkt);
        }
        let consumed = payload.len() as u32
            + u32::from(flags & SYN != 0)
            + u32::from(flags & FIN != 0);
        self.tcb.snd_nxt = self.tcb.snd_nxt.wrapping_add(consumed);
    }

    /// Retransmit starting at an explicit sequence without moving SND.NXT.
    fn send_retransmission(&mut self, seq: u32, flags: u16, payload: &[u8]) {
        let window = self.advertised_window();
        let opts = self.options_for(flags);
        if let Some(pkt) = segment::build(
            &self.store,
            self.local,
            self.remote,
            seq,
            self.tcb.rcv_nxt,
            flags,
            window,
            &opts,
            payload,
        ) {
            self.pending_out.push(pkt);
        }
    }

    /// Immediate empty ACK; cancels any pending delayed ACK.
    pub fn send_ack(&mut self) {
        self.stop_dack();
        self.send_segment(ACK, &[]);
    }

    pub fn send_reset(&mut self) {
        self.send_segment(RST | ACK, &[]);
    }

    /// RST addressed from a segment we refuse to own (RFC 793 p.36).
    pub fn send_reset_for(&mut self, seg: &SegmentMeta) {
        let (seq, ack, flags) = if seg.isset(ACK) {
            (seg.ack, 0, RST)
        } else {
            (0, seg.seq.wrapping_add(seg.seq_len()), RST | ACK)
        };
        let opts = OptionsOut::default();
        if let Some(pkt) = segment::build(
            &self.store,
            self.local,
            self.remote,
            seq,
            ack,
            flags,
            0,
            &opts,
            &[],
        ) {
            self.pending_out.push(pkt);
        }
    }

    pub fn drop_seg(&mut self, reason: DropReason) {
        trace!(conn = %self, ?reason, "tcp: segment dropped");
    }

    /// RFC 793 p.69 acceptability test. On failure an immediate ACK goes
    /// out (unless the segment was a RST) and the segment is dropped.
    pub fn check_seq(&mut self, seg: &SegmentMeta) -> bool {
        let wnd = self.calculate_rcv_wnd();
        let nxt = self.tcb.rcv_nxt;
        let slen = seg.seq_len();
        let in_win = |s: u32| seq_ge(s, nxt) && seq_lt(s, nxt.wrapping_add(wnd));
        let ok = if slen == 0 {
            if wnd == 0 { seg.seq == nxt } else { in_win(seg.seq) }
        } else if wnd == 0 {
            false
        } else {
            in_win(seg.seq) || in_win(seg.seq.wrapping_add(slen - 1))
        };
        if !ok {
            if !seg.isset(RST) {
                self.send_ack();
            }
            self.drop_seg(if wnd == 0 {
                DropReason::RcvWndZero
            } else {
                DropReason::SeqOutOfOrder
            });
        }
        ok
    }

    /// (Re)send our SYN-ACK; consumes sequence space only the first time.
    pub fn send_synack(&mut self) {
        if self.tcb.snd_nxt == self.tcb.iss {
            self.send_segment(SYN | ACK, &[]);
        } else {
            self.send_retransmission(self.tcb.iss, SYN | ACK, &[]);
        }
        self.rtx_ensure();
    }

    //
    // Handshake helpers
    //

    pub fn parse_syn_options(&mut self, seg: &SegmentMeta) {
        if let Some(mss) = seg.opts.mss {
            self.tcb.snd_mss = mss.min(self.settings.mss);
        } else {
            self.tcb.snd_mss = super::DEFAULT_MSS;
        }
        if let Some(shift) = seg.opts.window_scale {
            if self.settings.wscale > 0 {
                self.tcb.snd_wind_shift = shift;
                self.tcb.rcv_wind_shift = self.settings.wscale;
            }
        }
        if let Some((ts_val, _)) = seg.opts.timestamp {
            if self.settings.timestamps {
                self.tcb.ts_ok = true;
                self.tcb.ts_recent = ts_val;
            }
        }
        self.sack_perm = seg.opts.sack_permitted;
    }

    pub fn setup_congestion_control(&mut self) {
        self.tcb.cwnd = 3 * u32::from(self.smss());
        self.tcb.ssthresh = self.tcb.snd_wnd;
    }

    //
    // Congestion control (New Reno)
    //

    fn reno_increase_cwnd(&mut self, acked: u32) {
        let add = if self.tcb.slow_start() {
            acked.min(u32::from(self.smss()))
        } else {
            // congestion avoidance: SMSS*SMSS/cwnd, at least one byte
            let smss = u32::from(self.smss());
            (smss * smss / self.tcb.cwnd.max(1)).max(1)
        };
        self.tcb.cwnd = (self.tcb.cwnd + add).min(CWND_MAX);
    }

    fn reno_deflate_cwnd(&mut self, acked: u32) {
        let smss = u32::from(self.smss());
        let sub = if acked >= smss { acked - smss } else { acked };
        self.tcb.cwnd = self.tcb.cwnd.saturating_sub(sub).max(smss);
    }

    fn reduce_ssthresh(&mut self) {
        let smss = u32::from(self.smss());
        self.tcb.ssthresh = (self.flight_size() / 2).max(2 * smss);
    }

    /// Strictly-greater-than-one comparison in two's complement, matching
    /// the deployed interpretation of RFC 6582's full-ACK test.
    fn reno_full_ack(&self, ack: u32) -> bool {
        ack.wrapping_sub(self.tcb.recover) as i32 > 1
    }

    fn finish_fast_recovery(&mut self) {
        self.reno_fpack_seen = false;
        self.fast_recovery = false;
        self.tcb.cwnd = self.tcb.ssthresh.max(u32::from(self.smss()));
        debug!(conn = %self, cwnd = self.tcb.cwnd, "tcp: exiting fast recovery");
    }

    fn fast_retransmit(&mut self) {
        debug!(conn = %self, "tcp: fast retransmit");
        self.retransmit();
        self.tcb.cwnd = self.tcb.ssthresh + 3 * u32::from(self.smss());
    }

    /// RFC 3042 limited transmit: one new segment on the first two
    /// duplicate ACKs even if cwnd forbids it.
    fn limited_tx_send(&mut self) {
        let n = self
            .writeq
            .nxt_data()
            .len()
            .min(self.smss() as usize);
        if n == 0 {
            return;
        }
        trace!(conn = %self, n, "tcp: limited transmit");
        let data = self.writeq.nxt_data()[..n].to_vec();
        self.send_segment(ACK, &data);
        if let Some(done) = self.writeq.advance(n) {
            self.pending_events.push(UserEvent::Write(done));
        }
        self.rtx_ensure();
    }

    pub fn is_win_update(&self, seg: &SegmentMeta, win: u32) -> bool {
        self.tcb.snd_wnd != win
            && (seq_lt(self.tcb.snd_wl1, seg.seq)
                || (self.tcb.snd_wl1 == seg.seq && seq_le(self.tcb.snd_wl2, seg.ack)))
    }

    /// RFC 5681 p.3 duplicate-ACK test.
    pub fn is_dup_ack(&self, seg: &SegmentMeta, win: u32) -> bool {
        seg.ack == self.tcb.snd_una
            && self.flight_size() > 0
            && !seg.has_data()
            && self.tcb.snd_wnd == win
            && !seg.isset(SYN)
            && !seg.isset(FIN)
    }

    fn on_dup_ack(&mut self, seg: &SegmentMeta) {
        self.dup_acks += 1;
        if !self.fast_recovery {
            match self.dup_acks {
                1 | 2 => {
                    if self.limited_tx {
                        self.limited_tx_send();
                    }
                }
                3 => {
                    // RFC 6582: avoid re-entering recovery for old data.
                    if seq_gt(seg.ack.wrapping_sub(1), self.tcb.recover)
                        || self.prev_highest_ack == self.tcb.snd_una
                    {
                        self.reduce_ssthresh();
                        self.tcb.recover = self.tcb.snd_nxt;
                        self.fast_recovery = true;
                        self.fast_retransmit();
                    }
                }
                _ => {}
            }
        } else {
            // recovery: inflate and keep the pipe full
            self.tcb.cwnd = (self.tcb.cwnd + u32::from(self.smss())).min(CWND_MAX);
            self.writeq_push();
        }
    }

    //
    // ACK processing: dup-ack, stale, ack-of-unsent, then new data
    //

    pub fn handle_ack(&mut self, seg: &SegmentMeta) -> bool {
        let win = u32::from(seg.window) << self.tcb.snd_wind_shift;

        if self.is_dup_ack(seg, win) {
            self.on_dup_ack(seg);
            return true;
        }

        if seq_lt(seg.ack, self.tcb.snd_una) {
            // stale ACK
            self.drop_seg(DropReason::AckOutOfOrder);
            return true;
        }
        if seq_gt(seg.ack, self.tcb.snd_nxt) {
            // acks data never sent
            self.send_ack();
            self.drop_seg(DropReason::AckOutOfOrder);
            return false;
        }

        if self.is_win_update(seg, win) {
            self.tcb.snd_wnd = win;
            self.tcb.snd_wl1 = seg.seq;
            self.tcb.snd_wl2 = seg.ack;
        }

        let acked = seg.ack.wrapping_sub(self.tcb.snd_una);
        if acked == 0 {
            return true;
        }

        self.prev_highest_ack = self.tcb.snd_una;
        self.highest_ack = seg.ack;
        self.take_rtt_measure(seg);
        self.tcb.snd_una = seg.ack;
        self.rtx_attempt = 0;
        self.dup_acks = 0;

        let data_acked = (acked as usize).min(self.writeq.bytes_unacknowledged());
        self.writeq.acknowledge(data_acked);
        self.prune_peer_sacked();

        if !self.fast_recovery {
            self.reno_fpack_seen = false;
            self.reno_increase_cwnd(acked);
        } else if self.reno_full_ack(seg.ack) {
            self.finish_fast_recovery();
        } else {
            // partial ACK: first lost segment recovered, next one missing
            self.retransmit();
            self.reno_deflate_cwnd(acked);
            if !self.reno_fpack_seen {
                self.rtx_reset();
                self.reno_fpack_seen = true;
            }
        }

        if !seg.opts.sack_blocks.is_empty() {
            self.record_peer_sack(seg.opts.sack_blocks.clone());
        }

        if self.flight_size() == 0 {
            self.rtx_stop();
        } else if !self.fast_recovery {
            self.rtx_reset();
        }

        // the ack may have opened the window for queued data
        self.writeq_push();
        true
    }

    fn take_rtt_measure(&mut self, seg: &SegmentMeta) {
        if self.tcb.ts_ok {
            if let Some((_, ecr)) = seg.opts.timestamp {
                if ecr != 0 {
                    let rtt = self.ts_value().wrapping_sub(ecr);
                    self.rttm.measure(Duration::from_millis(u64::from(rtt)));
                    return;
                }
            }
        }
        let now = self.now();
        self.rttm.stop(now);
    }

    fn record_peer_sack(&mut self, blocks: Vec<Block>) {
        for b in blocks {
            if !self.peer_sacked.contains(&b) && seq_gt(b.end, self.tcb.snd_una) {
                self.peer_sacked.push(b);
            }
        }
    }

    fn prune_peer_sacked(&mut self) {
        let una = self.tcb.snd_una;
        self.peer_sacked.retain(|b| seq_gt(b.end, una));
    }

    //
    // Receiving data
    //

    pub fn recv_data(&mut self, seg: &SegmentMeta, payload: &[u8]) {
        let mut seq = seg.seq;
        let mut data = payload;

        // trim any prefix we already have
        if seq_lt(seq, self.tcb.rcv_nxt) {
            let skip = (self.tcb.rcv_nxt.wrapping_sub(seq) as usize).min(data.len());
            seq = seq.wrapping_add(skip as u32);
            data = &data[skip..];
        }
        if data.is_empty() {
            self.ack_data(false);
            return;
        }

        if self.readq.is_none() {
            self.readq = Some(ReadRequest::new(self.tcb.rcv_nxt, self.readq_capacity));
        }

        if seq == self.tcb.rcv_nxt {
            let psh = seg.isset(PSH);
            let inserted = match self.readq.as_mut() {
                Some(rq) => rq.insert(seq, data, psh),
                None => 0,
            };
            self.tcb.rcv_nxt = self.tcb.rcv_nxt.wrapping_add(inserted as u32);
            if inserted > 0 && self.sack_perm && !self.sack_list.is_empty() {
                // jump over out-of-order data this insert made contiguous
                let res = self.sack_list.new_valid_ack(seq, inserted);
                self.tcb.rcv_nxt = self.tcb.rcv_nxt.wrapping_add(res.blocksize);
            }
            self.deliver_ready();
            self.ack_data(false);
        } else {
            // strictly beyond RCV.NXT
            self.recv_out_of_order(seq, data, seg.isset(PSH));
            self.ack_data(true);
        }
    }

    fn recv_out_of_order(&mut self, seq: u32, data: &[u8], psh: bool) {
        if !self.sack_perm {
            return;
        }
        if self.sack_list.contains(seq) {
            // duplicate of data already buffered; just re-ack
            return;
        }
        let inserted = match self.readq.as_mut() {
            Some(rq) if rq.fits(seq) > 0 => rq.insert(seq, data, psh),
            _ => 0,
        };
        if inserted > 0 {
            let res = self.sack_list.recv_out_of_order(seq, inserted);
            self.bytes_sacked += u64::from(res.blocksize.min(inserted as u32));
            trace!(conn = %self, seq, inserted, "tcp: buffered out-of-order");
        }
    }

    fn deliver_ready(&mut self) {
        let Some(rq) = self.readq.as_mut() else { return };
        if self.on_read.is_some() {
            for chunk in rq.drain_ready() {
                self.pending_events.push(UserEvent::Read(chunk));
            }
        } else if rq.has_ready() {
            self.pending_events.push(UserEvent::DataAvailable);
        }
    }

    /// Acknowledge received data: piggyback on outgoing data when
    /// possible, otherwise delayed-ACK (one pending at most), with an
    /// immediate ACK for out-of-order arrivals.
    fn ack_data(&mut self, out_of_order: bool) {
        if out_of_order {
            self.send_ack();
            return;
        }
        if self.can_send() {
            self.writeq_push();
            return;
        }
        if self.use_dack() {
            self.dack_count += 1;
            if self.dack_count >= 2 {
                self.send_ack();
                self.dack_count = 0;
            } else {
                self.start_dack();
            }
        } else {
            self.send_ack();
        }
    }

    fn use_dack(&self) -> bool {
        !self.settings.dack_timeout.is_zero()
    }

    //
    // FIN handling
    //

    pub fn update_fin(&mut self, seg: &SegmentMeta) {
        if seg.isset(FIN) && !self.fin_recv {
            self.fin_recv = true;
            self.fin_seq = seg.seq.wrapping_add(seg.payload_len as u32);
        }
    }

    pub fn should_handle_fin(&self) -> bool {
        self.fin_recv && self.fin_seq == self.tcb.rcv_nxt
    }

    /// The peer's FIN became contiguous: consume it and notify.
    pub fn handle_fin(&mut self) {
        self.tcb.rcv_nxt = self.tcb.rcv_nxt.wrapping_add(1);
        self.deliver_ready();
        self.pending_events.push(UserEvent::Disconnect(Disconnect::Closing));
    }

    //
    // Writing
    //

    /// Push as much of the write queue as the usable window allows.
    pub fn writeq_push(&mut self) {
        while self.can_send() {
            let rem = self.writeq.nxt_data().len();
            let n = rem
                .min(self.smss() as usize)
                .min(self.usable_window() as usize);
            if n == 0 {
                break;
            }
            let completes = n == rem && self.writeq.len() == self.writeq.current() + 1;
            let flags = if completes { ACK | PSH } else { ACK };
            let data = self.writeq.nxt_data()[..n].to_vec();

            if !self.rttm.active() {
                let now = self.now();
                self.rttm.start(now);
            }
            self.send_segment(flags, &data);
            if let Some(done) = self.writeq.advance(n) {
                self.pending_events.push(UserEvent::Write(done));
            }
            self.rtx_ensure();
        }
        self.maybe_send_fin();
    }

    /// A deferred close completes once the queue drains.
    fn maybe_send_fin(&mut self) {
        if !self.close_signaled || self.fin_sent {
            return;
        }
        if self.writeq.bytes_remaining() > 0 {
            return;
        }
        self.send_fin();
    }

    pub fn send_fin(&mut self) {
        self.fin_sent = true;
        self.send_segment(FIN | ACK, &[]);
        self.rtx_ensure();
        let next = match self.state {
            State::Established | State::SynReceived => State::FinWait1,
            State::CloseWait => State::LastAck,
            other => other,
        };
        self.set_state(next);
    }

    /// Sequence number just past our FIN, valid once sent.
    pub fn fin_acked(&self) -> bool {
        self.fin_sent && self.tcb.snd_una == self.tcb.snd_nxt
    }

    //
    // Retransmission
    //

    /// Retransmit one segment starting at SND.UNA, skipping ranges the
    /// peer has SACKed.
    pub fn retransmit(&mut self) {
        let mut start = self.tcb.snd_una;
        if self.sack_perm {
            while seq_lt(start, self.tcb.snd_nxt) {
                let covered = self
                    .peer_sacked
                    .iter()
                    .find(|b| b.contains(start) && b.end != start)
                    .copied();
                match covered {
                    Some(b) => start = b.end,
                    None => break,
                }
            }
        }
        let offset = start.wrapping_sub(self.tcb.snd_una) as usize;
        let data = self.unacked_data(offset, self.smss() as usize);
        if data.is_empty() {
            if self.fin_sent && !self.fin_acked() {
                self.send_retransmission(start, FIN | ACK, &[]);
            } else if self.state == State::SynSent {
                self.resend_syn();
            } else if self.state == State::SynReceived {
                self.send_retransmission(self.tcb.iss, SYN | ACK, &[]);
            }
            return;
        }
        debug!(conn = %self, seq = start, len = data.len(), "tcp: retransmit");
        // Karn: a retransmitted segment must not feed the RTT estimator.
        self.rttm.clear();
        self.send_retransmission(start, ACK, &data);
    }

    /// Copy up to `max` sent-but-unacked bytes starting `offset` past
    /// SND.UNA.
    fn unacked_data(&self, offset: usize, max: usize) -> Vec<u8> {
        let sent = {
            // bytes handed to segments, front-relative
            let mut n = 0usize;
            for i in 0..self.writeq.len() {
                if i < self.writeq.current() {
                    n += self.writeq_buf_len(i);
                } else if i == self.writeq.current() {
                    n += self.writeq.offset();
                }
            }
            n.saturating_sub(self.writeq.acked())
        };
        if offset >= sent {
            return Vec::new();
        }
        let want = max.min(sent - offset);
        let mut out = Vec::with_capacity(want);
        let mut skip = self.writeq.acked() + offset;
        for i in 0..self.writeq.len() {
            if out.len() == want {
                break;
            }
            let buf = self.writeq_buf(i);
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            let take = (buf.len() - skip).min(want - out.len());
            out.extend_from_slice(&buf[skip..skip + take]);
            skip = 0;
        }
        out
    }

    fn writeq_buf(&self, i: usize) -> &[u8] {
        self.writeq.buffer(i)
    }

    fn writeq_buf_len(&self, i: usize) -> usize {
        self.writeq.buffer(i).len()
    }

    pub fn resend_syn(&mut self) {
        self.syn_rtx += 1;
        self.send_retransmission(self.tcb.iss, SYN, &[]);
    }

    pub fn rto_limit_reached(&self) -> bool {
        self.rtx_attempt >= MAX_RTX_ATTEMPTS || self.syn_rtx >= MAX_SYN_RTX
    }

    pub fn rtx_start(&mut self) {
        let delay = self.rttm.rto();
        let weak = self.self_ref.clone();
        self.rtx_stop();
        self.rtx_timer = Some(self.timers.schedule(delay, move || {
            if let Some(conn) = weak.upgrade() {
                rtx_timeout_entry(&conn);
            }
        }));
    }

    pub fn rtx_reset(&mut self) {
        self.rtx_start();
    }

    fn rtx_ensure(&mut self) {
        if self.rtx_timer.is_none() {
            self.rtx_start();
        }
    }

    pub fn rtx_stop(&mut self) {
        if let Some(id) = self.rtx_timer.take() {
            self.timers.stop(id);
        }
    }

    fn rtx_timeout(&mut self) {
        if self.rto_limit_reached() {
            debug!(conn = %self, "tcp: retry limit reached");
            match self.state {
                State::SynSent | State::SynReceived => {
                    self.pending_events.push(UserEvent::ConnectFailed);
                }
                _ => {
                    self.pending_events
                        .push(UserEvent::Disconnect(Disconnect::Refused));
                }
            }
            self.signal_close();
            return;
        }

        self.rttm.backoff();
        self.rttm.clear();

        match self.state {
            State::SynSent => {
                self.resend_syn();
            }
            State::SynReceived => {
                self.syn_rtx += 1;
                self.send_retransmission(self.tcb.iss, SYN | ACK, &[]);
            }
            _ => {
                self.rtx_attempt += 1;
                // RFC 5681: timeout collapses the window and restarts
                // slow start; any recovery episode is over.
                self.reduce_ssthresh();
                self.tcb.cwnd = u32::from(self.smss());
                self.fast_recovery = false;
                self.reno_fpack_seen = false;
                self.dup_acks = 0;
                self.retransmit();
            }
        }
        self.rtx_start();
    }

    //
    // TIME-WAIT and delayed ACK share one timer; their states are
    // disjoint, so the role is decided when it fires.
    //

    pub fn timewait_start(&mut self) {
        let delay = 2 * self.settings.msl;
        self.arm_timewait_dack(delay);
    }

    pub fn timewait_restart(&mut self) {
        self.timewait_start();
    }

    fn start_dack(&mut self) {
        if self.timewait_dack_timer.is_none() {
            let delay = self.settings.dack_timeout;
            self.arm_timewait_dack(delay);
        }
    }

    pub fn stop_dack(&mut self) {
        self.dack_count = 0;
        if self.state != State::TimeWait {
            if let Some(id) = self.timewait_dack_timer.take() {
                self.timers.stop(id);
            }
        }
    }

    fn arm_timewait_dack(&mut self, delay: Duration) {
        if let Some(id) = self.timewait_dack_timer.take() {
            self.timers.stop(id);
        }
        let weak = self.self_ref.clone();
        self.timewait_dack_timer = Some(self.timers.schedule(delay, move || {
            if let Some(conn) = weak.upgrade() {
                timewait_dack_entry(&conn);
            }
        }));
    }

    //
    // State & lifecycle
    //

    pub fn set_state(&mut self, state: State) {
        if state != self.state {
            trace!(conn = %self, from = %self.state, to = %state, "tcp: state");
            self.prev_state = self.state;
            self.state = state;
        }
    }

    pub fn signal_connect(&mut self) {
        self.pending_events.push(UserEvent::Connected);
    }

    /// Terminal: detach timers and schedule the close notification.
    pub fn signal_close(&mut self) {
        if self.close_fired {
            return;
        }
        self.close_fired = true;
        self.set_state(State::Closed);
        self.rtx_stop();
        if let Some(id) = self.timewait_dack_timer.take() {
            self.timers.stop(id);
        }
        // flush unfinished writes with bytes-written-so-far
        for written in self.writeq.reset() {
            self.pending_events.push(UserEvent::Write(written));
        }
        self.pending_events.push(UserEvent::Close);
    }

    pub fn tuple(&self) -> (Socket, Socket) {
        (self.local, self.remote)
    }
}

impl fmt::Display for ConnInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.local, self.remote, self.state)
    }
}

//
// Entry points: borrow, mutate, release, then flush.
//

pub(crate) fn segment_arrived(conn: &ConnRef, seg: &SegmentMeta, payload: &[u8]) {
    {
        let mut inner = conn.borrow_mut();
        super::state::handle(&mut inner, seg, payload);
    }
    flush(conn);
}

fn rtx_timeout_entry(conn: &ConnRef) {
    {
        let mut inner = conn.borrow_mut();
        inner.rtx_timer = None;
        inner.rtx_timeout();
    }
    flush(conn);
}

fn timewait_dack_entry(conn: &ConnRef) {
    {
        let mut inner = conn.borrow_mut();
        inner.timewait_dack_timer = None;
        if inner.state == State::TimeWait {
            inner.signal_close();
        } else {
            // delayed ACK expired
            inner.dack_count = 0;
            inner.send_segment(ACK, &[]);
        }
    }
    flush(conn);
}

/// Dispatch accumulated segments and events. Loops until a dispatch round
/// generates no further work.
pub(crate) fn flush(conn: &ConnRef) {
    loop {
        let (out, events, net) = {
            let mut inner = conn.borrow_mut();
            if inner.pending_out.is_empty() && inner.pending_events.is_empty() {
                return;
            }
            (
                std::mem::take(&mut inner.pending_out),
                std::mem::take(&mut inner.pending_events),
                inner.network_out.clone(),
            )
        };
        if let Some(net) = net {
            for pkt in out {
                net(pkt);
            }
        }
        for event in events {
            dispatch_event(conn, event);
        }
    }
}

fn dispatch_event(conn: &ConnRef, event: UserEvent) {
    match event {
        UserEvent::Connected => {
            let (cb, listener, tuple) = {
                let inner = conn.borrow();
                (inner.on_connect.clone(), inner.listener.clone(), inner.tuple())
            };
            if let Some(host) = conn.borrow().host.upgrade() {
                Tcp::notify_established(&host, tuple.0, tuple.1);
            }
            let handle = Connection { inner: conn.clone() };
            match listener.and_then(|w| w.upgrade()) {
                Some(listener) => super::listener::connected(&listener, handle),
                None => {
                    if let Some(cb) = cb {
                        cb(Some(handle));
                    }
                }
            }
        }
        UserEvent::ConnectFailed => {
            let cb = conn.borrow().on_connect.clone();
            if let Some(cb) = cb {
                cb(None);
            }
        }
        UserEvent::Read(bytes) => {
            let cb = conn.borrow().on_read.clone();
            if let Some(cb) = cb {
                cb(bytes);
            }
        }
        UserEvent::DataAvailable => {
            let cb = conn.borrow().on_data.clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        UserEvent::Write(n) => {
            let cb = conn.borrow().on_write.clone();
            if let Some(cb) = cb {
                cb(n);
            }
        }
        UserEvent::Disconnect(reason) => {
            let cb = conn.borrow().on_disconnect.clone();
            let handle = Connection { inner: conn.clone() };
            match cb {
                Some(cb) => cb(handle, reason),
                // default: close our end as well
                None => handle.close(),
            }
        }
        UserEvent::Close => {
            let (on_close, host, listener, tuple) = {
                let inner = conn.borrow();
                (
                    inner.on_close.clone(),
                    inner.host.upgrade(),
                    inner.listener.clone().and_then(|w| w.upgrade()),
                    inner.tuple(),
                )
            };
            if let Some(cb) = on_close {
                cb();
            }
            if let Some(listener) = listener {
                super::listener::remove(&listener, conn);
            }
            if let Some(host) = host {
                Tcp::close_connection(&host, tuple);
            }
            // no user callback may fire after close
            let mut inner = conn.borrow_mut();
            inner.on_connect = None;
            inner.on_read = None;
            inner.on_data = None;
            inner.on_disconnect = None;
            inner.on_close = None;
            inner.on_write = None;
        }
    }
}

/// A cheap-clonable handle to a connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: ConnRef,
}

impl Connection {
    pub fn local(&self) -> Socket {
        self.inner.borrow().local
    }

    pub fn remote(&self) -> Socket {
        self.inner.borrow().remote
    }

    pub fn state_name(&self) -> &'static str {
        self.inner.borrow().state.as_str()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().state.is_connected()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.borrow().state.is_writable()
    }

    pub fn is_readable(&self) -> bool {
        self.inner.borrow().state.is_readable()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.borrow().state.is_closing()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().state.is_closed()
    }

    /// Bytes waiting in the receive queue.
    pub fn readq_size(&self) -> usize {
        self.inner.borrow().readq.as_ref().map(|r| r.size()).unwrap_or(0)
    }

    /// Bytes waiting in the send queue.
    pub fn sendq_size(&self) -> usize {
        self.inner.borrow().writeq.bytes_total()
    }

    pub fn sendq_remaining(&self) -> usize {
        self.inner.borrow().writeq.bytes_remaining()
    }

    pub fn bytes_sacked(&self) -> u64 {
        self.inner.borrow().bytes_sacked
    }

    /// Async write. Data is segmented and sent as the window allows; the
    /// `on_write` callback fires once the whole request has been
    /// transmitted. Writing to a closed connection reports zero bytes.
    pub fn write(&self, data: impl Into<Bytes>) {
        let data: Bytes = data.into();
        if data.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Established | State::CloseWait => {
                    inner.writeq.push_back(data);
                    inner.writeq_push();
                }
                State::SynSent | State::SynReceived => {
                    // queued until the handshake completes
                    inner.writeq.push_back(data);
                }
                _ => {
                    inner.pending_events.push(UserEvent::Write(0));
                }
            }
        }
        flush(&self.inner);
    }

    /// Register the read callback with a receive-buffer capacity.
    /// Completed chunks are delivered as they become contiguous.
    pub fn on_read(&self, capacity: usize, cb: impl Fn(Bytes) + 'static) -> &Self {
        {
            let mut inner = self.inner.borrow_mut();
            inner.readq_capacity = capacity;
            inner.on_read = Some(Rc::new(cb));
            let nxt = inner.tcb.rcv_nxt;
            let empty = inner.readq.as_ref().map(|rq| rq.size() == 0).unwrap_or(true);
            if empty {
                inner.readq = Some(ReadRequest::new(nxt, capacity));
            }
        }
        self
    }

    /// Register the data-available callback (pull model; fetch with
    /// [`read_next`](Connection::read_next)). Unread data stays buffered.
    pub fn on_data(&self, cb: impl Fn() + 'static) -> &Self {
        self.inner.borrow_mut().on_data = Some(Rc::new(cb));
        self
    }

    /// Next fully received chunk, if any.
    pub fn read_next(&self) -> Option<Bytes> {
        self.inner.borrow_mut().readq.as_mut()?.read_next()
    }

    /// Size of the next fully received chunk.
    pub fn next_size(&self) -> usize {
        self.inner.borrow().readq.as_ref().map(|r| r.next_size()).unwrap_or(0)
    }

    pub fn on_disconnect(&self, cb: impl Fn(Connection, Disconnect) + 'static) -> &Self {
        self.inner.borrow_mut().on_disconnect = Some(Rc::new(cb));
        self
    }

    pub fn on_close(&self, cb: impl Fn() + 'static) -> &Self {
        self.inner.borrow_mut().on_close = Some(Rc::new(cb));
        self
    }

    pub fn on_write(&self, cb: impl Fn(usize) + 'static) -> &Self {
        self.inner.borrow_mut().on_write = Some(Rc::new(cb));
        self
    }

    /// Orderly close: FIN once the send queue drains.
    pub fn close(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::SynSent | State::Listen => {
                    inner.signal_close();
                }
                State::SynReceived | State::Established | State::CloseWait => {
                    inner.close_signaled = true;
                    if inner.writeq.bytes_remaining() == 0 && !inner.fin_sent {
                        inner.send_fin();
                    }
                }
                _ => {}
            }
        }
        flush(&self.inner);
    }

    /// Abort: RST out, everything torn down immediately.
    pub fn abort(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_closed() && inner.state != State::Listen {
                inner.send_reset();
            }
            inner.signal_close();
        }
        flush(&self.inner);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.borrow())
    }
}
