//! The RFC 793 connection state machine: the eleven canonical states and
//! the SEGMENT ARRIVES procedure (p.65–76), with the refinements deployed
//! TCP picked up since (RST in SYN-SENT fails the connect, New Reno ack
//! processing, delayed ACK strategy).
//!
//! States are a fieldless enum; dispatch is a `match`, not a vtable.

use std::fmt;

use tracing::debug;

use crate::util::{seq_gt, seq_le};

use super::connection::{ConnInner, Disconnect, DropReason, UserEvent};
use super::segment::{ACK, FIN, RST, SYN, SegmentMeta};

/// The eleven states of RFC 793.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN-SENT",
            Self::SynReceived => "SYN-RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN-WAIT-1",
            Self::FinWait2 => "FIN-WAIT-2",
            Self::CloseWait => "CLOSE-WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST-ACK",
            Self::TimeWait => "TIME-WAIT",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Established)
    }

    /// `send` is legal here.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// Data can still arrive here.
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            Self::FinWait1
                | Self::FinWait2
                | Self::CloseWait
                | Self::Closing
                | Self::LastAck
                | Self::TimeWait
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of SEGMENT ARRIVES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Ok,
    Closed,
}

/// SEGMENT ARRIVES.
pub(crate) fn handle(inner: &mut ConnInner, seg: &SegmentMeta, payload: &[u8]) -> HandleResult {
    match inner.state {
        State::Closed => {
            if !seg.isset(RST) {
                inner.send_reset_for(seg);
            }
            HandleResult::Closed
        }
        State::Listen => handle_listen(inner, seg),
        State::SynSent => handle_syn_sent(inner, seg, payload),
        _ => handle_synchronized(inner, seg, payload),
    }
}

/// RFC 793 p.65: LISTEN.
fn handle_listen(inner: &mut ConnInner, seg: &SegmentMeta) -> HandleResult {
    if seg.isset(RST) {
        return HandleResult::Ok;
    }
    if seg.isset(ACK) {
        inner.send_reset_for(seg);
        return HandleResult::Ok;
    }
    if seg.isset(SYN) {
        inner.tcb.irs = seg.seq;
        inner.tcb.rcv_nxt = seg.seq.wrapping_add(1);
        inner.parse_syn_options(seg);
        // the window field of a SYN is never scaled
        inner.tcb.snd_wnd = u32::from(seg.window);
        inner.tcb.snd_wl1 = seg.seq;
        inner.tcb.snd_wl2 = seg.ack;
        debug!(conn = %inner, "tcp: passive open");
        inner.set_state(State::SynReceived);
        inner.send_synack();
    }
    HandleResult::Ok
}

/// RFC 793 p.66: SYN-SENT.
fn handle_syn_sent(inner: &mut ConnInner, seg: &SegmentMeta, payload: &[u8]) -> HandleResult {
    let acceptable_ack = if seg.isset(ACK) {
        if seq_le(seg.ack, inner.tcb.iss) || seq_gt(seg.ack, inner.tcb.snd_nxt) {
            if !seg.isset(RST) {
                inner.send_reset_for(seg);
            }
            inner.drop_seg(DropReason::AckOutOfOrder);
            return HandleResult::Ok;
        }
        true
    } else {
        false
    };

    if seg.isset(RST) {
        if acceptable_ack {
            // refinement: fail the pending connect with REFUSED
            debug!(conn = %inner, "tcp: connection refused");
            inner.pending_events.push(UserEvent::ConnectFailed);
            inner.signal_close();
            return HandleResult::Closed;
        }
        return HandleResult::Ok;
    }

    if seg.isset(SYN) {
        inner.tcb.irs = seg.seq;
        inner.tcb.rcv_nxt = seg.seq.wrapping_add(1);
        inner.parse_syn_options(seg);
        if acceptable_ack {
            inner.tcb.snd_una = seg.ack;
        }

        if seq_gt(inner.tcb.snd_una, inner.tcb.iss) {
            // our SYN is acknowledged: connection established
            inner.tcb.snd_wnd = u32::from(seg.window);
            inner.tcb.snd_wl1 = seg.seq;
            inner.tcb.snd_wl2 = seg.ack;
            inner.rtx_stop();
            inner.setup_congestion_control();
            inner.set_state(State::Established);
            inner.send_ack();
            inner.signal_connect();
            inner.writeq_push();
            if !payload.is_empty() {
                inner.recv_data(seg, payload);
            }
        } else {
            // simultaneous open
            inner.set_state(State::SynReceived);
            inner.send_synack();
        }
    }
    HandleResult::Ok
}

/// RFC 793 p.69: every synchronized state plus SYN-RECEIVED/TIME-WAIT.
fn handle_synchronized(inner: &mut ConnInner, seg: &SegmentMeta, payload: &[u8]) -> HandleResult {
    // first: sequence acceptability
    if !inner.check_seq(seg) {
        return HandleResult::Ok;
    }

    // second: RST
    if seg.isset(RST) {
        match inner.state {
            State::TimeWait | State::Closing | State::LastAck => {}
            _ => {
                inner
                    .pending_events
                    .push(UserEvent::Disconnect(Disconnect::Reset));
            }
        }
        inner.drop_seg(DropReason::Rst);
        inner.signal_close();
        return HandleResult::Closed;
    }

    // RFC 7323 4.3: remember the peer's timestamp for echoing
    if inner.tcb.ts_ok {
        if let Some((ts_val, _)) = seg.opts.timestamp {
            if seq_le(seg.seq, inner.tcb.rcv_nxt) {
                inner.tcb.ts_recent = ts_val;
            }
        }
    }

    // third: SYN in the window is a protocol violation
    if seg.isset(SYN) {
        inner.send_reset();
        inner
            .pending_events
            .push(UserEvent::Disconnect(Disconnect::Reset));
        inner.signal_close();
        return HandleResult::Closed;
    }

    // fourth: segments without ACK are dropped
    if !seg.isset(ACK) {
        inner.drop_seg(DropReason::AckNotSet);
        return HandleResult::Ok;
    }

    // fifth: ACK processing (congestion control included)
    if !inner.handle_ack(seg) {
        return HandleResult::Ok;
    }

    match inner.state {
        State::SynReceived => {
            if seq_gt(inner.tcb.snd_una, inner.tcb.iss) {
                // handshake complete; let the listener veto
                let accepted = match inner.listener.as_ref().and_then(|w| w.upgrade()) {
                    Some(listener) => super::listener::check_accept(&listener, inner.remote),
                    None => true,
                };
                if !accepted {
                    debug!(conn = %inner, "tcp: accept filter refused");
                    inner.send_reset();
                    inner.signal_close();
                    return HandleResult::Closed;
                }
                inner.rtx_stop();
                inner.setup_congestion_control();
                inner.set_state(State::Established);
                inner.signal_connect();
                inner.writeq_push();
            } else {
                inner.drop_seg(DropReason::AckOutOfOrder);
                return HandleResult::Ok;
            }
        }
        State::FinWait1 => {
            if inner.fin_acked() {
                inner.set_state(State::FinWait2);
            }
        }
        State::Closing => {
            if inner.fin_acked() {
                inner.set_state(State::TimeWait);
                inner.timewait_start();
            }
            return HandleResult::Ok;
        }
        State::LastAck => {
            if inner.fin_acked() {
                inner.signal_close();
                return HandleResult::Closed;
            }
            return HandleResult::Ok;
        }
        State::TimeWait => {
            // a retransmitted FIN restarts the 2*MSL clock
            if seg.isset(FIN) {
                inner.send_ack();
                inner.timewait_restart();
            }
            return HandleResult::Ok;
        }
        _ => {}
    }

    // sixth: payload, while the receive side is open
    if !payload.is_empty() && inner.state.is_readable() {
        inner.recv_data(seg, payload);
    }

    // seventh: FIN
    inner.update_fin(seg);
    if inner.should_handle_fin() {
        inner.handle_fin();
        inner.send_ack();
        match inner.state {
            State::Established => inner.set_state(State::CloseWait),
            State::FinWait1 => {
                if inner.fin_acked() {
                    inner.set_state(State::TimeWait);
                    inner.timewait_start();
                } else {
                    inner.set_state(State::Closing);
                }
            }
            State::FinWait2 => {
                inner.set_state(State::TimeWait);
                inner.timewait_start();
            }
            _ => {}
        }
    }
    HandleResult::Ok
}
