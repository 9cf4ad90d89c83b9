//! Multicast Listener Discovery, host side: MLDv1 (RFC 2710) listener
//! states per group, plus the MLDv2 (RFC 3810) INCLUDE/EXCLUDE filter
//! modes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::buffer::{BufferStore, Packet};
use crate::ethernet;
use crate::timer::{TimerId, Timers};

use super::icmp6::{self, TYPE_MLD_DONE, TYPE_MLD_QUERY, TYPE_MLD_REPORT};
use super::{HEADER_LEN as IP6_HEADER_LEN, SharedIp6Config};

/// RFC 2710 §7.10: Unsolicited Report Interval.
pub const UNSOLICITED_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// The all-MLDv1-routers group, destination of Done messages.
pub const ALL_MLD_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// MLDv1 host states per listened-to group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    NonListener,
    DelayingListener,
    IdleListener,
}

/// MLDv2 filter modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Include,
    Exclude,
}

struct Group {
    state: ListenerState,
    /// We sent the most recent report, so leaving requires a Done.
    last_reporter: bool,
    report_timer: Option<TimerId>,
    filter_mode: FilterMode,
    sources: Vec<Ipv6Addr>,
}

/// Delegate that frames and sends an MLD message `(packet, src, dst)`.
pub type LinkOut = Rc<dyn Fn(Packet, Ipv6Addr, Ipv6Addr)>;

pub struct Mld {
    config: SharedIp6Config,
    store: BufferStore,
    timers: Timers,
    self_ref: Weak<RefCell<Mld>>,
    link_out: Option<LinkOut>,
    groups: HashMap<Ipv6Addr, Group>,
}

impl Mld {
    pub fn new(config: SharedIp6Config, store: BufferStore, timers: Timers) -> Rc<RefCell<Mld>> {
        let mld = Rc::new(RefCell::new(Mld {
            config,
            store,
            timers,
            self_ref: Weak::new(),
            link_out: None,
            groups: HashMap::new(),
        }));
        mld.borrow_mut().self_ref = Rc::downgrade(&mld);
        mld
    }

    pub fn set_link_out(&mut self, out: LinkOut) {
        self.link_out = Some(out);
    }

    pub fn state_of(&self, group: Ipv6Addr) -> ListenerState {
        self.groups
            .get(&group)
            .map(|g| g.state)
            .unwrap_or(ListenerState::NonListener)
    }

    pub fn filter_mode(&self, group: Ipv6Addr) -> Option<FilterMode> {
        self.groups.get(&group).map(|g| g.filter_mode)
    }

    /// MLDv2: change a group's source filter.
    pub fn set_filter(&mut self, group: Ipv6Addr, mode: FilterMode, sources: Vec<Ipv6Addr>) {
        if let Some(g) = self.groups.get_mut(&group) {
            g.filter_mode = mode;
            g.sources = sources;
        }
    }

    /// Start listening: send an unsolicited report and schedule the
    /// retransmission RFC 2710 asks for, entering DELAYING.
    pub fn join(&mut self, group: Ipv6Addr) -> Vec<(Packet, Ipv6Addr, Ipv6Addr)> {
        let mut out = Vec::new();
        if self
            .groups
            .get(&group)
            .is_some_and(|g| g.state != ListenerState::NonListener)
        {
            return out;
        }
        debug!(%group, "mld: join");
        if let Some((report, src)) = self.build_message(TYPE_MLD_REPORT, group) {
            out.push((report, src, group));
        }
        let timer = self.schedule_report(group, UNSOLICITED_REPORT_INTERVAL);
        self.groups.insert(
            group,
            Group {
                state: ListenerState::DelayingListener,
                last_reporter: true,
                report_timer: Some(timer),
                filter_mode: FilterMode::Exclude,
                sources: Vec::new(),
            },
        );
        out
    }

    /// Stop listening. A Done goes out only if we were the last host to
    /// report the group.
    pub fn leave(&mut self, group: Ipv6Addr) -> Vec<(Packet, Ipv6Addr, Ipv6Addr)> {
        let mut out = Vec::new();
        let Some(g) = self.groups.remove(&group) else {
            return out;
        };
        if let Some(timer) = g.report_timer {
            self.timers.stop(timer);
        }
        if g.last_reporter {
            debug!(%group, "mld: leaving, sending done");
            if let Some((done, src)) = self.build_message(TYPE_MLD_DONE, group) {
                out.push((done, src, ALL_MLD_ROUTERS));
            }
        }
        out
    }

    /// Handle an incoming MLD message (cursor at the ICMPv6 header).
    pub fn receive(&mut self, pkt: &Packet, _src: Ipv6Addr) -> Vec<(Packet, Ipv6Addr, Ipv6Addr)> {
        let out = Vec::new();
        let msg = pkt.data();
        if msg.len() < 24 {
            return out;
        }
        let max_delay = Duration::from_millis(u64::from(u16::from_be_bytes([msg[4], msg[5]])));
        let Ok(octets) = <[u8; 16]>::try_from(&msg[8..24]) else {
            return out;
        };
        let group = Ipv6Addr::from(octets);

        match msg[0] {
            TYPE_MLD_QUERY => {
                let general = group == Ipv6Addr::UNSPECIFIED;
                let targets: Vec<Ipv6Addr> = self
                    .groups
                    .iter()
                    .filter(|(g, st)| {
                        (general || **g == group) && st.state != ListenerState::NonListener
                    })
                    .map(|(g, _)| *g)
                    .collect();
                for target in targets {
                    self.delay_report(target, max_delay);
                }
            }
            TYPE_MLD_REPORT => {
                // another listener reported; our report is unnecessary
                if let Some(g) = self.groups.get_mut(&group) {
                    if g.state == ListenerState::DelayingListener {
                        trace!(%group, "mld: report heard, suppressing ours");
                        if let Some(timer) = g.report_timer.take() {
                            self.timers.stop(timer);
                        }
                        g.state = ListenerState::IdleListener;
                        g.last_reporter = false;
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// (Re)enter DELAYING with a response delay bounded by the query.
    fn delay_report(&mut self, group: Ipv6Addr, max_delay: Duration) {
        // deterministic midpoint of [0, max); no entropy source in-core
        let delay = max_delay / 2;
        let should_restart = {
            let Some(g) = self.groups.get(&group) else { return };
            g.state != ListenerState::DelayingListener || g.report_timer.is_none()
        };
        if should_restart {
            let timer = self.schedule_report(group, delay);
            if let Some(g) = self.groups.get_mut(&group) {
                if let Some(old) = g.report_timer.replace(timer) {
                    self.timers.stop(old);
                }
                g.state = ListenerState::DelayingListener;
            }
        }
    }

    fn schedule_report(&self, group: Ipv6Addr, delay: Duration) -> TimerId {
        let weak = self.self_ref.clone();
        self.timers.schedule(delay, move || {
            let Some(mld) = weak.upgrade() else { return };
            let (report, link_out) = {
                let mut m = mld.borrow_mut();
                let due = match m.groups.get_mut(&group) {
                    Some(g) if g.state == ListenerState::DelayingListener => {
                        g.state = ListenerState::IdleListener;
                        g.last_reporter = true;
                        g.report_timer = None;
                        true
                    }
                    _ => false,
                };
                let report = if due {
                    m.build_message(TYPE_MLD_REPORT, group)
                } else {
                    None
                };
                (report, m.link_out.clone())
            };
            if let (Some((report, src)), Some(out)) = (report, link_out) {
                out(report, src, group);
            }
        })
    }

    fn build_message(&mut self, mld_type: u8, group: Ipv6Addr) -> Option<(Packet, Ipv6Addr)> {
        let mut pkt = self.store.alloc(ethernet::HEADER_LEN + IP6_HEADER_LEN)?;
        pkt.append(&[mld_type, 0, 0, 0]);
        pkt.append(&[0; 4]); // max response delay + reserved
        pkt.append(&group.octets());
        let src = self
            .config
            .borrow()
            .linklocal
            .unwrap_or(Ipv6Addr::UNSPECIFIED);
        let dst = if mld_type == TYPE_MLD_DONE {
            ALL_MLD_ROUTERS
        } else {
            group
        };
        icmp6::finalize_checksum(&mut pkt, src, dst);
        Some((pkt, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    fn fixture() -> (Rc<RefCell<Mld>>, ManualClock, Timers) {
        let clock = ManualClock::new();
        let timers = Timers::new(Rc::new(clock.clone()));
        let config = Rc::new(RefCell::new(super::super::Ip6Config {
            linklocal: Some("fe80::1".parse().unwrap()),
            ..Default::default()
        }));
        let store = BufferStore::new(16, 2048);
        let mld = Mld::new(config, store, timers.clone());
        (mld, clock, timers)
    }

    fn group() -> Ipv6Addr {
        "ff02::1:3".parse().unwrap()
    }

    fn query(store: &BufferStore, group: Ipv6Addr, max_delay_ms: u16) -> Packet {
        let mut pkt = store.alloc(0).unwrap();
        pkt.append(&[TYPE_MLD_QUERY, 0, 0, 0]);
        pkt.append(&max_delay_ms.to_be_bytes());
        pkt.append(&[0, 0]);
        pkt.append(&group.octets());
        pkt
    }

    #[test]
    fn test_join_reports_and_goes_idle() {
        let (mld, clock, timers) = fixture();
        let out = mld.borrow_mut().join(group());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.data()[0], TYPE_MLD_REPORT);
        assert_eq!(mld.borrow().state_of(group()), ListenerState::DelayingListener);

        // the unsolicited retransmission fires, then we settle in IDLE
        let sent = Rc::new(RefCell::new(0));
        {
            let sent = sent.clone();
            mld.borrow_mut()
                .set_link_out(Rc::new(move |_p, _s, _d| *sent.borrow_mut() += 1));
        }
        clock.advance(UNSOLICITED_REPORT_INTERVAL + Duration::from_secs(1));
        timers.process();
        assert_eq!(*sent.borrow(), 1);
        assert_eq!(mld.borrow().state_of(group()), ListenerState::IdleListener);
    }

    #[test]
    fn test_query_delays_then_reports() {
        let (mld, clock, timers) = fixture();
        mld.borrow_mut().join(group());
        clock.advance(Duration::from_secs(11));
        timers.process();
        assert_eq!(mld.borrow().state_of(group()), ListenerState::IdleListener);

        let store = BufferStore::new(4, 2048);
        let q = query(&store, Ipv6Addr::UNSPECIFIED, 10_000);
        mld.borrow_mut().receive(&q, "fe80::9".parse().unwrap());
        assert_eq!(mld.borrow().state_of(group()), ListenerState::DelayingListener);

        let sent = Rc::new(RefCell::new(0));
        {
            let sent = sent.clone();
            mld.borrow_mut()
                .set_link_out(Rc::new(move |_p, _s, _d| *sent.borrow_mut() += 1));
        }
        clock.advance(Duration::from_secs(6));
        timers.process();
        assert_eq!(*sent.borrow(), 1);
        assert_eq!(mld.borrow().state_of(group()), ListenerState::IdleListener);
    }

    #[test]
    fn test_foreign_report_suppresses_ours() {
        let (mld, _clock, _timers) = fixture();
        mld.borrow_mut().join(group());

        let store = BufferStore::new(4, 2048);
        let mut report = store.alloc(0).unwrap();
        report.append(&[TYPE_MLD_REPORT, 0, 0, 0, 0, 0, 0, 0]);
        report.append(&group().octets());
        mld.borrow_mut().receive(&report, "fe80::9".parse().unwrap());

        assert_eq!(mld.borrow().state_of(group()), ListenerState::IdleListener);
        // we are no longer the last reporter, so leaving is silent
        let out = mld.borrow_mut().leave(group());
        assert!(out.is_empty());
    }

    #[test]
    fn test_leave_as_last_reporter_sends_done() {
        let (mld, _clock, _timers) = fixture();
        mld.borrow_mut().join(group());
        let out = mld.borrow_mut().leave(group());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.data()[0], TYPE_MLD_DONE);
        assert_eq!(out[0].2, ALL_MLD_ROUTERS);
        assert_eq!(mld.borrow().state_of(group()), ListenerState::NonListener);
    }

    #[test]
    fn test_filter_modes() {
        let (mld, _clock, _timers) = fixture();
        mld.borrow_mut().join(group());
        assert_eq!(mld.borrow().filter_mode(group()), Some(FilterMode::Exclude));
        let source: Ipv6Addr = "2001:db8::5".parse().unwrap();
        mld.borrow_mut()
            .set_filter(group(), FilterMode::Include, vec![source]);
        assert_eq!(mld.borrow().filter_mode(group()), Some(FilterMode::Include));
    }
}
