//! Stateless address autoconfiguration (RFC 4862): link-local address
//! from the interface identifier, duplicate address detection, router
//! solicitation, and global addresses from advertised prefixes.

use std::cell::RefCell;
use std::net::Ipv6Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::addr::MacAddr;
use crate::buffer::Packet;
use crate::timer::Timers;

use super::ndp::{Ndp, PrefixInfo};
use super::{SharedIp6Config, addr_from_prefix, eui64};

/// RFC 4862: RetransTimer between/after DAD probes.
pub const DAD_RETRANS_TIMER: Duration = Duration::from_secs(1);

/// RFC 4862: number of DAD probes.
pub const DAD_TRANSMITS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaacState {
    Idle,
    /// Probing the link-local address.
    TentativeLinklocal,
    /// Link-local assigned, waiting for a router advertisement.
    AwaitingRouter,
    /// Probing a global address formed from an advertised prefix.
    TentativeGlobal,
    Configured,
}

/// Sends an NDP message `(packet at its ICMPv6 header, src, dst)`.
pub type LinkOut = Rc<dyn Fn(Packet, Ipv6Addr, Ipv6Addr)>;

/// Fired once a global address is assigned.
pub type CompleteFn = Rc<dyn Fn(Ipv6Addr)>;

pub struct Slaac {
    mac: MacAddr,
    config: SharedIp6Config,
    ndp: Rc<RefCell<Ndp>>,
    timers: Timers,
    self_ref: Weak<RefCell<Slaac>>,
    link_out: Option<LinkOut>,
    on_complete: Option<CompleteFn>,
    state: SlaacState,
    tentative: Option<Ipv6Addr>,
    pending_router: Option<Ipv6Addr>,
}

impl Slaac {
    pub fn new(
        mac: MacAddr,
        config: SharedIp6Config,
        ndp: Rc<RefCell<Ndp>>,
        timers: Timers,
    ) -> Rc<RefCell<Slaac>> {
        let slaac = Rc::new(RefCell::new(Slaac {
            mac,
            config,
            ndp,
            timers,
            self_ref: Weak::new(),
            link_out: None,
            on_complete: None,
            state: SlaacState::Idle,
            tentative: None,
            pending_router: None,
        }));
        slaac.borrow_mut().self_ref = Rc::downgrade(&slaac);
        slaac
    }

    pub fn set_link_out(&mut self, out: LinkOut) {
        self.link_out = Some(out);
    }

    pub fn on_complete(&mut self, cb: CompleteFn) {
        self.on_complete = Some(cb);
    }

    pub fn state(&self) -> SlaacState {
        self.state
    }

    pub fn linklocal_addr(&self) -> Ipv6Addr {
        addr_from_prefix(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), eui64(self.mac))
    }

    /// Begin autoconfiguration: DAD on the EUI-64 link-local address.
    pub fn start(&mut self) {
        if self.state != SlaacState::Idle {
            return;
        }
        let target = self.linklocal_addr();
        debug!(%target, "slaac: probing link-local");
        self.state = SlaacState::TentativeLinklocal;
        self.tentative = Some(target);
        self.probe(target);
    }

    fn probe(&mut self, target: Ipv6Addr) {
        let built = self.ndp.borrow_mut().build_neighbor_solicitation(target, true);
        if let (Some((pkt, src, dst)), Some(out)) = (built, self.link_out.clone()) {
            out(pkt, src, dst);
        }
        let weak = self.self_ref.clone();
        self.timers.schedule(DAD_RETRANS_TIMER * DAD_TRANSMITS, move || {
            if let Some(slaac) = weak.upgrade() {
                dad_elapsed(&slaac, target);
            }
        });
    }

    /// NDP saw a neighbor advertisement: a defending node owns our
    /// tentative address.
    pub fn neighbor_update(&mut self, target: Ipv6Addr) {
        if self.tentative == Some(target) {
            warn!(%target, "slaac: duplicate address detected");
            self.tentative = None;
            self.state = SlaacState::Idle;
        }
    }

    /// NDP parsed router-advertisement prefixes.
    pub fn prefixes(&mut self, prefixes: &[PrefixInfo]) {
        if self.state != SlaacState::AwaitingRouter {
            return;
        }
        for info in prefixes {
            if !info.autonomous || info.prefix_len != 64 || info.valid_lifetime == 0 {
                continue;
            }
            let target = addr_from_prefix(info.prefix, eui64(self.mac));
            debug!(%target, "slaac: probing global address");
            self.state = SlaacState::TentativeGlobal;
            self.tentative = Some(target);
            self.pending_router = Some(info.router);
            self.probe(target);
            break;
        }
    }
}

/// The DAD window elapsed without a defender: assign the address.
fn dad_elapsed(slaac: &Rc<RefCell<Slaac>>, target: Ipv6Addr) {
    enum Next {
        SolicitRouters,
        Complete(Ipv6Addr),
        Nothing,
    }
    let next = {
        let mut s = slaac.borrow_mut();
        if s.tentative != Some(target) {
            Next::Nothing
        } else {
            s.tentative = None;
            match s.state {
                SlaacState::TentativeLinklocal => {
                    debug!(%target, "slaac: link-local assigned");
                    s.config.borrow_mut().linklocal = Some(target);
                    s.state = SlaacState::AwaitingRouter;
                    Next::SolicitRouters
                }
                SlaacState::TentativeGlobal => {
                    debug!(%target, "slaac: global address assigned");
                    {
                        let gateway = s.pending_router.take();
                        let mut cfg = s.config.borrow_mut();
                        cfg.global = Some(target);
                        cfg.gateway = gateway;
                    }
                    s.state = SlaacState::Configured;
                    Next::Complete(target)
                }
                _ => Next::Nothing,
            }
        }
    };
    match next {
        Next::SolicitRouters => {
            let (built, out) = {
                let s = slaac.borrow();
                (s.ndp.borrow_mut().build_router_solicitation(), s.link_out.clone())
            };
            if let (Some((pkt, src, dst)), Some(out)) = (built, out) {
                out(pkt, src, dst);
            }
        }
        Next::Complete(addr) => {
            let cb = slaac.borrow().on_complete.clone();
            if let Some(cb) = cb {
                cb(addr);
            }
        }
        Next::Nothing => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStore;
    use crate::ip6::Ip6Config;
    use crate::timer::ManualClock;

    const MAC: MacAddr = MacAddr::new(0x00, 0x50, 0x56, 0x01, 0x23, 0x45);

    struct Fixture {
        slaac: Rc<RefCell<Slaac>>,
        config: SharedIp6Config,
        sent: Rc<RefCell<Vec<(u8, Ipv6Addr)>>>,
        clock: ManualClock,
        timers: Timers,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new();
        let timers = Timers::new(Rc::new(clock.clone()));
        let config: SharedIp6Config = Rc::new(RefCell::new(Ip6Config::default()));
        let store = BufferStore::new(32, 2048);
        let ndp = Rc::new(RefCell::new(Ndp::new(MAC, config.clone(), store)));
        let slaac = Slaac::new(MAC, config.clone(), ndp, timers.clone());
        let sent = Rc::new(RefCell::new(Vec::new()));
        {
            let sent = sent.clone();
            slaac
                .borrow_mut()
                .set_link_out(Rc::new(move |pkt: Packet, _src, dst| {
                    sent.borrow_mut().push((pkt.data()[0], dst));
                }));
        }
        Fixture {
            slaac,
            config,
            sent,
            clock,
            timers,
        }
    }

    #[test]
    fn test_full_autoconfiguration() {
        let fix = fixture();
        let done = Rc::new(RefCell::new(None));
        {
            let done = done.clone();
            fix.slaac
                .borrow_mut()
                .on_complete(Rc::new(move |addr| *done.borrow_mut() = Some(addr)));
        }

        fix.slaac.borrow_mut().start();
        assert_eq!(fix.slaac.borrow().state(), SlaacState::TentativeLinklocal);
        // a DAD neighbor solicitation went out
        assert_eq!(fix.sent.borrow()[0].0, 135);

        // no defender: link-local assigned, router solicitation sent
        fix.clock.advance(Duration::from_secs(2));
        fix.timers.process();
        assert_eq!(fix.slaac.borrow().state(), SlaacState::AwaitingRouter);
        assert_eq!(
            fix.config.borrow().linklocal,
            Some("fe80::250:56ff:fe01:2345".parse().unwrap())
        );
        assert_eq!(fix.sent.borrow()[1].0, 133);

        // a router advertises 2001:db8::/64
        let router: Ipv6Addr = "fe80::ff".parse().unwrap();
        fix.slaac.borrow_mut().prefixes(&[PrefixInfo {
            prefix: "2001:db8::".parse().unwrap(),
            prefix_len: 64,
            on_link: true,
            autonomous: true,
            valid_lifetime: 86400,
            preferred_lifetime: 14400,
            router,
        }]);
        assert_eq!(fix.slaac.borrow().state(), SlaacState::TentativeGlobal);

        fix.clock.advance(Duration::from_secs(2));
        fix.timers.process();
        assert_eq!(fix.slaac.borrow().state(), SlaacState::Configured);
        let expected: Ipv6Addr = "2001:db8::250:56ff:fe01:2345".parse().unwrap();
        assert_eq!(fix.config.borrow().global, Some(expected));
        assert_eq!(fix.config.borrow().gateway, Some(router));
        assert_eq!(*done.borrow(), Some(expected));
    }

    #[test]
    fn test_dad_conflict_aborts() {
        let fix = fixture();
        fix.slaac.borrow_mut().start();
        let target = fix.slaac.borrow().linklocal_addr();

        // a defender advertises the address before the timer elapses
        fix.slaac.borrow_mut().neighbor_update(target);
        fix.clock.advance(Duration::from_secs(2));
        fix.timers.process();

        assert_eq!(fix.slaac.borrow().state(), SlaacState::Idle);
        assert_eq!(fix.config.borrow().linklocal, None);
    }

    #[test]
    fn test_non_autonomous_prefix_ignored() {
        let fix = fixture();
        fix.slaac.borrow_mut().start();
        fix.clock.advance(Duration::from_secs(2));
        fix.timers.process();

        fix.slaac.borrow_mut().prefixes(&[PrefixInfo {
            prefix: "2001:db8::".parse().unwrap(),
            prefix_len: 64,
            on_link: true,
            autonomous: false,
            valid_lifetime: 86400,
            preferred_lifetime: 14400,
            router: "fe80::ff".parse().unwrap(),
        }]);
        assert_eq!(fix.slaac.borrow().state(), SlaacState::AwaitingRouter);
    }
}
