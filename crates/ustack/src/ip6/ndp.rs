//! Neighbor Discovery (RFC 4861), as far as SLAAC needs it: router
//! solicitation out, router-advertisement prefix parsing in, and
//! neighbor solicitation/advertisement for resolution and duplicate
//! address detection.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::Duration;

use tracing::{debug, trace};

use crate::addr::MacAddr;
use crate::buffer::{BufferStore, Packet};
use crate::ethernet;

use super::icmp6::{
    self, TYPE_NEIGHBOR_ADVERTISEMENT, TYPE_NEIGHBOR_SOLICITATION, TYPE_ROUTER_ADVERTISEMENT,
    TYPE_ROUTER_SOLICITATION,
};
use super::{ALL_ROUTERS, HEADER_LEN as IP6_HEADER_LEN, SharedIp6Config, solicited_node};

// NDP options
const OPT_SOURCE_LLADDR: u8 = 1;
const OPT_TARGET_LLADDR: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;

/// Neighbor cache TTL, mirroring the v4 resolver's behavior.
const CACHE_EXPIRY: Duration = Duration::from_secs(60 * 5);

/// Prefix information lifted out of a router advertisement, handed to
/// SLAAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfo {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    /// The advertising router (default-gateway candidate).
    pub router: Ipv6Addr,
}

/// What the NDP handler wants done with an incoming message.
pub enum NdpOut {
    /// An advertisement to send back `(packet, src ip, dst ip)`.
    Transmit(Packet, Ipv6Addr, Ipv6Addr),
    /// Router advertisement carried usable prefixes.
    Prefixes(Vec<PrefixInfo>),
    /// Someone advertised the given target address (DAD conflict check,
    /// resolution completion).
    NeighborUpdate { target: Ipv6Addr, mac: Option<MacAddr> },
}

struct CacheEntry {
    mac: MacAddr,
    inserted: Duration,
}

pub struct Ndp {
    mac: MacAddr,
    config: SharedIp6Config,
    store: BufferStore,
    cache: HashMap<Ipv6Addr, CacheEntry>,
}

impl Ndp {
    pub fn new(mac: MacAddr, config: SharedIp6Config, store: BufferStore) -> Self {
        Ndp {
            mac,
            config,
            store,
            cache: HashMap::new(),
        }
    }

    pub fn cached(&self, addr: Ipv6Addr, now: Duration) -> Option<MacAddr> {
        self.cache
            .get(&addr)
            .filter(|e| now < e.inserted + CACHE_EXPIRY)
            .map(|e| e.mac)
    }

    pub fn cache(&mut self, addr: Ipv6Addr, mac: MacAddr, now: Duration) {
        trace!(%addr, %mac, "ndp: cache");
        self.cache.insert(addr, CacheEntry { mac, inserted: now });
    }

    pub fn flush_expired(&mut self, now: Duration) {
        self.cache.retain(|_, e| now < e.inserted + CACHE_EXPIRY);
    }

    /// Handle an NDP message (cursor at the ICMPv6 header).
    pub fn receive(&mut self, pkt: &Packet, src: Ipv6Addr, now: Duration) -> Vec<NdpOut> {
        let mut out = Vec::new();
        let msg = pkt.data();
        let Some(&icmp_type) = msg.first() else {
            return out;
        };
        match icmp_type {
            TYPE_NEIGHBOR_SOLICITATION if msg.len() >= 24 => {
                let Some(target) = read_addr(&msg[8..24]) else {
                    return out;
                };
                if let Some(mac) = find_lladdr_option(&msg[24..], OPT_SOURCE_LLADDR) {
                    self.cache(src, mac, now);
                }
                let ours = self.config.borrow().is_our_addr(target);
                if ours {
                    // DAD probes come from the unspecified address and are
                    // answered to all-nodes
                    let reply_to = if src == Ipv6Addr::UNSPECIFIED {
                        super::ALL_NODES
                    } else {
                        src
                    };
                    if let Some((adv, adv_src)) = self.build_neighbor_advertisement(target, reply_to) {
                        debug!(%target, to = %reply_to, "ndp: advertising");
                        out.push(NdpOut::Transmit(adv, adv_src, reply_to));
                    }
                }
            }
            TYPE_NEIGHBOR_ADVERTISEMENT if msg.len() >= 24 => {
                let Some(target) = read_addr(&msg[8..24]) else {
                    return out;
                };
                let mac = find_lladdr_option(&msg[24..], OPT_TARGET_LLADDR);
                if let Some(mac) = mac {
                    self.cache(target, mac, now);
                }
                out.push(NdpOut::NeighborUpdate { target, mac });
            }
            TYPE_ROUTER_ADVERTISEMENT if msg.len() >= 16 => {
                if let Some(mac) = find_lladdr_option(&msg[16..], OPT_SOURCE_LLADDR) {
                    self.cache(src, mac, now);
                }
                let prefixes = parse_prefix_options(&msg[16..], src);
                if !prefixes.is_empty() {
                    out.push(NdpOut::Prefixes(prefixes));
                }
            }
            TYPE_ROUTER_SOLICITATION => {
                // hosts ignore solicitations from other hosts
            }
            _ => {}
        }
        out
    }

    /// Router solicitation toward all-routers (RFC 4861 6.3.7).
    /// Returns `(packet, src, dst)`.
    pub fn build_router_solicitation(&mut self) -> Option<(Packet, Ipv6Addr, Ipv6Addr)> {
        let mut pkt = self.store.alloc(ethernet::HEADER_LEN + IP6_HEADER_LEN)?;
        pkt.append(&[TYPE_ROUTER_SOLICITATION, 0, 0, 0]);
        pkt.append(&[0; 4]); // reserved
        pkt.append(&[OPT_SOURCE_LLADDR, 1]);
        pkt.append(&self.mac.octets());
        let src = self
            .config
            .borrow()
            .linklocal
            .unwrap_or(Ipv6Addr::UNSPECIFIED);
        icmp6::finalize_checksum(&mut pkt, src, ALL_ROUTERS);
        Some((pkt, src, ALL_ROUTERS))
    }

    /// Neighbor solicitation for `target`. With `dad` the source is
    /// unspecified and the destination is the solicited-node group.
    pub fn build_neighbor_solicitation(
        &mut self,
        target: Ipv6Addr,
        dad: bool,
    ) -> Option<(Packet, Ipv6Addr, Ipv6Addr)> {
        let mut pkt = self.store.alloc(ethernet::HEADER_LEN + IP6_HEADER_LEN)?;
        pkt.append(&[TYPE_NEIGHBOR_SOLICITATION, 0, 0, 0]);
        pkt.append(&[0; 4]);
        pkt.append(&target.octets());
        let src = if dad {
            Ipv6Addr::UNSPECIFIED
        } else {
            pkt.append(&[OPT_SOURCE_LLADDR, 1]);
            pkt.append(&self.mac.octets());
            self.config
                .borrow()
                .linklocal
                .unwrap_or(Ipv6Addr::UNSPECIFIED)
        };
        let dst = solicited_node(target);
        icmp6::finalize_checksum(&mut pkt, src, dst);
        Some((pkt, src, dst))
    }

    fn build_neighbor_advertisement(
        &mut self,
        target: Ipv6Addr,
        dst: Ipv6Addr,
    ) -> Option<(Packet, Ipv6Addr)> {
        let mut pkt = self.store.alloc(ethernet::HEADER_LEN + IP6_HEADER_LEN)?;
        pkt.append(&[TYPE_NEIGHBOR_ADVERTISEMENT, 0, 0, 0]);
        // flags: solicited + override
        pkt.append(&[0x60, 0, 0, 0]);
        pkt.append(&target.octets());
        pkt.append(&[OPT_TARGET_LLADDR, 1]);
        pkt.append(&self.mac.octets());
        let src = self.config.borrow().source_for(dst);
        icmp6::finalize_checksum(&mut pkt, src, dst);
        Some((pkt, src))
    }
}

fn read_addr(bytes: &[u8]) -> Option<Ipv6Addr> {
    let octets: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
    Some(Ipv6Addr::from(octets))
}

/// Walk NDP options (8-octet units) for a link-layer address option.
fn find_lladdr_option(mut opts: &[u8], kind: u8) -> Option<MacAddr> {
    while opts.len() >= 8 {
        let len = usize::from(opts[1]) * 8;
        if len == 0 || len > opts.len() {
            return None;
        }
        if opts[0] == kind {
            return MacAddr::from_slice(&opts[2..8]);
        }
        opts = &opts[len..];
    }
    None
}

/// Collect prefix-information options (RFC 4861 4.6.2).
fn parse_prefix_options(mut opts: &[u8], router: Ipv6Addr) -> Vec<PrefixInfo> {
    let mut prefixes = Vec::new();
    while opts.len() >= 8 {
        let len = usize::from(opts[1]) * 8;
        if len == 0 || len > opts.len() {
            break;
        }
        if opts[0] == OPT_PREFIX_INFO && len >= 32 {
            let flags = opts[3];
            if let Some(prefix) = read_addr(&opts[16..32]) {
                prefixes.push(PrefixInfo {
                    prefix,
                    prefix_len: opts[2],
                    on_link: flags & 0x80 != 0,
                    autonomous: flags & 0x40 != 0,
                    valid_lifetime: u32::from_be_bytes([opts[4], opts[5], opts[6], opts[7]]),
                    preferred_lifetime: u32::from_be_bytes([opts[8], opts[9], opts[10], opts[11]]),
                    router,
                });
            }
        }
        opts = &opts[len..];
    }
    prefixes
}
