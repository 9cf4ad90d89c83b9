//! A recursive stub resolver with a per-hostname cache.
//!
//! Queries go out over a dedicated UDP socket; replies are matched by
//! transaction id. Each request carries a one-shot timeout, and a periodic
//! flush evicts expired cache entries (an entry can thus outlive its TTL
//! by up to one flush interval).

pub mod message;

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::timer::{TimerId, Timers};
use crate::udp::{Udp, UdpSocket};

pub use message::{RData, Record, RecordType, Response};

/// Well-known DNS service port.
pub const SERVICE_PORT: u16 = 53;

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Completion callback: the resolved address, or why not.
pub type ResolveFn = Box<dyn FnOnce(Result<IpAddr>)>;

struct CacheEntry {
    address: IpAddr,
    expires: Duration,
}

struct PendingRequest {
    hostname: String,
    callback: Option<ResolveFn>,
    timer: TimerId,
}

pub struct Client {
    socket: UdpSocket,
    timers: Timers,
    self_ref: Weak<RefCell<Client>>,
    cache: HashMap<String, CacheEntry>,
    cache_ttl: Duration,
    requests: HashMap<u16, PendingRequest>,
    next_id: u16,
}

impl Client {
    /// Bind a resolver on `udp` with its own ephemeral socket.
    pub fn new(udp: &Rc<RefCell<Udp>>, timers: Timers) -> Result<Rc<RefCell<Client>>> {
        let socket = Udp::bind(udp, None)?;
        let client = Rc::new(RefCell::new(Client {
            socket: socket.clone(),
            timers: timers.clone(),
            self_ref: Weak::new(),
            cache: HashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            requests: HashMap::new(),
            next_id: 1,
        }));
        client.borrow_mut().self_ref = Rc::downgrade(&client);

        {
            let weak = Rc::downgrade(&client);
            socket.on_read(move |from, data| {
                if let Some(client) = weak.upgrade() {
                    receive_response(&client, from.addr(), data);
                }
            });
        }
        {
            let weak = Rc::downgrade(&client);
            let clock = timers.clone();
            timers.periodic(DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_INTERVAL, move || {
                if let Some(client) = weak.upgrade() {
                    let now = clock.now();
                    client.borrow_mut().flush_expired(now);
                }
            });
        }
        Ok(client)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Zero disables caching entirely.
    pub fn set_cache_ttl(&mut self, ttl: Duration) {
        self.cache_ttl = ttl;
    }

    pub fn flush_cache(&mut self) {
        self.cache.clear();
    }

    fn flush_expired(&mut self, now: Duration) {
        self.cache.retain(|_, e| e.expires > now);
    }

    pub fn is_fqdn(hostname: &str) -> bool {
        hostname.contains('.')
    }

    fn cached(&self, hostname: &str, now: Duration) -> Option<IpAddr> {
        self.cache
            .get(hostname)
            .filter(|e| e.expires > now)
            .map(|e| e.address)
    }

    fn add_cache_entry(&mut self, hostname: &str, address: IpAddr, ttl: Duration, now: Duration) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let ttl = ttl.min(self.cache_ttl);
        trace!(hostname, %address, ?ttl, "dns: cached");
        self.cache.insert(
            hostname.to_string(),
            CacheEntry {
                address,
                expires: now + ttl,
            },
        );
    }

    fn allocate_id(&mut self) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Resolve `hostname` via `server`. Cache hits call back synchronously;
/// otherwise an A query goes out and the callback fires on the reply or
/// after `timeout`.
pub fn resolve(
    client: &Rc<RefCell<Client>>,
    server: Ipv4Addr,
    hostname: &str,
    callback: ResolveFn,
    timeout: Duration,
    force: bool,
) {
    // cache lookup under a short borrow; callback outside it
    let hit = {
        let c = client.borrow();
        let now = c.timers.now();
        if force { None } else { c.cached(hostname, now) }
    };
    if let Some(address) = hit {
        trace!(hostname, %address, "dns: cache hit");
        callback(Ok(address));
        return;
    }

    let (id, query, socket) = {
        let mut c = client.borrow_mut();
        let id = c.allocate_id();
        let query = match message::encode_query(id, hostname, RecordType::A) {
            Ok(q) => q,
            Err(e) => {
                drop(c);
                callback(Err(e));
                return;
            }
        };

        let weak = c.self_ref.clone();
        let timer = c.timers.schedule(timeout, move || {
            let Some(client) = weak.upgrade() else { return };
            let cb = {
                let mut c = client.borrow_mut();
                c.requests.remove(&id).and_then(|mut r| r.callback.take())
            };
            if let Some(cb) = cb {
                debug!(id, "dns: request timed out");
                cb(Err(Error::Timeout));
            }
        });
        c.requests.insert(
            id,
            PendingRequest {
                hostname: hostname.to_string(),
                callback: Some(callback),
                timer,
            },
        );
        (id, query, c.socket.clone())
    };

    debug!(hostname, id, %server, "dns: query");
    if let Err(e) = socket.sendto(server, SERVICE_PORT, &query) {
        let cb = {
            let mut c = client.borrow_mut();
            if let Some(req) = c.requests.remove(&id) {
                c.timers.stop(req.timer);
                let mut req = req;
                req.callback.take()
            } else {
                None
            }
        };
        if let Some(cb) = cb {
            cb(Err(e));
        }
    }
}

/// Incoming datagram on the resolver socket.
fn receive_response(client: &Rc<RefCell<Client>>, _from: IpAddr, data: &[u8]) {
    let Ok(response) = message::decode(data) else {
        trace!("dns: undecodable response");
        return;
    };

    let (callback, outcome) = {
        let mut c = client.borrow_mut();
        let Some(mut request) = c.requests.remove(&response.id) else {
            trace!(id = response.id, "dns: reply for unknown id");
            return;
        };
        c.timers.stop(request.timer);

        let outcome = if response.rcode != 0 {
            Err(Error::NameNotFound(request.hostname.clone()))
        } else {
            match response.first_addr() {
                Some(address) => {
                    let ttl = Duration::from_secs(u64::from(response.min_ttl().unwrap_or(0)));
                    let now = c.timers.now();
                    c.add_cache_entry(&request.hostname, address, ttl, now);
                    Ok(address)
                }
                None => Err(Error::NameNotFound(request.hostname.clone())),
            }
        };
        (request.callback.take(), outcome)
    };

    if let Some(cb) = callback {
        cb(outcome);
    }
}
