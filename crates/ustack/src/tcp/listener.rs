//! A passive (listening) TCP endpoint with its bounded SYN queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::addr::Socket;

use super::Tcp;
use super::connection::{ConnRef, Connection};

/// Filter deciding whether to accept a completed handshake.
pub type AcceptFn = Rc<dyn Fn(Socket) -> bool>;

/// Invoked with each newly established connection.
pub type ConnectFn = Rc<dyn Fn(Connection)>;

pub(crate) struct ListenerInner {
    pub local: Socket,
    pub syn_queue: VecDeque<ConnRef>,
    pub max_syn_backlog: usize,
    pub on_accept: Option<AcceptFn>,
    pub on_connect: Option<ConnectFn>,
    pub host: Weak<RefCell<Tcp>>,
}

impl ListenerInner {
    pub fn syn_queue_full(&self) -> bool {
        self.syn_queue.len() >= self.max_syn_backlog
    }
}

/// Handle to a bound listener. Clones share the listener.
#[derive(Clone)]
pub struct Listener {
    pub(crate) inner: Rc<RefCell<ListenerInner>>,
}

impl Listener {
    pub fn local(&self) -> Socket {
        self.inner.borrow().local
    }

    pub fn port(&self) -> u16 {
        self.inner.borrow().local.port()
    }

    pub fn syn_queue_size(&self) -> usize {
        self.inner.borrow().syn_queue.len()
    }

    /// Install the accept filter, consulted when a handshake completes.
    /// Returning `false` resets the remote and discards the connection.
    pub fn on_accept(&self, f: impl Fn(Socket) -> bool + 'static) -> &Self {
        self.inner.borrow_mut().on_accept = Some(Rc::new(f));
        self
    }

    /// Install the established-connection callback.
    pub fn on_connect(&self, f: impl Fn(Connection) + 'static) -> &Self {
        self.inner.borrow_mut().on_connect = Some(Rc::new(f));
        self
    }

    /// Unbind: half-open connections are reset, pending accepts die.
    pub fn close(&self) {
        let (host, port) = {
            let inner = self.inner.borrow();
            (inner.host.upgrade(), inner.local.port())
        };
        if let Some(host) = host {
            Tcp::unbind(&host, port);
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(
            f,
            "Listener {} with {} half-open connections",
            inner.local,
            inner.syn_queue.len()
        )
    }
}

/// Run the accept filter for `remote`. Default accepts everything.
pub(crate) fn check_accept(listener: &Rc<RefCell<ListenerInner>>, remote: Socket) -> bool {
    let filter = listener.borrow().on_accept.clone();
    match filter {
        Some(filter) => filter(remote),
        None => true,
    }
}

/// A queued connection finished its handshake.
pub(crate) fn connected(listener: &Rc<RefCell<ListenerInner>>, conn: Connection) {
    {
        let mut inner = listener.borrow_mut();
        inner.syn_queue.retain(|c| !Rc::ptr_eq(c, &conn.inner));
    }
    debug!(conn = %conn, "tcp: connection accepted");
    let cb = listener.borrow().on_connect.clone();
    if let Some(cb) = cb {
        cb(conn);
    }
}

/// Drop a dying connection from the SYN queue.
pub(crate) fn remove(listener: &Rc<RefCell<ListenerInner>>, conn: &ConnRef) {
    listener
        .borrow_mut()
        .syn_queue
        .retain(|c| !Rc::ptr_eq(c, conn));
}
