//! Callback-driven TCP/IP stack for unikernel-style single-address-space
//! targets.
//!
//! The crate implements the Ethernet → ARP → IPv4/IPv6 → {ICMP, UDP, TCP}
//! pipeline as a strictly layered set of components bound together per NIC
//! by [`inet::Inet`]. Packets are zero-copy buffer handles whose layer
//! cursors move as headers are consumed or prepended; the whole stack runs
//! on a single-threaded, run-to-completion event loop driven by a central
//! [`timer::Timers`] service and the NIC's receive interrupt.
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use ustack::nic::SimNic;
//! use ustack::timer::{MonotonicClock, Timers};
//! use ustack::Inet;
//!
//! let timers = Timers::new(Rc::new(MonotonicClock::new()));
//! let nic = Rc::new(SimNic::new("52:54:00:00:00:01".parse()?, 1500));
//! let inet = Inet::new(nic, timers)?;
//! inet.configure(
//!     "10.0.0.1".parse()?,
//!     "255.255.255.0".parse()?,
//!     "10.0.0.254".parse()?,
//!     "10.0.0.53".parse()?,
//! );
//!
//! // TCP echo service
//! inet.tcp_bind(7, |conn| {
//!     let c = conn.clone();
//!     conn.on_read(16 * 1024, move |chunk| c.write(chunk));
//! })?;
//!
//! // outgoing connection
//! let conn = inet.tcp_connect("10.0.0.2:80".parse()?, |conn| {
//!     if let Some(conn) = conn {
//!         conn.write(&b"GET / HTTP/1.0\r\n\r\n"[..]);
//!     }
//! })?;
//! ```
//!
//! # Event model
//!
//! There are no threads and no suspension points: every callback runs to
//! completion. Asynchronous operations (connect, read, write, resolve,
//! ping) return immediately and deliver results through registered
//! callbacks. The embedder's event loop feeds received frames to the
//! stack via the NIC upstream handler and calls
//! [`Inet::process_timers`](inet::Inet::process_timers) when the next
//! timer deadline passes.

pub mod addr;
pub mod arp;
pub mod buffer;
pub mod conntrack;
pub mod dns;
pub mod error;
pub mod ethernet;
pub mod filter;
pub mod inet;
pub mod ip;
pub mod ip4;
pub mod ip6;
pub mod nic;
pub mod port_util;
pub mod super_stack;
pub mod tcp;
pub mod timer;
pub mod udp;
pub mod util;

// Feature-gated modules
#[cfg(feature = "config")]
pub mod config;

// Re-export common types at crate root for convenience
pub use addr::{MacAddr, Socket};
pub use buffer::{BufferStore, Packet};
pub use error::{Error, NetworkError, Result};
pub use inet::Inet;
pub use super_stack::SuperStack;

// Transport handles
pub use tcp::{Connection, Disconnect, Listener};
pub use udp::UdpSocket;

// Driver contract
pub use nic::Nic;
