//! Error types for stack operations.
//!
//! Two layers of errors exist. [`Error`] is returned from the user-facing
//! API (`bind`, `connect`, `resolve`, `sendto`). [`NetworkError`] is the
//! small copyable taxonomy delivered asynchronously to registered error
//! callbacks when the network reports a problem (ICMP errors, resolution
//! failure, timeouts). Protocol faults inside the receive path never
//! surface as either: malformed packets are counted and dropped.

use std::net::IpAddr;

/// Result type for stack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during stack operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested local port is taken.
    #[error("port {port} already in use")]
    PortInUse {
        /// The port that was requested.
        port: u16,
    },

    /// No ephemeral port could be allocated.
    #[error("ephemeral ports exhausted")]
    PortsExhausted,

    /// The NIC buffer pool is empty.
    #[error("out of packet buffers")]
    OutOfBuffers,

    /// A capacity-limited table refused a new entry.
    #[error("{table} table full")]
    TableFull {
        /// Which table refused.
        table: &'static str,
    },

    /// Datagram exceeds the path MTU and fragmentation is disabled.
    #[error("message of {size} bytes exceeds path MTU {pmtu}")]
    MsgTooBig {
        /// Size of the offending message.
        size: usize,
        /// Path MTU for the destination.
        pmtu: u16,
    },

    /// The operation is not legal in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The remote end refused the connection.
    #[error("connection refused")]
    Refused,

    /// A request timed out.
    #[error("timed out")]
    Timeout,

    /// Hostname could not be resolved.
    #[error("hostname not found: {0}")]
    NameNotFound(String),

    /// A hostname violates DNS length limits.
    #[error("invalid hostname: {0}")]
    InvalidName(String),

    /// Wire-format parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// No interface is configured for the requested address family.
    #[error("no address configured: {0}")]
    NotConfigured(&'static str),
}

impl Error {
    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if this is a resource-exhaustion error.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::PortsExhausted | Self::OutOfBuffers | Self::TableFull { .. }
        )
    }
}

/// Asynchronous network-reported errors, delivered to per-socket and
/// per-connection error callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    /// ICMP destination unreachable, with the ICMP code.
    Unreachable(u8),
    /// ICMP fragmentation needed / packet too big, with the next-hop MTU.
    TooBig(u16),
    /// ICMP time exceeded.
    TimeExceeded,
    /// ICMP parameter problem.
    ParameterProblem,
    /// Link-layer address resolution gave up; the datagram was dropped.
    ResolveFailed(IpAddr),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(code) => write!(f, "destination unreachable (code {code})"),
            Self::TooBig(mtu) => write!(f, "packet too big (next-hop mtu {mtu})"),
            Self::TimeExceeded => write!(f, "time exceeded"),
            Self::ParameterProblem => write!(f, "parameter problem"),
            Self::ResolveFailed(ip) => write!(f, "address resolution failed for {ip}"),
        }
    }
}

impl NetworkError {
    /// True when the error means the destination port is closed.
    pub fn is_port_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(3))
    }
}
