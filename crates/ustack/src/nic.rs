//! The link-layer driver contract consumed by the stack, and a scripted
//! in-memory driver used by tests and the demo bin.
//!
//! A driver delivers received frames through the upstream handler and
//! accepts outgoing frames via [`Nic::transmit`]. Buffers come from the
//! driver's own [`BufferStore`] so DMA-style ownership round-trips cleanly.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::addr::MacAddr;
use crate::buffer::{BufferStore, Packet};

/// Upstream frame handler installed by the stack.
pub type UpstreamFn = Rc<dyn Fn(Packet)>;

/// Backpressure signal: invoked with the free transmit-queue depth.
pub type QueueAvailableFn = Rc<dyn Fn(usize)>;

/// Contract a NIC driver must satisfy for [`crate::inet::Inet`] to bind a
/// stack on top of it.
pub trait Nic {
    /// The hardware address.
    fn mac(&self) -> MacAddr;

    /// Link MTU, excluding the Ethernet header.
    fn mtu(&self) -> u16;

    /// The driver's buffer pool. Frames handed upstream and packets
    /// created by the stack for this NIC all come from here.
    fn buffer_store(&self) -> BufferStore;

    /// Queue one frame for transmission. The driver owns the packet from
    /// here on and releases its buffer when the hardware is done.
    fn transmit(&self, frame: Packet);

    /// Install the receive handler.
    fn set_upstream(&self, upstream: UpstreamFn);

    /// Free slots in the transmit queue right now.
    fn transmit_queue_available(&self) -> usize;

    /// Install the handler fired when transmit slots free up.
    fn on_queue_available(&self, handler: QueueAvailableFn);

    fn driver_name(&self) -> &'static str {
        "nic"
    }
}

const SIM_TX_CAPACITY: usize = 128;

struct SimInner {
    upstream: Option<UpstreamFn>,
    queue_available: Option<QueueAvailableFn>,
    tx: VecDeque<Vec<u8>>,
}

/// A deterministic in-memory NIC. Transmitted frames accumulate until the
/// harness drains them with [`SimNic::poll_tx`]; received frames are pushed
/// in with [`SimNic::inject`]. Tests get full control over loss, reorder
/// and timing.
#[derive(Clone)]
pub struct SimNic {
    mac: MacAddr,
    mtu: u16,
    store: BufferStore,
    inner: Rc<RefCell<SimInner>>,
}

impl SimNic {
    pub fn new(mac: MacAddr, mtu: u16) -> Self {
        // Headroom for the Ethernet header plus a little driver slack.
        let bufsize = (mtu as usize + 64).next_power_of_two();
        SimNic {
            mac,
            mtu,
            store: BufferStore::new(512, bufsize),
            inner: Rc::new(RefCell::new(SimInner {
                upstream: None,
                queue_available: None,
                tx: VecDeque::new(),
            })),
        }
    }

    /// Drain all frames queued for transmission.
    pub fn poll_tx(&self) -> Vec<Vec<u8>> {
        let drained: Vec<Vec<u8>> = self.inner.borrow_mut().tx.drain(..).collect();
        if !drained.is_empty() {
            let handler = self.inner.borrow().queue_available.clone();
            if let Some(handler) = handler {
                handler(SIM_TX_CAPACITY);
            }
        }
        drained
    }

    /// Number of frames currently queued for transmission.
    pub fn tx_depth(&self) -> usize {
        self.inner.borrow().tx.len()
    }

    /// Deliver a received frame to the stack.
    pub fn inject(&self, frame: &[u8]) {
        let upstream = self.inner.borrow().upstream.clone();
        let Some(upstream) = upstream else {
            trace!("frame dropped: no upstream handler");
            return;
        };
        match self.store.load(frame) {
            Some(pkt) => upstream(pkt),
            None => trace!(len = frame.len(), "frame dropped: no buffer"),
        }
    }
}

impl Nic for SimNic {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn buffer_store(&self) -> BufferStore {
        self.store.clone()
    }

    fn transmit(&self, frame: Packet) {
        let mut inner = self.inner.borrow_mut();
        if inner.tx.len() >= SIM_TX_CAPACITY {
            trace!("tx queue full, frame dropped");
            return;
        }
        inner.tx.push_back(frame.data().to_vec());
        // `frame` drops here, returning its buffer to the pool.
    }

    fn set_upstream(&self, upstream: UpstreamFn) {
        self.inner.borrow_mut().upstream = Some(upstream);
    }

    fn transmit_queue_available(&self) -> usize {
        SIM_TX_CAPACITY - self.inner.borrow().tx.len()
    }

    fn on_queue_available(&self, handler: QueueAvailableFn) {
        self.inner.borrow_mut().queue_available = Some(handler);
    }

    fn driver_name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_transmit_and_poll() {
        let nic = SimNic::new(MacAddr::new(2, 0, 0, 0, 0, 1), 1500);
        let store = nic.buffer_store();
        let mut pkt = store.alloc(0).unwrap();
        pkt.append(b"frame-bytes");
        nic.transmit(pkt);
        assert_eq!(nic.tx_depth(), 1);
        let frames = nic.poll_tx();
        assert_eq!(frames, vec![b"frame-bytes".to_vec()]);
        // transmit released the packet buffer back to the pool
        assert_eq!(store.available(), store.pool_size());
    }

    #[test]
    fn test_inject_reaches_upstream() {
        let nic = SimNic::new(MacAddr::new(2, 0, 0, 0, 0, 1), 1500);
        let seen = Rc::new(Cell::new(0usize));
        let s = seen.clone();
        nic.set_upstream(Rc::new(move |pkt: Packet| {
            s.set(pkt.len());
        }));
        nic.inject(&[0xaa; 60]);
        assert_eq!(seen.get(), 60);
    }
}
