//! Packet buffers and the per-NIC buffer pool.
//!
//! A [`BufferStore`] owns a fixed population of uniformly sized buffers.
//! A [`Packet`] checks one buffer out of a store and returns it on drop,
//! exactly once, to the store that created it. Layers never copy payloads;
//! they move the packet's `data_begin`/`data_end` cursors instead, so the
//! same buffer walks the whole pipeline in both directions.

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::{Rc, Weak};

use tracing::trace;

struct StoreInner {
    bufsize: usize,
    pool_size: usize,
    available: Vec<Box<[u8]>>,
    next: Option<BufferStore>,
}

/// Fixed-size buffer pool. Cheap to clone; clones share the pool.
///
/// When the free list runs dry, `alloc` walks the chain of secondary
/// stores. A buffer is always released back to the store it came from.
#[derive(Clone)]
pub struct BufferStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl BufferStore {
    /// Create a pool of `count` buffers of `bufsize` bytes each.
    pub fn new(count: usize, bufsize: usize) -> Self {
        let available = (0..count)
            .map(|_| vec![0u8; bufsize].into_boxed_slice())
            .collect();
        BufferStore {
            inner: Rc::new(RefCell::new(StoreInner {
                bufsize,
                pool_size: count,
                available,
                next: None,
            })),
        }
    }

    pub fn bufsize(&self) -> usize {
        self.inner.borrow().bufsize
    }

    pub fn pool_size(&self) -> usize {
        self.inner.borrow().pool_size
    }

    /// Buffers currently on the free list (this store only).
    pub fn available(&self) -> usize {
        self.inner.borrow().available.len()
    }

    /// Chain a secondary store to fall back on when this one is empty.
    pub fn chain_secondary(&self, other: BufferStore) {
        self.inner.borrow_mut().next = Some(other);
    }

    fn take(&self) -> Option<(Box<[u8]>, Weak<RefCell<StoreInner>>)> {
        if let Some(buf) = self.inner.borrow_mut().available.pop() {
            return Some((buf, Rc::downgrade(&self.inner)));
        }
        let next = self.inner.borrow().next.clone();
        match next {
            Some(store) => store.take(),
            None => {
                trace!("buffer store exhausted");
                None
            }
        }
    }

    /// Check out a buffer with both cursors placed at `offset`, leaving
    /// `offset` bytes of headroom for lower-layer headers.
    pub fn alloc(&self, offset: usize) -> Option<Packet> {
        let (buf, store) = self.take()?;
        debug_assert!(offset <= buf.len());
        Some(Packet {
            buf,
            store,
            data_begin: offset,
            data_end: offset,
            next_hop: None,
        })
    }

    /// Check out a buffer pre-filled with `frame`, cursors spanning it.
    /// Used by drivers delivering received frames.
    pub fn load(&self, frame: &[u8]) -> Option<Packet> {
        let (mut buf, store) = self.take()?;
        if frame.len() > buf.len() {
            // oversized frame: hand the buffer straight back
            if let Some(inner) = store.upgrade() {
                inner.borrow_mut().available.push(buf);
            }
            return None;
        }
        buf[..frame.len()].copy_from_slice(frame);
        Some(Packet {
            buf,
            store,
            data_begin: 0,
            data_end: frame.len(),
            next_hop: None,
        })
    }
}

/// A buffer handle threading through the layer pipeline.
///
/// Invariant: `data_begin <= data_end <= capacity`. Receive layers strip
/// headers with [`trim_front`](Packet::trim_front); transmit layers grow
/// the packet downward with [`push_front`](Packet::push_front).
pub struct Packet {
    buf: Box<[u8]>,
    store: Weak<RefCell<StoreInner>>,
    data_begin: usize,
    data_end: usize,
    next_hop: Option<IpAddr>,
}

impl Packet {
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.data_end - self.data_begin
    }

    pub fn is_empty(&self) -> bool {
        self.data_end == self.data_begin
    }

    /// Room below `data_begin` for headers yet to be prepended.
    pub fn headroom(&self) -> usize {
        self.data_begin
    }

    /// Room above `data_end` for payload yet to be appended.
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.data_end
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_begin..self.data_end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_begin..self.data_end]
    }

    /// Drop `n` bytes from the front (a consumed header).
    pub fn trim_front(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.data_begin += n.min(self.len());
    }

    /// Grow the packet downward by `n` bytes and return the new header
    /// region. Requires `n` bytes of headroom.
    pub fn push_front(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(n <= self.headroom());
        self.data_begin -= n;
        let end = self.data_begin + n;
        &mut self.buf[self.data_begin..end]
    }

    /// Append a copy of `bytes`, bounded by tailroom. Returns bytes taken.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.tailroom());
        self.buf[self.data_end..self.data_end + n].copy_from_slice(&bytes[..n]);
        self.data_end += n;
        n
    }

    /// Grow the packet upward by `n` bytes and return the new region.
    /// The region holds whatever the recycled buffer held before.
    pub fn extend(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(n <= self.tailroom());
        let begin = self.data_end;
        self.data_end += n;
        &mut self.buf[begin..self.data_end]
    }

    /// Set the payload length measured from `data_begin`.
    pub fn set_len(&mut self, n: usize) {
        debug_assert!(self.data_begin + n <= self.buf.len());
        self.data_end = self.data_begin + n;
    }

    /// Shrink to the first `n` bytes if currently longer.
    pub fn truncate(&mut self, n: usize) {
        if n < self.len() {
            self.data_end = self.data_begin + n;
        }
    }

    pub fn next_hop(&self) -> Option<IpAddr> {
        self.next_hop
    }

    pub fn set_next_hop(&mut self, hop: IpAddr) {
        self.next_hop = Some(hop);
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.is_empty() {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.borrow_mut().available.push(buf);
        }
        // Store already gone: the buffer simply frees with us.
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("capacity", &self.capacity())
            .field("next_hop", &self.next_hop)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_release() {
        let store = BufferStore::new(2, 256);
        assert_eq!(store.available(), 2);
        let p = store.alloc(0).unwrap();
        assert_eq!(store.available(), 1);
        drop(p);
        assert_eq!(store.available(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let store = BufferStore::new(1, 64);
        let _a = store.alloc(0).unwrap();
        assert!(store.alloc(0).is_none());
    }

    #[test]
    fn test_secondary_store_migration() {
        let primary = BufferStore::new(1, 64);
        let secondary = BufferStore::new(1, 64);
        primary.chain_secondary(secondary.clone());

        let _a = primary.alloc(0).unwrap();
        // second alloc comes from the secondary store
        let b = primary.alloc(0).unwrap();
        assert_eq!(secondary.available(), 0);
        // and releases back to the secondary, not the primary
        drop(b);
        assert_eq!(secondary.available(), 1);
        assert_eq!(primary.available(), 0);
    }

    #[test]
    fn test_cursor_discipline() {
        let store = BufferStore::new(1, 128);
        let mut p = store.alloc(34).unwrap();
        assert_eq!(p.headroom(), 34);
        assert_eq!(p.len(), 0);

        p.append(b"hello");
        assert_eq!(p.data(), b"hello");

        let hdr = p.push_front(4);
        hdr.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(p.len(), 9);
        assert_eq!(&p.data()[..4], &[1, 2, 3, 4]);

        p.trim_front(4);
        assert_eq!(p.data(), b"hello");
    }

    #[test]
    fn test_append_bounded_by_tailroom() {
        let store = BufferStore::new(1, 8);
        let mut p = store.alloc(0).unwrap();
        let taken = p.append(&[0u8; 32]);
        assert_eq!(taken, 8);
        assert_eq!(p.tailroom(), 0);
    }

    #[test]
    fn test_load_oversized_frame_rejected() {
        let store = BufferStore::new(1, 16);
        assert!(store.load(&[0u8; 32]).is_none());
        // buffer was returned, not leaked
        assert_eq!(store.available(), 1);
    }
}
