//! Receive-side buffering: sequence-indexed buffers that accept holes,
//! and the read request that slides them over the byte stream.
//!
//! A [`ReadBuffer`] covers a fixed window `[start, start + capacity)` of
//! sequence space; data lands at its offset, out-of-order bytes leave a
//! hole that is tracked until filled. A buffer is ready for delivery when
//! it has no holes and either PSH was seen or it is full.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// How many sequence windows may be buffered at once.
pub const BUFFER_LIMIT: usize = 2;

#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    cap: usize,
    start: u32,
    /// Bytes missing below the current fill level.
    hole: usize,
    push_seen: bool,
}

impl ReadBuffer {
    pub fn new(start: u32, capacity: usize) -> Self {
        ReadBuffer {
            buf: BytesMut::with_capacity(capacity),
            cap: capacity,
            start,
            hole: 0,
            push_seen: false,
        }
    }

    /// Bytes of `[seq, ...)` this buffer can still take; zero when `seq`
    /// is outside the window.
    pub fn fits(&self, seq: u32) -> usize {
        let rel = seq.wrapping_sub(self.start) as usize;
        if rel < self.cap { self.cap - rel } else { 0 }
    }

    /// Insert data at its sequence position. Overlapping inserts are the
    /// caller's responsibility to prevent. Returns bytes taken.
    pub fn insert(&mut self, seq: u32, data: &[u8], push: bool) -> usize {
        let rel = seq.wrapping_sub(self.start) as usize;
        debug_assert!(rel < self.cap);
        let n = data.len().min(self.cap - rel);
        let end = rel + n;

        let filled = self.buf.len();
        if end > filled {
            self.buf.resize(end, 0);
        }
        if rel > filled {
            self.hole += rel - filled;
        } else {
            // insert below the fill level plugs hole bytes exactly
            self.hole -= end.min(filled).saturating_sub(rel).min(self.hole);
        }
        self.buf[rel..end].copy_from_slice(&data[..n]);
        if push && n == data.len() {
            self.push_seen = true;
        }
        n
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Highest filled offset (holes included in the count).
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn missing(&self) -> usize {
        self.hole
    }

    pub fn at_end(&self) -> bool {
        self.buf.len() == self.cap
    }

    /// Deliverable: gap-free, and either pushed or full.
    pub fn is_ready(&self) -> bool {
        self.hole == 0 && (self.push_seen || self.at_end())
    }

    pub fn start_seq(&self) -> u32 {
        self.start
    }

    pub fn end_seq(&self) -> u32 {
        self.start.wrapping_add(self.cap as u32)
    }

    /// Hand out the collected bytes, leaving the buffer empty at the
    /// sequence just past what was taken.
    pub fn take(&mut self) -> Bytes {
        let len = self.buf.len();
        self.start = self.start.wrapping_add(len as u32);
        self.push_seen = false;
        self.hole = 0;
        let bytes = std::mem::replace(&mut self.buf, BytesMut::with_capacity(self.cap));
        bytes.freeze()
    }

    /// Re-anchor an empty buffer at a new starting sequence.
    pub fn reset(&mut self, start: u32) {
        self.start = start;
        self.buf.clear();
        self.hole = 0;
        self.push_seen = false;
    }
}

/// The sliding window of read buffers plus the queue of completed chunks
/// awaiting the application.
#[derive(Debug)]
pub struct ReadRequest {
    buffers: VecDeque<ReadBuffer>,
    complete: VecDeque<Bytes>,
    capacity: usize,
}

impl ReadRequest {
    pub fn new(start: u32, capacity: usize) -> Self {
        let mut buffers = VecDeque::with_capacity(BUFFER_LIMIT);
        buffers.push_back(ReadBuffer::new(start, capacity));
        ReadRequest {
            buffers,
            complete: VecDeque::new(),
            capacity,
        }
    }

    /// Bytes insertable starting at `seq`, across current and createable
    /// buffers. Windows are contiguous, so the budget is simply measured
    /// from the front window's base.
    pub fn fits(&self, seq: u32) -> usize {
        let Some(base) = self.buffers.front().map(|b| b.start_seq()) else {
            return 0;
        };
        let rel = seq.wrapping_sub(base) as usize;
        let total = BUFFER_LIMIT * self.capacity;
        if rel < total { total - rel } else { 0 }
    }

    /// Total bytes buffered but not yet read by the application.
    pub fn size(&self) -> usize {
        let buffered: usize = self.buffers.iter().map(|b| b.size() - b.missing()).sum();
        let ready: usize = self.complete.iter().map(|b| b.len()).sum();
        buffered + ready
    }

    /// Insert received data; contiguity is the connection's concern, this
    /// only places bytes. Returns bytes accepted.
    pub fn insert(&mut self, mut seq: u32, mut data: &[u8], push: bool) -> usize {
        let mut inserted = 0;
        while !data.is_empty() {
            let Some(index) = self.buffer_for(seq) else { break };
            let buf = &mut self.buffers[index];
            let n = buf.fits(seq).min(data.len());
            if n == 0 {
                break;
            }
            buf.insert(seq, &data[..n], push && n == data.len());
            inserted += n;
            seq = seq.wrapping_add(n as u32);
            data = &data[n..];
        }
        self.harvest();
        inserted
    }

    /// Next completed chunk, if any.
    pub fn read_next(&mut self) -> Option<Bytes> {
        self.complete.pop_front()
    }

    /// Size of the next completed chunk.
    pub fn next_size(&self) -> usize {
        self.complete.front().map(|b| b.len()).unwrap_or(0)
    }

    pub fn has_ready(&self) -> bool {
        !self.complete.is_empty()
    }

    /// Drain every completed chunk.
    pub fn drain_ready(&mut self) -> Vec<Bytes> {
        self.complete.drain(..).collect()
    }

    /// Abandon buffered state and restart at `seq`.
    pub fn reset(&mut self, seq: u32) {
        self.buffers.clear();
        self.buffers.push_back(ReadBuffer::new(seq, self.capacity));
        self.complete.clear();
    }

    fn buffer_for(&mut self, seq: u32) -> Option<usize> {
        for (i, buf) in self.buffers.iter().enumerate() {
            if buf.fits(seq) > 0 {
                return Some(i);
            }
        }
        // materialize the next contiguous window if allowed
        while self.buffers.len() < BUFFER_LIMIT {
            let next_start = self.buffers.back().map(|b| b.end_seq())?;
            self.buffers.push_back(ReadBuffer::new(next_start, self.capacity));
            if self.buffers.back().is_some_and(|b| b.fits(seq) > 0) {
                return Some(self.buffers.len() - 1);
            }
        }
        None
    }

    /// Move ready buffers into the completed queue, keeping the window
    /// contiguous. A partially filled buffer is only harvested early (on
    /// PSH) when no later data is buffered, so delivery stays in order.
    fn harvest(&mut self) {
        loop {
            let Some(front) = self.buffers.front() else { break };
            if front.size() == 0 || !front.is_ready() {
                break;
            }
            let full = front.at_end();
            let later_data = self.buffers.iter().skip(1).any(|b| b.size() > 0);
            if !full && later_data {
                break;
            }

            let mut front = match self.buffers.pop_front() {
                Some(b) => b,
                None => break,
            };
            let bytes = front.take();
            self.complete.push_back(bytes);

            if full {
                // ranges stay contiguous; add a fresh window at the tail
                let tail = self.buffers.back().map(|b| b.end_seq()).unwrap_or(front.start_seq());
                self.buffers.push_back(ReadBuffer::new(tail, self.capacity));
            } else {
                // early harvest: nothing buffered beyond; restart cleanly
                let start = front.start_seq();
                self.buffers.clear();
                self.buffers.push_back(ReadBuffer::new(start, self.capacity));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_push_delivers() {
        let mut rq = ReadRequest::new(1000, 64);
        rq.insert(1000, b"hello ", false);
        rq.insert(1006, b"world", true);
        assert_eq!(rq.read_next().unwrap(), Bytes::from_static(b"hello world"));
        assert!(rq.read_next().is_none());
    }

    #[test]
    fn test_hole_blocks_delivery_until_filled() {
        let mut rq = ReadRequest::new(0, 64);
        rq.insert(10, b"world", true); // out of order
        assert!(!rq.has_ready());
        assert_eq!(rq.buffers.front().unwrap().missing(), 10);

        rq.insert(0, b"helloXXXXX", false); // fills the hole
        assert!(rq.has_ready());
        let chunk = rq.read_next().unwrap();
        assert_eq!(&chunk[..], b"helloXXXXXworld");
    }

    #[test]
    fn test_full_buffer_delivers_without_push() {
        let mut rq = ReadRequest::new(0, 8);
        rq.insert(0, b"12345678", false);
        assert_eq!(rq.read_next().unwrap(), Bytes::from_static(b"12345678"));
        // window slid: next bytes go to the next chunk
        rq.insert(8, b"9abcdef0", false);
        assert_eq!(rq.read_next().unwrap(), Bytes::from_static(b"9abcdef0"));
    }

    #[test]
    fn test_spill_into_second_window() {
        let mut rq = ReadRequest::new(0, 8);
        // 12 bytes: fills window one and half of window two
        let taken = rq.insert(0, b"0123456789ab", false);
        assert_eq!(taken, 12);
        assert_eq!(rq.read_next().unwrap(), Bytes::from_static(b"01234567"));
        rq.insert(12, b"cdef", true);
        assert_eq!(rq.read_next().unwrap(), Bytes::from_static(b"89abcdef"));
    }

    #[test]
    fn test_fits_caps_at_window_budget() {
        let rq = ReadRequest::new(0, 8);
        assert_eq!(rq.fits(0), 16); // two windows worth
        assert_eq!(rq.fits(4), 12);
        assert_eq!(rq.fits(100), 0);
    }

    #[test]
    fn test_early_push_waits_for_later_data() {
        let mut rq = ReadRequest::new(0, 8);
        rq.insert(10, b"zz", false); // out of order, second window
        rq.insert(0, b"abc", true); // pushed, but later data exists
        assert!(!rq.has_ready());
    }

    #[test]
    fn test_size_counts_buffered_and_ready() {
        let mut rq = ReadRequest::new(0, 16);
        rq.insert(0, b"abcd", true);
        rq.insert(20, b"xy", false);
        // 4 ready + 2 buffered out-of-order
        assert_eq!(rq.size(), 6);
    }

    #[test]
    fn test_reset_restarts_window() {
        let mut rq = ReadRequest::new(0, 8);
        rq.insert(2, b"xx", false);
        rq.reset(100);
        assert_eq!(rq.size(), 0);
        rq.insert(100, b"fresh!", true);
        assert_eq!(rq.read_next().unwrap(), Bytes::from_static(b"fresh!"));
    }
}
