//! The outgoing byte queue of a connection.
//!
//! Buffers stay queued until fully acknowledged so retransmission can
//! always reach back to `SND.UNA`:
//!
//! ```text
//! [UNA][xxx][xxx][NXT][---][---]
//!  ^               ^
//!  sent but        not yet sent (or partially sent)
//!  not acked
//! ```

use std::collections::VecDeque;

use bytes::Bytes;

/// Ordered user write requests with transmit and acknowledge cursors.
#[derive(Debug, Default)]
pub struct WriteQueue {
    q: VecDeque<Bytes>,
    /// Index of the buffer the next transmission reads from.
    current: usize,
    /// Bytes of `q[current]` already handed to segments.
    offset: usize,
    /// Bytes of `q[0]` already acknowledged.
    acked: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write request.
    pub fn push_back(&mut self, buf: Bytes) {
        debug_assert!(!buf.is_empty());
        self.q.push_back(buf);
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn acked(&self) -> usize {
        self.acked
    }

    /// Whether any bytes remain to transmit.
    pub fn has_remaining_requests(&self) -> bool {
        self.current < self.q.len()
    }

    /// Raw view of request `i`, front-relative. Empty when out of range.
    pub fn buffer(&self, i: usize) -> &[u8] {
        self.q.get(i).map(|b| b.as_ref()).unwrap_or(&[])
    }

    /// Unsent remainder of the current request.
    pub fn nxt_data(&self) -> &[u8] {
        match self.q.get(self.current) {
            Some(buf) => &buf[self.offset..],
            None => &[],
        }
    }

    /// Total bytes across all queued requests.
    pub fn bytes_total(&self) -> usize {
        self.q.iter().map(|b| b.len()).sum()
    }

    /// Bytes not yet handed to any segment.
    pub fn bytes_remaining(&self) -> usize {
        let mut n = 0;
        for (i, buf) in self.q.iter().enumerate() {
            if i > self.current {
                n += buf.len();
            } else if i == self.current {
                n += buf.len() - self.offset;
            }
        }
        n
    }

    /// Bytes sent or unsent but not yet acknowledged.
    pub fn bytes_unacknowledged(&self) -> usize {
        self.bytes_total() - self.acked
    }

    /// Advance the transmit cursor by `n` bytes. Returns the length of the
    /// request this completed, if it finished one.
    pub fn advance(&mut self, n: usize) -> Option<usize> {
        let buf_len = self.q.get(self.current)?.len();
        debug_assert!(self.offset + n <= buf_len);
        self.offset += n;
        if self.offset == buf_len {
            self.current += 1;
            self.offset = 0;
            return Some(buf_len);
        }
        None
    }

    /// Acknowledge `n` bytes from the front, releasing finished requests.
    pub fn acknowledge(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.q.front() else { break };
            let take = n.min(front.len() - self.acked);
            self.acked += take;
            n -= take;
            if self.acked == front.len() {
                self.q.pop_front();
                self.acked = 0;
                // cursors are relative to the queue front
                if self.current > 0 {
                    self.current -= 1;
                } else {
                    self.offset = 0;
                }
            }
        }
    }

    /// Drop everything, reporting how much of each queued request had been
    /// transmitted so the owner can fire the write callbacks.
    pub fn reset(&mut self) -> Vec<usize> {
        let mut written = Vec::with_capacity(self.q.len());
        for (i, buf) in self.q.iter().enumerate() {
            if i < self.current {
                written.push(buf.len());
            } else if i == self.current {
                written.push(self.offset);
            } else {
                written.push(0);
            }
        }
        self.q.clear();
        self.current = 0;
        self.offset = 0;
        self.acked = 0;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_completes_requests() {
        let mut wq = WriteQueue::new();
        wq.push_back(Bytes::from_static(b"aaaa"));
        wq.push_back(Bytes::from_static(b"bb"));
        assert_eq!(wq.bytes_remaining(), 6);

        assert_eq!(wq.advance(2), None);
        assert_eq!(wq.nxt_data(), b"aa");
        assert_eq!(wq.advance(2), Some(4));
        assert_eq!(wq.nxt_data(), b"bb");
        assert_eq!(wq.advance(2), Some(2));
        assert!(!wq.has_remaining_requests());
        assert_eq!(wq.bytes_remaining(), 0);
        // nothing acked yet: everything is retransmittable
        assert_eq!(wq.bytes_unacknowledged(), 6);
    }

    #[test]
    fn test_acknowledge_releases_front() {
        let mut wq = WriteQueue::new();
        wq.push_back(Bytes::from_static(b"aaaa"));
        wq.push_back(Bytes::from_static(b"bb"));
        wq.advance(4);
        wq.advance(2);

        wq.acknowledge(3);
        assert_eq!(wq.len(), 2);
        assert_eq!(wq.acked(), 3);
        wq.acknowledge(1);
        assert_eq!(wq.len(), 1);
        assert_eq!(wq.acked(), 0);
        wq.acknowledge(2);
        assert!(wq.is_empty());
        assert_eq!(wq.bytes_unacknowledged(), 0);
    }

    #[test]
    fn test_ack_keeps_transmit_cursor_aligned() {
        let mut wq = WriteQueue::new();
        wq.push_back(Bytes::from_static(b"aaaa"));
        wq.push_back(Bytes::from_static(b"bbbb"));
        wq.advance(4); // finished first buffer; current = 1
        wq.acknowledge(4); // first popped; current back to 0
        assert_eq!(wq.current(), 0);
        assert_eq!(wq.nxt_data(), b"bbbb");
    }

    #[test]
    fn test_reset_reports_written_bytes() {
        let mut wq = WriteQueue::new();
        wq.push_back(Bytes::from_static(b"aaaa"));
        wq.push_back(Bytes::from_static(b"bbbb"));
        wq.push_back(Bytes::from_static(b"cccc"));
        wq.advance(4);
        wq.advance(2);
        assert_eq!(wq.reset(), vec![4, 2, 0]);
        assert!(wq.is_empty());
    }
}
