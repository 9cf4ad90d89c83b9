//! Selective-acknowledgement block list (RFC 2018), receiver side.
//!
//! At most three non-overlapping blocks of received-but-not-contiguous
//! sequence space, kept most-recently-touched first so the freshest block
//! always makes it into the limited option space. A block arriving when
//! the list is full is silently discarded; the sender sees no progress and
//! retransmits, which matches observed wire behavior.

use crate::util::{seq_ge, seq_le};

/// Maximum number of blocks kept (and advertised).
pub const MAX_BLOCKS: usize = 3;

/// One contiguous block `[start, end)` of received sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block {
    pub start: u32,
    pub end: u32,
}

impl Block {
    pub fn new(start: u32, end: u32) -> Self {
        Block { start, end }
    }

    pub fn size(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, seq: u32) -> bool {
        seq_ge(seq, self.start) && seq_le(seq, self.end)
    }

    /// `other` ends exactly where we begin.
    pub fn connects_start(&self, other: &Block) -> bool {
        other.end == self.start
    }

    /// `other` begins exactly where we end.
    pub fn connects_end(&self, other: &Block) -> bool {
        other.start == self.end
    }
}

/// Progress report from a list operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckResult {
    /// Bytes the caller may count as newly buffered / newly freed.
    pub length: usize,
    /// Size of the block that grew or was released.
    pub blocksize: u32,
}

/// The receiver's out-of-order block list.
#[derive(Debug, Default)]
pub struct SackList {
    /// Most-recently-touched first.
    blocks: Vec<Block>,
}

impl SackList {
    pub fn new() -> Self {
        SackList { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.blocks.iter().any(|b| b.contains(seq))
    }

    /// The blocks to advertise, freshest first.
    pub fn recent_entries(&self) -> Vec<Block> {
        self.blocks.iter().take(MAX_BLOCKS).copied().collect()
    }

    /// Record out-of-order data `[seq, seq+len)`.
    ///
    /// Assumes no overlap with existing blocks (the read buffer rejects
    /// overlapping inserts first). Returns zero progress when the list is
    /// full and the data connects to nothing.
    pub fn recv_out_of_order(&mut self, seq: u32, len: usize) -> AckResult {
        let blk = Block::new(seq, seq.wrapping_add(len as u32));

        let mut connects_end = None;
        let mut connects_start = None;
        for (i, b) in self.blocks.iter().enumerate() {
            if b.connects_end(&blk) {
                connects_end = Some(i);
            } else if b.connects_start(&blk) {
                connects_start = Some(i);
            }
            if connects_end.is_some() && connects_start.is_some() {
                break;
            }
        }

        match (connects_end, connects_start) {
            (Some(e), start) => {
                self.blocks[e].end = blk.end;
                if let Some(s) = start {
                    // The new data bridges two blocks.
                    self.blocks[e].end = self.blocks[s].end;
                    self.blocks.remove(s);
                    // removal may have shifted the extended block
                    let e = if s < e { e - 1 } else { e };
                    self.move_to_front(e);
                } else {
                    self.move_to_front(e);
                }
            }
            (None, Some(s)) => {
                self.blocks[s].start = blk.start;
                self.move_to_front(s);
            }
            (None, None) => {
                if self.blocks.len() == MAX_BLOCKS {
                    // Full: silent drop, no progress reported.
                    return AckResult {
                        length: 0,
                        blocksize: 0,
                    };
                }
                self.blocks.insert(0, blk);
            }
        }
        AckResult {
            length: len,
            blocksize: blk.size(),
        }
    }

    /// RCV.NXT advanced to `seq + len`: release any block it swallowed.
    /// The returned `length` is the part of `len` not already covered by
    /// the released block (zero unless the advance was partial).
    pub fn new_valid_ack(&mut self, seq: u32, len: usize) -> AckResult {
        let ack = seq.wrapping_add(len as u32);
        let mut length = len;
        let mut blocksize = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            if b.contains(ack) {
                blocksize = b.size();
                length -= ack.wrapping_sub(b.start) as usize;
                self.blocks.remove(i);
                break;
            }
        }
        AckResult { length, blocksize }
    }

    fn move_to_front(&mut self, index: usize) {
        if index > 0 {
            let b = self.blocks.remove(index);
            self.blocks.insert(0, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_block_goes_in_front() {
        let mut list = SackList::new();
        list.recv_out_of_order(1000, 100);
        list.recv_out_of_order(3000, 100);
        let entries = list.recent_entries();
        assert_eq!(entries[0], Block::new(3000, 3100));
        assert_eq!(entries[1], Block::new(1000, 1100));
    }

    #[test]
    fn test_extend_at_end() {
        let mut list = SackList::new();
        list.recv_out_of_order(1000, 100);
        let r = list.recv_out_of_order(1100, 50);
        assert_eq!(r, AckResult { length: 50, blocksize: 50 });
        assert_eq!(list.recent_entries(), vec![Block::new(1000, 1150)]);
    }

    #[test]
    fn test_extend_at_start() {
        let mut list = SackList::new();
        list.recv_out_of_order(1000, 100);
        list.recv_out_of_order(900, 100);
        assert_eq!(list.recent_entries(), vec![Block::new(900, 1100)]);
    }

    #[test]
    fn test_fill_gap_merges_blocks() {
        let mut list = SackList::new();
        list.recv_out_of_order(1000, 100); // [1000,1100)
        list.recv_out_of_order(1200, 100); // [1200,1300)
        list.recv_out_of_order(1100, 100); // bridges
        assert_eq!(list.len(), 1);
        assert_eq!(list.recent_entries(), vec![Block::new(1000, 1300)]);
    }

    #[test]
    fn test_overflow_silently_dropped() {
        let mut list = SackList::new();
        list.recv_out_of_order(1000, 10);
        list.recv_out_of_order(2000, 10);
        list.recv_out_of_order(3000, 10);
        let r = list.recv_out_of_order(4000, 10);
        assert_eq!(r, AckResult { length: 0, blocksize: 0 });
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_valid_ack_releases_block() {
        let mut list = SackList::new();
        list.recv_out_of_order(1000, 100);
        // contiguous data [900,1000) arrives; rcv.nxt jumps over the block
        let r = list.new_valid_ack(900, 100);
        assert_eq!(r.blocksize, 100);
        assert_eq!(r.length, 100);
        assert!(list.is_empty());
    }

    #[test]
    fn test_valid_ack_without_block() {
        let mut list = SackList::new();
        let r = list.new_valid_ack(500, 50);
        assert_eq!(r, AckResult { length: 50, blocksize: 0 });
    }

    #[test]
    fn test_contains_and_wraparound() {
        let mut list = SackList::new();
        list.recv_out_of_order(u32::MAX - 10, 20);
        assert!(list.contains(u32::MAX));
        assert!(list.contains(5));
        assert!(!list.contains(100));
    }
}
