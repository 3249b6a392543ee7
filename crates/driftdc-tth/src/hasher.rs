//! Streaming tree hasher.
//!
//! Feeds arbitrary-sized buffers and produces the file root together with
//! the block hash array at a chosen power-of-two block size. Used when
//! hashing the local share and when re-verifying downloaded ranges.

use crate::tree::{leaf_hash, root_from_leaves};
use crate::{HASH_SIZE, LEAF_SIZE, Root};

/// Incremental tree hasher.
///
/// Segment hashes are computed as data arrives; whenever a full block of
/// segments is available it is collapsed to its block hash, so memory use
/// is bounded by one block's worth of segment hashes.
pub struct TthHasher {
    block_size: u64,
    /// Segment hashes of the block currently being filled.
    pending: Vec<[u8; HASH_SIZE]>,
    /// Completed block hashes.
    blocks: Vec<[u8; HASH_SIZE]>,
    /// Partial bottom-level segment.
    buf: Vec<u8>,
    total: u64,
}

impl TthHasher {
    /// Create a hasher producing block hashes of `block_size` bytes.
    ///
    /// `block_size` must be a power of two and at least [`LEAF_SIZE`].
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        debug_assert!(block_size.is_power_of_two() && block_size >= LEAF_SIZE);
        Self {
            block_size,
            pending: Vec::new(),
            blocks: Vec::new(),
            buf: Vec::with_capacity(LEAF_SIZE as usize),
            total: 0,
        }
    }

    fn segments_per_block(&self) -> usize {
        (self.block_size / LEAF_SIZE) as usize
    }

    fn push_segment(&mut self, hash: [u8; HASH_SIZE]) {
        self.pending.push(hash);
        if self.pending.len() == self.segments_per_block() {
            self.blocks.push(root_from_leaves(&self.pending).0);
            self.pending.clear();
        }
    }

    /// Feed more file data.
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        if !self.buf.is_empty() {
            let want = LEAF_SIZE as usize - self.buf.len();
            let take = want.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == LEAF_SIZE as usize {
                let seg = std::mem::take(&mut self.buf);
                self.push_segment(leaf_hash(&seg));
            }
        }
        while data.len() >= LEAF_SIZE as usize {
            let (seg, rest) = data.split_at(LEAF_SIZE as usize);
            self.push_segment(leaf_hash(seg));
            data = rest;
        }
        self.buf.extend_from_slice(data);
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    /// Finish, returning the file root and the block hash array.
    #[must_use]
    pub fn finalize(mut self) -> (Root, Vec<[u8; HASH_SIZE]>) {
        if !self.buf.is_empty() || (self.total == 0 && self.blocks.is_empty()) {
            let seg = std::mem::take(&mut self.buf);
            self.pending.push(leaf_hash(&seg));
        }
        if !self.pending.is_empty() {
            self.blocks.push(root_from_leaves(&self.pending).0);
        }
        let root = root_from_leaves(&self.blocks);
        (root, self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{block_hash, root_of};

    #[test]
    fn empty_input_yields_empty_root() {
        let (root, blocks) = TthHasher::new(1024).finalize();
        assert_eq!(
            root.to_base32(),
            "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"
        );
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn matches_batch_root_across_split_points() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = root_of(&data);
        for step in [1usize, 7, 1024, 1500, 4096] {
            let mut h = TthHasher::new(4096);
            for chunk in data.chunks(step) {
                h.update(chunk);
            }
            let (root, _) = h.finalize();
            assert_eq!(root, expected, "split step {step}");
        }
    }

    #[test]
    fn block_hashes_match_direct_computation() {
        let data = vec![0x17u8; 9 * 1024];
        let mut h = TthHasher::new(4096);
        h.update(&data);
        let (root, blocks) = h.finalize();
        assert_eq!(root, root_of(&data));
        assert_eq!(blocks.len(), 3);
        for (i, chunk) in data.chunks(4096).enumerate() {
            assert_eq!(blocks[i], block_hash(chunk));
        }
    }

    #[test]
    fn bytes_hashed_counts_input() {
        let mut h = TthHasher::new(1024);
        h.update(&[0u8; 100]);
        h.update(&[0u8; 924]);
        h.update(&[0u8; 1]);
        assert_eq!(h.bytes_hashed(), 1025);
    }
}
