//! THEX tree construction over Tiger digests.
//!
//! A file is cut into 1024-byte segments; each segment hash is
//! `tiger(0x00 || data)` and interior nodes are
//! `tiger(0x01 || left || right)`. An odd node at any level is promoted
//! unchanged. A "block" is a power-of-two number of segments; the hash of
//! a block is the subtree root over its segments, so an array of block
//! hashes (the TTHL) rolls up to the file root with the same pairing rule.

use crate::{HASH_SIZE, LEAF_SIZE, MIN_BLOCK_SIZE, Root, TthError};
use digest::Digest;
use tiger::Tiger;

/// Hash a bottom-level segment (at most [`LEAF_SIZE`] bytes).
#[must_use]
pub fn leaf_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    debug_assert!(data.len() as u64 <= LEAF_SIZE);
    let mut h = Tiger::new();
    h.update([0u8]);
    h.update(data);
    h.finalize().into()
}

/// Combine two child hashes into their parent.
#[must_use]
pub fn internal_hash(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
    let mut h = Tiger::new();
    h.update([1u8]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Collapse one tree level: pairs combine, a trailing odd node is promoted.
fn combine_level(hashes: &[[u8; HASH_SIZE]]) -> Vec<[u8; HASH_SIZE]> {
    hashes
        .chunks(2)
        .map(|pair| {
            if pair.len() == 2 {
                internal_hash(&pair[0], &pair[1])
            } else {
                pair[0]
            }
        })
        .collect()
}

/// Roll a hash array up to the tree root.
///
/// An empty array yields the root of the empty file (the hash of a single
/// empty segment).
#[must_use]
pub fn root_from_leaves(leaves: &[[u8; HASH_SIZE]]) -> Root {
    if leaves.is_empty() {
        return Root(leaf_hash(&[]));
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = combine_level(&level);
    }
    Root(level[0])
}

/// Compute the tree root of an in-memory byte string.
#[must_use]
pub fn root_of(data: &[u8]) -> Root {
    let leaves: Vec<[u8; HASH_SIZE]> = if data.is_empty() {
        vec![leaf_hash(&[])]
    } else {
        data.chunks(LEAF_SIZE as usize).map(leaf_hash).collect()
    };
    root_from_leaves(&leaves)
}

/// Hash of a single block of file data at any power-of-two block size.
///
/// This is the subtree root over the block's 1024-byte segments and is
/// what a TTHL entry is compared against during download verification.
#[must_use]
pub fn block_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    root_of(data).0
}

/// Smallest power-of-two block size (≥ 1024) that covers `size` bytes in
/// at most `block_count` blocks.
#[must_use]
pub fn block_size(size: u64, block_count: u64) -> u64 {
    let mut bs = LEAF_SIZE;
    while block_count > 0 && bs.checked_mul(block_count).is_some_and(|c| c < size) {
        bs <<= 1;
    }
    bs
}

/// An owned TTHL: the array of 24-byte block hashes plus the block size
/// they describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaves {
    hashes: Vec<[u8; HASH_SIZE]>,
    block_size: u64,
}

impl Leaves {
    /// Wrap a raw leaf blob as received from a peer.
    ///
    /// # Errors
    ///
    /// Returns [`TthError::BadLeafLength`] if the blob is not a whole
    /// number of 24-byte hashes.
    pub fn from_bytes(blob: &[u8], file_size: u64) -> Result<Self, TthError> {
        if blob.is_empty() || blob.len() % HASH_SIZE != 0 {
            return Err(TthError::BadLeafLength(blob.len()));
        }
        let hashes: Vec<[u8; HASH_SIZE]> = blob
            .chunks_exact(HASH_SIZE)
            .map(|c| {
                let mut h = [0u8; HASH_SIZE];
                h.copy_from_slice(c);
                h
            })
            .collect();
        let block_size = block_size(file_size, hashes.len() as u64);
        Ok(Self { hashes, block_size })
    }

    /// A synthetic single-block array for files below the TTHL threshold:
    /// the lone block hash is the root itself.
    #[must_use]
    pub fn single(root: Root, file_size: u64) -> Self {
        Self {
            hashes: vec![root.0],
            block_size: file_size.max(1).next_power_of_two().max(LEAF_SIZE),
        }
    }

    /// Block hashes in file order.
    #[must_use]
    pub fn hashes(&self) -> &[[u8; HASH_SIZE]] {
        &self.hashes
    }

    /// The block size this array describes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// True when the array is empty (never the case for a valid TTHL).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Serialize back to the wire blob.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.hashes.len() * HASH_SIZE);
        for h in &self.hashes {
            out.extend_from_slice(h);
        }
        out
    }

    /// Verify that this array rolls up to `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TthError::RootMismatch`] when it does not; the caller
    /// marks the providing source INVTTHL.
    pub fn verify(&self, root: Root) -> Result<(), TthError> {
        if root_from_leaves(&self.hashes) == root {
            Ok(())
        } else {
            Err(TthError::RootMismatch)
        }
    }

    /// Compact the array in place by combining blocks in groups of four
    /// until the block size is at least [`MIN_BLOCK_SIZE`].
    ///
    /// One combining round always runs when more than one block remains,
    /// so an array entering at exactly the minimum still shrinks once.
    /// The root is unchanged by compaction.
    pub fn compact(&mut self) {
        loop {
            if self.hashes.len() <= 1 {
                break;
            }
            self.hashes = combine_level(&combine_level(&self.hashes));
            self.block_size = self.block_size.saturating_mul(4);
            if self.block_size >= MIN_BLOCK_SIZE {
                break;
            }
        }
    }
}

/// Check a raw leaf blob against a root without keeping the array.
///
/// # Errors
///
/// Propagates [`TthError::BadLeafLength`] and [`TthError::RootMismatch`].
pub fn verify_leaves(blob: &[u8], file_size: u64, root: Root) -> Result<Leaves, TthError> {
    let leaves = Leaves::from_bytes(blob, file_size)?;
    leaves.verify(root)?;
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_ROOT: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";

    #[test]
    fn empty_file_root_matches_reference() {
        assert_eq!(root_of(&[]).to_base32(), EMPTY_ROOT);
        assert_eq!(root_from_leaves(&[]).to_base32(), EMPTY_ROOT);
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let data = [0x42u8; 100];
        assert_eq!(root_of(&data).0, leaf_hash(&data));
    }

    #[test]
    fn two_leaves_combine() {
        let data = vec![7u8; 1536];
        let l0 = leaf_hash(&data[..1024]);
        let l1 = leaf_hash(&data[1024..]);
        assert_eq!(root_of(&data).0, internal_hash(&l0, &l1));
    }

    #[test]
    fn odd_leaf_promoted() {
        // Three segments: root = H(H(l0,l1), l2).
        let data = vec![9u8; 3 * 1024];
        let leaves: Vec<_> = data.chunks(1024).map(leaf_hash).collect();
        let expected = internal_hash(&internal_hash(&leaves[0], &leaves[1]), &leaves[2]);
        assert_eq!(root_of(&data).0, expected);
    }

    #[test]
    fn block_hash_equals_subtree_root() {
        let block = vec![3u8; 4096];
        let leaves: Vec<_> = block.chunks(1024).map(leaf_hash).collect();
        assert_eq!(block_hash(&block), root_from_leaves(&leaves).0);
    }

    #[test]
    fn block_size_bounds() {
        assert_eq!(block_size(1024, 1), 1024);
        assert_eq!(block_size(2048, 1), 2048);
        assert_eq!(block_size(2048, 2), 1024);
        // 10 MiB in at most 9 blocks needs 2 MiB blocks.
        assert_eq!(block_size(10 << 20, 9), 2 << 20);
        assert_eq!(block_size(0, 4), 1024);
    }

    #[test]
    fn leaves_roundtrip_and_verify() {
        let data = vec![0xABu8; 8 * 1024];
        let root = root_of(&data);
        let hashes: Vec<_> = data.chunks(1024).map(leaf_hash).collect();
        let mut blob = Vec::new();
        for h in &hashes {
            blob.extend_from_slice(h);
        }
        let leaves = verify_leaves(&blob, data.len() as u64, root).unwrap();
        assert_eq!(leaves.len(), 8);
        assert_eq!(leaves.block_size(), 1024);
        assert_eq!(leaves.to_bytes(), blob);
    }

    #[test]
    fn corrupt_leaves_rejected() {
        let data = vec![0xABu8; 4 * 1024];
        let root = root_of(&data);
        let mut blob: Vec<u8> = data.chunks(1024).flat_map(|c| leaf_hash(c)).collect();
        blob[0] ^= 0xFF;
        assert_eq!(
            verify_leaves(&blob, data.len() as u64, root).unwrap_err(),
            TthError::RootMismatch
        );
    }

    #[test]
    fn bad_leaf_length_rejected() {
        assert!(matches!(
            Leaves::from_bytes(&[0u8; 23], 1024),
            Err(TthError::BadLeafLength(23))
        ));
        assert!(matches!(
            Leaves::from_bytes(&[], 1024),
            Err(TthError::BadLeafLength(0))
        ));
    }

    #[test]
    fn compact_eight_one_mib_blocks_to_two() {
        // 8 MiB of data in 8 blocks of 1 MiB compacts to 2 blocks of
        // 4 MiB with the root unchanged.
        let data = vec![0x5Au8; 8 << 20];
        let root = root_of(&data);
        let hashes: Vec<_> = data.chunks(1 << 20).map(block_hash).collect();
        let mut blob = Vec::new();
        for h in &hashes {
            blob.extend_from_slice(h);
        }
        let mut leaves = Leaves::from_bytes(&blob, data.len() as u64).unwrap();
        assert_eq!(leaves.block_size(), 1 << 20);
        leaves.compact();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves.block_size(), 4 << 20);
        leaves.verify(root).unwrap();
    }

    #[test]
    fn compact_reaches_min_block_size() {
        // A 4 MiB file at 1024-byte granularity compacts to >= 1 MiB blocks.
        let data = vec![0xC3u8; 4 << 20];
        let root = root_of(&data);
        let hashes: Vec<_> = data.chunks(1024).map(leaf_hash).collect();
        let mut blob = Vec::new();
        for h in &hashes {
            blob.extend_from_slice(h);
        }
        let mut leaves = Leaves::from_bytes(&blob, data.len() as u64).unwrap();
        leaves.compact();
        assert!(leaves.block_size() >= MIN_BLOCK_SIZE);
        assert_eq!(leaves.len(), 4);
        leaves.verify(root).unwrap();
    }

    #[test]
    fn compact_single_block_is_noop() {
        let root = root_of(b"tiny");
        let mut leaves = Leaves::single(root, 4);
        leaves.compact();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves.hashes()[0], root.0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_leaf_rollup_matches_root(len in 0usize..16 * 1024) {
                let data = vec![0xEEu8; len];
                let leaves: Vec<_> = if data.is_empty() {
                    vec![leaf_hash(&[])]
                } else {
                    data.chunks(1024).map(leaf_hash).collect()
                };
                prop_assert_eq!(root_from_leaves(&leaves), root_of(&data));
            }

            #[test]
            fn prop_compaction_preserves_root(blocks in 1usize..64) {
                let hashes: Vec<[u8; HASH_SIZE]> = (0..blocks)
                    .map(|i| leaf_hash(&[i as u8]))
                    .collect();
                let root = root_from_leaves(&hashes);
                let mut blob = Vec::new();
                for h in &hashes {
                    blob.extend_from_slice(h);
                }
                let mut leaves =
                    Leaves::from_bytes(&blob, (blocks as u64) * 1024).unwrap();
                leaves.compact();
                prop_assert_eq!(root_from_leaves(leaves.hashes()), root);
            }

            #[test]
            fn prop_block_size_is_power_of_two(size in 1u64..1 << 32, count in 1u64..512) {
                let bs = block_size(size, count);
                prop_assert!(bs.is_power_of_two());
                prop_assert!(bs >= LEAF_SIZE);
                // Covers the file in at most `count` blocks.
                prop_assert!(size.div_ceil(bs) <= count.max(1));
            }
        }
    }
}
