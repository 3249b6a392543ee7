//! Segmented files: parallel chunks, block verification, durable
//! bitmaps.
//!
//! One [`SegmentedFile`] manages the incomplete file of one item. Bytes
//! arrive through per-thread chunk assignments; whenever a complete
//! block is buffered it is Tiger-tree hashed against the leaf array
//! before it is written, so only verified data ever reaches the disk
//! and the bitmap. On a mismatch the buffered bytes are discarded and
//! the bits stay clear.

use crate::TransferError;
use bitvec::prelude::{BitVec, Lsb0};
use driftdc_tth::{Leaves, Root, tree};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A chunk assignment handed to one download thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Assignment id, used to push data and to release.
    pub id: u64,
    /// First byte offset.
    pub offset: u64,
    /// Byte length.
    pub len: u64,
}

#[derive(Debug)]
struct ActiveChunk {
    id: u64,
    /// Next byte expected.
    pos: u64,
    /// Exclusive end of the assignment.
    end: u64,
    /// Bytes of the block currently being filled.
    buf: Vec<u8>,
}

/// The segmented download state of one item.
pub struct SegmentedFile {
    hash: Root,
    size: u64,
    leaves: Leaves,
    bitmap: BitVec<u8, Lsb0>,
    have: u64,
    file: File,
    path: PathBuf,
    active: Vec<ActiveChunk>,
    next_id: u64,
    allbusy: bool,
    dirty: bool,
}

impl SegmentedFile {
    /// Open (or create) the incomplete file, pre-sized to `size`, and
    /// restore the verified-block bitmap if one is provided.
    ///
    /// # Errors
    ///
    /// [`TransferError::IncompleteIo`] on any file failure.
    pub fn open(
        path: &Path,
        hash: Root,
        size: u64,
        leaves: Leaves,
        saved_bitmap: Option<&[u8]>,
    ) -> Result<Self, TransferError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(TransferError::IncompleteIo)?;
        file.set_len(size).map_err(TransferError::IncompleteIo)?;

        let blocks = Self::block_count(size, leaves.block_size());
        let mut bitmap: BitVec<u8, Lsb0> = BitVec::repeat(false, blocks);
        if let Some(saved) = saved_bitmap {
            let restored: BitVec<u8, Lsb0> = BitVec::from_slice(saved);
            for (i, bit) in restored.iter().by_vals().take(blocks).enumerate() {
                bitmap.set(i, bit);
            }
        }
        let mut have = 0;
        for i in bitmap.iter_ones() {
            have += Self::block_len_at(size, leaves.block_size(), i as u64);
        }

        Ok(Self {
            hash,
            size,
            leaves,
            bitmap,
            have,
            file,
            path: path.to_owned(),
            active: Vec::new(),
            next_id: 0,
            allbusy: false,
            dirty: false,
        })
    }

    fn block_count(size: u64, block_size: u64) -> usize {
        size.div_ceil(block_size).max(1) as usize
    }

    fn block_len_at(size: u64, block_size: u64, idx: u64) -> u64 {
        (size - idx * block_size).min(block_size)
    }

    /// Block size the leaf array describes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.leaves.block_size()
    }

    /// Confirmed bytes.
    #[must_use]
    pub fn have(&self) -> u64 {
        self.have
    }

    /// Number of download threads currently assigned.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.active.len()
    }

    /// Whether no unallocated chunk remains.
    #[must_use]
    pub fn allbusy(&self) -> bool {
        self.allbusy
    }

    /// Whether every block is verified.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.bitmap.all()
    }

    /// The bitmap bytes if verification progressed since the last call;
    /// the caller debounces the flush to durable storage.
    pub fn take_dirty_bitmap(&mut self) -> Option<Vec<u8>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.bitmap.clone().into_vec())
    }

    fn covered_by_active(&self, block: u64) -> bool {
        let bs = self.block_size();
        self.active
            .iter()
            .any(|c| c.pos / bs <= block && block * bs < c.end)
    }

    /// Assign the next chunk: the head of the first contiguous run of
    /// unverified, unassigned blocks, capped at `max_chunk` so parallel
    /// threads each get a bounded segment. Runs shorter than
    /// `min_chunk` are refused while other threads are active (tiny
    /// segments are not worth a connection). Returns `None` and sets
    /// all-busy when nothing is assignable.
    pub fn assign(&mut self, min_chunk: u64, max_chunk: u64) -> Option<Chunk> {
        let bs = self.block_size();
        let blocks = self.bitmap.len() as u64;
        let mut block = 0;
        while block < blocks {
            if self.bitmap[block as usize] || self.covered_by_active(block) {
                block += 1;
                continue;
            }
            let mut end = block;
            while end < blocks && !self.bitmap[end as usize] && !self.covered_by_active(end) {
                end += 1;
            }
            let offset = block * bs;
            let region = (end * bs).min(self.size) - offset;
            if region < min_chunk && !self.active.is_empty() {
                block = end;
                continue;
            }
            // Cap and re-align to a block boundary unless the cap
            // swallows the whole region anyway.
            let cap = max_chunk.max(min_chunk).max(bs);
            let len = if cap < region {
                (cap / bs).max(1) * bs
            } else {
                region
            };
            let id = self.next_id;
            self.next_id += 1;
            self.active.push(ActiveChunk {
                id,
                pos: offset,
                end: offset + len,
                buf: Vec::new(),
            });
            return Some(Chunk { id, offset, len });
        }
        self.allbusy = true;
        None
    }

    /// Release an assignment without finishing it; buffered unverified
    /// bytes are discarded and the range becomes assignable again.
    pub fn release(&mut self, chunk_id: u64) {
        self.active.retain(|c| c.id != chunk_id);
        self.allbusy = false;
    }

    /// Feed downloaded bytes for an assignment, verifying and
    /// persisting each completed block.
    ///
    /// # Errors
    ///
    /// [`TransferError::HashMismatch`] when a block fails verification
    /// (the chunk is released, its bits stay clear),
    /// [`TransferError::IncompleteIo`] on file failure,
    /// [`TransferError::Protocol`] on bytes past the assignment end.
    pub fn push(&mut self, chunk_id: u64, mut data: &[u8]) -> Result<(), TransferError> {
        let bs = self.block_size();
        let Some(slot) = self.active.iter().position(|c| c.id == chunk_id) else {
            return Err(TransferError::Protocol("data for unknown chunk".into()));
        };
        while !data.is_empty() {
            let (pos, end) = {
                let c = &self.active[slot];
                (c.pos, c.end)
            };
            if pos >= end {
                return Err(TransferError::Protocol(
                    "peer sent more bytes than requested".into(),
                ));
            }
            let block = pos / bs;
            let block_end = ((block + 1) * bs).min(self.size).min(end);
            let want = (block_end - pos) as usize;
            let take = want.min(data.len());
            self.active[slot].buf.extend_from_slice(&data[..take]);
            self.active[slot].pos += take as u64;
            data = &data[take..];

            if take == want {
                // Either a block boundary or the assignment tail.
                let full_block_end = ((block + 1) * bs).min(self.size);
                if self.active[slot].pos == full_block_end {
                    let buf = std::mem::take(&mut self.active[slot].buf);
                    self.commit_block(block, &buf).inspect_err(|_| {
                        self.release(chunk_id);
                    })?;
                } else {
                    // The assignment ends mid-block; the partial bytes
                    // cannot be verified and are dropped on release.
                }
            }
        }
        let finished = self.active[slot].pos >= self.active[slot].end;
        if finished {
            self.release(chunk_id);
        }
        Ok(())
    }

    fn commit_block(&mut self, block: u64, buf: &[u8]) -> Result<(), TransferError> {
        let expected = self.leaves.hashes()[block as usize];
        if tree::block_hash(buf) != expected {
            tracing::warn!(
                hash = %self.hash,
                block,
                "block failed tree verification, discarding"
            );
            return Err(TransferError::HashMismatch);
        }
        let offset = block * self.block_size();
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf))
            .map_err(TransferError::IncompleteIo)?;
        self.bitmap.set(block as usize, true);
        self.have += buf.len() as u64;
        self.dirty = true;
        Ok(())
    }

    /// Finish: fsync the incomplete file and rename it to `dest`.
    ///
    /// # Errors
    ///
    /// [`TransferError::IncompleteIo`] when the final sync fails,
    /// [`TransferError::DestIo`] when the rename (or destination
    /// directory creation) fails. The incomplete file is left in place
    /// on error.
    pub fn finish(self, dest: &Path) -> Result<(), TransferError> {
        debug_assert!(self.complete());
        self.file.sync_all().map_err(TransferError::IncompleteIo)?;
        drop(self.file);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(TransferError::DestIo)?;
        }
        std::fs::rename(&self.path, dest).map_err(TransferError::DestIo)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftdc_tth::tree::{block_hash, root_of};
    use tempfile::TempDir;

    /// Build (data, root, leaves) for a test file.
    fn fixture(len: usize, block_size: u64) -> (Vec<u8>, Root, Leaves) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let root = root_of(&data);
        let mut blob = Vec::new();
        for chunk in data.chunks(block_size as usize) {
            blob.extend_from_slice(&block_hash(chunk));
        }
        let leaves = Leaves::from_bytes(&blob, len as u64).unwrap();
        (data, root, leaves)
    }

    fn open_seg(dir: &TempDir, data_len: usize, bs: u64) -> (Vec<u8>, SegmentedFile) {
        let (data, root, leaves) = fixture(data_len, bs);
        let path = dir.path().join("incomplete");
        let seg = SegmentedFile::open(&path, root, data.len() as u64, leaves, None).unwrap();
        (data, seg)
    }

    #[test]
    fn single_thread_full_download() {
        let dir = TempDir::new().unwrap();
        let (data, mut seg) = open_seg(&dir, 10 * 1024, 4096);
        let chunk = seg.assign(0, u64::MAX).unwrap();
        assert_eq!(chunk.offset, 0);
        assert_eq!(chunk.len, data.len() as u64);
        seg.push(chunk.id, &data).unwrap();
        assert!(seg.complete());
        assert_eq!(seg.have(), data.len() as u64);

        let dest = dir.path().join("out/final.bin");
        seg.finish(&dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), data);
    }

    #[test]
    fn parallel_chunks_cover_disjoint_ranges() {
        let dir = TempDir::new().unwrap();
        let (data, mut seg) = open_seg(&dir, 16 * 1024, 4096);
        let a = seg.assign(4096, 8192).unwrap();
        assert_eq!((a.offset, a.len), (0, 8192));
        let b = seg.assign(4096, u64::MAX).unwrap();
        assert_eq!(b.offset, 8192);
        assert!(a.offset + a.len <= b.offset);
        seg.push(a.id, &data[a.offset as usize..(a.offset + a.len) as usize])
            .unwrap();
        seg.push(b.id, &data[b.offset as usize..(b.offset + b.len) as usize])
            .unwrap();
        assert!(seg.complete());
    }

    #[test]
    fn tiny_remainders_refused_while_threads_active() {
        let dir = TempDir::new().unwrap();
        let (_, mut seg) = open_seg(&dir, 8 * 1024, 1024);
        let first = seg.assign(0, u64::MAX).unwrap();
        assert_eq!(first.len, 8 * 1024);
        // Whole file assigned; nothing left.
        assert!(seg.assign(1024, u64::MAX).is_none());
        assert!(seg.allbusy());
        seg.release(first.id);
        assert!(!seg.allbusy());
        assert!(seg.assign(1024, u64::MAX).is_some());
    }

    #[test]
    fn corrupt_block_is_rejected_and_range_reassignable() {
        let dir = TempDir::new().unwrap();
        let (data, mut seg) = open_seg(&dir, 4096, 1024);
        let chunk = seg.assign(0, u64::MAX).unwrap();
        let mut bad = data.clone();
        bad[0] ^= 0xFF;
        let err = seg.push(chunk.id, &bad[..1024]).unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch));
        assert_eq!(seg.have(), 0);
        assert_eq!(seg.active_threads(), 0);
        // The range is assignable again and correct data succeeds.
        let chunk = seg.assign(0, u64::MAX).unwrap();
        seg.push(chunk.id, &data).unwrap();
        assert!(seg.complete());
    }

    #[test]
    fn bitmap_survives_restart() {
        let dir = TempDir::new().unwrap();
        let (data, root, leaves) = fixture(8 * 1024, 1024);
        let path = dir.path().join("incomplete");
        let saved = {
            let mut seg =
                SegmentedFile::open(&path, root, data.len() as u64, leaves.clone(), None).unwrap();
            let chunk = seg.assign(0, 4096).unwrap();
            // Download only half the file.
            seg.push(chunk.id, &data[..4096]).unwrap();
            assert_eq!(seg.have(), 4096);
            seg.take_dirty_bitmap().unwrap()
        };
        let mut seg =
            SegmentedFile::open(&path, root, data.len() as u64, leaves, Some(&saved)).unwrap();
        assert_eq!(seg.have(), 4096);
        // Only the second half is assignable.
        let chunk = seg.assign(0, u64::MAX).unwrap();
        assert_eq!(chunk.offset, 4096);
        seg.push(chunk.id, &data[4096..]).unwrap();
        assert!(seg.complete());
    }

    #[test]
    fn synthetic_single_block_verifies_whole_file() {
        // Files below the TTHL threshold: one block, hash == root.
        let dir = TempDir::new().unwrap();
        let data = vec![0x3Cu8; 5000];
        let root = root_of(&data);
        let leaves = Leaves::single(root, data.len() as u64);
        let path = dir.path().join("incomplete");
        let mut seg =
            SegmentedFile::open(&path, root, data.len() as u64, leaves, None).unwrap();
        let chunk = seg.assign(0, u64::MAX).unwrap();
        seg.push(chunk.id, &data).unwrap();
        assert!(seg.complete());
    }

    #[test]
    fn dirty_bitmap_only_after_progress() {
        let dir = TempDir::new().unwrap();
        let (data, mut seg) = open_seg(&dir, 2048, 1024);
        assert!(seg.take_dirty_bitmap().is_none());
        let chunk = seg.assign(0, u64::MAX).unwrap();
        seg.push(chunk.id, &data[..1024]).unwrap();
        assert!(seg.take_dirty_bitmap().is_some());
        assert!(seg.take_dirty_bitmap().is_none());
    }

    #[test]
    fn release_discards_partial_block() {
        let dir = TempDir::new().unwrap();
        let (data, mut seg) = open_seg(&dir, 4096, 4096);
        let chunk = seg.assign(0, u64::MAX).unwrap();
        seg.push(chunk.id, &data[..100]).unwrap();
        seg.release(chunk.id);
        assert_eq!(seg.have(), 0);
        // Full retry works.
        let chunk = seg.assign(0, u64::MAX).unwrap();
        seg.push(chunk.id, &data).unwrap();
        assert!(seg.complete());
    }
}
