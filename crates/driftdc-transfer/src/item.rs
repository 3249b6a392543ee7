//! Queue items, priorities and persisted error codes.

use digest::Digest;
use driftdc_hub::Uid;
use driftdc_tth::{Leaves, Root};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tiger::Tiger;

/// Persisted per-item / per-source error codes. The numeric values are
/// part of the on-disk format and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i8)]
pub enum DlError {
    /// No error.
    #[default]
    None = 0,
    /// The source sent a leaf array that does not root to the hash.
    InvTthl = 1,
    /// The source does not have the file.
    NoFile = 2,
    /// I/O failure on the incomplete file.
    IoInc = 3,
    /// I/O failure moving to the destination.
    IoDest = 4,
    /// Content failed hash verification.
    Hash = 5,
}

impl DlError {
    /// Decode a persisted value.
    #[must_use]
    pub fn from_code(code: i8) -> Self {
        match code {
            1 => DlError::InvTthl,
            2 => DlError::NoFile,
            3 => DlError::IoInc,
            4 => DlError::IoDest,
            5 => DlError::Hash,
            _ => DlError::None,
        }
    }

    /// The persisted value.
    #[must_use]
    pub fn code(self) -> i8 {
        self as i8
    }
}

/// Item priority. `Off` and `Err` are administrative states persisted in
/// the same field, below every real priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Disabled after a fatal item error (persisted -65).
    Err,
    /// Administratively paused (persisted -64).
    Off,
    /// Persisted -2.
    VeryLow,
    /// Persisted -1.
    Low,
    /// Persisted 0.
    Medium,
    /// Persisted +1.
    High,
    /// Persisted +2.
    VeryHigh,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// Decode a persisted value.
    #[must_use]
    pub fn from_code(code: i8) -> Self {
        match code {
            -65 => Priority::Err,
            -64 => Priority::Off,
            i8::MIN..=-2 => Priority::VeryLow,
            -1 => Priority::Low,
            0 => Priority::Medium,
            1 => Priority::High,
            _ => Priority::VeryHigh,
        }
    }

    /// The persisted value.
    #[must_use]
    pub fn code(self) -> i8 {
        match self {
            Priority::Err => -65,
            Priority::Off => -64,
            Priority::VeryLow => -2,
            Priority::Low => -1,
            Priority::Medium => 0,
            Priority::High => 1,
            Priority::VeryHigh => 2,
        }
    }

    /// Whether items at this priority may be scheduled at all.
    #[must_use]
    pub fn enabled(self) -> bool {
        !matches!(self, Priority::Err | Priority::Off)
    }
}

/// The pseudo-hash keying a peer's file list in the queue:
/// `tiger(uid)`.
#[must_use]
pub fn filelist_hash(uid: Uid) -> Root {
    let mut h = Tiger::new();
    h.update(uid.0.to_be_bytes());
    Root(h.finalize().into())
}

/// Per-source state within an item.
#[derive(Debug, Clone, Default)]
pub struct SourceState {
    /// Source-local error; a demoted source sinks in the ordering but
    /// other sources stay usable.
    pub error: DlError,
    /// Human-readable error detail.
    pub error_msg: Option<String>,
}

/// A queue item: one destination file we want.
#[derive(Debug, Clone)]
pub struct DlItem {
    /// Content hash: TTH root for files, [`filelist_hash`] for lists.
    pub hash: Root,
    /// Total size; file lists use 0 until known.
    pub size: u64,
    /// Scheduling priority.
    pub priority: Priority,
    /// Item-level error.
    pub error: DlError,
    /// Item-level error detail.
    pub error_msg: Option<String>,
    /// Final destination.
    pub dest: PathBuf,
    /// Whether this is a peer file list.
    pub islist: bool,
    /// Verified leaf array, once fetched.
    pub tthl: Option<Leaves>,
    /// Confirmed bytes.
    pub have: u64,
    /// Candidate sources.
    pub sources: HashMap<Uid, SourceState>,
    /// No unallocated chunk is available right now.
    pub allbusy: bool,
}

impl DlItem {
    /// New item with no sources.
    #[must_use]
    pub fn new(hash: Root, size: u64, dest: PathBuf, islist: bool) -> Self {
        Self {
            hash,
            size,
            priority: Priority::default(),
            error: DlError::None,
            error_msg: None,
            dest,
            islist,
            tthl: None,
            have: 0,
            sources: HashMap::new(),
            allbusy: false,
        }
    }

    /// The incomplete-file path inside `incoming`: the base32 hash, so
    /// the name is stable across restarts.
    #[must_use]
    pub fn incoming_path(&self, incoming: &Path) -> PathBuf {
        incoming.join(self.hash.to_base32())
    }

    /// Whether the item is fully downloaded.
    #[must_use]
    pub fn complete(&self) -> bool {
        !self.islist && self.size > 0 && self.have >= self.size
    }

    /// Whether this item can be scheduled for `uid` right now.
    #[must_use]
    pub fn enabled_for(&self, uid: Uid) -> bool {
        self.priority.enabled()
            && self.error == DlError::None
            && !self.complete()
            && self
                .sources
                .get(&uid)
                .is_some_and(|s| s.error == DlError::None)
    }
}
