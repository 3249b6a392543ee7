//! # driftdc-transfer
//!
//! The download side of the client: queue, scheduler, segmented
//! transfers with tree-hash verification, and the client-client wire
//! protocol for both dialects.
//!
//! This crate provides:
//! - **Queue model**: items keyed by content hash, per-(item × user)
//!   sources with their own error state, persisted through the
//!   [`store::DlStore`] collaborator
//! - **Scheduler**: per-user `NCO → EXP → IDL ⇄ ACT → WAI` machines, a
//!   debounced needs-start scan, and global download-slot accounting
//! - **Segmented engine**: parallel block-aligned chunks, incremental
//!   Tiger-tree verification, durable bitmaps, rename-on-completion
//! - **Peer connections**: NMDC and ADC client-client handshakes,
//!   TTHL and file-range requests, and upload serving with
//!   slot/minislot fairness

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod item;
pub mod peer;
pub mod queue;
pub mod sched;
pub mod segment;
pub mod store;

pub use item::{DlError, DlItem, Priority};
pub use queue::{Queue, UserState};
pub use sched::{SchedAction, Scheduler};
pub use segment::SegmentedFile;
pub use store::{DlStore, JsonStore, MemStore};

/// Debounce interval between scheduler scans.
pub const SCAN_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

/// How long a user sits in WAI after a failure before reconnecting.
pub const WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Default minimum chunk the scheduler will hand to a thread (the
/// `download_segment` option overrides it).
pub const DEFAULT_MIN_CHUNK: u64 = 1024 * 1024;

/// Errors crossing the transfer layer's seams.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Transport failure from the networking substrate.
    #[error(transparent)]
    Net(#[from] driftdc_net::NetError),
    /// The peer violated the client-client protocol.
    #[error("peer protocol error: {0}")]
    Protocol(String),
    /// The peer reports no free upload slots.
    #[error("peer has no free slots")]
    NoSlots,
    /// The peer does not have the requested file.
    #[error("file not available from peer")]
    NoFile,
    /// Local storage failure on the incomplete file.
    #[error("incomplete file I/O: {0}")]
    IncompleteIo(std::io::Error),
    /// Local storage failure while renaming to the destination.
    #[error("destination I/O: {0}")]
    DestIo(std::io::Error),
    /// A block failed tree-hash verification.
    #[error("block hash mismatch")]
    HashMismatch,
    /// The leaf array a peer sent does not root to the item hash.
    #[error("TTHL does not match root")]
    BadTthl,
}
