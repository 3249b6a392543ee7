//! # driftdc-filelist
//!
//! In-memory share model and search matching.
//!
//! This crate provides:
//! - **Share tree**: an arena of directories and files with cached
//!   aggregate sizes and case-insensitive unique child names
//! - **files.xml**: serialization to and from the ADC standard format,
//!   optionally bzip2-compressed
//! - **Search matching**: compiled predicates answering hub search
//!   requests against the local tree
//!
//! The tree is a pure data structure; it is consumed by the hub engine
//! (outbound search replies) and the transfer engine (local file lookup
//! by content hash).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod search;
pub mod tree;
pub mod xml;

pub use search::{Matcher, MatcherSpec, SizePred};
pub use tree::{FileList, LocalAttrs, NodeId, TreeError};

/// Maximum byte length of one path element.
pub const MAX_NAME_LEN: usize = 63;

/// Maximum element nesting accepted from a remote files.xml.
pub const MAX_XML_DEPTH: usize = 50;

/// Errors from parsing a remote file list.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    /// Underlying reader failure (I/O or decompression).
    #[error("file list read: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed XML.
    #[error("file list parse: {0}")]
    Parse(String),
    /// Structurally valid XML that violates the files.xml contract.
    #[error("file list invalid: {0}")]
    Invalid(&'static str),
}
