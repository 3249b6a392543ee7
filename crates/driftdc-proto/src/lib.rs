//! # driftdc-proto
//!
//! Wire-level codecs for the Direct Connect protocol family.
//!
//! This crate provides:
//! - **NMDC**: `|`-terminated command framing, text escaping, the
//!   Lock→Key handshake transform, `$Search`/`$SR` encoding and decoding
//! - **ADC**: newline-terminated UTF-8 framing with session ids, argument
//!   escaping, feature-broadcast filters, and named-parameter helpers
//! - **Hub addresses**: `dchub://`/`adcs://`-style URL parsing with
//!   keyprint extraction
//! - **SUDP**: AES-128-CBC encryption of UDP search results
//!
//! Everything here is pure: no sockets, no state machines. Sessions live
//! in `driftdc-hub`, transport in `driftdc-net`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adc;
pub mod hubaddr;
pub mod nmdc;
pub mod sudp;

pub use adc::{AdcMessage, AdcType, Cid, Sid};
pub use hubaddr::{HubAddr, HubDialect};

/// What a search asks for. Shared by both dialect encoders and the file
/// list matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    /// Any file or directory name.
    Any,
    /// Audio files.
    Audio,
    /// Compressed archives.
    Archive,
    /// Documents.
    Doc,
    /// Executables.
    Exe,
    /// Images.
    Img,
    /// Video files.
    Video,
    /// Directories only.
    Dir,
    /// Exact Tiger tree root lookup.
    Tth,
}

/// Size constraint carried by a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeConstraint {
    /// No restriction.
    None,
    /// File must be at least this large.
    Min(u64),
    /// File must be at most this large.
    Max(u64),
}

/// Errors from the pure codecs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// An ADC line was empty or structurally malformed.
    #[error("malformed ADC message: {0}")]
    BadAdc(&'static str),
    /// An NMDC command could not be decoded.
    #[error("malformed NMDC command: {0}")]
    BadNmdc(&'static str),
    /// A hub address failed validation.
    #[error("invalid hub address: {0}")]
    BadAddr(&'static str),
}
