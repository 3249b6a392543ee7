//! # driftdc-tth
//!
//! Tiger tree hashing (TTH) for the Direct Connect protocols.
//!
//! This crate provides:
//! - **Root type**: 24-byte tree root with the wire base32 encoding
//! - **Tree construction**: THEX-compatible leaf and internal node hashing
//! - **Leaf arrays (TTHL)**: verification against a root and in-place
//!   compaction to larger block sizes
//! - **Streaming hasher**: incremental hashing of file data at a chosen
//!   block size
//!
//! Roots produced here are byte-identical to those of existing DC
//! implementations: 1024-byte leaf segments, a `0x00` prefix on leaf
//! hashes, a `0x01` prefix on internal nodes, and odd nodes promoted
//! unchanged to the next level.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hasher;
pub mod tree;

pub use hasher::TthHasher;
pub use tree::{Leaves, block_size, root_from_leaves, verify_leaves};

use data_encoding::BASE32_NOPAD;
use std::fmt;
use std::str::FromStr;

/// Size of a bottom-level hash segment in bytes.
pub const LEAF_SIZE: u64 = 1024;

/// Smallest block size kept after leaf compaction (1 MiB).
pub const MIN_BLOCK_SIZE: u64 = 1024 * 1024;

/// Files smaller than this are downloaded without a leaf array; the
/// synthetic single block hash equals the root (2 MiB).
pub const MIN_TTHL_SIZE: u64 = 2 * 1024 * 1024;

/// Byte length of a Tiger digest.
pub const HASH_SIZE: usize = 24;

/// Errors from parsing or validating tree hash material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TthError {
    /// A base32 root string had the wrong length or alphabet.
    #[error("invalid TTH root encoding")]
    BadRoot,
    /// A leaf blob's length is not a multiple of the hash size.
    #[error("leaf data length {0} is not a multiple of {HASH_SIZE}")]
    BadLeafLength(usize),
    /// Rolling the leaves up did not reproduce the expected root.
    #[error("leaf array does not match root")]
    RootMismatch,
}

/// A 24-byte Tiger tree root.
///
/// Displayed and parsed in the 39-character unpadded base32 form used on
/// the wire (`LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ` is the root of the
/// empty file).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Root(pub [u8; HASH_SIZE]);

impl Root {
    /// Root consisting of all zero bytes, used as a placeholder.
    pub const ZERO: Root = Root([0u8; HASH_SIZE]);

    /// Encode to the 39-character base32 wire form.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Decode from the 39-character base32 wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TthError::BadRoot`] unless the input is exactly 39
    /// characters of the base32 alphabet decoding to 24 bytes.
    pub fn from_base32(s: &str) -> Result<Self, TthError> {
        if s.len() != 39 {
            return Err(TthError::BadRoot);
        }
        let bytes = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| TthError::BadRoot)?;
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| TthError::BadRoot)?;
        Ok(Root(arr))
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({})", self.to_base32())
    }
}

impl FromStr for Root {
    type Err = TthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Root::from_base32(s)
    }
}
