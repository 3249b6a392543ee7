//! The typed runtime configuration the core consumes.
//!
//! The CLI loads its TOML file into this; every field maps to one of
//! the recognized option names. Changes arrive through
//! [`crate::Core::set_config`], which fans out the side effects (slot
//! table reconfiguration, bucket rate updates, a scheduler kick).

use driftdc_hub::hub::SudpPolicy;
use std::net::IpAddr;
use std::path::PathBuf;

/// Bits of the `flush_file_cache` mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushFileCache {
    /// Drop pages of files we finished downloading.
    pub download: bool,
    /// Drop pages of files we uploaded.
    pub upload: bool,
    /// Drop pages of files we hashed.
    pub hash: bool,
}

/// Global configuration (per-hub options live on the hub entries).
#[derive(Debug, Clone)]
pub struct Config {
    /// Default session identity.
    pub nick: String,
    /// Active mode: accept incoming peer connections.
    pub active: bool,
    /// Routable address announced in active mode.
    pub active_ip: Option<IpAddr>,
    /// TCP listen port (0 = ephemeral).
    pub active_port: u16,
    /// UDP search port (0 = same as `active_port`).
    pub active_udp_port: u16,
    /// Local bind address for outgoing connections.
    pub local_address: Option<IpAddr>,
    /// Concurrent download slots.
    pub download_slots: u32,
    /// Global download rate in bytes/s (0 = unlimited).
    pub download_rate: u64,
    /// Global upload rate in bytes/s (0 = unlimited).
    pub upload_rate: u64,
    /// Hashing rate in bytes/s (0 = unlimited).
    pub hash_rate: u64,
    /// Minimum chunk handed to a download thread.
    pub download_segment: u64,
    /// Upload slots.
    pub upload_slots: u32,
    /// Minislots for small files and lists.
    pub minislots: u32,
    /// Largest file served from a minislot.
    pub minislot_size: u64,
    /// Concurrent uploads allowed per user (0 = unlimited).
    pub max_ul_per_user: u32,
    /// Drop idle peer connections when the user goes offline.
    pub disconnect_offline: bool,
    /// Hub reconnect delay in seconds (0 disables).
    pub reconnect_timeout: u64,
    /// SUDP policy.
    pub sudp_policy: SudpPolicy,
    /// Age in seconds before a fetched peer file list is re-downloaded.
    pub filelist_maxage: u64,
    /// Share hidden files.
    pub share_hidden: bool,
    /// Follow symlinks while sharing.
    pub share_symlinks: bool,
    /// Keep empty directories in the share.
    pub share_emptydirs: bool,
    /// Regex of share paths to exclude.
    pub share_exclude: Option<String>,
    /// Regex of download names to skip when queueing whole directories.
    pub download_exclude: Option<String>,
    /// Skip queueing files that are already shared.
    pub download_shared: bool,
    /// Page cache advice mask.
    pub flush_file_cache: FlushFileCache,
    /// Shared directories: virtual name to disk path.
    pub share_dirs: Vec<(String, PathBuf)>,
    /// Directory for incomplete files.
    pub incoming_dir: PathBuf,
    /// Directory finished downloads land in.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nick: format!("driftdc{:04}", rand::random::<u16>() % 10000),
            active: false,
            active_ip: None,
            active_port: 0,
            active_udp_port: 0,
            local_address: None,
            download_slots: 3,
            download_rate: 0,
            upload_rate: 0,
            hash_rate: 0,
            download_segment: driftdc_transfer::DEFAULT_MIN_CHUNK,
            upload_slots: 2,
            minislots: 3,
            minislot_size: 64 * 1024,
            max_ul_per_user: 1,
            disconnect_offline: false,
            reconnect_timeout: 30,
            sudp_policy: SudpPolicy::default(),
            filelist_maxage: 7 * 24 * 3600,
            share_hidden: false,
            share_symlinks: false,
            share_emptydirs: false,
            share_exclude: None,
            download_exclude: None,
            download_shared: false,
            flush_file_cache: FlushFileCache::default(),
            share_dirs: Vec::new(),
            incoming_dir: PathBuf::from("inc"),
            download_dir: PathBuf::from("dl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = Config::default();
        assert!(cfg.nick.starts_with("driftdc"));
        assert!(cfg.download_slots > 0);
        assert_eq!(cfg.reconnect_timeout, 30);
        assert!(!cfg.active);
    }
}
