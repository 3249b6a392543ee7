//! Hub users and uid derivation.
//!
//! A peer is identified process-wide by a 64-bit uid derived from the
//! hub id and the peer's stable identity (ADC CID, NMDC nick). The same
//! physical peer on two hubs gets two distinct uids on purpose: slots,
//! queues and errors are tracked per hub relationship.

use digest::Digest;
use driftdc_proto::adc::{Cid, Sid};
use std::fmt;
use tiger::Tiger;

/// Process-unique peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn uid_digest(hub_id: u64, identity: &[u8]) -> Uid {
    let mut h = Tiger::new();
    h.update(hub_id.to_be_bytes());
    h.update(identity);
    let digest = h.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    Uid(u64::from_be_bytes(first))
}

/// uid of an ADC peer: first 8 bytes of `tiger(hub_id || CID)`.
#[must_use]
pub fn uid_from_cid(hub_id: u64, cid: &Cid) -> Uid {
    uid_digest(hub_id, &cid.0)
}

/// uid of an NMDC peer: first 8 bytes of `tiger(hub_id || nick)`.
#[must_use]
pub fn uid_from_nick(hub_id: u64, nick: &str) -> Uid {
    uid_digest(hub_id, nick.as_bytes())
}

/// A peer as known through one hub.
#[derive(Debug, Clone)]
pub struct HubUser {
    /// Process-unique id.
    pub uid: Uid,
    /// Hub this user was seen on.
    pub hub_id: u64,
    /// Display name.
    pub nick: String,
    /// ADC session id, absent on NMDC.
    pub sid: Option<Sid>,
    /// ADC client id, absent on NMDC.
    pub cid: Option<Cid>,
    /// Whether the peer accepts incoming connections.
    pub active: bool,
    /// Whether the peer supports TLS client connections.
    pub tls: bool,
    /// Whether the peer supports encrypted UDP search results.
    pub sudp: bool,
    /// Advertised share size in bytes.
    pub share: u64,
    /// Free upload slots, when known.
    pub slots_free: u32,
    /// Advertised IPv4 address, when known.
    pub ip: Option<std::net::IpAddr>,
    /// Advertised UDP search port, when known.
    pub udp_port: Option<u16>,
}

impl HubUser {
    /// New NMDC user from a nick.
    #[must_use]
    pub fn from_nick(hub_id: u64, nick: &str) -> Self {
        Self {
            uid: uid_from_nick(hub_id, nick),
            hub_id,
            nick: nick.to_owned(),
            sid: None,
            cid: None,
            active: false,
            tls: false,
            sudp: false,
            share: 0,
            slots_free: 0,
            ip: None,
            udp_port: None,
        }
    }

    /// New ADC user from a session id and CID.
    #[must_use]
    pub fn from_adc(hub_id: u64, sid: Sid, cid: &Cid, nick: &str) -> Self {
        Self {
            uid: uid_from_cid(hub_id, cid),
            hub_id,
            nick: nick.to_owned(),
            sid: Some(sid),
            cid: Some(*cid),
            active: false,
            tls: false,
            sudp: false,
            share: 0,
            slots_free: 0,
            ip: None,
            udp_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_are_deterministic() {
        assert_eq!(uid_from_nick(1, "alice"), uid_from_nick(1, "alice"));
        let cid = Cid([3u8; 24]);
        assert_eq!(uid_from_cid(9, &cid), uid_from_cid(9, &cid));
    }

    #[test]
    fn uids_differ_across_hubs() {
        // The same peer on two hubs is two HubUsers with two uids.
        assert_ne!(uid_from_nick(1, "alice"), uid_from_nick(2, "alice"));
        let cid = Cid([3u8; 24]);
        assert_ne!(uid_from_cid(1, &cid), uid_from_cid(2, &cid));
    }

    #[test]
    fn uids_differ_across_identities() {
        assert_ne!(uid_from_nick(1, "alice"), uid_from_nick(1, "bob"));
        // Nick is case-sensitive on NMDC.
        assert_ne!(uid_from_nick(1, "Alice"), uid_from_nick(1, "alice"));
    }
}
