//! Hub address parsing.
//!
//! `scheme://host[:port][/?kp=SHA256/<base32>]` where the scheme selects
//! the dialect and TLS: `dchub`/`nmdc` (plain NMDC), `nmdcs` (NMDC over
//! TLS), `adc` (plain ADC), `adcs` (ADC over TLS). The default port is
//! 411. The `kp` query pins the server certificate's SHA-256 fingerprint
//! and is only meaningful with a TLS scheme.

use crate::ProtoError;
use data_encoding::BASE32_NOPAD;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Which protocol family a hub speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubDialect {
    /// Legacy NeoModus protocol.
    Nmdc,
    /// Advanced Direct Connect.
    Adc,
}

/// A validated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// Dotted-quad IPv4, strictly formatted (no leading zeros).
    V4(Ipv4Addr),
    /// IPv6, written in brackets on the wire.
    V6(Ipv6Addr),
    /// DNS name: at most 255 bytes, labels at most 63 bytes, no leading
    /// hyphen, no label starting with a digit.
    Name(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::V4(ip) => write!(f, "{ip}"),
            Host::V6(ip) => write!(f, "[{ip}]"),
            Host::Name(n) => f.write_str(n),
        }
    }
}

/// A parsed and validated hub address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubAddr {
    /// Protocol dialect selected by the scheme.
    pub dialect: HubDialect,
    /// Whether the connection is made through TLS.
    pub tls: bool,
    /// Hub host.
    pub host: Host,
    /// Hub port (411 unless given).
    pub port: u16,
    /// Pinned certificate SHA-256 fingerprint from the `kp` query.
    pub keyprint: Option<[u8; 32]>,
}

/// Strict IPv4 check: the std parser plus a round-trip comparison, which
/// rejects leading zeros and other creative spellings.
#[must_use]
pub fn is_valid_ipv4(s: &str) -> bool {
    Ipv4Addr::from_str(s).is_ok_and(|ip| ip.to_string() == s)
}

fn valid_dns_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.as_bytes()[0].is_ascii_digit()
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

fn valid_scheme(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || b.len() > 15 || !b[0].is_ascii_lowercase() {
        return false;
    }
    b[1..]
        .iter()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, b'.' | b'+' | b'-'))
}

fn parse_host(s: &str) -> Result<Host, ProtoError> {
    if let Some(v6) = s.strip_prefix('[') {
        let v6 = v6
            .strip_suffix(']')
            .ok_or(ProtoError::BadAddr("unterminated IPv6 bracket"))?;
        let ip = Ipv6Addr::from_str(v6).map_err(|_| ProtoError::BadAddr("bad IPv6 address"))?;
        return Ok(Host::V6(ip));
    }
    if is_valid_ipv4(s) {
        // Unreachable for strings std rejects; from_str re-checked here
        // only to convert.
        let ip = Ipv4Addr::from_str(s).map_err(|_| ProtoError::BadAddr("bad IPv4 address"))?;
        return Ok(Host::V4(ip));
    }
    if valid_dns_name(s) {
        return Ok(Host::Name(s.to_ascii_lowercase()));
    }
    Err(ProtoError::BadAddr("invalid host"))
}

fn parse_keyprint(query: &str) -> Result<Option<[u8; 32]>, ProtoError> {
    for pair in query.split('&') {
        let Some(value) = pair.strip_prefix("kp=") else {
            continue;
        };
        let b32 = value
            .strip_prefix("SHA256/")
            .ok_or(ProtoError::BadAddr("unsupported keyprint hash"))?;
        if b32.len() != 52 {
            return Err(ProtoError::BadAddr("bad keyprint length"));
        }
        let bytes = BASE32_NOPAD
            .decode(b32.to_ascii_uppercase().as_bytes())
            .map_err(|_| ProtoError::BadAddr("bad keyprint encoding"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtoError::BadAddr("bad keyprint length"))?;
        return Ok(Some(arr));
    }
    Ok(None)
}

impl HubAddr {
    /// Parse and validate a hub address string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadAddr`] on an unknown scheme, an invalid
    /// host, an out-of-range port, or a malformed keyprint. Nothing about
    /// the input is usable on error.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or(ProtoError::BadAddr("missing scheme"))?;
        let scheme = scheme.to_ascii_lowercase();
        if !valid_scheme(&scheme) {
            return Err(ProtoError::BadAddr("invalid scheme"));
        }
        let (dialect, tls) = match scheme.as_str() {
            "dchub" | "nmdc" => (HubDialect::Nmdc, false),
            "nmdcs" => (HubDialect::Nmdc, true),
            "adc" => (HubDialect::Adc, false),
            "adcs" => (HubDialect::Adc, true),
            _ => return Err(ProtoError::BadAddr("unknown hub scheme")),
        };

        // Split off "/..." path+query, if any.
        let (authority, tail) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };
        let keyprint = match tail.split_once('?') {
            Some((_, query)) => parse_keyprint(query)?,
            None => None,
        };

        // Split host from port, honoring IPv6 brackets.
        let (host_s, port) = if authority.starts_with('[') {
            match authority.rfind(']') {
                Some(end) => match authority[end + 1..].strip_prefix(':') {
                    Some(p) => (&authority[..=end], Some(p)),
                    None if authority[end + 1..].is_empty() => (authority, None),
                    None => return Err(ProtoError::BadAddr("garbage after IPv6 host")),
                },
                None => return Err(ProtoError::BadAddr("unterminated IPv6 bracket")),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };
        let host = parse_host(host_s)?;
        let port = match port {
            Some(p) => {
                let n: u16 = p.parse().map_err(|_| ProtoError::BadAddr("bad port"))?;
                if n == 0 {
                    return Err(ProtoError::BadAddr("bad port"));
                }
                n
            }
            None => 411,
        };

        if keyprint.is_some() && !tls {
            return Err(ProtoError::BadAddr("keyprint on a plaintext scheme"));
        }

        Ok(Self {
            dialect,
            tls,
            host,
            port,
            keyprint,
        })
    }

    /// The canonical string form.
    #[must_use]
    pub fn to_url(&self) -> String {
        let scheme = match (self.dialect, self.tls) {
            (HubDialect::Nmdc, false) => "dchub",
            (HubDialect::Nmdc, true) => "nmdcs",
            (HubDialect::Adc, false) => "adc",
            (HubDialect::Adc, true) => "adcs",
        };
        let mut out = format!("{scheme}://{}:{}", self.host, self.port);
        if let Some(kp) = &self.keyprint {
            out.push_str("/?kp=SHA256/");
            out.push_str(&BASE32_NOPAD.encode(kp));
        }
        out
    }
}

impl fmt::Display for HubAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl FromStr for HubAddr {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HubAddr::parse(s)
    }
}
