//! Name resolution.
//!
//! Resolution runs on the runtime's blocking pool via tokio's resolver;
//! callers wrap it in their own timeout. Address order is preserved as
//! returned by the system resolver so family preference follows the OS
//! configuration.

use crate::error::{NetError, Result};
use std::net::SocketAddr;
use tokio::net::lookup_host;

/// Resolve `host:port` to a candidate address list.
///
/// A literal IPv4/IPv6 address resolves to itself without a DNS query.
///
/// # Errors
///
/// [`NetError::Conn`] when resolution fails or yields no addresses.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| NetError::Conn(format!("resolving {host}: {e}").into()))?
        .collect();
    if addrs.is_empty() {
        return Err(NetError::Conn(
            format!("resolving {host}: no addresses").into(),
        ));
    }
    tracing::debug!(host, count = addrs.len(), "resolved");
    Ok(addrs)
}
