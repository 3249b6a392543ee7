//! # driftdc-net
//!
//! Networking substrate: uniform transport for hub and peer traffic.
//!
//! This crate provides:
//! - **Connections**: non-blocking TCP with three read modes
//!   (message-terminated, byte-counted consume, byte-counted peek), a
//!   bounded read buffer, and buffered writes
//! - **TLS**: opportunistic upgrade with certificate fingerprint
//!   reporting for keyprint pinning
//! - **Bulk transfers**: rate-limited streaming of file regions in both
//!   directions, cancellable, co-existing with the framed mode
//! - **Rate limiting**: global and per-connection token buckets
//! - **UDP**: dual-stack datagram sockets with a shared outgoing queue
//!
//! One operation is outstanding per connection at a time; callers await
//! one frame before issuing the next request. All errors carry the
//! {CONN, RECV, SEND, TIMEOUT} taxonomy and leave the connection
//! unusable (its state is Idle by the time the error is returned).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conn;
pub mod error;
pub mod rate;
pub mod resolve;
pub mod tls;
pub mod udp;

pub use conn::{Connection, ConnectOpts, ConnState};
pub use error::{ErrorKind, NetError};
pub use rate::{Bucket, RateCounter};
pub use tls::{ClientIdentity, TlsSetup};
pub use udp::UdpPair;

/// Default upper bound on the framed read buffer (1 MiB).
pub const MAX_READ_BUF: usize = 1024 * 1024;

/// Inactivity limit for connection setup and framed reads without
/// keep-alive.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Idle period after which a keep-alive message is written.
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(120);
