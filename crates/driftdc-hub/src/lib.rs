//! # driftdc-hub
//!
//! Hub protocol engine: one logical session per hub, speaking NMDC or
//! ADC depending on the hub address, hiding the two wire formats behind
//! a single event surface.
//!
//! This crate provides:
//! - **Session state machines**: `PROTOCOL → IDENTIFY → VERIFY →
//!   NORMAL` for both dialects, as pure line-in/actions-out machines
//! - **User tables**: keyed by session id (ADC) or nick (NMDC), with
//!   process-unique 64-bit uids derived from the hub id and the peer's
//!   stable identity
//! - **Search dispatch**: outbound searches, inbound request matching
//!   against the local share, and reply routing (UDP, hub-routed, SUDP)
//! - **The hub driver**: connection lifecycle, TLS and keyprint policy,
//!   reconnect timing
//!
//! Both session machines emit [`event::HubEvent`] and consume
//! [`event::HubCommand`]; nothing outside this crate ever sees NMDC or
//! ADC syntax.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adc;
pub mod event;
pub mod hub;
pub mod nmdc;
pub mod search;
pub mod user;

pub use event::{HubCommand, HubEvent, SearchResult};
pub use hub::{Hub, HubConfig, HubState};
pub use user::{HubUser, Uid};

/// Maximum search results returned to a passive peer.
pub const MAX_RESULTS_PASSIVE: usize = 5;

/// Maximum search results returned to an active peer.
pub const MAX_RESULTS_ACTIVE: usize = 10;

/// Default hub reconnect delay in seconds.
pub const DEFAULT_RECONNECT_SECS: u64 = 30;
