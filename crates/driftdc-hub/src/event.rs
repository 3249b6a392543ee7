//! The dialect-neutral event and command surface.
//!
//! Both session machines emit [`HubEvent`] and serialize [`HubCommand`];
//! the two wire formats never share an AST. Events ripple to the
//! message sink, peer-message handling and the download scheduler.

use crate::user::{HubUser, Uid};
use driftdc_proto::{SearchKind, SizeConstraint};
use driftdc_tth::Root;

/// A hit reported to a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// Originating peer.
    pub uid: Uid,
    /// Full share path at the peer.
    pub path: String,
    /// File size; `None` marks a directory result.
    pub size: Option<u64>,
    /// Free upload slots at the peer.
    pub slots_free: u32,
    /// Tiger root for file results.
    pub tth: Option<Root>,
}

/// High-level events emitted by a hub session.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// The hub's lifecycle state changed.
    StateChanged(crate::hub::HubState),
    /// The session reached the logged-in state.
    LoggedIn,
    /// The hub asked for a password and none is configured.
    PasswordNeeded,
    /// A peer joined or completed its info.
    UserJoined(HubUser),
    /// A peer's info changed.
    UserInfo(HubUser),
    /// A peer quit.
    UserQuit(Uid),
    /// Main chat message.
    Chat {
        /// Sender, `None` for hub-originated text.
        from: Option<Uid>,
        /// Message text.
        text: String,
    },
    /// Private message.
    Private {
        /// Sender.
        from: Uid,
        /// Message text.
        text: String,
    },
    /// A search result addressed to us.
    Result(SearchResult),
    /// A peer wants us to connect to them (active peer).
    ConnectToMe {
        /// The peer, when it could be identified.
        uid: Option<Uid>,
        /// Address to dial.
        addr: String,
        /// Whether the peer connection should use TLS.
        tls: bool,
        /// ADC token echoed back in the client handshake.
        token: Option<String>,
    },
    /// A passive peer asks us to connect out to them.
    RevConnectToMe {
        /// The requesting peer.
        uid: Uid,
        /// ADC token.
        token: Option<String>,
    },
    /// Informational text from the hub (status, MOTD, errors).
    HubMessage(String),
    /// The session ended.
    Closed {
        /// Human-readable reason.
        reason: String,
        /// Whether the reconnect timer should be armed. False for
        /// terminal closes: redirects, bans, denied nicks.
        reconnect: bool,
    },
}

/// Commands accepted by a hub session.
#[derive(Debug, Clone)]
pub enum HubCommand {
    /// Send main chat.
    Chat(String),
    /// Send a private message.
    Private {
        /// Recipient.
        to: Uid,
        /// Message text.
        text: String,
    },
    /// Broadcast a search.
    Search(SearchSpec),
    /// Ask an active peer to connect to us, or ask the hub to relay a
    /// reverse request when we are passive.
    RequestConnection {
        /// Target peer.
        uid: Uid,
        /// Token to correlate the peer handshake (ADC).
        token: String,
    },
    /// Answer a password request.
    Password(String),
    /// Refresh our own presence (share size, slots changed).
    UpdateInfo,
    /// Close the session.
    Disconnect,
}

/// Dialect-neutral outbound search description.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    /// What kind of thing is searched for.
    pub kind: SearchKind,
    /// Size restriction.
    pub size: SizeConstraint,
    /// Include terms; for [`SearchKind::Tth`] the single term is the
    /// base32 root.
    pub terms: Vec<String>,
    /// Exact root for TTH searches.
    pub tth: Option<Root>,
    /// Correlation token carried in ADC searches and SUDP keys.
    pub token: String,
    /// SUDP key announced with the search when policy allows.
    pub sudp_key: Option<[u8; 16]>,
}
