//! Transport error taxonomy.

use std::borrow::Cow;
use thiserror::Error;

/// The four transport failure classes. The owning component decides
/// whether to reconnect (hub) or abandon (peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Could not establish or keep the connection.
    Conn,
    /// Failure while receiving.
    Recv,
    /// Failure while sending.
    Send,
    /// Inactivity limit hit.
    Timeout,
}

/// A transport error with its class and a human-readable message.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// Connect-phase failure (resolution, dial, TLS, cancellation).
    #[error("connection error: {0}")]
    Conn(Cow<'static, str>),
    /// Receive failure.
    #[error("receive error: {0}")]
    Recv(Cow<'static, str>),
    /// Send failure.
    #[error("send error: {0}")]
    Send(Cow<'static, str>),
    /// Inactivity timeout.
    #[error("timeout: {0}")]
    Timeout(Cow<'static, str>),
}

impl NetError {
    /// The failure class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Conn(_) => ErrorKind::Conn,
            NetError::Recv(_) => ErrorKind::Recv,
            NetError::Send(_) => ErrorKind::Send,
            NetError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Connect-phase error with static context.
    #[must_use]
    pub const fn conn(context: &'static str) -> Self {
        NetError::Conn(Cow::Borrowed(context))
    }

    /// Receive error with static context.
    #[must_use]
    pub const fn recv(context: &'static str) -> Self {
        NetError::Recv(Cow::Borrowed(context))
    }

    /// Send error with static context.
    #[must_use]
    pub const fn send(context: &'static str) -> Self {
        NetError::Send(Cow::Borrowed(context))
    }

    /// Timeout with static context.
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NetError::Timeout(Cow::Borrowed(context))
    }

    pub(crate) fn recv_io(err: &std::io::Error) -> Self {
        NetError::Recv(Cow::Owned(err.to_string()))
    }

    pub(crate) fn send_io(err: &std::io::Error) -> Self {
        NetError::Send(Cow::Owned(err.to_string()))
    }

    pub(crate) fn conn_io(err: &std::io::Error) -> Self {
        NetError::Conn(Cow::Owned(err.to_string()))
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_variants() {
        assert_eq!(NetError::conn("x").kind(), ErrorKind::Conn);
        assert_eq!(NetError::recv("x").kind(), ErrorKind::Recv);
        assert_eq!(NetError::send("x").kind(), ErrorKind::Send);
        assert_eq!(NetError::timeout("x").kind(), ErrorKind::Timeout);
    }

    #[test]
    fn display_carries_message() {
        assert!(NetError::timeout("no activity for 30s")
            .to_string()
            .contains("no activity"));
    }
}
