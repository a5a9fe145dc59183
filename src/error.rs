//! NETCONF engine error types.
//!
//! Errors fall into the classes the session layer has to tell apart:
//!
//! | Class               | Type                         | Effect on the session            |
//! |---------------------|------------------------------|----------------------------------|
//! | Framing             | [`FramingError`]             | always fatal                     |
//! | Parse               | [`MessageError`]             | fatal before hello, else replied |
//! | Protocol sequence   | [`NetconfError::Protocol`]   | fatal before hello, else replied |
//! | Handler             | [`RpcError`](crate::protocol::RpcError) | replied, non-fatal    |
//! | Timeout             | [`NetconfError::RequestTimeout`], hello/idle | per-request or fatal |
//!
//! Fatal errors end the session with a [`CloseReason`], which is what the
//! session registry reports in its `SessionEnded` event.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub use crate::codec::FramingError;
pub use crate::protocol::MessageError;
use crate::protocol::RpcError;

/// NETCONF engine errors.
#[derive(Error, Debug)]
pub enum NetconfError {
    /// Byte-level framing violation.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Frame did not contain a valid protocol message.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] MessageError),

    /// Message arrived out of sequence for the current session state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Hello exchange did not produce a usable session.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Session is closed (or closed while the operation was outstanding).
    #[error("Session closed")]
    SessionClosed,

    /// Client request saw no reply within its timeout.
    #[error("Request {message_id} timed out")]
    RequestTimeout {
        /// Message-id of the request that timed out.
        message_id: String,
    },

    /// Hello was not exchanged within the configured duration.
    #[error("Hello exchange timed out")]
    HelloTimeout,

    /// Message-id is already outstanding on this session.
    #[error("Duplicate outstanding message-id: {0}")]
    DuplicateMessageId(String),

    /// Peer answered a request with one or more rpc-error elements.
    #[error("Remote rpc-error: {}", format_rpc_errors(.0))]
    Rpc(Vec<RpcError>),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Server-side error (bind, accept).
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for NETCONF operations
pub type Result<T> = std::result::Result<T, NetconfError>;

impl From<toml::de::Error> for NetconfError {
    fn from(err: toml::de::Error) -> Self {
        NetconfError::Config(err.to_string())
    }
}

fn format_rpc_errors(errors: &[RpcError]) -> String {
    errors
        .iter()
        .map(|e| match &e.message {
            Some(msg) => format!("{} ({})", e.tag, msg),
            None => e.tag.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a session ended.
///
/// Every variant maps to a stable code (see [`CloseReason::code`]) so
/// monitoring consumers can match on it without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum CloseReason {
    /// Peer sent `close-session`.
    CloseSession,
    /// Another session issued `kill-session` for this one.
    KillSession {
        /// Session that requested the kill.
        killed_by: u64,
    },
    /// Local side asked for the session to close.
    LocalClose,
    /// Server is shutting down.
    ServerShutdown,
    /// Hello was not completed in time.
    HelloTimeout,
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// Transport reached EOF or failed.
    TransportClosed,
    /// Framing violation.
    Framing(String),
    /// Protocol-sequence violation or malformed pre-hello content.
    Protocol(String),
    /// Hello exchange failed validation.
    NegotiationFailed(String),
}

impl CloseReason {
    /// Stable code for monitoring and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CloseSession => "close-session",
            Self::KillSession { .. } => "kill-session",
            Self::LocalClose => "local-close",
            Self::ServerShutdown => "server-shutdown",
            Self::HelloTimeout => "hello-timeout",
            Self::IdleTimeout => "idle-timeout",
            Self::TransportClosed => "transport-closed",
            Self::Framing(_) => "framing-error",
            Self::Protocol(_) => "protocol-error",
            Self::NegotiationFailed(_) => "negotiation-failed",
        }
    }

    /// Whether the session ended because something went wrong.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::HelloTimeout
                | Self::IdleTimeout
                | Self::Framing(_)
                | Self::Protocol(_)
                | Self::NegotiationFailed(_)
        )
    }

    /// Map a fatal engine error to the reason the session ends with.
    pub fn from_error(err: &NetconfError) -> Self {
        match err {
            NetconfError::Framing(FramingError::Io(_)) => Self::TransportClosed,
            NetconfError::Framing(e) => Self::Framing(e.to_string()),
            NetconfError::Deserialization(e) => Self::Protocol(e.to_string()),
            NetconfError::Protocol(msg) => Self::Protocol(msg.clone()),
            NetconfError::NegotiationFailed(msg) => Self::NegotiationFailed(msg.clone()),
            NetconfError::HelloTimeout => Self::HelloTimeout,
            NetconfError::Io(_) | NetconfError::SessionClosed => Self::TransportClosed,
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KillSession { killed_by } => write!(f, "kill-session by {killed_by}"),
            Self::Framing(detail) | Self::Protocol(detail) | Self::NegotiationFailed(detail) => {
                write!(f, "{}: {}", self.code(), detail)
            },
            _ => f.write_str(self.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::CloseSession.code(), "close-session");
        assert_eq!(
            CloseReason::KillSession { killed_by: 3 }.to_string(),
            "kill-session by 3"
        );
        assert_eq!(
            CloseReason::Framing("bad header".into()).to_string(),
            "framing-error: bad header"
        );
        assert!(CloseReason::IdleTimeout.is_error());
        assert!(!CloseReason::CloseSession.is_error());
    }

    #[test]
    fn test_close_reason_from_error() {
        let err = NetconfError::Framing(FramingError::MessageTooLarge { limit: 10 });
        assert_eq!(CloseReason::from_error(&err).code(), "framing-error");
        assert_eq!(
            CloseReason::from_error(&NetconfError::HelloTimeout),
            CloseReason::HelloTimeout
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(
            CloseReason::from_error(&NetconfError::Framing(FramingError::Io(io))),
            CloseReason::TransportClosed
        );
    }
}
