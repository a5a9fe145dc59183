//! NETCONF message framing (RFC 6242).
//!
//! Turns the transport byte stream into complete message byte spans and
//! back. Two mechanisms exist on the wire:
//!
//! | Mode           | Wire format                                   | Used for                   |
//! |----------------|-----------------------------------------------|----------------------------|
//! | End-of-message | `<message>]]>]]>`                             | hello, base:1.0 sessions   |
//! | Chunked        | `\n#<len>\n<bytes>` ... `\n##\n`              | base:1.1 sessions          |
//!
//! Every session starts in end-of-message mode. When both peers advertise
//! `urn:ietf:params:netconf:base:1.1` the session switches to chunked
//! framing right after the hello exchange. [`FramingCodec::set_mode`] performs
//! that switch in place, so bytes already sitting in the read buffer are
//! decoded with the new mode and nothing is lost or reordered.
//!
//! Framing violations are never recovered from: after the first error the
//! codec keeps failing and the owning session closes the connection.
//!
//! # Usage
//!
//! ```rust,ignore
//! use netconf::codec::{FramingCodec, FramingMode};
//! use tokio_util::codec::Framed;
//!
//! let mut framed = Framed::new(stream, FramingCodec::new(16 * 1024 * 1024));
//! // ... hello exchange ...
//! framed.codec_mut().set_mode(FramingMode::Chunked);
//! ```

mod chunked;
mod framing;

pub use chunked::{encode_chunked, ChunkDecoder};
pub use framing::FramingCodec;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// End-of-message delimiter used by base:1.0 framing.
pub const EOM_DELIMITER: &[u8] = b"]]>]]>";

/// Default maximum size of one assembled message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum size of one incoming chunk (16 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default size of outgoing chunks.
pub const DEFAULT_OUTBOUND_CHUNK_SIZE: usize = 8192;

/// Largest chunk size the chunk header grammar permits (RFC 6242 §4.2).
pub const MAX_CHUNK_SIZE_LIMIT: u64 = 4_294_967_295;

/// Framing mechanism in effect for a direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// `]]>]]>` delimited (base:1.0, and always for hello).
    #[default]
    EndOfMessage,
    /// Chunked framing (base:1.1).
    Chunked,
}

impl FramingMode {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EndOfMessage => "end-of-message",
            Self::Chunked => "chunked",
        }
    }
}

impl std::fmt::Display for FramingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Framing failures. All of them are fatal for the session.
#[derive(Error, Debug)]
pub enum FramingError {
    /// Message grew past the configured limit before it was complete.
    #[error("Message exceeds maximum size of {limit} bytes")]
    MessageTooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// Chunk header declared a size above the configured limit.
    #[error("Chunk size {size} exceeds maximum of {limit} bytes")]
    ChunkTooLarge {
        /// Declared size.
        size: u64,
        /// Configured limit.
        limit: usize,
    },

    /// Chunk header or footer did not match the RFC 6242 grammar.
    #[error("Malformed chunk {context}: got byte 0x{found:02x}, expected {expected}")]
    MalformedChunk {
        /// Which part of the framing was being read.
        context: &'static str,
        /// Offending byte.
        found: u8,
        /// What the grammar allows at this position.
        expected: &'static str,
    },

    /// Stream ended in the middle of a message.
    #[error("Stream closed with {pending} bytes of incomplete message")]
    Truncated {
        /// Bytes buffered when the stream ended.
        pending: usize,
    },

    /// Chunked framing cannot carry an empty message.
    #[error("Cannot encode an empty message with chunked framing")]
    EmptyMessage,

    /// Codec already failed; the session must be torn down.
    #[error("Framing codec already failed")]
    Poisoned,

    /// I/O error from the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_mode_default() {
        assert_eq!(FramingMode::default(), FramingMode::EndOfMessage);
        assert_eq!(FramingMode::Chunked.to_string(), "chunked");
    }

    #[test]
    fn test_malformed_chunk_display() {
        let err = FramingError::MalformedChunk {
            context: "header length",
            found: b'a',
            expected: "[1-9]",
        };
        assert_eq!(
            err.to_string(),
            "Malformed chunk header length: got byte 0x61, expected [1-9]"
        );
    }
}
