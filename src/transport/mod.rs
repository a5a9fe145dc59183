//! Transport layer.
//!
//! The session engine runs over any ordered, reliable byte stream
//! (`AsyncRead + AsyncWrite`). A [`Transport`] accepts connections and hands
//! each one to [`NetconfServer::handle_connection`], which owns it from the
//! hello exchange to teardown.
//!
//! ```text
//! ┌───────────────────────────────┐
//! │         NetconfServer         │
//! │     (transport-agnostic)      │
//! └───────────────┬───────────────┘
//!                 │ byte streams
//!        ┌────────┴────────┐
//!        ▼                 ▼
//! ┌──────────────┐  ┌──────────────┐
//! │ TcpTransport │  │  in-memory   │
//! │              │  │ (duplex, tests)
//! └──────────────┘  └──────────────┘
//! ```
//!
//! Secure transports (SSH subsystem, TLS) wrap their channel as a byte
//! stream and use the same entry point.

mod tcp;

pub use tcp::{connect, TcpTransport};

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::server::NetconfServer;

/// Transport trait for pluggable network backends.
pub trait Transport: Send + Sync {
    /// Accept connections and run a session on each.
    ///
    /// Runs until the listener fails.
    fn serve(&self, server: NetconfServer) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Get the listen address as a string.
    fn listen_addr(&self) -> String;
}
