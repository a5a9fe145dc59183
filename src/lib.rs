//! # NETCONF Core - Session and Message-Framing Engine
//!
//! Protocol engine for NETCONF (RFC 6241) over any reliable byte stream,
//! with the framing rules of RFC 6242.
//!
//! ## Features
//!
//! - **Framing**: end-of-message and chunked framing with an in-place switch
//!   after the hello exchange
//! - **Sessions**: hello exchange, capability negotiation, monotonic state
//!   machine, hello and idle timeouts
//! - **Dispatch**: chained operation handlers, replies in request order,
//!   terminal operations
//! - **Client**: message-id correlation, per-request timeouts, notification
//!   subscribers
//! - **Registry**: live session list, `kill-session`, monitoring events
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                                Server
//!    |                                                     |
//!    |<------------- <hello> (caps, session-id) -----------|
//!    |-------------- <hello> (caps) ---------------------->|
//!    |        [chunked framing if both sent base:1.1]      |
//!    |                                                     |
//!    |-------------- <rpc message-id="1"> ---------------->|
//!    |-------------- <rpc message-id="2"> ---------------->|
//!    |<------------- <rpc-reply message-id="1"> -----------|
//!    |<------------- <rpc-reply message-id="2"> -----------|
//!    |<------------- <notification> ----------------------|
//!    |                                                     |
//!    |-------------- <rpc><close-session/></rpc> --------->|
//!    |<------------- <rpc-reply><ok/></rpc-reply> ---------|
//! ```
//!
//! ### Wire Formats
//!
//! | Framing        | Wire Format                      | When                    |
//! |----------------|----------------------------------|-------------------------|
//! | End-of-message | `<msg>]]>]]>`                    | hello; base:1.0 peers   |
//! | Chunked        | `\n#<len>\n<bytes>...\n##\n`     | both peers base:1.1     |
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,ignore
//! use netconf::dispatch::{handler_fn, OperationOutput, OperationResult};
//! use netconf::protocol::OperationName;
//! use netconf::{Config, NetconfServer, TcpTransport, Transport};
//!
//! let server = NetconfServer::builder(Config::default())
//!     .with_operation(
//!         OperationName::base("get"),
//!         handler_fn(|_req, _prev| async {
//!             OperationResult::Ok(OperationOutput::Data("<data/>".into()))
//!         }),
//!     )
//!     .build()?;
//! TcpTransport::localhost(2830).serve(server).await?;
//! ```
//!
//! ### Client
//!
//! ```rust,ignore
//! use netconf::transport::connect;
//! use netconf::ClientOptions;
//!
//! let client = connect("127.0.0.1:2830", ClientOptions::default()).await?;
//! let reply = client.rpc("<get/>").await?;
//! client.close().await?;
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: Message framing (end-of-message and chunked)
//! - [`protocol`]: Messages, capabilities, rpc-error, session state machine
//! - [`dispatch`]: Handler chains, reply ordering, pending requests
//! - [`session`]: Server and client session drivers
//! - [`registry`]: Live sessions and monitoring events
//! - [`server`]: Server assembly and connection handling
//! - [`transport`]: Byte-stream transports (TCP)
//! - [`timer`]: Shared timer service
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use codec::{FramingCodec, FramingMode};
pub use config::Config;
pub use dispatch::{OperationHandler, OperationRegistry};
pub use error::{CloseReason, NetconfError, Result};
pub use protocol::{Capability, CapabilitySet, Message, RpcError, Session, SessionState};
pub use registry::{MonitoringEvent, SessionRegistry};
pub use server::NetconfServer;
pub use session::{ClientOptions, ClientSession};
pub use transport::{TcpTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
