//! Session drivers.
//!
//! A driver owns one transport connection and runs the
//! [`Session`](crate::protocol::Session) state machine against it:
//!
//! ```text
//!            hello sent
//!   connect ───────────> AwaitingHello ──peer hello──> Established
//!                              │                           │
//!                hello timeout │          close-session,   │ kill-session,
//!                  bad message │          idle timeout,    │ shutdown
//!                              v                           v
//!                           Closed <──── replies drained ─ Closing
//! ```
//!
//! - [`ServerSession`] answers rpcs through the
//!   [`OperationRegistry`](crate::dispatch::OperationRegistry) and keeps
//!   replies in request order.
//! - [`ClientSession`] correlates replies by message-id and fans
//!   notifications out to subscribers.

mod client;
mod server;

pub use client::{ClientOptions, ClientSession};
pub use server::{ServerContext, ServerSession};
