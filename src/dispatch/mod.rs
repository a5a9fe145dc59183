//! Message dispatch.
//!
//! | Direction | Message        | Path                                               |
//! |-----------|----------------|----------------------------------------------------|
//! | Server in | `rpc`          | [`OperationRegistry::execute`] → [`ReplyOrderer`]  |
//! | Client in | `rpc-reply`    | [`PendingRequests::complete`] by message-id        |
//! | Client in | `notification` | [`NotificationListeners::publish`]                 |
//!
//! The server session takes a sequence number from the [`ReplyOrderer`]
//! for every rpc in receipt order, runs its handler chain on a separate
//! task, and writes replies only as the orderer releases them. Replies to
//! pipelined rpcs therefore leave in request order even when handlers
//! finish out of order.
//!
//! Operations marked terminal (for example `commit`) must be the last rpc
//! in flight: while one is outstanding, further rpcs are rejected with
//! `malformed-message`.

mod listeners;
mod operations;
mod ordering;
mod pending;

pub use listeners::{NotificationListeners, NotificationStream};
pub use operations::{
    handler_fn, FnHandler, OperationError, OperationFuture, OperationHandler, OperationOutput,
    OperationRegistry, OperationRequest, OperationResult,
};
pub use ordering::ReplyOrderer;
pub use pending::{PendingRequests, ReplyReceiver};
