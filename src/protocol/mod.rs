//! NETCONF messages, capabilities and session state.
//!
//! # Message Flow
//!
//! ```text
//! Client                                   Server
//!    |                                        |
//!    |<------- hello (caps, session-id) ------|  Sent on connect by both sides,
//!    |-------- hello (caps) ----------------->|  always end-of-message framed
//!    |                                        |
//!    |   framing switches to chunked here if both advertised base:1.1
//!    |                                        |
//!    |-------- rpc message-id=1 ------------->|  Pipelined requests
//!    |-------- rpc message-id=2 ------------->|
//!    |<------- rpc-reply message-id=1 --------|  Replies in request order
//!    |<------- rpc-reply message-id=2 --------|
//!    |<------- notification ------------------|  Unsolicited events
//!    |                                        |
//!    |-------- rpc <close-session/> --------->|
//!    |<------- rpc-reply <ok/> ---------------|  Then the transport closes
//! ```
//!
//! ## State Machine
//!
//! | State           | Description                        | Valid Transitions  |
//! |-----------------|------------------------------------|--------------------|
//! | `AwaitingHello` | Connected, hello not yet received  | → Established, Closed |
//! | `Established`   | Capabilities negotiated            | → Closing, Closed  |
//! | `Closing`       | Flushing replies before teardown   | → Closed           |
//! | `Closed`        | Terminated                         | (terminal)         |
//!
//! ## Error Replies
//!
//! | Condition                       | error-type  | error-tag                 |
//! |---------------------------------|-------------|---------------------------|
//! | Malformed XML after hello       | rpc         | `malformed-message`       |
//! | rpc without message-id          | rpc         | `missing-attribute`       |
//! | rpc without operation           | protocol    | `missing-element`         |
//! | No handler for operation        | protocol    | `operation-not-supported` |
//! | rpc after terminal operation    | rpc         | `malformed-message`       |
//! | Handler failure                 | as returned by the handler              |

mod capabilities;
mod message;
mod rpc_error;
mod session;
pub mod xml;

pub use capabilities::{
    Capability, CapabilitySet, ModuleCapability, NegotiatedCaps, BASE_1_0, BASE_1_1,
    CANDIDATE_1_0, NOTIFICATION_1_0,
};
pub use message::{
    salvage_message_id, Hello, Message, MessageError, Notification, OperationName,
    ReplyContent, Rpc, RpcReply, BASE_NAMESPACE, NOTIFICATION_NAMESPACE,
};
pub use rpc_error::{ErrorSeverity, ErrorTag, ErrorType, RpcError};
pub use session::{Role, Session, SessionState};
