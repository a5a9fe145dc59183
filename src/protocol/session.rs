//! Session state machine.
//!
//! Pure bookkeeping for one connection: hello validation, capability
//! negotiation, session-id binding and the lifecycle below. The async
//! drivers in [`crate::session`] own a `Session` and consult it for every
//! inbound message.
//!
//! ```text
//!  AwaitingHello ──hello ok──> Established ──close──> Closing ──flushed──> Closed
//!        │                          │                                        ^
//!        └──timeout / bad hello / non-hello / EOF───────────fatal error──────┘
//! ```

use chrono::{DateTime, Utc};

use super::capabilities::{CapabilitySet, NegotiatedCaps};
use super::message::{Hello, Message};
use crate::codec::FramingMode;
use crate::error::{CloseReason, NetconfError, Result};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the peer's hello
    AwaitingHello,
    /// Hello exchanged, messages flow
    Established,
    /// Close requested, flushing in-flight replies
    Closing,
    /// Terminated
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::AwaitingHello => 0,
            Self::Established => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    /// Get descriptive name
    pub fn name(&self) -> &'static str {
        match self {
            Self::AwaitingHello => "awaiting-hello",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts rpcs, assigns the session id
    Server,
    /// Sends rpcs, learns the session id from the server hello
    Client,
}

/// NETCONF session state
#[derive(Debug)]
pub struct Session {
    /// Role on this connection
    role: Role,
    /// Current state
    state: SessionState,
    /// Capabilities we advertise
    local_caps: CapabilitySet,
    /// Session id (reserved by server, learned by client)
    session_id: Option<u64>,
    /// Capabilities the peer advertised
    remote_caps: Option<CapabilitySet>,
    /// Negotiation outcome
    negotiated: Option<NegotiatedCaps>,
    /// Creation time
    created_at: DateTime<Utc>,
    /// Why the session is closing or closed
    close_reason: Option<CloseReason>,
    /// Whether close side effects were handed out
    released: bool,
}

impl Session {
    /// Server-side session with its reserved id
    pub fn server(session_id: u64, capabilities: CapabilitySet) -> Self {
        let mut session = Self::new(Role::Server, capabilities);
        session.session_id = Some(session_id);
        session
    }

    /// Client-side session
    pub fn client(capabilities: CapabilitySet) -> Self {
        Self::new(Role::Client, capabilities)
    }

    fn new(role: Role, capabilities: CapabilitySet) -> Self {
        Self {
            role,
            state: SessionState::AwaitingHello,
            local_caps: capabilities,
            session_id: None,
            remote_caps: None,
            negotiated: None,
            created_at: Utc::now(),
            close_reason: None,
            released: false,
        }
    }

    /// Session id, once known
    pub fn id(&self) -> Option<u64> {
        self.session_id
    }

    /// Role on this connection
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if session is established
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Capabilities we advertise
    pub fn local_capabilities(&self) -> &CapabilitySet {
        &self.local_caps
    }

    /// Capabilities the peer advertised
    pub fn remote_capabilities(&self) -> Option<&CapabilitySet> {
        self.remote_caps.as_ref()
    }

    /// Negotiation outcome
    pub fn negotiated(&self) -> Option<&NegotiatedCaps> {
        self.negotiated.as_ref()
    }

    /// Framing for messages after the hello exchange
    pub fn framing(&self) -> FramingMode {
        self.negotiated
            .as_ref()
            .map(|n| n.framing)
            .unwrap_or_default()
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Why the session is closing or closed
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// The hello we send. Server hellos carry the session id.
    pub fn local_hello(&self) -> Hello {
        let hello = Hello::new(self.local_caps.clone());
        match (self.role, self.session_id) {
            (Role::Server, Some(id)) => hello.with_session_id(id),
            _ => hello,
        }
    }

    /// Gate an inbound message on the current state.
    ///
    /// Anything but a hello before the hello exchange is fatal, as is a
    /// second hello. Messages arriving while closing are refused with
    /// [`NetconfError::SessionClosed`] without further effect.
    pub fn accept_message(&mut self, message: &Message) -> Result<()> {
        match (self.state, message) {
            (SessionState::AwaitingHello, Message::Hello(_)) => Ok(()),
            (SessionState::AwaitingHello, other) => Err(self.fail(NetconfError::Protocol(
                format!("{} received before hello", other.kind()),
            ))),
            (SessionState::Established, Message::Hello(_)) => Err(self.fail(
                NetconfError::Protocol("hello received on established session".to_string()),
            )),
            (SessionState::Established, _) => Ok(()),
            (SessionState::Closing | SessionState::Closed, _) => Err(NetconfError::SessionClosed),
        }
    }

    /// Process the peer's hello and establish the session.
    ///
    /// Validation failures close the session and are returned.
    pub fn on_hello(&mut self, hello: Hello) -> Result<&NegotiatedCaps> {
        if self.state != SessionState::AwaitingHello {
            return Err(self.fail(NetconfError::Protocol(format!(
                "hello received in state {}",
                self.state
            ))));
        }

        match (self.role, hello.session_id) {
            (Role::Server, Some(id)) => {
                return Err(self.fail(NetconfError::Protocol(format!(
                    "client hello carries session-id {id}"
                ))));
            },
            (Role::Client, None) => {
                return Err(self.fail(NetconfError::NegotiationFailed(
                    "server hello has no session-id".to_string(),
                )));
            },
            (Role::Client, Some(id)) => self.session_id = Some(id),
            (Role::Server, None) => {},
        }

        let negotiated = match self.local_caps.negotiate(&hello.capabilities) {
            Ok(negotiated) => negotiated,
            Err(err) => return Err(self.fail(err)),
        };

        tracing::debug!(
            "Session {:?} negotiated {} framing, {} common capabilities",
            self.session_id,
            negotiated.framing,
            negotiated.common.len()
        );
        self.remote_caps = Some(hello.capabilities);
        self.transition(SessionState::Established);
        Ok(self.negotiated.insert(negotiated))
    }

    /// Start closing. Returns false if the session was already closing or
    /// closed; the first reason wins.
    ///
    /// A session that never finished its hello goes straight to Closed.
    pub fn begin_close(&mut self, reason: CloseReason) -> bool {
        let next = match self.state {
            SessionState::AwaitingHello => SessionState::Closed,
            SessionState::Established => SessionState::Closing,
            SessionState::Closing | SessionState::Closed => return false,
        };
        self.close_reason.get_or_insert(reason);
        self.transition(next);
        true
    }

    /// Record a fatal error: the session moves to Closed with a reason
    /// derived from the error. Returns the error for propagation.
    pub fn fail(&mut self, err: NetconfError) -> NetconfError {
        if self.state != SessionState::Closed {
            tracing::warn!("Session {:?} failed: {}", self.session_id, err);
            self.close_reason
                .get_or_insert_with(|| CloseReason::from_error(&err));
            self.transition(SessionState::Closed);
        }
        err
    }

    /// Enter Closed. Returns the close reason the first time only, so
    /// resources tied to the session are released exactly once.
    pub fn finish_close(&mut self) -> Option<CloseReason> {
        self.transition(SessionState::Closed);
        if self.released {
            return None;
        }
        self.released = true;
        Some(
            self.close_reason
                .get_or_insert(CloseReason::LocalClose)
                .clone(),
        )
    }

    fn transition(&mut self, next: SessionState) {
        if next.rank() < self.state.rank() {
            tracing::warn!(
                "Ignoring backward transition {} -> {} on session {:?}",
                self.state,
                next,
                self.session_id
            );
            return;
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::{BASE_1_0, BASE_1_1};
    use crate::protocol::message::{Rpc, RpcReply};

    fn base_10() -> CapabilitySet {
        [BASE_1_0].into_iter().collect()
    }

    #[test]
    fn test_server_hello_carries_id() {
        let session = Session::server(7, CapabilitySet::base());
        assert_eq!(session.local_hello().session_id, Some(7));
        assert_eq!(session.state(), SessionState::AwaitingHello);

        let client = Session::client(CapabilitySet::base());
        assert_eq!(client.local_hello().session_id, None);
    }

    #[test]
    fn test_server_establishes() {
        let mut session = Session::server(1, CapabilitySet::base());
        let negotiated = session.on_hello(Hello::new(CapabilitySet::base())).unwrap();
        assert_eq!(negotiated.framing, FramingMode::Chunked);
        assert!(session.is_established());
        assert_eq!(session.framing(), FramingMode::Chunked);
    }

    #[test]
    fn test_client_learns_id_and_falls_back_to_eom() {
        let mut client = Session::client([BASE_1_0, BASE_1_1].into_iter().collect());
        client
            .on_hello(Hello::new(base_10()).with_session_id(42))
            .unwrap();
        assert_eq!(client.id(), Some(42));
        assert_eq!(client.framing(), FramingMode::EndOfMessage);
    }

    #[test]
    fn test_client_hello_with_session_id_is_fatal() {
        let mut session = Session::server(1, CapabilitySet::base());
        let err = session
            .on_hello(Hello::new(CapabilitySet::base()).with_session_id(5))
            .unwrap_err();
        assert!(matches!(err, NetconfError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason().map(|r| r.code()), Some("protocol-error"));
    }

    #[test]
    fn test_server_hello_without_id_rejected() {
        let mut client = Session::client(CapabilitySet::base());
        assert!(matches!(
            client.on_hello(Hello::new(CapabilitySet::base())),
            Err(NetconfError::NegotiationFailed(_))
        ));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[test]
    fn test_no_common_base_closes() {
        let mut session = Session::server(1, [BASE_1_1].into_iter().collect());
        assert!(session.on_hello(Hello::new(base_10())).is_err());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.close_reason().map(|r| r.code()),
            Some("negotiation-failed")
        );
    }

    #[test]
    fn test_non_hello_before_hello_never_establishes() {
        let mut session = Session::server(1, CapabilitySet::base());
        let rpc = Message::Rpc(Rpc::new("1", "<get/>").unwrap());
        assert!(session.accept_message(&rpc).is_err());
        assert_eq!(session.state(), SessionState::Closed);

        // A late hello cannot revive it
        assert!(session.on_hello(Hello::new(CapabilitySet::base())).is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_second_hello_is_fatal() {
        let mut session = Session::server(1, CapabilitySet::base());
        session.on_hello(Hello::new(CapabilitySet::base())).unwrap();
        let hello = Message::Hello(Hello::new(CapabilitySet::base()));
        assert!(session.accept_message(&hello).is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_is_idempotent_and_released_once() {
        let mut session = Session::server(1, CapabilitySet::base());
        session.on_hello(Hello::new(CapabilitySet::base())).unwrap();

        assert!(session.begin_close(CloseReason::CloseSession));
        assert!(!session.begin_close(CloseReason::LocalClose));
        assert_eq!(session.state(), SessionState::Closing);

        let reply = Message::RpcReply(RpcReply::ok("1"));
        assert!(matches!(
            session.accept_message(&reply),
            Err(NetconfError::SessionClosed)
        ));

        assert_eq!(session.finish_close(), Some(CloseReason::CloseSession));
        assert_eq!(session.finish_close(), None);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_before_hello_goes_to_closed() {
        let mut session = Session::client(CapabilitySet::base());
        assert!(session.begin_close(CloseReason::HelloTimeout));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.finish_close(), Some(CloseReason::HelloTimeout));
    }
}
