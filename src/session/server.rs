//! Server side of one NETCONF connection.

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::FramingCodec;
use crate::config::SessionConfig;
use crate::dispatch::{
    OperationError, OperationOutput, OperationRegistry, OperationRequest, OperationResult,
    ReplyOrderer,
};
use crate::error::{CloseReason, MessageError, NetconfError};
use crate::protocol::xml::normalize_fragment;
use crate::protocol::{
    salvage_message_id, CapabilitySet, Hello, Message, OperationName, Rpc, RpcError, RpcReply,
    Session, SessionState, BASE_NAMESPACE,
};
use crate::registry::{SessionCommand, SessionCounters, SessionInfo, SessionRegistry};
use crate::timer::{TimerHandle, TimerService};

type Flow = ControlFlow<()>;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared server facilities every session uses
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Session registry
    pub registry: SessionRegistry,
    /// Operation handlers
    pub operations: Arc<OperationRegistry>,
    /// Shared timer service
    pub timers: TimerService,
    /// Limits and timeouts
    pub config: SessionConfig,
}

/// A reply waiting for its turn in the ordering buffer
struct Slot {
    seq: u64,
    reply: RpcReply,
    closes_session: bool,
}

/// Drives one server-side session from hello to teardown.
///
/// Inbound messages are processed strictly in receipt order on the
/// session task. Handler chains run on spawned tasks and report back
/// through a channel; the [`ReplyOrderer`] puts their replies back into
/// request order before they are written.
pub struct ServerSession<T> {
    framed: Framed<T, FramingCodec>,
    session: Session,
    session_id: u64,
    ctx: ServerContext,
    peer: String,
    transport: &'static str,
    counters: Arc<SessionCounters>,
    control_tx: mpsc::UnboundedSender<SessionCommand>,
    control_rx: mpsc::UnboundedReceiver<SessionCommand>,
    completions_tx: mpsc::UnboundedSender<Slot>,
    completions_rx: mpsc::UnboundedReceiver<Slot>,
    orderer: ReplyOrderer<Slot>,
    /// Sequence number and name of the terminal operation in flight
    terminal_in_flight: Option<(u64, OperationName)>,
    hello_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
    registered: bool,
}

impl<T> ServerSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected transport.
    ///
    /// `session_id` must come from [`SessionRegistry::allocate_id`];
    /// `capabilities` is what the server hello advertises.
    pub fn new(
        io: T,
        peer: impl Into<String>,
        transport: &'static str,
        session_id: u64,
        capabilities: CapabilitySet,
        ctx: ServerContext,
    ) -> Self {
        let codec = FramingCodec::new(ctx.config.max_message_size)
            .with_max_chunk_size(ctx.config.max_chunk_size)
            .with_outbound_chunk_size(ctx.config.outbound_chunk_size);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Self {
            framed: Framed::new(io, codec),
            session: Session::server(session_id, capabilities),
            session_id,
            ctx,
            peer: peer.into(),
            transport,
            counters: Arc::new(SessionCounters::new()),
            control_tx,
            control_rx,
            completions_tx,
            completions_rx,
            orderer: ReplyOrderer::new(),
            terminal_in_flight: None,
            hello_timer: None,
            idle_timer: None,
            registered: false,
        }
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.session_id
    }

    /// Run until the session closes; returns why it closed.
    pub async fn run(mut self) -> CloseReason {
        tracing::debug!("Session {} accepted from {}", self.session_id, self.peer);
        match self.start().await {
            Ok(()) => self.event_loop().await,
            Err(err) => {
                self.session.fail(err);
            },
        }
        self.teardown().await
    }

    async fn start(&mut self) -> Result<(), NetconfError> {
        let hello = Message::Hello(self.session.local_hello());
        self.framed.send(hello.to_bytes()).await?;

        let control = self.control_tx.clone();
        self.hello_timer = Some(self.ctx.timers.schedule(
            self.ctx.config.hello_timeout(),
            move || {
                let _ = control.send(SessionCommand::Close(CloseReason::HelloTimeout));
            },
        ));
        Ok(())
    }

    async fn event_loop(&mut self) {
        loop {
            let flow = tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(bytes)) => self.on_frame(bytes).await,
                    Some(Err(err)) => {
                        self.session.fail(err.into());
                        ControlFlow::Break(())
                    },
                    None => {
                        tracing::debug!("Session {}: transport closed by peer", self.session_id);
                        self.session.begin_close(CloseReason::TransportClosed);
                        ControlFlow::Break(())
                    },
                },
                Some(slot) = self.completions_rx.recv() => self.release(slot).await,
                Some(command) = self.control_rx.recv() => self.on_command(command).await,
            };
            if flow.is_break() {
                break;
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Close(CloseReason::HelloTimeout)
                if self.session.state() != SessionState::AwaitingHello =>
            {
                tracing::debug!(
                    "Session {}: hello timeout fired after hello; ignored",
                    self.session_id
                );
                ControlFlow::Continue(())
            },
            SessionCommand::Close(reason) => {
                tracing::debug!("Session {} asked to close: {}", self.session_id, reason);
                self.session.begin_close(reason);
                self.flush_in_flight().await;
                ControlFlow::Break(())
            },
            SessionCommand::Notify(notification) => {
                if !self.session.is_established() {
                    tracing::debug!(
                        "Session {} not established; notification dropped",
                        self.session_id
                    );
                    return ControlFlow::Continue(());
                }
                let flow = self.send(Message::Notification(notification)).await;
                if flow.is_continue() {
                    self.counters.notification_sent();
                }
                flow
            },
        }
    }

    async fn on_frame(&mut self, bytes: Bytes) -> Flow {
        if let (Some(timer), Some(idle)) = (&self.idle_timer, self.ctx.config.idle_timeout()) {
            timer.reset(idle);
        }

        let message = match Message::parse(&bytes) {
            Ok(message) => message,
            Err(err) => return self.on_malformed(&bytes, err).await,
        };

        match self.session.accept_message(&message) {
            Ok(()) => {},
            Err(NetconfError::SessionClosed) => {
                tracing::debug!(
                    "Session {}: dropping {} received while closing",
                    self.session_id,
                    message.kind()
                );
                return ControlFlow::Continue(());
            },
            Err(_) => return ControlFlow::Break(()),
        }

        match message {
            Message::Hello(hello) => self.on_hello(hello).await,
            Message::Rpc(rpc) => self.on_rpc(rpc).await,
            other => {
                tracing::warn!(
                    "Session {}: ignoring unexpected {} from client",
                    self.session_id,
                    other.kind()
                );
                self.counters.bad_rpc_received();
                ControlFlow::Continue(())
            },
        }
    }

    async fn on_malformed(&mut self, bytes: &[u8], err: MessageError) -> Flow {
        match self.session.state() {
            SessionState::AwaitingHello => {
                self.session.fail(NetconfError::Deserialization(err));
                ControlFlow::Break(())
            },
            SessionState::Established => {
                self.counters.bad_rpc_received();
                let message_id = err
                    .message_id()
                    .map(str::to_string)
                    .or_else(|| salvage_message_id(bytes));
                tracing::warn!(
                    "Session {}: rejecting message (message-id {:?}): {}",
                    self.session_id,
                    message_id,
                    err
                );
                self.reply_now(RpcReply::errors(message_id, vec![err.to_rpc_error()]))
                    .await
            },
            SessionState::Closing | SessionState::Closed => ControlFlow::Continue(()),
        }
    }

    async fn on_hello(&mut self, hello: Hello) -> Flow {
        let framing = match self.session.on_hello(hello) {
            Ok(negotiated) => negotiated.framing,
            Err(_) => return ControlFlow::Break(()),
        };
        self.framed.codec_mut().set_mode(framing);

        if let Some(timer) = self.hello_timer.take() {
            timer.cancel();
        }
        if let Some(idle) = self.ctx.config.idle_timeout() {
            let control = self.control_tx.clone();
            self.idle_timer = Some(self.ctx.timers.schedule(idle, move || {
                let _ = control.send(SessionCommand::Close(CloseReason::IdleTimeout));
            }));
        }

        let info = SessionInfo {
            session_id: self.session_id,
            peer: self.peer.clone(),
            transport: self.transport.to_string(),
            capabilities: self
                .session
                .remote_capabilities()
                .cloned()
                .unwrap_or_default(),
            framing,
            login_time: Utc::now(),
            counters: Default::default(),
        };
        if let Err(err) = self
            .ctx
            .registry
            .add(info, self.counters.clone(), self.control_tx.clone())
            .await
        {
            tracing::warn!("Session {} not registered: {}", self.session_id, err);
            self.session.begin_close(CloseReason::ServerShutdown);
            return ControlFlow::Break(());
        }
        self.registered = true;

        tracing::info!(
            "Session {} established with {} ({} framing)",
            self.session_id,
            self.peer,
            framing
        );
        ControlFlow::Continue(())
    }

    async fn on_rpc(&mut self, rpc: Rpc) -> Flow {
        if let Some((_, terminal)) = &self.terminal_in_flight {
            self.counters.bad_rpc_received();
            let err = RpcError::malformed_message(format!(
                "rpc received while terminal operation {} is in flight",
                terminal.name
            ));
            tracing::warn!(
                "Session {}: rejecting rpc {}: {}",
                self.session_id,
                rpc.message_id,
                err
            );
            let reply =
                RpcReply::errors(Some(rpc.message_id), vec![err]).with_attributes(rpc.attributes);
            return self.reply_now(reply).await;
        }

        self.counters.rpc_received();
        let seq = self.orderer.reserve();
        tracing::debug!(
            "Session {}: rpc {} ({}) seq {}",
            self.session_id,
            rpc.message_id,
            rpc.operation,
            seq
        );

        if is_close_session(&rpc.operation) {
            self.session.begin_close(CloseReason::CloseSession);
            let reply = RpcReply::ok(rpc.message_id).with_attributes(rpc.attributes);
            return self
                .release(Slot {
                    seq,
                    reply,
                    closes_session: true,
                })
                .await;
        }

        if self.ctx.operations.is_terminal(&rpc.operation) {
            self.terminal_in_flight = Some((seq, rpc.operation.clone()));
        }

        let request = OperationRequest::from_rpc(self.session_id, &rpc);
        let operations = self.ctx.operations.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(operations.execute(&request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!("Handler for {} panicked", request.operation);
                    Err(RpcError::operation_failed("operation handler panicked").into())
                });
            let _ = completions.send(Slot {
                seq,
                reply: build_reply(rpc, result),
                closes_session: false,
            });
        });
        ControlFlow::Continue(())
    }

    async fn reply_now(&mut self, reply: RpcReply) -> Flow {
        let seq = self.orderer.reserve();
        self.release(Slot {
            seq,
            reply,
            closes_session: false,
        })
        .await
    }

    /// Hand a completed reply to the ordering buffer and write whatever it
    /// releases. Nothing is written after the close-session reply.
    async fn release(&mut self, slot: Slot) -> Flow {
        let seq = slot.seq;
        for slot in self.orderer.complete(seq, slot) {
            if matches!(&self.terminal_in_flight, Some((terminal, _)) if *terminal == slot.seq) {
                self.terminal_in_flight = None;
            }
            if !slot.reply.rpc_errors().is_empty() {
                self.counters.rpc_error_sent();
            }
            let closes_session = slot.closes_session;
            self.send(Message::RpcReply(slot.reply)).await?;
            if closes_session {
                tracing::debug!("Session {}: close-session replied", self.session_id);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Write the replies still owed for rpcs already accepted, in order.
    /// Inbound frames are no longer read, so nothing new is accepted.
    async fn flush_in_flight(&mut self) {
        if self.orderer.is_idle() || self.session.state() == SessionState::Closed {
            return;
        }
        tracing::debug!(
            "Session {}: flushing {} in-flight replies",
            self.session_id,
            self.orderer.in_flight()
        );
        let deadline = tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT;
        while !self.orderer.is_idle() {
            match tokio::time::timeout_at(deadline, self.completions_rx.recv()).await {
                Ok(Some(slot)) => {
                    if self.release(slot).await.is_break() {
                        return;
                    }
                },
                Ok(None) => return,
                Err(_) => {
                    tracing::warn!(
                        "Session {}: {} replies dropped at close",
                        self.session_id,
                        self.orderer.in_flight()
                    );
                    return;
                },
            }
        }
    }

    async fn send(&mut self, message: Message) -> Flow {
        match self.framed.send(message.to_bytes()).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                self.session.fail(err.into());
                ControlFlow::Break(())
            },
        }
    }

    async fn teardown(mut self) -> CloseReason {
        if let Some(timer) = self.hello_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }

        let reason = self
            .session
            .finish_close()
            .unwrap_or(CloseReason::LocalClose);
        if self.registered {
            self.ctx
                .registry
                .remove(self.session_id, reason.clone())
                .await;
        }
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.framed.close()).await;

        if reason.is_error() {
            tracing::warn!("Session {} closed: {}", self.session_id, reason);
        } else {
            tracing::info!("Session {} closed: {}", self.session_id, reason);
        }
        reason
    }
}

fn is_close_session(operation: &OperationName) -> bool {
    operation.name == "close-session"
        && operation
            .namespace
            .as_deref()
            .map_or(true, |ns| ns == BASE_NAMESPACE)
}

/// Translate a handler outcome into the reply for `rpc`.
fn build_reply(rpc: Rpc, result: OperationResult) -> RpcReply {
    let Rpc {
        message_id,
        attributes,
        ..
    } = rpc;
    let reply = match result {
        Ok(OperationOutput::Ok) => RpcReply::ok(message_id),
        Ok(OperationOutput::Data(data)) => match normalize_fragment(&data, BASE_NAMESPACE) {
            Ok(data) => RpcReply::data(message_id, data),
            Err(err) => RpcReply::errors(
                Some(message_id),
                vec![RpcError::operation_failed(format!(
                    "handler returned malformed data: {err}"
                ))],
            ),
        },
        Err(OperationError(errors)) if errors.is_empty() => RpcReply::errors(
            Some(message_id),
            vec![RpcError::operation_failed("operation failed")],
        ),
        Err(OperationError(errors)) => RpcReply::errors(Some(message_id), errors),
    };
    reply.with_attributes(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorTag, ReplyContent};

    fn rpc(id: &str, xml: &str) -> Rpc {
        Rpc::new(id, xml).unwrap().with_attribute("user", "admin")
    }

    #[tokio::test]
    async fn test_stale_hello_timeout_is_ignored_after_hello() {
        use crate::dispatch::handler_fn;
        use crate::protocol::Hello;
        use crate::registry::MonitoringEvent;

        let mut operations = OperationRegistry::new();
        operations.register(
            OperationName::base("get"),
            handler_fn(|_req, _prev| async {
                OperationResult::Ok(OperationOutput::Data("<data/>".into()))
            }),
        );
        let ctx = ServerContext {
            registry: SessionRegistry::new(CapabilitySet::base()),
            operations: Arc::new(operations),
            timers: TimerService::start(),
            config: SessionConfig::default(),
        };
        let mut events = ctx.registry.subscribe().await;

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let session = ServerSession::new(
            server_io,
            "peer",
            "duplex",
            9,
            CapabilitySet::base(),
            ctx.clone(),
        );
        let control = session.control_tx.clone();
        let handle = tokio::spawn(session.run());

        let mut peer = Framed::new(client_io, FramingCodec::new(1 << 20));
        peer.next().await.unwrap().unwrap();
        let hello = Message::Hello(Hello::new(CapabilitySet::base()));
        peer.send(hello.to_bytes()).await.unwrap();
        peer.codec_mut().set_mode(crate::codec::FramingMode::Chunked);
        loop {
            if let Some(MonitoringEvent::SessionStarted(_)) = events.recv().await {
                break;
            }
        }

        // the hello timer fired just before the hello was processed
        assert!(control
            .send(SessionCommand::Close(CloseReason::HelloTimeout))
            .is_ok());
        let get = Message::Rpc(Rpc::new("1", "<get/>").unwrap());
        peer.send(get.to_bytes()).await.unwrap();
        let reply = Message::parse(&peer.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, Message::RpcReply(r) if r.message_id.as_deref() == Some("1")));
        assert!(ctx.registry.contains(9).await);

        drop(peer);
        assert_eq!(handle.await.unwrap(), CloseReason::TransportClosed);
    }

    #[test]
    fn test_is_close_session() {
        assert!(is_close_session(&OperationName::base("close-session")));
        assert!(is_close_session(&OperationName::local("close-session")));
        assert!(!is_close_session(&OperationName::new(
            "urn:example",
            "close-session"
        )));
        assert!(!is_close_session(&OperationName::base("kill-session")));
    }

    #[test]
    fn test_build_reply_ok_echoes_attributes() {
        let reply = build_reply(rpc("1", "<commit/>"), Ok(OperationOutput::Ok));
        assert_eq!(reply.message_id.as_deref(), Some("1"));
        assert_eq!(reply.content, ReplyContent::Ok);
        assert_eq!(reply.attributes, vec![("user".into(), "admin".into())]);
    }

    #[test]
    fn test_build_reply_normalizes_data() {
        let reply = build_reply(
            rpc("2", "<get/>"),
            Ok(OperationOutput::Data("<data><x/></data>".into())),
        );
        assert_eq!(
            reply.content,
            ReplyContent::Data(format!("<data xmlns=\"{BASE_NAMESPACE}\"><x/></data>"))
        );
    }

    #[test]
    fn test_build_reply_malformed_data_is_error() {
        let reply = build_reply(
            rpc("3", "<get/>"),
            Ok(OperationOutput::Data("<data>".into())),
        );
        assert_eq!(reply.rpc_errors()[0].tag, ErrorTag::OperationFailed);
    }

    #[test]
    fn test_build_reply_errors_verbatim() {
        let err = RpcError::invalid_value("nope").with_path("/a");
        let reply = build_reply(rpc("4", "<get/>"), Err(err.clone().into()));
        assert_eq!(reply.rpc_errors(), &[err]);

        let empty = build_reply(rpc("5", "<get/>"), Err(OperationError(Vec::new())));
        assert_eq!(empty.rpc_errors().len(), 1);
    }
}
