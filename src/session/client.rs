//! Client side of a NETCONF session.
//!
//! [`ClientSession::connect`] performs the hello exchange and then hands the
//! transport to a background I/O task. Requests are correlated with replies
//! by message-id through [`PendingRequests`]; each one is guarded by a
//! timer from the shared [`TimerService`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;

use crate::codec::{
    FramingCodec, FramingMode, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_OUTBOUND_CHUNK_SIZE,
};
use crate::config::Config;
use crate::dispatch::{NotificationListeners, NotificationStream, PendingRequests};
use crate::error::{CloseReason, NetconfError, Result};
use crate::protocol::{
    salvage_message_id, CapabilitySet, Message, Rpc, RpcReply, Session, SessionState,
};
use crate::timer::TimerService;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Client session options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Capabilities to advertise
    pub capabilities: CapabilitySet,
    /// Time allowed for the server hello
    pub hello_timeout: Duration,
    /// Default time to wait for each rpc-reply
    pub request_timeout: Duration,
    /// Maximum size of one assembled message
    pub max_message_size: usize,
    /// Maximum size of one incoming chunk
    pub max_chunk_size: usize,
    /// Size outgoing messages are split into in chunked mode
    pub outbound_chunk_size: usize,
    /// Timer service to share; a private one is started when `None`
    pub timers: Option<TimerService>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            capabilities: CapabilitySet::base(),
            hello_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(60),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            outbound_chunk_size: DEFAULT_OUTBOUND_CHUNK_SIZE,
            timers: None,
        }
    }
}

impl ClientOptions {
    /// Options from the `[client]` and `[session]` config sections
    pub fn from_config(config: &Config) -> Self {
        let mut capabilities = CapabilitySet::base();
        for uri in &config.client.capabilities {
            capabilities.insert(uri.as_str());
        }
        Self {
            capabilities,
            hello_timeout: config.session.hello_timeout(),
            request_timeout: config.client.request_timeout(),
            max_message_size: config.session.max_message_size,
            max_chunk_size: config.session.max_chunk_size,
            outbound_chunk_size: config.session.outbound_chunk_size,
            timers: None,
        }
    }

    /// Share an existing timer service
    pub fn with_timers(mut self, timers: TimerService) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Set the default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

enum Outbound {
    Send(Bytes),
    Close,
}

/// An established client session.
///
/// Cheap to share behind an `Arc`; every method takes `&self`, so several
/// tasks may have requests outstanding at once.
pub struct ClientSession {
    session_id: u64,
    server_capabilities: CapabilitySet,
    framing: FramingMode,
    request_timeout: Duration,
    timers: TimerService,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Arc<PendingRequests>,
    listeners: Arc<NotificationListeners>,
    state: watch::Receiver<SessionState>,
    next_message_id: AtomicU64,
    closing: AtomicBool,
}

impl ClientSession {
    /// Exchange hellos over `io` and start the session.
    pub async fn connect<T>(io: T, options: ClientOptions) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let timers = options.timers.clone().unwrap_or_else(TimerService::start);
        let codec = FramingCodec::new(options.max_message_size)
            .with_max_chunk_size(options.max_chunk_size)
            .with_outbound_chunk_size(options.outbound_chunk_size);
        let mut framed = Framed::new(io, codec);
        let mut session = Session::client(options.capabilities.clone());

        framed
            .send(Message::Hello(session.local_hello()).to_bytes())
            .await?;

        let (expired_tx, expired_rx) = oneshot::channel();
        let hello_timer = timers.schedule(options.hello_timeout, move || {
            let _ = expired_tx.send(());
        });
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = expired_rx => return Err(session.fail(NetconfError::HelloTimeout)),
        };
        hello_timer.cancel();

        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => return Err(session.fail(err.into())),
            None => return Err(session.fail(NetconfError::SessionClosed)),
        };
        let message = Message::parse(&bytes).map_err(|e| session.fail(e.into()))?;
        session.accept_message(&message)?;
        let Message::Hello(hello) = message else {
            return Err(NetconfError::Protocol("expected server hello".to_string()));
        };
        let framing = session.on_hello(hello)?.framing;
        framed.codec_mut().set_mode(framing);

        let session_id = session.id().ok_or_else(|| {
            NetconfError::NegotiationFailed("server hello has no session-id".to_string())
        })?;
        let server_capabilities = session
            .remote_capabilities()
            .cloned()
            .unwrap_or_default();

        let pending = Arc::new(PendingRequests::new());
        let listeners = Arc::new(NotificationListeners::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Established);

        tokio::spawn(drive(
            framed,
            session,
            outbound_rx,
            pending.clone(),
            listeners.clone(),
            state_tx,
        ));

        tracing::info!(
            "Client session {} established ({} framing)",
            session_id,
            framing
        );

        Ok(Self {
            session_id,
            server_capabilities,
            framing,
            request_timeout: options.request_timeout,
            timers,
            outbound: outbound_tx,
            pending,
            listeners,
            state: state_rx,
            next_message_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        })
    }

    /// Session id assigned by the server
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Capabilities the server advertised
    pub fn server_capabilities(&self) -> &CapabilitySet {
        &self.server_capabilities
    }

    /// Framing in use after the hello exchange
    pub fn framing(&self) -> FramingMode {
        self.framing
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Send an operation with the default timeout.
    ///
    /// Replies carrying error-severity rpc-errors are returned as
    /// [`NetconfError::Rpc`].
    pub async fn rpc(&self, operation_xml: &str) -> Result<RpcReply> {
        self.rpc_with_timeout(operation_xml, self.request_timeout)
            .await
    }

    /// Send an operation with an explicit timeout.
    pub async fn rpc_with_timeout(
        &self,
        operation_xml: &str,
        timeout: Duration,
    ) -> Result<RpcReply> {
        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let rpc = Rpc::new(message_id, operation_xml)?;
        self.send_rpc(rpc, timeout).await
    }

    /// Send a prepared rpc (caller-chosen message-id and attributes).
    pub async fn send_rpc(&self, rpc: Rpc, timeout: Duration) -> Result<RpcReply> {
        let message_id = rpc.message_id.clone();
        let reply_rx = self.pending.register(&message_id)?;

        let pending = self.pending.clone();
        let timeout_id = message_id.clone();
        let timer = self.timers.schedule(timeout, move || {
            let message_id = timeout_id.clone();
            if pending.complete(&timeout_id, Err(NetconfError::RequestTimeout { message_id })) {
                tracing::warn!("Request {} timed out", timeout_id);
            }
        });
        self.pending.attach_timer(&message_id, timer);

        if self
            .outbound
            .send(Outbound::Send(Message::Rpc(rpc).to_bytes()))
            .is_err()
        {
            self.pending.discard(&message_id);
            return Err(NetconfError::SessionClosed);
        }

        let reply = reply_rx.await.map_err(|_| NetconfError::SessionClosed)??;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(NetconfError::Rpc(reply.rpc_errors().to_vec()))
        }
    }

    /// Register for notifications. The stream ends when the session closes.
    pub fn subscribe_notifications(&self) -> NotificationStream {
        self.listeners.subscribe()
    }

    /// Number of requests awaiting a reply
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Close gracefully with `close-session`, then drop the transport.
    /// Later or concurrent calls wait for that same close to finish.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            self.closed().await;
            return Ok(());
        }
        let outcome = self.rpc("<close-session/>").await;
        let _ = self.outbound.send(Outbound::Close);
        self.closed().await;
        match outcome {
            Ok(_) | Err(NetconfError::SessionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Wait until the session has closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_id", &self.session_id)
            .field("framing", &self.framing)
            .field("state", &self.state())
            .field("outstanding", &self.pending.len())
            .finish()
    }
}

/// Background I/O task: writes outbound rpcs and routes inbound replies
/// and notifications until the session ends.
async fn drive<T>(
    mut framed: Framed<T, FramingCodec>,
    mut session: Session,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<PendingRequests>,
    listeners: Arc<NotificationListeners>,
    state: watch::Sender<SessionState>,
) -> CloseReason
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let flow = tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Send(bytes)) => match framed.send(bytes).await {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        session.fail(err.into());
                        ControlFlow::Break(())
                    },
                },
                Some(Outbound::Close) | None => {
                    session.begin_close(CloseReason::LocalClose);
                    ControlFlow::Break(())
                },
            },
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => on_frame(&mut session, &bytes, &pending, &listeners),
                Some(Err(err)) => {
                    session.fail(err.into());
                    ControlFlow::Break(())
                },
                None => {
                    session.begin_close(CloseReason::TransportClosed);
                    ControlFlow::Break(())
                },
            },
        };
        if flow.is_break() {
            break;
        }
    }

    let session_id = session.id().unwrap_or_default();
    let reason = session.finish_close().unwrap_or(CloseReason::LocalClose);
    let failed = pending.fail_all();
    listeners.close();
    state.send_replace(SessionState::Closed);
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, framed.close()).await;

    if reason.is_error() {
        tracing::warn!(
            "Client session {} closed: {} ({} requests failed)",
            session_id,
            reason,
            failed
        );
    } else {
        tracing::info!("Client session {} closed: {}", session_id, reason);
    }
    reason
}

fn on_frame(
    session: &mut Session,
    bytes: &[u8],
    pending: &PendingRequests,
    listeners: &NotificationListeners,
) -> ControlFlow<()> {
    let message = match Message::parse(bytes) {
        Ok(message) => message,
        Err(err) => {
            let message_id = err
                .message_id()
                .map(str::to_string)
                .or_else(|| salvage_message_id(bytes));
            tracing::warn!(
                "Discarding malformed message from server (message-id {:?}): {}",
                message_id,
                err
            );
            if let Some(id) = message_id {
                pending.complete(&id, Err(NetconfError::Deserialization(err)));
            }
            return ControlFlow::Continue(());
        },
    };

    match session.accept_message(&message) {
        Ok(()) => {},
        Err(NetconfError::SessionClosed) => return ControlFlow::Continue(()),
        Err(_) => return ControlFlow::Break(()),
    }

    match message {
        Message::RpcReply(reply) => match reply.message_id.clone() {
            Some(id) => {
                if !pending.complete(&id, Ok(reply)) {
                    tracing::warn!("Discarding rpc-reply for unknown message-id {}", id);
                }
            },
            None => tracing::warn!(
                "Discarding rpc-reply without message-id: {:?}",
                reply.rpc_errors()
            ),
        },
        Message::Notification(notification) => {
            let delivered = listeners.publish(&notification);
            tracing::debug!("Notification delivered to {} listeners", delivered);
        },
        other => tracing::warn!("Ignoring unexpected {} from server", other.kind()),
    }
    ControlFlow::Continue(())
}
