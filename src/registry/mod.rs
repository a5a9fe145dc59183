//! Session registry and monitoring.
//!
//! The registry is created by the server, shared by handle with every
//! session and torn down with [`SessionRegistry::close_all`] when the server
//! stops. It tracks:
//!
//! - established sessions keyed by session id, with a control channel to
//!   each (close, kill, notification delivery),
//! - the server capability set and the YANG schemas it implies,
//! - monitoring listeners.
//!
//! # Monitoring events
//!
//! | Event                 | Emitted when                               |
//! |-----------------------|--------------------------------------------|
//! | `CapabilitiesChanged` | server capabilities are added or removed   |
//! | `SchemasChanged`      | the module capabilities change             |
//! | `SessionStarted`      | a session reaches Established              |
//! | `SessionEnded`        | a session is removed, with its reason      |
//!
//! A new listener first receives the current state (capabilities, schemas
//! and one `SessionStarted` per live session) and only then later events.
//! Both happen under the registry lock, so nothing is missed or repeated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::codec::FramingMode;
use crate::error::{CloseReason, NetconfError, Result};
use crate::protocol::{Capability, CapabilitySet, Notification};

/// Instruction delivered to a running session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Close the session with the given reason
    Close(CloseReason),
    /// Send a notification to the peer
    Notify(Notification),
}

/// Per-session traffic counters
#[derive(Debug, Default)]
pub struct SessionCounters {
    in_rpcs: AtomicU64,
    in_bad_rpcs: AtomicU64,
    out_rpc_errors: AtomicU64,
    out_notifications: AtomicU64,
}

impl SessionCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a well-formed inbound rpc
    pub fn rpc_received(&self) {
        self.in_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound message that could not be processed as an rpc
    pub fn bad_rpc_received(&self) {
        self.in_bad_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a reply carrying rpc-error
    pub fn rpc_error_sent(&self) {
        self.out_rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a delivered notification
    pub fn notification_sent(&self) {
        self.out_notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            in_rpcs: self.in_rpcs.load(Ordering::Relaxed),
            in_bad_rpcs: self.in_bad_rpcs.load(Ordering::Relaxed),
            out_rpc_errors: self.out_rpc_errors.load(Ordering::Relaxed),
            out_notifications: self.out_notifications.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CounterSnapshot {
    /// Well-formed rpcs received
    pub in_rpcs: u64,
    /// Malformed or rejected messages received
    pub in_bad_rpcs: u64,
    /// Replies sent with rpc-error
    pub out_rpc_errors: u64,
    /// Notifications sent
    pub out_notifications: u64,
}

/// Monitoring view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub session_id: u64,
    /// Peer address
    pub peer: String,
    /// Transport name
    pub transport: String,
    /// Capabilities the client advertised
    pub capabilities: CapabilitySet,
    /// Framing in use
    pub framing: FramingMode,
    /// When the session was established
    pub login_time: DateTime<Utc>,
    /// Traffic counters at snapshot time
    pub counters: CounterSnapshot,
}

/// YANG schema advertised through a module capability
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Schema {
    /// Module name
    pub identifier: String,
    /// Revision, if advertised
    pub version: Option<String>,
    /// Always `yang`
    pub format: &'static str,
    /// Module namespace
    pub namespace: String,
}

/// Change pushed to monitoring listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringEvent {
    /// Session reached Established
    SessionStarted(SessionInfo),
    /// Session was removed
    SessionEnded {
        /// Last view of the session
        info: SessionInfo,
        /// Why it ended
        reason: CloseReason,
    },
    /// Server capability set changed
    CapabilitiesChanged {
        /// Full set after the change
        capabilities: CapabilitySet,
        /// Newly added
        added: Vec<Capability>,
        /// Removed
        removed: Vec<Capability>,
    },
    /// Schema list changed
    SchemasChanged(Vec<Schema>),
}

struct Entry {
    info: SessionInfo,
    counters: Arc<SessionCounters>,
    control: mpsc::UnboundedSender<SessionCommand>,
}

impl Entry {
    fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            counters: self.counters.snapshot(),
            ..self.info.clone()
        }
    }
}

struct State {
    sessions: BTreeMap<u64, Entry>,
    listeners: Vec<mpsc::UnboundedSender<MonitoringEvent>>,
    capabilities: CapabilitySet,
    closed: bool,
}

impl State {
    fn emit(&mut self, event: MonitoringEvent) {
        self.listeners.retain(|tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                tracing::debug!("Dropping closed monitoring listener");
            }
            delivered
        });
    }
}

/// Registry of live sessions
#[derive(Clone)]
pub struct SessionRegistry {
    next_id: Arc<AtomicU64>,
    state: Arc<RwLock<State>>,
}

impl SessionRegistry {
    /// Create registry advertising the given server capabilities
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            state: Arc::new(RwLock::new(State {
                sessions: BTreeMap::new(),
                listeners: Vec::new(),
                capabilities,
                closed: false,
            })),
        }
    }

    /// Reserve a fresh session id. Ids start at 1 and are never reused.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an established session.
    pub async fn add(
        &self,
        info: SessionInfo,
        counters: Arc<SessionCounters>,
        control: mpsc::UnboundedSender<SessionCommand>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(NetconfError::Server("registry is shut down".to_string()));
        }
        let id = info.session_id;
        if state.sessions.contains_key(&id) {
            return Err(NetconfError::Server(format!("session {id} already registered")));
        }
        let entry = Entry {
            info,
            counters,
            control,
        };
        let started = entry.snapshot();
        state.sessions.insert(id, entry);
        state.emit(MonitoringEvent::SessionStarted(started));
        tracing::debug!("Registered session {} ({} live)", id, state.sessions.len());
        Ok(())
    }

    /// Remove a session and report why it ended.
    pub async fn remove(&self, session_id: u64, reason: CloseReason) -> Option<SessionInfo> {
        let mut state = self.state.write().await;
        let entry = state.sessions.remove(&session_id)?;
        let info = entry.snapshot();
        state.emit(MonitoringEvent::SessionEnded {
            info: info.clone(),
            reason,
        });
        Some(info)
    }

    /// All live sessions, ordered by id
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .map(Entry::snapshot)
            .collect()
    }

    /// One live session
    pub async fn get(&self, session_id: u64) -> Option<SessionInfo> {
        self.state
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(Entry::snapshot)
    }

    /// Whether the session is live
    pub async fn contains(&self, session_id: u64) -> bool {
        self.state.read().await.sessions.contains_key(&session_id)
    }

    /// Number of live sessions
    pub async fn count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Register a monitoring listener.
    ///
    /// The returned stream starts with the current capabilities, schemas
    /// and live sessions.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitoringEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;

        let capabilities = state.capabilities.clone();
        let initial = std::iter::once(MonitoringEvent::CapabilitiesChanged {
            added: capabilities.iter().cloned().collect(),
            removed: Vec::new(),
            capabilities: capabilities.clone(),
        })
        .chain(std::iter::once(MonitoringEvent::SchemasChanged(
            schemas_of(&capabilities),
        )))
        .chain(
            state
                .sessions
                .values()
                .map(|e| MonitoringEvent::SessionStarted(e.snapshot())),
        );
        for event in initial {
            // Receiver is still held here
            let _ = tx.send(event);
        }

        if !state.closed {
            state.listeners.push(tx);
        }
        rx
    }

    /// Server capabilities
    pub async fn capabilities(&self) -> CapabilitySet {
        self.state.read().await.capabilities.clone()
    }

    /// Schemas derived from the server's module capabilities
    pub async fn schemas(&self) -> Vec<Schema> {
        schemas_of(&self.state.read().await.capabilities)
    }

    /// Add and remove server capabilities, notifying listeners of the
    /// effective change. Returns the new set.
    pub async fn update_capabilities(
        &self,
        added: impl IntoIterator<Item = Capability>,
        removed: impl IntoIterator<Item = Capability>,
    ) -> CapabilitySet {
        let mut state = self.state.write().await;
        let before = state.capabilities.clone();

        let mut after = before.clone();
        for cap in removed {
            after.remove(&cap);
        }
        for cap in added {
            after.insert(cap);
        }

        let added: Vec<Capability> = after.difference(&before).iter().cloned().collect();
        let removed: Vec<Capability> = before.difference(&after).iter().cloned().collect();
        if added.is_empty() && removed.is_empty() {
            return after;
        }

        state.capabilities = after.clone();
        state.emit(MonitoringEvent::CapabilitiesChanged {
            capabilities: after.clone(),
            added,
            removed,
        });

        let schemas = schemas_of(&after);
        if schemas != schemas_of(&before) {
            state.emit(MonitoringEvent::SchemasChanged(schemas));
        }
        after
    }

    /// Ask a session to close. Returns false if it is not live.
    pub async fn close_session(&self, session_id: u64, reason: CloseReason) -> bool {
        self.send(session_id, SessionCommand::Close(reason)).await
    }

    /// Deliver a notification to one session. Returns false if it is not live.
    pub async fn notify(&self, session_id: u64, notification: Notification) -> bool {
        self.send(session_id, SessionCommand::Notify(notification))
            .await
    }

    /// Deliver a notification to every live session; returns how many
    /// accepted it.
    pub async fn broadcast(&self, notification: &Notification) -> usize {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|e| {
                e.control
                    .send(SessionCommand::Notify(notification.clone()))
                    .is_ok()
            })
            .count()
    }

    async fn send(&self, session_id: u64, command: SessionCommand) -> bool {
        let state = self.state.read().await;
        match state.sessions.get(&session_id) {
            Some(entry) => entry.control.send(command).is_ok(),
            None => false,
        }
    }

    /// Close every live session and refuse new ones.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let mut state = self.state.write().await;
        state.closed = true;
        let count = state
            .sessions
            .values()
            .filter(|e| e.control.send(SessionCommand::Close(reason.clone())).is_ok())
            .count();
        tracing::info!("Closing {} sessions: {}", count, reason);
        count
    }

    /// Whether `close_all` was called
    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn schemas_of(capabilities: &CapabilitySet) -> Vec<Schema> {
    let mut schemas: Vec<Schema> = capabilities
        .modules()
        .into_iter()
        .map(|m| Schema {
            identifier: m.name,
            version: m.revision,
            format: "yang",
            namespace: m.namespace,
        })
        .collect();
    schemas.sort();
    schemas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BASE_1_0, BASE_1_1};

    const IF_MODULE: &str =
        "urn:ietf:params:xml:ns:yang:ietf-interfaces?module=ietf-interfaces&revision=2018-02-20";

    fn info(id: u64) -> SessionInfo {
        SessionInfo {
            session_id: id,
            peer: "127.0.0.1:5000".to_string(),
            transport: "tcp".to_string(),
            capabilities: CapabilitySet::base(),
            framing: FramingMode::Chunked,
            login_time: Utc::now(),
            counters: CounterSnapshot::default(),
        }
    }

    async fn add(
        registry: &SessionRegistry,
        id: u64,
    ) -> (Arc<SessionCounters>, mpsc::UnboundedReceiver<SessionCommand>) {
        let counters = Arc::new(SessionCounters::new());
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add(info(id), counters.clone(), tx).await.unwrap();
        (counters, rx)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = SessionRegistry::new(CapabilitySet::base());
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_add_remove_snapshot() {
        let registry = SessionRegistry::new(CapabilitySet::base());
        let (counters, _rx) = add(&registry, 1).await;
        let _second = add(&registry, 2).await;
        counters.rpc_received();
        counters.rpc_error_sent();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].counters.in_rpcs, 1);
        assert_eq!(snapshot[0].counters.out_rpc_errors, 1);

        let (tx, _) = mpsc::unbounded_channel();
        assert!(registry
            .add(info(1), Arc::new(SessionCounters::new()), tx)
            .await
            .is_err());

        assert!(registry.remove(1, CloseReason::CloseSession).await.is_some());
        assert!(registry.remove(1, CloseReason::CloseSession).await.is_none());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_state_first() {
        let caps: CapabilitySet = [BASE_1_0, BASE_1_1, IF_MODULE].into_iter().collect();
        let registry = SessionRegistry::new(caps.clone());
        let _s = add(&registry, 7).await;

        let mut events = registry.subscribe().await;
        assert!(matches!(
            events.recv().await,
            Some(MonitoringEvent::CapabilitiesChanged { capabilities, .. }) if capabilities == caps
        ));
        match events.recv().await {
            Some(MonitoringEvent::SchemasChanged(schemas)) => {
                assert_eq!(schemas.len(), 1);
                assert_eq!(schemas[0].identifier, "ietf-interfaces");
                assert_eq!(schemas[0].version.as_deref(), Some("2018-02-20"));
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events.recv().await,
            Some(MonitoringEvent::SessionStarted(info)) if info.session_id == 7
        ));

        registry.remove(7, CloseReason::IdleTimeout).await;
        assert!(matches!(
            events.recv().await,
            Some(MonitoringEvent::SessionEnded { info, reason: CloseReason::IdleTimeout })
                if info.session_id == 7
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_capabilities() {
        let registry = SessionRegistry::new(CapabilitySet::base());
        let mut events = registry.subscribe().await;
        events.recv().await;
        events.recv().await;

        let after = registry
            .update_capabilities([Capability::new(IF_MODULE)], [Capability::new(BASE_1_1)])
            .await;
        assert!(after.contains(IF_MODULE));
        assert!(!after.contains(BASE_1_1));

        match events.recv().await {
            Some(MonitoringEvent::CapabilitiesChanged { added, removed, .. }) => {
                assert_eq!(added, vec![Capability::new(IF_MODULE)]);
                assert_eq!(removed, vec![Capability::new(BASE_1_1)]);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events.recv().await,
            Some(MonitoringEvent::SchemasChanged(s)) if s.len() == 1
        ));

        // No effective change, no event
        registry
            .update_capabilities([Capability::new(BASE_1_0)], Vec::new())
            .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commands_reach_sessions() {
        let registry = SessionRegistry::new(CapabilitySet::base());
        let (_c1, mut rx1) = add(&registry, 1).await;
        let (_c2, mut rx2) = add(&registry, 2).await;

        assert!(registry.notify(1, Notification::new("<e/>")).await);
        assert!(matches!(rx1.recv().await, Some(SessionCommand::Notify(_))));

        assert_eq!(registry.broadcast(&Notification::new("<e/>")).await, 2);
        assert!(matches!(rx1.recv().await, Some(SessionCommand::Notify(_))));
        assert!(matches!(rx2.recv().await, Some(SessionCommand::Notify(_))));

        assert!(
            registry
                .close_session(2, CloseReason::KillSession { killed_by: 1 })
                .await
        );
        assert!(matches!(
            rx2.recv().await,
            Some(SessionCommand::Close(CloseReason::KillSession { killed_by: 1 }))
        ));
        assert!(!registry.close_session(9, CloseReason::LocalClose).await);

        assert_eq!(registry.close_all(CloseReason::ServerShutdown).await, 2);
        assert!(registry.is_closed().await);
        let (tx, _) = mpsc::unbounded_channel();
        assert!(registry
            .add(info(3), Arc::new(SessionCounters::new()), tx)
            .await
            .is_err());
    }
}
