//! Outstanding client requests.
//!
//! Each entry pairs a message-id with the oneshot its caller awaits and the
//! timer guarding it. Whoever removes the entry from the map (reply, timeout
//! or session close) is the single writer for that request; everyone else
//! finds it gone and does nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{NetconfError, Result};
use crate::protocol::RpcReply;
use crate::timer::TimerHandle;

/// Receives the outcome of one request
pub type ReplyReceiver = oneshot::Receiver<Result<RpcReply>>;

struct Entry {
    tx: oneshot::Sender<Result<RpcReply>>,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    closed: bool,
}

/// Pending requests of one session, keyed by message-id.
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<State>,
}

impl PendingRequests {
    /// Create empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request. Fails if the id is already outstanding or the
    /// session has closed.
    pub fn register(&self, message_id: &str) -> Result<ReplyReceiver> {
        let mut state = self.lock();
        if state.closed {
            return Err(NetconfError::SessionClosed);
        }
        if state.entries.contains_key(message_id) {
            return Err(NetconfError::DuplicateMessageId(message_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        state
            .entries
            .insert(message_id.to_string(), Entry { tx, timer: None });
        Ok(rx)
    }

    /// Attach the timeout timer to a registered request. If the request
    /// already completed, the timer is cancelled instead.
    pub fn attach_timer(&self, message_id: &str, timer: TimerHandle) {
        let mut state = self.lock();
        match state.entries.get_mut(message_id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.cancel(),
        }
    }

    /// Complete a request. Returns false if it was not outstanding, which
    /// is the losing side of a reply/timeout race or an unsolicited reply.
    pub fn complete(&self, message_id: &str, outcome: Result<RpcReply>) -> bool {
        let entry = self.lock().entries.remove(message_id);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.cancel();
        }
        if entry.tx.send(outcome).is_err() {
            tracing::debug!("Caller for message-id {} went away", message_id);
        }
        true
    }

    /// Forget a request without completing it (send failed).
    pub fn discard(&self, message_id: &str) {
        if let Some(entry) = self.lock().entries.remove(message_id) {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
    }

    /// Fail every outstanding request with [`NetconfError::SessionClosed`]
    /// and refuse new ones. Returns how many were failed; repeated calls
    /// return 0.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, Entry)> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (message_id, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
            let _ = entry.tx.send(Err(NetconfError::SessionClosed));
            tracing::debug!("Failed pending request {} on close", message_id);
        }
        count
    }

    /// Whether the message-id is outstanding
    pub fn contains(&self, message_id: &str) -> bool {
        self.lock().entries.contains_key(message_id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table has been closed
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PendingRequests")
            .field("outstanding", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::timer::TimerService;

    #[tokio::test]
    async fn test_complete_once() {
        let pending = PendingRequests::new();
        let rx = pending.register("1").unwrap();
        assert!(pending.complete("1", Ok(RpcReply::ok("1"))));
        assert!(!pending.complete(
            "1",
            Err(NetconfError::RequestTimeout {
                message_id: "1".into()
            })
        ));
        assert!(rx.await.unwrap().unwrap().is_ok());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let pending = PendingRequests::new();
        let _rx = pending.register("7").unwrap();
        assert!(matches!(
            pending.register("7"),
            Err(NetconfError::DuplicateMessageId(id)) if id == "7"
        ));
    }

    #[tokio::test]
    async fn test_fail_all_is_idempotent() {
        let pending = PendingRequests::new();
        let a = pending.register("a").unwrap();
        let b = pending.register("b").unwrap();
        assert_eq!(pending.fail_all(), 2);
        assert_eq!(pending.fail_all(), 0);
        assert!(matches!(a.await.unwrap(), Err(NetconfError::SessionClosed)));
        assert!(matches!(b.await.unwrap(), Err(NetconfError::SessionClosed)));
        assert!(matches!(
            pending.register("c"),
            Err(NetconfError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_timeout_races_reply_exactly_once() {
        let timers = TimerService::start();
        for round in 0..50 {
            let pending = Arc::new(PendingRequests::new());
            let id = format!("{round}");
            let rx = pending.register(&id).unwrap();

            let on_timeout = pending.clone();
            let timeout_id = id.clone();
            let timer = timers.schedule(Duration::from_millis(1), move || {
                on_timeout.complete(
                    &timeout_id,
                    Err(NetconfError::RequestTimeout {
                        message_id: timeout_id.clone(),
                    }),
                );
            });
            pending.attach_timer(&id, timer);

            tokio::time::sleep(Duration::from_millis(1)).await;
            let by_reply = pending.complete(&id, Ok(RpcReply::ok(id.clone())));

            let outcome = rx.await.unwrap();
            assert_eq!(by_reply, outcome.is_ok());
            assert!(pending.is_empty());
        }
    }
}
