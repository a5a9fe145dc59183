//! Shared timer service.
//!
//! One driver task owns a [`DelayQueue`] (a hierarchical timing wheel) and
//! every hello, idle and request timeout in the process is an entry in it.
//! Callers talk to the driver through a command channel, so scheduling,
//! resetting and cancelling never block.
//!
//! ```text
//!  TimerService::schedule ──Schedule──┐
//!  TimerHandle::reset ──────Reset─────┤      ┌──────────────┐
//!  TimerHandle::cancel ─────Cancel────┼────> │ driver task  │──expired──> callback()
//!  TimerService::shutdown ──Shutdown──┘      │ (DelayQueue) │
//!                                            └──────────────┘
//! ```
//!
//! Callbacks run on the driver task and should only hand work off (send on
//! a channel, complete a oneshot). Cancelling races with expiry are settled
//! by whoever owns the guarded state the callback touches; see
//! [`PendingRequests`](crate::dispatch::PendingRequests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};

/// Longest delay the wheel accepts. Longer delays are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule {
        id: u64,
        delay: Duration,
        callback: Callback,
    },
    Reset {
        id: u64,
        delay: Duration,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

/// Handle to the shared timer driver.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

impl TimerService {
    /// Spawn the driver task on the current runtime.
    pub fn start() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            inner: Arc::new(Inner {
                commands,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Run `callback` once `delay` has elapsed, unless cancelled first.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::Schedule {
            id,
            delay,
            callback: Box::new(callback),
        };
        if self.inner.commands.send(command).is_err() {
            tracing::warn!("Timer service stopped; timer {} will never fire", id);
        }
        TimerHandle {
            id,
            commands: self.inner.commands.clone(),
        }
    }

    /// Whether the driver task is still running.
    pub fn is_running(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    /// Stop the driver. Timers that have not fired are dropped.
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("running", &self.is_running())
            .finish()
    }
}

/// A scheduled timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl TimerHandle {
    /// Timer id, unique within its service
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the timer. No-op if it already fired or was cancelled.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel { id: self.id });
    }

    /// Restart the countdown with a new delay. No-op once fired.
    pub fn reset(&self, delay: Duration) {
        let _ = self.commands.send(Command::Reset { id: self.id, delay });
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule { id, delay, .. } => write!(f, "Schedule({id}, {delay:?})"),
            Self::Reset { id, delay } => write!(f, "Reset({id}, {delay:?})"),
            Self::Cancel { id } => write!(f, "Cancel({id})"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut queue: DelayQueue<u64> = DelayQueue::new();
    let mut entries: HashMap<u64, (delay_queue::Key, Callback)> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Schedule { id, delay, callback }) => {
                    let key = queue.insert(id, clamp(id, delay));
                    entries.insert(id, (key, callback));
                },
                Some(Command::Reset { id, delay }) => {
                    if let Some((key, _)) = entries.get(&id) {
                        queue.reset(key, clamp(id, delay));
                    }
                },
                Some(Command::Cancel { id }) => {
                    if let Some((key, _)) = entries.remove(&id) {
                        queue.remove(&key);
                    }
                },
                Some(Command::Shutdown) | None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let id = expired.into_inner();
                if let Some((_, callback)) = entries.remove(&id) {
                    callback();
                }
            },
        }
    }

    tracing::debug!("Timer service stopped with {} pending timers", entries.len());
}

fn clamp(id: u64, delay: Duration) -> Duration {
    if delay > MAX_DELAY {
        tracing::warn!("Timer {} delay {:?} clamped to {:?}", id, delay, MAX_DELAY);
        MAX_DELAY
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test]
    async fn test_timer_fires() {
        let timers = TimerService::start();
        let (tx, rx) = oneshot::channel();
        timers.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        assert!(timeout(Duration::from_secs(2), rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let timers = TimerService::start();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = timers.schedule(Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();
        sleep(Duration::from_millis(150)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reset_postpones() {
        let timers = TimerService::start();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = timers.schedule(Duration::from_millis(80), move || {
            flag.store(true, Ordering::SeqCst);
        });
        handle.reset(Duration::from_millis(400));
        sleep(Duration::from_millis(150)).await;
        assert!(!fired.load(Ordering::SeqCst));
        sleep(Duration::from_millis(600)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fire_order_follows_deadline() {
        let timers = TimerService::start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (label, ms) in [("late", 60u64), ("early", 10)] {
            let tx = tx.clone();
            timers.schedule(Duration::from_millis(ms), move || {
                let _ = tx.send(label);
            });
        }
        assert_eq!(rx.recv().await, Some("early"));
        assert_eq!(rx.recv().await, Some("late"));
    }

    #[tokio::test]
    async fn test_oversized_delay_does_not_stop_driver() {
        let timers = TimerService::start();
        let far = timers.schedule(Duration::from_secs(100_000_000), || {});
        far.reset(Duration::MAX);

        let (tx, rx) = oneshot::channel();
        timers.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        assert!(timeout(Duration::from_secs(2), rx).await.is_ok());
        assert!(timers.is_running());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let timers = TimerService::start();
        timers.shutdown();
        sleep(Duration::from_millis(20)).await;
        assert!(!timers.is_running());
    }
}
