//! Notification fan-out.
//!
//! Each subscriber owns the receiving end of an unbounded channel, so a
//! slow or failed listener never blocks the publisher or its siblings.
//! Delivery to one listener preserves publish order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::protocol::Notification;

/// Receiving side of a notification subscription
pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

/// Registered notification listeners of one session.
#[derive(Debug, Default)]
pub struct NotificationListeners {
    listeners: Mutex<Vec<(u64, mpsc::UnboundedSender<Notification>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl NotificationListeners {
    /// Create empty listener list
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, mpsc::UnboundedSender<Notification>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a listener. After [`close`](Self::close) the returned stream
    /// ends immediately.
    pub fn subscribe(&self) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.lock();
        if !self.closed.load(Ordering::Acquire) {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            listeners.push((id, tx));
        }
        rx
    }

    /// Deliver to every listener. Listeners whose stream was dropped are
    /// logged and removed; returns the number of successful deliveries.
    pub fn publish(&self, notification: &Notification) -> usize {
        let mut listeners = self.lock();
        let mut delivered = 0;
        listeners.retain(|(id, tx)| match tx.send(notification.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            },
            Err(_) => {
                tracing::warn!("Dropping notification listener {}: receiver closed", id);
                false
            },
        });
        delivered
    }

    /// Release all registrations; their streams end.
    pub fn close(&self) {
        let mut listeners = self.lock();
        self.closed.store(true, Ordering::Release);
        listeners.clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let listeners = NotificationListeners::new();
        let mut a = listeners.subscribe();
        let mut b = listeners.subscribe();

        for i in 0..3 {
            assert_eq!(listeners.publish(&Notification::new(format!("<e{i}/>"))), 2);
        }
        for i in 0..3 {
            assert_eq!(a.recv().await.unwrap().content, format!("<e{i}/>"));
            assert_eq!(b.recv().await.unwrap().content, format!("<e{i}/>"));
        }
    }

    #[tokio::test]
    async fn test_dead_listener_does_not_block_others() {
        let listeners = NotificationListeners::new();
        let dead = listeners.subscribe();
        let mut alive = listeners.subscribe();
        drop(dead);

        assert_eq!(listeners.publish(&Notification::new("<e/>")), 1);
        assert_eq!(listeners.len(), 1);
        assert!(alive.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let listeners = NotificationListeners::new();
        let mut rx = listeners.subscribe();
        listeners.close();
        assert!(rx.recv().await.is_none());
        let mut late = listeners.subscribe();
        assert!(late.recv().await.is_none());
        assert!(listeners.is_empty());
    }
}
