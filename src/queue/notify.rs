//! Edge-triggered "something new exists" signal with multiple subscribers.
//!
//! Each subscription owns a single-slot channel. [`Notification::notify`]
//! offers a token to every slot without blocking; a full slot means the
//! subscriber already has a pending wakeup and the token is coalesced.
//! Consumers treat a wakeup purely as "check again", never as a count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

#[derive(Default)]
struct NotifyInner {
    subscribers: RwLock<Vec<(u64, mpsc::Sender<()>)>>,
    next_id: AtomicU64,
}

/// Multi-subscriber notification bus.
///
/// Owned by the queue; subscribers hold a [`Subscription`] handle.
#[derive(Clone, Default)]
pub struct Notification {
    inner: Arc<NotifyInner>,
}

impl Notification {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Notification::default()
    }

    /// Registers a new subscription with an empty slot.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, tx));
        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Offers a token to every subscriber. A full slot drops the token.
    pub(crate) fn notify(&self) {
        let subscribers = self.inner.subscribers.read();
        for (_, tx) in subscribers.iter() {
            let _ = tx.try_send(());
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// A registered subscriber slot.
///
/// Dropping the subscription removes it from the bus; no token is delivered
/// to its slot afterwards.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<()>,
    inner: Arc<NotifyInner>,
}

impl Subscription {
    /// Suspends until a token is available, then consumes it.
    ///
    /// Cancellation-aware: safe to race against a cancellation token inside
    /// `tokio::select!`.
    pub async fn wait(&mut self) {
        let _ = self.rx.recv().await;
    }

    /// Consumes a pending token without waiting. Returns false when the
    /// slot is empty.
    pub fn try_wait(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Removes this subscription from the bus.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner
            .subscribers
            .write()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_wakes_a_waiting_subscriber() {
        let bus = Notification::new();
        let mut sub = bus.subscribe();

        bus.notify();

        tokio::time::timeout(Duration::from_secs(1), sub.wait())
            .await
            .expect("subscriber should wake");
    }

    #[tokio::test]
    async fn notify_reaches_every_subscriber() {
        let bus = Notification::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.notify();

        assert!(first.try_wait());
        assert!(second.try_wait());
    }

    #[tokio::test]
    async fn tokens_coalesce_in_a_full_slot() {
        let bus = Notification::new();
        let mut sub = bus.subscribe();

        bus.notify();
        bus.notify();
        bus.notify();

        // Only one token was retained.
        assert!(sub.try_wait());
        assert!(!sub.try_wait());
    }

    #[tokio::test]
    async fn close_removes_the_subscriber() {
        let bus = Notification::new();
        let sub = bus.subscribe();
        let other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        sub.close();
        assert_eq!(bus.subscriber_count(), 1);

        // Notifying after close must not panic or deliver to the gone slot.
        bus.notify();
        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn notify_without_subscribers_is_a_no_op() {
        let bus = Notification::new();
        bus.notify();
    }
}
