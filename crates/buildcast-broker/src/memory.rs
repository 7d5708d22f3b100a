//! In-process broker.

use crate::subscription::{Subscription, SubscriptionId};
use crate::{validate_pattern, Broker, BrokerError, BrokerMessage, SUBSCRIPTION_CAPACITY};
use async_trait::async_trait;
use buildcast_types::pattern_matches;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Subscribers registered under one pattern.
type Subscribers = HashMap<SubscriptionId, mpsc::Sender<BrokerMessage>>;

/// Registry shared between the broker and the release hooks of its
/// subscriptions.
///
/// Uses `std::sync::RwLock`: every acquisition is a short map operation that
/// never spans an `.await`. Publishes only take the read lock, so builds
/// publishing concurrently never wait on each other.
#[derive(Default)]
struct Registry {
    /// pattern -> subscribers. Entries are created on first subscribe and
    /// removed when their last subscriber leaves.
    patterns: RwLock<HashMap<String, Subscribers>>,
    /// Set once by `shutdown`, under the write lock.
    closed: AtomicBool,
}

impl Registry {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Subscribers>> {
        self.patterns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Subscribers>> {
        self.patterns.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remove(&self, pattern: &str, id: SubscriptionId) {
        let mut patterns = self.write();
        if let Some(subscribers) = patterns.get_mut(pattern) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                patterns.remove(pattern);
            }
        }
    }
}

/// Broker whose channels live in this process.
#[derive(Clone)]
pub struct MemoryBroker {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIPTION_CAPACITY)
    }

    /// Creates a broker whose subscriptions buffer at most `capacity`
    /// undelivered messages each.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// Number of distinct patterns with at least one live subscriber.
    pub fn pattern_count(&self) -> usize {
        self.registry.read().len()
    }

    fn release_hook(&self, pattern: &str, id: SubscriptionId) -> impl FnOnce() + Send + 'static {
        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        let pattern = pattern.to_string();
        move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&pattern, id);
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        if self.registry.is_closed() {
            return Err(BrokerError::Closed);
        }

        let message = BrokerMessage {
            channel: Arc::from(channel),
            payload: Arc::from(payload),
        };

        let patterns = self.registry.read();
        let mut delivered = 0usize;
        for (pattern, subscribers) in patterns.iter() {
            if !pattern_matches(pattern, channel) {
                continue;
            }
            for (id, sender) in subscribers {
                match sender.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            subscription = id,
                            channel = %channel,
                            "dropping message for slow subscriber"
                        );
                    }
                    // Receiver dropped; its release hook is about to run.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        tracing::trace!(channel = %channel, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        validate_pattern(pattern)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        {
            let mut patterns = self.registry.write();
            if self.registry.is_closed() {
                return Err(BrokerError::Closed);
            }
            patterns
                .entry(pattern.to_string())
                .or_default()
                .insert(id, sender);
        }

        tracing::debug!(subscription = id, pattern = %pattern, "subscription opened");
        Ok(Subscription::new(
            id,
            pattern,
            receiver,
            self.release_hook(pattern, id),
        ))
    }

    fn subscriber_count(&self) -> usize {
        self.registry.read().values().map(HashMap::len).sum()
    }

    async fn shutdown(&self) {
        let mut patterns = self.registry.write();
        self.registry.closed.store(true, Ordering::Release);
        let dropped: usize = patterns.values().map(HashMap::len).sum();
        // Dropping the senders ends every live subscription's sequence.
        patterns.clear();
        tracing::info!(subscriptions = dropped, "memory broker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_PATTERN_LEN;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_payload(sub: &mut Subscription) -> String {
        let msg = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("message should arrive")
            .expect("subscription should be open");
        msg.payload.to_string()
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let broker = MemoryBroker::new();
        broker.publish("logs:nobody", r#"{"log":"x"}"#).await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(broker.pattern_count(), 0);
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("logs:X").await.unwrap();

        for i in 0..100 {
            broker.publish("logs:X", &i.to_string()).await.unwrap();
        }
        for i in 0..100 {
            assert_eq!(next_payload(&mut sub).await, i.to_string());
        }
    }

    #[tokio::test]
    async fn pattern_subscription_gets_no_backfill() {
        let broker = MemoryBroker::new();
        broker.publish("logs:A", "early-a").await.unwrap();
        broker.publish("logs:B", "early-b").await.unwrap();

        let mut sub = broker.subscribe("logs:*").await.unwrap();
        broker.publish("logs:A", "late-a").await.unwrap();
        broker.publish("logs:B", "late-b").await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(&*first.channel, "logs:A");
        assert_eq!(&*first.payload, "late-a");
        assert_eq!(next_payload(&mut sub).await, "late-b");
        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn non_matching_channels_are_filtered() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("logs:A").await.unwrap();
        broker.publish("logs:B", "b").await.unwrap();
        broker.publish("logs:A", "a").await.unwrap();
        assert_eq!(next_payload(&mut sub).await, "a");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_collects_pattern() {
        let broker = MemoryBroker::new();
        let mut first = broker.subscribe("logs:A").await.unwrap();
        let second = broker.subscribe("logs:A").await.unwrap();
        assert_eq!(broker.subscriber_count(), 2);
        assert_eq!(broker.pattern_count(), 1);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(broker.subscriber_count(), 1);
        assert_eq!(broker.pattern_count(), 1);

        drop(second);
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(broker.pattern_count(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_publisher_or_others() {
        let broker = MemoryBroker::with_capacity(2);
        let _stalled = broker.subscribe("logs:A").await.unwrap();
        let mut live = broker.subscribe("logs:A").await.unwrap();

        for i in 0..2 {
            broker.publish("logs:A", &i.to_string()).await.unwrap();
            assert_eq!(next_payload(&mut live).await, i.to_string());
        }
        // The stalled subscriber's queue is full; publishing still returns.
        timeout(Duration::from_millis(200), broker.publish("logs:A", "2"))
            .await
            .expect("publish must not block")
            .unwrap();
        assert_eq!(next_payload(&mut live).await, "2");
    }

    #[tokio::test]
    async fn empty_pattern_is_rejected() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.subscribe("").await,
            Err(BrokerError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn subscriptions_have_distinct_ids() {
        let broker = MemoryBroker::new();
        let first = broker.subscribe("logs:A").await.unwrap();
        let second = broker.subscribe("logs:A").await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.pattern(), "logs:A");
        assert_eq!(second.pattern(), "logs:A");
    }

    #[tokio::test]
    async fn overlong_pattern_is_rejected() {
        let broker = MemoryBroker::new();
        let pattern = format!("logs:{}b", "*a".repeat(MAX_PATTERN_LEN));
        assert!(matches!(
            broker.subscribe(&pattern).await,
            Err(BrokerError::InvalidPattern(_))
        ));
        assert_eq!(broker.subscriber_count(), 0);

        let longest = format!("logs:{}", "*".repeat(MAX_PATTERN_LEN - "logs:".len()));
        assert!(broker.subscribe(&longest).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_terminates_subscriptions() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("logs:*").await.unwrap();

        broker.shutdown().await;

        assert!(sub.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
        assert!(matches!(
            broker.publish("logs:A", "x").await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(
            broker.subscribe("logs:*").await,
            Err(BrokerError::Closed)
        ));
        // Releasing after shutdown is harmless.
        sub.unsubscribe();
    }
}
