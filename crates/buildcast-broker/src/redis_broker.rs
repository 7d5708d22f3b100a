//! Redis-backed broker.
//!
//! Publishes go through one multiplexed [`ConnectionManager`], which
//! reconnects on its own. Each subscription owns a dedicated pub/sub
//! connection and a forwarding task; releasing the subscription aborts the
//! task, which drops the connection and with it the `PSUBSCRIBE`.

use crate::subscription::{Subscription, SubscriptionId};
use crate::{validate_pattern, Broker, BrokerError, BrokerMessage, SUBSCRIPTION_CAPACITY};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;

type ForwardTasks = Arc<Mutex<HashMap<SubscriptionId, AbortHandle>>>;

/// Broker backed by Redis `PUBLISH` / `PSUBSCRIBE`.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
    /// Forwarding task of every live subscription.
    tasks: ForwardTasks,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl RedisBroker {
    /// Connects to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Fails if the URL is malformed or the server cannot be reached. Callers
    /// treat this as fatal at startup.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        tracing::info!("connected to redis broker");
        Ok(Self {
            client,
            publisher,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::trace!(channel = %channel, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        validate_pattern(pattern)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let id: SubscriptionId = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let task_pattern = pattern.to_string();

        let forward = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(
                            subscription = id,
                            "discarding undecodable redis payload: {}",
                            e
                        );
                        continue;
                    }
                };
                let message = BrokerMessage {
                    channel: Arc::from(msg.get_channel_name()),
                    payload: Arc::from(payload),
                };
                match sender.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            subscription = id,
                            pattern = %task_pattern,
                            "dropping message for slow subscriber"
                        );
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            tracing::debug!(subscription = id, pattern = %task_pattern, "redis subscription ended");
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, forward.abort_handle());
        let tasks = self.tasks.clone();
        tracing::debug!(subscription = id, pattern = %pattern, "subscription opened");

        Ok(Subscription::new(id, pattern, receiver, move || {
            let handle = tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(handle) = handle {
                handle.abort();
            }
        }))
    }

    fn subscriber_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let tasks: Vec<AbortHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        // Aborting a forwarder drops its sender, ending the subscription.
        for handle in &tasks {
            handle.abort();
        }
        tracing::info!(subscriptions = tasks.len(), "redis broker shut down");
    }
}
