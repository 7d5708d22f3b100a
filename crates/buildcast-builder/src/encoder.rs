//! Turns build output into ordered log events and publishes them.

use buildcast_broker::Broker;
use buildcast_types::{BuildId, LogEvent, StreamKind};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle for emitting log events for one build.
///
/// Cloneable so that the stdout and stderr pumps can share it. Emitting
/// never blocks and never fails: events are queued and published in
/// sequence order by a single background task, and publish failures are
/// logged and dropped there.
#[derive(Clone)]
pub struct LogEncoder {
    inner: Arc<Inner>,
}

struct Inner {
    build_id: BuildId,
    queue: Mutex<Queue>,
    publisher: Mutex<Option<JoinHandle<usize>>>,
}

/// Sequence assignment and enqueueing happen under one lock so that queue
/// order always equals sequence order.
struct Queue {
    sender: Option<mpsc::UnboundedSender<LogEvent>>,
    next_sequence: u64,
}

impl LogEncoder {
    /// Starts the publisher task for `build_id` on `broker`.
    pub fn spawn(build_id: BuildId, broker: Arc<dyn Broker>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let publisher = tokio::spawn(publish_events(broker, build_id.channel(), receiver));
        Self {
            inner: Arc::new(Inner {
                build_id,
                queue: Mutex::new(Queue {
                    sender: Some(sender),
                    next_sequence: 0,
                }),
                publisher: Mutex::new(Some(publisher)),
            }),
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.inner.build_id
    }

    /// Queues one chunk of output as a log event.
    ///
    /// Returns the sequence number assigned to the event, or `None` if the
    /// encoder has already been finished.
    pub fn emit(&self, stream: StreamKind, text: impl Into<Vec<u8>>) -> Option<u64> {
        let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = queue.next_sequence;
        let event = LogEvent {
            build_id: self.inner.build_id.clone(),
            stream,
            text: text.into(),
            sequence,
        };
        queue.sender.as_ref()?.send(event).ok()?;
        queue.next_sequence += 1;
        Some(sequence)
    }

    /// Queues a pipeline lifecycle message.
    pub fn system(&self, message: impl Into<String>) -> Option<u64> {
        self.emit(StreamKind::System, message.into())
    }

    /// Closes the queue and waits until every queued event has been handed
    /// to the broker.
    ///
    /// Returns how many events were published successfully. Only the first
    /// call waits; later calls return 0.
    pub async fn finish(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .take();
        let publisher = self
            .inner
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match publisher {
            Some(handle) => match handle.await {
                Ok(published) => published,
                Err(e) => {
                    tracing::error!(build_id = %self.inner.build_id, "log publisher task failed: {}", e);
                    0
                }
            },
            None => 0,
        }
    }
}

async fn publish_events(
    broker: Arc<dyn Broker>,
    channel: String,
    mut events: mpsc::UnboundedReceiver<LogEvent>,
) -> usize {
    let mut published = 0;
    while let Some(event) = events.recv().await {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(sequence = event.sequence, "failed to encode log event: {}", e);
                continue;
            }
        };
        match broker.publish(&channel, &payload).await {
            Ok(()) => published += 1,
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    sequence = event.sequence,
                    stream = event.stream.as_str(),
                    "failed to publish log: {}",
                    e
                );
            }
        }
    }
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildcast_broker::MemoryBroker;
    use buildcast_types::LogPayload;

    fn build_id() -> BuildId {
        BuildId::new("abc123").unwrap()
    }

    #[tokio::test]
    async fn sequences_are_monotonic_and_published_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let mut sub = broker.subscribe("logs:abc123").await.unwrap();
        let encoder = LogEncoder::spawn(build_id(), broker.clone());

        assert_eq!(encoder.system("Build Started..."), Some(0));
        assert_eq!(encoder.emit(StreamKind::Stdout, b"one\n".to_vec()), Some(1));
        assert_eq!(encoder.emit(StreamKind::Stderr, b"two\n".to_vec()), Some(2));
        assert_eq!(encoder.finish().await, 3);

        let mut logs = Vec::new();
        while let Some(msg) = sub.recv().await {
            logs.push(LogPayload::parse(&msg.payload).unwrap().log);
            if logs.len() == 3 {
                break;
            }
        }
        assert_eq!(logs, ["Build Started...", "one\n", "error: two\n"]);
    }

    #[tokio::test]
    async fn emit_after_finish_is_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let encoder = LogEncoder::spawn(build_id(), broker);
        encoder.system("x");
        assert_eq!(encoder.finish().await, 1);
        assert_eq!(encoder.system("late"), None);
        assert_eq!(encoder.finish().await, 0);
    }

    #[tokio::test]
    async fn publish_failures_do_not_fail_the_emitter() {
        let broker = Arc::new(MemoryBroker::new());
        broker.shutdown().await;
        let encoder = LogEncoder::spawn(build_id(), broker);

        assert_eq!(encoder.system("dropped"), Some(0));
        assert_eq!(encoder.emit(StreamKind::Stdout, "also dropped"), Some(1));
        assert_eq!(encoder.finish().await, 0);
    }

    #[tokio::test]
    async fn clones_share_one_sequence() {
        let broker = Arc::new(MemoryBroker::new());
        let encoder = LogEncoder::spawn(build_id(), broker);
        let other = encoder.clone();

        let a = tokio::spawn(async move {
            (0..50)
                .map(|_| other.emit(StreamKind::Stdout, "a").unwrap())
                .collect::<Vec<_>>()
        });
        let mut b: Vec<u64> = (0..50)
            .map(|_| encoder.emit(StreamKind::Stderr, "b").unwrap())
            .collect();
        let mut all = a.await.unwrap();
        all.append(&mut b);
        all.sort_unstable();

        assert_eq!(all, (0..100).collect::<Vec<u64>>());
        assert_eq!(encoder.finish().await, 100);
    }
}
