//! Provides an in memory implementation of [`Broker`].
//!
//! Messages survive channel loss (unacknowledged deliveries are returned to the queue) but not
//! the process. It also exposes hooks for simulating broker outages in tests.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Broker, Channel, Delivery, DeliveryStream, DeliveryTag, QueueError};
use crate::job::QueueMessage;

/// An in memory implementation of [`Broker`].
///
/// Clones share the same queue.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    next_channel: AtomicU64,
    next_tag: AtomicI64,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Stored>,
    unacked: HashMap<DeliveryTag, Unacked>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<()>)>,
    fail_publishes: bool,
}

#[derive(Clone)]
struct Stored {
    payload: serde_json::Value,
    delivered_before: bool,
}

struct Unacked {
    channel: u64,
    message: Stored,
}

impl State {
    fn wake_subscribers(&mut self) {
        self.subscribers
            .retain(|(_, subscriber)| subscriber.send(()).is_ok());
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("pending", &self.pending())
            .field("unacked", &self.unacked())
            .finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    /// Creates a new instance of [`InMemoryBroker`] with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls to [`Broker::connect`] fail with [`QueueError::Connect`].
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// The number of times [`Broker::connect`] has been called, including failed attempts.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// While set, [`Channel::publish`] fails with [`QueueError::Operation`].
    pub fn fail_publishes(&self, fail: bool) -> Result<(), QueueError> {
        self.shared.lock()?.fail_publishes = fail;
        Ok(())
    }

    /// Closes every open channel, as if the broker had restarted.
    ///
    /// Unacknowledged deliveries are returned to the queue.
    pub fn drop_connections(&self) -> Result<(), QueueError> {
        let channels = self
            .shared
            .lock()?
            .channels
            .keys()
            .copied()
            .collect::<Vec<_>>();
        channels
            .into_iter()
            .try_for_each(|channel| self.shared.close_channel(channel))
    }

    /// Pushes a raw payload onto the queue, bypassing [`QueueMessage`] encoding.
    pub fn push_raw(&self, payload: serde_json::Value) -> Result<(), QueueError> {
        let mut state = self.shared.lock()?;
        state.ready.push_back(Stored {
            payload,
            delivered_before: false,
        });
        state.wake_subscribers();
        Ok(())
    }

    /// The number of messages waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.shared
            .lock()
            .map(|state| state.ready.len())
            .unwrap_or_default()
    }

    /// The number of messages delivered but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.shared
            .lock()
            .map(|state| state.unacked.len())
            .unwrap_or_default()
    }
}

impl Shared {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::BadState)
    }

    fn close_channel(&self, channel: u64) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(open) = state.channels.remove(&channel) {
            open.store(false, Ordering::SeqCst);
        }
        let mut returned = state
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel == channel)
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        returned.sort();
        for tag in returned.into_iter().rev() {
            if let Some(Unacked { message, .. }) = state.unacked.remove(&tag) {
                state.ready.push_front(Stored {
                    delivered_before: true,
                    ..message
                });
            }
        }
        // Dropping the senders wakes the closed channel's own streams.
        state.subscribers.retain(|(owner, _)| *owner != channel);
        state.wake_subscribers();
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn connect(&self) -> Result<Self::Channel, QueueError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if should_fail {
            return Err(QueueError::Connect("in memory broker unavailable".to_owned()));
        }

        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        self.shared.lock()?.channels.insert(id, open.clone());
        Ok(InMemoryChannel {
            id,
            shared: self.shared.clone(),
            open,
        })
    }
}

/// A channel opened on an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl InMemoryChannel {
    const POLL_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueueError::ConnectionClosed)
        }
    }

    fn next_delivery(&self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_open()?;
        let mut state = self.shared.lock()?;
        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        let tag = DeliveryTag::from(self.shared.next_tag.fetch_add(1, Ordering::SeqCst));
        let delivery = Delivery {
            tag,
            payload: message.payload.clone(),
            redelivered: message.delivered_before,
        };
        state.unacked.insert(
            tag,
            Unacked {
                channel: self.id,
                message,
            },
        );
        Ok(Some(delivery))
    }

    fn take_unacked(&self, tag: DeliveryTag) -> Result<Stored, QueueError> {
        self.ensure_open()?;
        let mut state = self.shared.lock()?;
        match state.unacked.get(&tag) {
            Some(unacked) if unacked.channel == self.id => state
                .unacked
                .remove(&tag)
                .map(|unacked| unacked.message)
                .ok_or(QueueError::UnknownDelivery(tag)),
            _ => Err(QueueError::UnknownDelivery(tag)),
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.ensure_open()?;
        let payload = serde_json::to_value(message)?;
        let mut state = self.shared.lock()?;
        if state.fail_publishes {
            return Err(QueueError::Operation("publish rejected".to_owned()));
        }
        state.ready.push_back(Stored {
            payload,
            delivered_before: false,
        });
        state.wake_subscribers();
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, QueueError> {
        self.ensure_open()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.shared.lock()?.subscribers.push((self.id, sender));

        let channel = self.clone();
        Ok(Box::pin(stream! {
            loop {
                match channel.next_delivery() {
                    Ok(Some(delivery)) => yield Ok(delivery),
                    Ok(None) => {
                        tokio::select! {
                            _ = receiver.recv() => {},
                            _ = tokio::time::sleep(InMemoryChannel::POLL_DELAY) => {},
                        }
                    }
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.take_unacked(tag).map(|_| ())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let message = self.take_unacked(tag)?;
        let mut state = self.shared.lock()?;
        state.ready.push_front(Stored {
            delivered_before: true,
            ..message
        });
        state.wake_subscribers();
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.ensure_open()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Err(error) = self.shared.close_channel(self.id) {
            tracing::error!(?error, "Failed to close in memory channel");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{job::JobId, queue_test_suite};
    use assert_matches::assert_matches;
    use futures::StreamExt;

    queue_test_suite!(for: InMemoryBroker::new());

    #[tokio::test]
    async fn failing_connects_are_counted_down() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);

        assert_matches!(broker.connect().await, Err(QueueError::Connect(_)));
        assert_matches!(broker.connect().await, Err(QueueError::Connect(_)));
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn drop_connections_closes_streams() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        let mut stream = channel.subscribe().await.unwrap();

        broker.drop_connections().unwrap();

        assert_matches!(
            stream.next().await,
            Some(Err(QueueError::ConnectionClosed))
        );
        assert!(stream.next().await.is_none());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn subscription_waits_for_publish() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        let stream = channel.subscribe().await.unwrap();
        let mut stream = Box::pin(tokio_stream::StreamExt::timeout(
            stream,
            std::time::Duration::from_millis(50),
        ));

        assert_matches!(stream.next().await, Some(Err(_)));

        broker.push_raw(serde_json::json!({"anything": true})).unwrap();

        assert_matches!(stream.next().await, Some(Ok(Ok(_))));
    }

    #[tokio::test]
    async fn failing_publishes() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        broker.fail_publishes(true).unwrap();

        let message = QueueMessage {
            id: JobId::new(),
            text: "Hello".to_owned(),
            source_language: "en".to_owned(),
            target_language: "pt".to_owned(),
        };

        assert_matches!(
            channel.publish(&message).await,
            Err(QueueError::Operation(_))
        );
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn ack_from_another_channel_is_unknown() {
        let broker = InMemoryBroker::new();
        let consumer = broker.connect().await.unwrap();
        let other = broker.connect().await.unwrap();
        broker.push_raw(serde_json::json!({"anything": true})).unwrap();
        let mut stream = consumer.subscribe().await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        assert_matches!(
            other.ack(delivery.tag).await,
            Err(QueueError::UnknownDelivery(_))
        );
        assert!(consumer.ack(delivery.tag).await.is_ok());
    }
}
