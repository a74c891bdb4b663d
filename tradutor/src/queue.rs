//! The durable, at-least-once, queue between admission and the workers.
//!
//! A [`Broker`] knows how to open a [`Channel`]. A channel publishes [`QueueMessage`]s and hands
//! them to consumers as [`Delivery`]s. A delivery stays owned by its consumer until it is
//! [`Channel::ack`]ed or [`Channel::nack`]ed. If the channel is lost first the broker makes the
//! message available again, flagged as redelivered.
//!
//! Connection lifecycle is handled by [`crate::supervisor::ConnectionSupervisor`], not by callers.
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::job::QueueMessage;

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// The queue used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "translation_queue";

/// Something that can open connections to a durable queue.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Channel: Channel;

    /// Opens a new channel.
    ///
    /// Returns [`QueueError::Connect`] if the broker cannot be reached.
    async fn connect(&self) -> Result<Self::Channel, QueueError>;
}

/// An open connection to the queue.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Persists a message on the queue.
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Starts consuming the queue.
    ///
    /// The stream yields an error, and then ends, when the channel is lost.
    async fn subscribe(&self) -> Result<DeliveryStream, QueueError>;

    /// Removes a delivered message from the queue.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Returns a delivered message to the queue for redelivery.
    async fn nack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Round trip to the broker.
    async fn ping(&self) -> Result<(), QueueError>;

    fn is_open(&self) -> bool;

    /// Closes the channel, returning any unacknowledged deliveries to the queue.
    async fn close(&self);
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// Identifies a delivery on the channel that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(i64);

impl From<i64> for DeliveryTag {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<DeliveryTag> for i64 {
    fn from(value: DeliveryTag) -> Self {
        value.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeliveryTag({})", self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: serde_json::Value,
    /// Whether this message has been delivered before without being acknowledged.
    pub redelivered: bool,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to connect to the queue: {0}")]
    Connect(String),
    #[error("Gave up connecting to the queue after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<QueueError> },
    #[error("Queue connection closed")]
    ConnectionClosed,
    #[error("Queue operation failed: {0}")]
    Operation(String),
    #[error("Unknown delivery {0}")]
    UnknownDelivery(DeliveryTag),
    #[error("Error encoding or decoding message")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Queue in bad state")]
    BadState,
}
