//! Test suite for ensuring a correct implementation of a [`Broker`].
use std::time::Duration;

use futures::StreamExt;

use super::*;
use crate::job::JobId;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn mock_message() -> QueueMessage {
    QueueMessage {
        id: JobId::new(),
        text: "Hello".to_owned(),
        source_language: "en".to_owned(),
        target_language: "pt".to_owned(),
    }
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(RECEIVE_TIMEOUT, stream.next())
        .await
        .expect("Timed out waiting for a delivery")
        .expect("Stream ended")
        .expect("Stream errored")
}

async fn assert_nothing_delivered(stream: &mut DeliveryStream) {
    if let Ok(Some(Ok(delivery))) =
        tokio::time::timeout(Duration::from_millis(200), stream.next()).await
    {
        panic!("Unexpected delivery {delivery:?}");
    }
}

/// Create a test suite for a [`Broker`] implementation.
///
/// # Example
///
/// ```
/// use tradutor::queue::memory::InMemoryBroker;
/// use tradutor::queue_test_suite;
/// queue_test_suite!(for: InMemoryBroker::new());
/// ```
#[macro_export]
macro_rules! queue_test_suite {
    (for: $broker:expr) => {
        $crate::queue_test_suite!(attr: tokio::test, args: (), broker: $broker);
    };
    (attr: [$($attr:meta),+], args: $args:tt, broker: $broker:expr) => {
        $(#[$attr])+
        async fn publish_then_consume $args {
            let broker = $broker;
            $crate::queue::testing::publish_then_consume(broker).await;
        }
        $(#[$attr])+
        async fn subscribe_wakes_on_publish $args {
            let broker = $broker;
            $crate::queue::testing::subscribe_wakes_on_publish(broker).await;
        }
        $(#[$attr])+
        async fn deliveries_are_fifo $args {
            let broker = $broker;
            $crate::queue::testing::deliveries_are_fifo(broker).await;
        }
        $(#[$attr])+
        async fn acked_messages_are_not_redelivered $args {
            let broker = $broker;
            $crate::queue::testing::acked_messages_are_not_redelivered(broker).await;
        }
        $(#[$attr])+
        async fn nacked_messages_are_redelivered $args {
            let broker = $broker;
            $crate::queue::testing::nacked_messages_are_redelivered(broker).await;
        }
        $(#[$attr])+
        async fn unacked_messages_survive_channel_close $args {
            let broker = $broker;
            $crate::queue::testing::unacked_messages_survive_channel_close(broker).await;
        }
        $(#[$attr])+
        async fn only_one_consumer_receives_message $args {
            let broker = $broker;
            $crate::queue::testing::only_one_consumer_receives_message(broker).await;
        }
        $(#[$attr])+
        async fn closed_channel_rejects_operations $args {
            let broker = $broker;
            $crate::queue::testing::closed_channel_rejects_operations(broker).await;
        }
    };
    (attr: $attr:meta, args: $args:tt, broker: $broker:expr) => {
        $crate::queue_test_suite!(attr: [$attr], args: $args, broker: $broker);
    };
}

#[doc(hidden)]
pub async fn publish_then_consume(broker: impl Broker) {
    let channel = broker.connect().await.unwrap();
    let message = mock_message();
    channel.publish(&message).await.unwrap();

    let mut stream = channel.subscribe().await.unwrap();
    let delivery = next_delivery(&mut stream).await;

    assert_eq!(delivery.decode::<QueueMessage>().unwrap(), message);
    assert!(!delivery.redelivered);
    channel.ack(delivery.tag).await.unwrap();
    channel.close().await;
}

#[doc(hidden)]
pub async fn subscribe_wakes_on_publish(broker: impl Broker) {
    let consumer = broker.connect().await.unwrap();
    let publisher = broker.connect().await.unwrap();
    let mut stream = consumer.subscribe().await.unwrap();
    let message = mock_message();

    let handle = tokio::spawn(async move {
        let delivery = next_delivery(&mut stream).await;
        (delivery, stream)
    });
    tokio::task::yield_now().await;
    publisher.publish(&message).await.unwrap();

    let (delivery, _stream) = handle.await.unwrap();
    assert_eq!(delivery.decode::<QueueMessage>().unwrap().id, message.id);
    consumer.ack(delivery.tag).await.unwrap();
}

#[doc(hidden)]
pub async fn deliveries_are_fifo(broker: impl Broker) {
    let channel = broker.connect().await.unwrap();
    let messages = [mock_message(), mock_message(), mock_message()];
    for message in &messages {
        channel.publish(message).await.unwrap();
    }

    let mut stream = channel.subscribe().await.unwrap();
    for message in &messages {
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.decode::<QueueMessage>().unwrap().id, message.id);
        channel.ack(delivery.tag).await.unwrap();
    }
}

#[doc(hidden)]
pub async fn acked_messages_are_not_redelivered(broker: impl Broker) {
    let channel = broker.connect().await.unwrap();
    channel.publish(&mock_message()).await.unwrap();
    let mut stream = channel.subscribe().await.unwrap();
    let delivery = next_delivery(&mut stream).await;

    channel.ack(delivery.tag).await.unwrap();
    channel.close().await;

    let channel = broker.connect().await.unwrap();
    let mut stream = channel.subscribe().await.unwrap();
    assert_nothing_delivered(&mut stream).await;
}

#[doc(hidden)]
pub async fn nacked_messages_are_redelivered(broker: impl Broker) {
    let channel = broker.connect().await.unwrap();
    let message = mock_message();
    channel.publish(&message).await.unwrap();
    let mut stream = channel.subscribe().await.unwrap();
    let delivery = next_delivery(&mut stream).await;

    channel.nack(delivery.tag).await.unwrap();

    let redelivery = next_delivery(&mut stream).await;
    assert_eq!(redelivery.decode::<QueueMessage>().unwrap(), message);
    assert!(redelivery.redelivered);
    channel.ack(redelivery.tag).await.unwrap();
}

#[doc(hidden)]
pub async fn unacked_messages_survive_channel_close(broker: impl Broker) {
    let channel = broker.connect().await.unwrap();
    let message = mock_message();
    channel.publish(&message).await.unwrap();
    let mut stream = channel.subscribe().await.unwrap();
    let _delivery = next_delivery(&mut stream).await;

    channel.close().await;
    drop(stream);

    let channel = broker.connect().await.unwrap();
    let mut stream = channel.subscribe().await.unwrap();
    let redelivery = next_delivery(&mut stream).await;
    assert_eq!(redelivery.decode::<QueueMessage>().unwrap(), message);
    assert!(redelivery.redelivered);
    channel.ack(redelivery.tag).await.unwrap();
}

#[doc(hidden)]
pub async fn only_one_consumer_receives_message(broker: impl Broker) {
    let first = broker.connect().await.unwrap();
    let second = broker.connect().await.unwrap();
    first.publish(&mock_message()).await.unwrap();

    let mut first_stream = first.subscribe().await.unwrap();
    let delivery = next_delivery(&mut first_stream).await;
    let mut second_stream = second.subscribe().await.unwrap();

    assert_nothing_delivered(&mut second_stream).await;
    first.ack(delivery.tag).await.unwrap();
}

#[doc(hidden)]
pub async fn closed_channel_rejects_operations(broker: impl Broker) {
    let channel = broker.connect().await.unwrap();
    channel.close().await;

    assert!(!channel.is_open());
    assert!(channel.ping().await.is_err());
    assert!(channel.publish(&mock_message()).await.is_err());
}
