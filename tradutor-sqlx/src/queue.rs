use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use sqlx::{postgres::PgListener, PgPool};
use tokio::{
    sync::{mpsc, OnceCell, RwLock},
    task::AbortHandle,
};
use tracing::instrument;
use tradutor::{
    job::QueueMessage,
    queue::{Broker, Channel, Delivery, DeliveryStream, DeliveryTag, QueueError, DEFAULT_QUEUE_NAME},
};
use uuid::Uuid;

use crate::types::QueuedMessage;

const NOTIFY_CHANNEL: &str = "tradutor_queue";

type Subscribers = Arc<RwLock<Vec<(Uuid, mpsc::UnboundedSender<()>)>>>;

/// A durable queue held in the `translation_queue` table.
///
/// Each [`PgChannel`] claims messages under its own consumer id with `FOR UPDATE SKIP LOCKED`,
/// so a message is only ever held by one consumer. Acknowledging deletes the row. A claim that
/// is not acknowledged within the lease, for example because the consumer died, is handed out
/// again. Consumers are woken by `LISTEN/NOTIFY` and otherwise poll.
///
/// A claim is renewed for as long as its channel holds it, so only a consumer which stops
/// renewing, for example because it died, loses its messages to another consumer.
#[derive(Clone, Debug)]
pub struct PgBroker {
    pool: PgPool,
    queue: Arc<str>,
    lease: Duration,
    subscribers: Subscribers,
    listener: Arc<OnceCell<()>>,
    migrations: Arc<[PgPool]>,
    migrated: Arc<OnceCell<()>>,
}

impl Deref for PgBroker {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgBroker {
    fn from(pool: PgPool) -> Self {
        Self::new(pool, DEFAULT_QUEUE_NAME)
    }
}

impl PgBroker {
    /// How long a claimed message may stay unacknowledged before it is redelivered.
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);
    const POLL_DELAY: Duration = Duration::from_secs(5);

    pub fn new(pool: PgPool, queue: &str) -> Self {
        Self {
            pool,
            queue: queue.into(),
            lease: Self::DEFAULT_LEASE,
            subscribers: Default::default(),
            listener: Default::default(),
            migrations: Arc::new([]),
            migrated: Default::default(),
        }
    }

    /// Runs [`crate::migrate`] on each of `pools` the first time a connection succeeds.
    ///
    /// Migrating on connect puts schema setup under the same retry policy as the queue
    /// connection, so a database that is still starting does not fail the process.
    pub fn with_migrations(self, pools: impl IntoIterator<Item = PgPool>) -> Self {
        Self {
            migrations: pools.into_iter().collect(),
            ..self
        }
    }

    pub fn with_lease(self, lease: Duration) -> Self {
        Self { lease, ..self }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        for pool in self.migrations.iter() {
            crate::migrate(pool)
                .await
                .map_err(|error| QueueError::Connect(error.to_string()))?;
        }
        Ok(())
    }

    async fn start_listener(&self) -> Result<(), QueueError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|error| QueueError::Connect(error.to_string()))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|error| QueueError::Connect(error.to_string()))?;

        tokio::spawn({
            let subscribers = self.subscribers.clone();
            let queue = self.queue.clone();
            async move {
                loop {
                    match listener.recv().await {
                        Ok(notification) if notification.payload() == &*queue => {
                            subscribers
                                .write()
                                .await
                                .retain(|(_, sender)| sender.send(()).is_ok());
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::warn!(?error, "Queue listener lost its connection");
                            tokio::time::sleep(Self::POLL_DELAY).await;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    type Channel = PgChannel;

    #[instrument(skip(self), fields(queue = %self.queue))]
    async fn connect(&self) -> Result<Self::Channel, QueueError> {
        sqlx::query("SELECT 1")
            .execute(self.deref())
            .await
            .map_err(|error| QueueError::Connect(error.to_string()))?;
        self.migrated
            .get_or_try_init(|| self.run_migrations())
            .await?;
        self.listener
            .get_or_try_init(|| self.start_listener())
            .await?;

        Ok(PgChannel {
            broker: self.clone(),
            consumer_id: Uuid::new_v4(),
            open: Arc::new(AtomicBool::new(true)),
            renewals: Default::default(),
        })
    }
}

/// A consumer on a [`PgBroker`].
#[derive(Clone, Debug)]
pub struct PgChannel {
    broker: PgBroker,
    consumer_id: Uuid,
    open: Arc<AtomicBool>,
    renewals: Arc<Mutex<HashMap<DeliveryTag, AbortHandle>>>,
}

fn operation_error(error: sqlx::Error) -> QueueError {
    match error {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            QueueError::ConnectionClosed
        }
        error => QueueError::Operation(error.to_string()),
    }
}

impl PgChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueueError::ConnectionClosed)
        }
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_open()?;
        let delivery = sqlx::query_as::<_, QueuedMessage>(
            r#"UPDATE translation_queue
            SET
                consumer_id = $2,
                locked_at = timezone('UTC'::text, now()),
                delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM translation_queue
                WHERE queue = $1
                AND (
                    consumer_id IS NULL
                    OR locked_at < timezone('UTC'::text, now()) - make_interval(secs => $3)
                )
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(self.broker.queue())
        .bind(self.consumer_id)
        .bind(self.broker.lease.as_secs_f64())
        .fetch_optional(self.broker.deref())
        .await
        .map_err(operation_error)?
        .map(Delivery::from);
        if let Some(delivery) = &delivery {
            self.hold(delivery.tag)?;
        }
        Ok(delivery)
    }

    /// Keeps renewing the lease on a claimed message until it is acknowledged, returned or the
    /// claim is lost.
    fn hold(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let interval = self.broker.lease / 3;
        let channel = self.clone();
        let renewal = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match channel.renew(tag).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(%tag, consumer_id = %channel.consumer_id, "Lost claim on message");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(?error, %tag, "Failed to renew claim on message");
                    }
                }
            }
        });
        self.renewals
            .lock()
            .map_err(|_| QueueError::BadState)?
            .insert(tag, renewal.abort_handle());
        Ok(())
    }

    fn release_hold(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        if let Some(renewal) = self
            .renewals
            .lock()
            .map_err(|_| QueueError::BadState)?
            .remove(&tag)
        {
            renewal.abort();
        }
        Ok(())
    }

    async fn renew(&self, tag: DeliveryTag) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"UPDATE translation_queue
            SET locked_at = timezone('UTC'::text, now())
            WHERE id = $1 AND consumer_id = $2
            "#,
        )
        .bind(i64::from(tag))
        .bind(self.consumer_id)
        .execute(self.broker.deref())
        .await
        .map_err(operation_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.release_hold(tag)?;
        let result = sqlx::query(
            r#"UPDATE translation_queue
            SET consumer_id = NULL, locked_at = NULL
            WHERE id = $1 AND consumer_id = $2
            "#,
        )
        .bind(i64::from(tag))
        .bind(self.consumer_id)
        .execute(self.broker.deref())
        .await
        .map_err(operation_error)?;
        match result.rows_affected() {
            0 => Err(QueueError::UnknownDelivery(tag)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Channel for PgChannel {
    #[instrument(skip(self, message), fields(request_id = %message.id))]
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.ensure_open()?;
        let payload = serde_json::to_value(message)?;
        sqlx::query("INSERT INTO translation_queue (queue, payload) VALUES ($1, $2)")
            .bind(self.broker.queue())
            .bind(payload)
            .execute(self.broker.deref())
            .await
            .map_err(operation_error)?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, QueueError> {
        self.ensure_open()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.broker
            .subscribers
            .write()
            .await
            .push((self.consumer_id, sender));

        let channel = self.clone();
        Ok(Box::pin(stream! {
            loop {
                match channel.claim().await {
                    Ok(Some(delivery)) => yield Ok(delivery),
                    Ok(None) => {
                        tokio::select! {
                            _ = receiver.recv() => {},
                            _ = tokio::time::sleep(PgBroker::POLL_DELAY) => {},
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

    #[instrument(skip(self))]
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.release_hold(tag)?;
        let result = sqlx::query("DELETE FROM translation_queue WHERE id = $1 AND consumer_id = $2")
            .bind(i64::from(tag))
            .bind(self.consumer_id)
            .execute(self.broker.deref())
            .await
            .map_err(operation_error)?;
        match result.rows_affected() {
            0 => Err(QueueError::UnknownDelivery(tag)),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self))]
    async fn nack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.release(tag).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.ensure_open()?;
        sqlx::query("SELECT 1")
            .execute(self.broker.deref())
            .await
            .map_err(operation_error)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut renewals) = self.renewals.lock() {
            renewals.drain().for_each(|(_, renewal)| renewal.abort());
        }
        let released = sqlx::query(
            r#"UPDATE translation_queue
            SET consumer_id = NULL, locked_at = NULL
            WHERE consumer_id = $1
            "#,
        )
        .bind(self.consumer_id)
        .execute(self.broker.deref())
        .await;
        if let Err(error) = released {
            // Claims left behind are picked up again once their lease expires.
            tracing::warn!(?error, consumer_id = %self.consumer_id, "Failed to release claimed messages");
        }
        self.broker
            .subscribers
            .write()
            .await
            .retain(|(consumer, _)| *consumer != self.consumer_id);
    }
}
