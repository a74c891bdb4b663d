//! Consuming the queue and translating jobs.
//!
//! A [`Worker`] runs one consumption loop: it takes a message, drives the job to a terminal
//! status and only then acknowledges it. Messages are handled one at a time.
//!
//! The loop survives the queue going away. Failing to connect at startup is fatal, but once the
//! worker has connected any loss of the channel tears the loop down and starts it again after
//! [`ReconnectPolicy::restart_delay`](crate::supervisor::ReconnectPolicy::restart_delay).
//! Anything delivered but not yet acknowledged is redelivered by the broker.
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    job::{
        runner::{JobRunner, Outcome},
        QueueMessage,
    },
    queue::{Broker, Channel, Delivery, QueueError},
    store::{JobStore, StoreError},
    supervisor::ConnectionSupervisor,
    translator::Translator,
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Could not connect to the queue at startup: {0}")]
    Startup(#[source] QueueError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Translates jobs taken from the queue.
pub struct Worker<B: Broker, S, T> {
    supervisor: Arc<ConnectionSupervisor<B>>,
    runner: JobRunner<S, T>,
}

impl<B, S, T> Worker<B, S, T>
where
    B: Broker,
    S: JobStore,
    T: Translator,
{
    pub fn new(supervisor: Arc<ConnectionSupervisor<B>>, store: Arc<S>, translator: T) -> Self {
        Self {
            supervisor,
            runner: JobRunner::new(store, Arc::new(translator)),
        }
    }

    /// Bounds each call to the translator. Without it a call may take as long as it likes.
    pub fn with_translation_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            runner: self.runner.with_timeout(timeout),
            ..self
        }
    }

    /// Runs the consumption loop until `cancellation_token` is cancelled.
    ///
    /// Returns [`WorkerError::Startup`] if the first connection cannot be established. After
    /// that the loop only ends on cancellation, finishing the message in hand first.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<(), WorkerError> {
        let restart_delay = self.supervisor.policy().restart_delay;
        let mut started = false;

        loop {
            let channel = tokio::select! {
                result = self.supervisor.connect() => result,
                _ = cancellation_token.cancelled() => break,
            };
            let error = match channel {
                Ok(channel) => {
                    started = true;
                    match self.consume(&*channel, &cancellation_token).await {
                        Ok(()) => break,
                        Err(error) => error,
                    }
                }
                Err(error) if !started => {
                    tracing::error!(?error, "Worker could not connect to the queue");
                    return Err(WorkerError::Startup(error));
                }
                Err(error) => error.into(),
            };

            if matches!(error, WorkerError::Queue(_)) {
                self.supervisor.invalidate().await;
            }
            tracing::warn!(
                ?error,
                "Worker consumption loop stopped, restarting in {restart_delay:?}"
            );
            tokio::select! {
                _ = tokio::time::sleep(restart_delay) => {},
                _ = cancellation_token.cancelled() => break,
            }
        }

        tracing::info!("Worker shut down");
        self.supervisor.shutdown().await;
        Ok(())
    }

    /// Runs the worker on a new task.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<Result<(), WorkerError>> {
        tokio::spawn(async move { self.run(cancellation_token).await })
    }

    async fn consume(
        &self,
        channel: &B::Channel,
        cancellation_token: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut deliveries = channel.subscribe().await?;
        tracing::info!("Waiting for translation jobs");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => return Ok(()),
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.handle(channel, delivery).await?,
                Some(Err(error)) => return Err(error.into()),
                None => return Err(QueueError::ConnectionClosed.into()),
            }
        }
    }

    #[instrument(skip_all, fields(tag = %delivery.tag, redelivered = delivery.redelivered))]
    async fn handle(&self, channel: &B::Channel, delivery: Delivery) -> Result<(), WorkerError> {
        let message = match delivery.decode::<QueueMessage>() {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(
                    ?error,
                    payload = %delivery.payload,
                    "Discarding message that is not a translation job"
                );
                channel.ack(delivery.tag).await?;
                return Ok(());
            }
        };

        let job_id = message.id;
        match self.runner.execute(message).await {
            Ok(outcome) => {
                if let Outcome::Failed(reason) = &outcome {
                    tracing::debug!(%job_id, %reason, "Acknowledging failed job {job_id}");
                }
                channel.ack(delivery.tag).await?;
                Ok(())
            }
            Err(error) => {
                tracing::error!(?error, %job_id, "Could not record result of job {job_id}");
                if let Err(nack_error) = channel.nack(delivery.tag).await {
                    tracing::error!(error = ?nack_error, %job_id, "Failed to return job {job_id} to the queue");
                }
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backoff::Backoff,
        job::{Job, JobId, JobStatus, TranslationRequest},
        queue::memory::InMemoryBroker,
        store::memory::InMemoryJobStore,
        supervisor::ReconnectPolicy,
        testing::ScriptedTranslator,
    };
    use assert_matches::assert_matches;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::constant(Duration::from_millis(5)))
            .with_restart_delay(Duration::from_millis(20))
    }

    fn supervisor(broker: &InMemoryBroker) -> Arc<ConnectionSupervisor<InMemoryBroker>> {
        Arc::new(ConnectionSupervisor::new(broker.clone(), policy()))
    }

    async fn enqueue(store: &InMemoryJobStore, broker: &InMemoryBroker) -> JobId {
        let job = Job::queued(TranslationRequest::new("Hello", "en", "pt"));
        store.insert(&job).await.unwrap();
        broker
            .connect()
            .await
            .unwrap()
            .publish(&job.message())
            .await
            .unwrap();
        job.id
    }

    async fn wait_for_terminal(store: &InMemoryJobStore, id: JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = store.get(id).await.unwrap() {
                    if job.status.is_terminal() {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met")
    }

    #[tokio::test]
    async fn translates_and_acknowledges() {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        let id = enqueue(&store, &broker).await;
        let token = CancellationToken::new();
        let worker = Worker::new(
            supervisor(&broker),
            Arc::new(store.clone()),
            ScriptedTranslator::echo(),
        );
        let handle = worker.spawn(token.clone());

        let job = wait_for_terminal(&store, id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_text.as_deref(), Some("[pt] Hello"));
        wait_until(|| broker.unacked() == 0 && broker.pending() == 0).await;

        token.cancel();
        assert_matches!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn failed_translation_is_acknowledged() {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        let id = enqueue(&store, &broker).await;
        let token = CancellationToken::new();
        let translator = ScriptedTranslator::failing("provider down");
        let handle = Worker::new(supervisor(&broker), Arc::new(store.clone()), translator.clone())
            .spawn(token.clone());

        let job = wait_for_terminal(&store, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result_text.is_none());
        wait_until(|| broker.unacked() == 0 && broker.pending() == 0).await;
        assert_eq!(translator.calls(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn startup_connection_failure_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(10);
        let worker = Worker::new(
            supervisor(&broker),
            Arc::new(InMemoryJobStore::new()),
            ScriptedTranslator::echo(),
        );

        let result = worker.run(CancellationToken::new()).await;

        assert_matches!(
            result,
            Err(WorkerError::Startup(QueueError::RetriesExhausted { attempts: 3, .. }))
        );
    }

    #[tokio::test]
    async fn poison_messages_are_discarded() {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        broker
            .push_raw(serde_json::json!({"unexpected": "shape"}))
            .unwrap();
        let id = enqueue(&store, &broker).await;
        let token = CancellationToken::new();
        let handle = Worker::new(
            supervisor(&broker),
            Arc::new(store.clone()),
            ScriptedTranslator::echo(),
        )
        .spawn(token.clone());

        assert_eq!(wait_for_terminal(&store, id).await.status, JobStatus::Completed);
        wait_until(|| broker.unacked() == 0 && broker.pending() == 0).await;

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn store_outage_returns_message_to_queue() {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        let id = enqueue(&store, &broker).await;
        store.set_unavailable(true);
        let token = CancellationToken::new();
        let translator = ScriptedTranslator::echo();
        let handle = Worker::new(supervisor(&broker), Arc::new(store.clone()), translator.clone())
            .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(translator.calls(), 0);
        store.set_unavailable(false);

        assert_eq!(wait_for_terminal(&store, id).await.status, JobStatus::Completed);
        wait_until(|| broker.unacked() == 0 && broker.pending() == 0).await;

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restarts_after_connection_loss() {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        let first = enqueue(&store, &broker).await;
        let token = CancellationToken::new();
        let handle = Worker::new(
            supervisor(&broker),
            Arc::new(store.clone()),
            ScriptedTranslator::echo(),
        )
        .spawn(token.clone());
        wait_for_terminal(&store, first).await;

        broker.drop_connections().unwrap();
        let second = enqueue(&store, &broker).await;
        broker.fail_next_connects(2);

        assert_eq!(
            wait_for_terminal(&store, second).await.status,
            JobStatus::Completed
        );
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_retranslated() {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        let id = enqueue(&store, &broker).await;
        store.mark_processing(id).await.unwrap();
        store.mark_completed(id, "Olá").await.unwrap();
        let token = CancellationToken::new();
        let translator = ScriptedTranslator::echo();
        let handle = Worker::new(supervisor(&broker), Arc::new(store.clone()), translator.clone())
            .spawn(token.clone());

        wait_until(|| broker.unacked() == 0 && broker.pending() == 0).await;
        assert_eq!(translator.calls(), 0);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().result_text.as_deref(),
            Some("Olá")
        );

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
