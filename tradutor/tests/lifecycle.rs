use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tradutor::{
    prelude::*,
    queue::memory::InMemoryBroker,
    store::memory::InMemoryJobStore,
    testing::ScriptedTranslator,
};

struct Harness {
    store: InMemoryJobStore,
    broker: InMemoryBroker,
    admission: AdmissionService<InMemoryJobStore, InMemoryBroker>,
    client: PollingClient<StatusService<InMemoryJobStore>>,
    token: CancellationToken,
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_max_attempts(5)
        .with_backoff(Backoff::constant(Duration::from_millis(5)))
        .with_restart_delay(Duration::from_millis(20))
}

impl Harness {
    fn new() -> Self {
        let store = InMemoryJobStore::new();
        let broker = InMemoryBroker::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(broker.clone(), policy()));
        let admission = AdmissionService::new(Arc::new(store.clone()), supervisor);
        let client = PollingClient::new(StatusService::new(Arc::new(store.clone()))).with_config(
            PollConfig::default()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(300),
        );
        Self {
            store,
            broker,
            admission,
            client,
            token: CancellationToken::new(),
        }
    }

    fn start_worker(
        &self,
        translator: ScriptedTranslator,
    ) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
        let supervisor = Arc::new(ConnectionSupervisor::new(self.broker.clone(), policy()));
        Worker::new(supervisor, Arc::new(self.store.clone()), translator).spawn(self.token.clone())
    }

    async fn submit(&self, text: &str) -> JobId {
        self.admission
            .submit(TranslationRequest::new(text, "en", "pt"))
            .await
            .unwrap()
    }

    async fn settled(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.broker.pending() > 0 || self.broker.unacked() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue did not drain");
    }
}

#[tokio::test]
async fn submitted_job_completes() {
    let harness = Harness::new();
    let worker = harness.start_worker(ScriptedTranslator::echo());

    let id = harness.submit("Hello").await;
    let view = harness.client.wait_for_terminal(id).await.unwrap();

    assert_eq!(view.request_id, id);
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.original_text, "Hello");
    assert!(!view.translated_text.unwrap().trim().is_empty());
    assert!(view.updated_at >= view.created_at);

    harness.token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn submission_is_queued_until_a_worker_runs() {
    let harness = Harness::new();

    let id = harness.submit("Hello").await;
    let status = StatusService::new(Arc::new(harness.store.clone()));

    assert_eq!(status.get_status(id).await.unwrap().status, JobStatus::Queued);
    assert_eq!(harness.broker.pending(), 1);
}

#[tokio::test]
async fn missing_language_is_rejected() {
    let harness = Harness::new();

    let result = harness
        .admission
        .submit(TranslationRequest {
            text: "Hello".to_owned(),
            source_language: String::new(),
            target_language: "pt".to_owned(),
        })
        .await;

    assert_matches!(
        result,
        Err(AdmissionError::Validation(ValidationError::Missing(
            "sourceLanguage"
        )))
    );
    assert!(harness.store.is_empty());
    assert_eq!(harness.broker.pending(), 0);
}

#[tokio::test]
async fn polling_an_unknown_id_times_out() {
    let harness = Harness::new();
    let client = PollingClient::new(StatusService::new(Arc::new(harness.store.clone())))
        .with_config(
            PollConfig::default()
                .with_interval(Duration::from_millis(1))
                .with_max_attempts(5),
        );
    let mut observations = vec![];

    let result = client
        .wait_with_progress(JobId::new(), |event| observations.push(event.clone()))
        .await;

    assert_matches!(result, Err(PollError::TimedOut { attempts: 5, .. }));
    assert!(observations
        .iter()
        .all(|event| matches!(event, PollEvent::NotFound { .. })));
}

#[tokio::test]
async fn provider_failure_marks_job_failed() {
    let harness = Harness::new();
    let worker = harness.start_worker(ScriptedTranslator::failing("model overloaded"));

    let id = harness.submit("Hello").await;
    let view = harness.client.wait_for_terminal(id).await.unwrap();

    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.translated_text.is_none());
    assert!(view.failure_reason.unwrap().contains("model overloaded"));
    harness.settled().await;

    harness.token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_survives_slow_broker_startup() {
    let harness = Harness::new();
    let ids = [
        harness.submit("one").await,
        harness.submit("two").await,
        harness.submit("three").await,
    ];
    harness.broker.fail_next_connects(3);

    let worker = harness.start_worker(ScriptedTranslator::echo());

    for id in ids {
        let view = harness.client.wait_for_terminal(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
    }
    harness.settled().await;

    harness.token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_gives_up_when_broker_never_comes_up() {
    let harness = Harness::new();
    harness.broker.fail_next_connects(100);

    let worker = harness.start_worker(ScriptedTranslator::echo());

    assert_matches!(
        worker.await.unwrap(),
        Err(WorkerError::Startup(QueueError::RetriesExhausted {
            attempts: 5,
            ..
        }))
    );
}

#[tokio::test]
async fn interrupted_job_is_redelivered_and_completed() {
    let harness = Harness::new();
    let id = harness.submit("Hello").await;

    // A consumer takes the message, starts the job and dies before acknowledging it.
    let channel = harness.broker.connect().await.unwrap();
    let mut deliveries = channel.subscribe().await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(delivery.decode::<QueueMessage>().unwrap().id, id);
    harness.store.mark_processing(id).await.unwrap();
    drop(deliveries);
    channel.close().await;

    let translator = ScriptedTranslator::echo();
    let worker = harness.start_worker(translator.clone());

    let view = harness.client.wait_for_terminal(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(translator.calls(), 1);
    harness.settled().await;

    harness.token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn connection_lost_mid_run_loses_nothing() {
    let harness = Harness::new();
    let translator = ScriptedTranslator::echo();
    let worker = harness.start_worker(translator.clone());
    let first = harness.submit("first").await;
    harness.client.wait_for_terminal(first).await.unwrap();

    harness.broker.drop_connections().unwrap();
    let second = harness.submit("second").await;

    let view = harness.client.wait_for_terminal(second).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert!(!worker.is_finished());
    harness.settled().await;

    harness.token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn redelivered_messages_leave_terminal_jobs_alone() {
    let harness = Harness::new();
    let translator = ScriptedTranslator::echo();
    let worker = harness.start_worker(translator.clone());
    let id = harness.submit("Hello").await;
    let completed = harness.client.wait_for_terminal(id).await.unwrap();

    let job = harness.store.get(id).await.unwrap().unwrap();
    let publisher = harness.broker.connect().await.unwrap();
    publisher.publish(&job.message()).await.unwrap();
    publisher.publish(&job.message()).await.unwrap();
    harness.settled().await;

    let after = harness.client.wait_for_terminal(id).await.unwrap();
    assert_eq!(after, completed);
    assert_eq!(translator.calls(), 1);

    harness.token.cancel();
    worker.await.unwrap().unwrap();
}
