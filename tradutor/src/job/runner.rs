use std::{sync::Arc, time::Duration};

use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    store::{JobStore, StoreError, Transition},
    translator::{TranslateError, Translator},
};

use super::{JobId, JobStatus, QueueMessage};

/// What became of a job handed to the [`JobRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed(String),
    /// The job was already in the given status and was left untouched.
    Skipped(JobStatus),
    /// No record exists for the message.
    Orphaned,
}

/// Drives a single job through `processing` to a terminal status.
///
/// Errors from the store are returned to the caller, who must not acknowledge the message.
/// Anything that goes wrong with the translation itself ends up recorded as `failed`.
pub(crate) struct JobRunner<S, T> {
    store: Arc<S>,
    translator: Arc<T>,
    timeout: Option<Duration>,
}

impl<S, T> JobRunner<S, T>
where
    S: JobStore,
    T: Translator,
{
    pub(crate) fn new(store: Arc<S>, translator: Arc<T>) -> Self {
        Self {
            store,
            translator,
            timeout: None,
        }
    }

    pub(crate) fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }

    #[instrument(skip(self, message), fields(request_id = %message.id))]
    pub(crate) async fn execute(&self, message: QueueMessage) -> Result<Outcome, StoreError> {
        let job_id = message.id;
        match self.store.mark_processing(job_id).await {
            Ok(Transition::Applied) => {}
            Ok(Transition::Rejected { current }) => {
                tracing::info!(%job_id, %current, "Job {job_id} is already {current}, skipping");
                return Ok(Outcome::Skipped(current));
            }
            Err(StoreError::JobNotFound(_)) => {
                tracing::warn!(%job_id, "No record for job {job_id}, discarding message");
                return Ok(Outcome::Orphaned);
            }
            Err(error) => return Err(error),
        }

        tracing::debug!(%job_id, "Translating job {job_id}");
        match self.translate(message).await {
            Ok(text) => self.handle_translated(job_id, &text).await,
            Err(error) => self.handle_error(job_id, error).await,
        }
    }

    async fn translate(&self, message: QueueMessage) -> Result<String, TranslateError> {
        let translator = self.translator.clone();
        let call = async move {
            translator
                .translate(
                    &message.text,
                    &message.source_language,
                    &message.target_language,
                )
                .await
        };
        let timeout = self.timeout;
        let handle = tokio::spawn(
            async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or(Err(TranslateError::Timeout(limit))),
                    None => call.await,
                }
            }
            .in_current_span(),
        );

        let text = handle.await??;
        if text.trim().is_empty() {
            return Err(TranslateError::EmptyResponse);
        }
        Ok(text)
    }

    async fn handle_translated(&self, job_id: JobId, text: &str) -> Result<Outcome, StoreError> {
        match self.store.mark_completed(job_id, text).await? {
            Transition::Applied => {
                tracing::info!(%job_id, "Job {job_id} completed");
                Ok(Outcome::Completed)
            }
            Transition::Rejected { current } => {
                tracing::warn!(%job_id, %current, "Job {job_id} became {current} while translating");
                Ok(Outcome::Skipped(current))
            }
        }
    }

    async fn handle_error(
        &self,
        job_id: JobId,
        error: TranslateError,
    ) -> Result<Outcome, StoreError> {
        tracing::error!(
            %job_id,
            ?error,
            "Job {job_id} failed: error type: {}, message: {error}",
            error.error_type(),
        );
        let reason = error.to_string();
        match self.store.mark_failed(job_id, &reason).await? {
            Transition::Applied => Ok(Outcome::Failed(reason)),
            Transition::Rejected { current } => Ok(Outcome::Skipped(current)),
        }
    }
}

impl From<JoinError> for TranslateError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panicked(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        job::{Job, TranslationRequest},
        store::memory::InMemoryJobStore,
        translator::MockTranslator,
    };
    use assert_matches::assert_matches;

    async fn queued_job(store: &InMemoryJobStore) -> Job {
        let job = Job::queued(TranslationRequest::new("Hello", "en", "pt"));
        store.insert(&job).await.unwrap();
        job
    }

    fn runner(
        store: &InMemoryJobStore,
        translator: MockTranslator,
    ) -> JobRunner<InMemoryJobStore, MockTranslator> {
        JobRunner::new(Arc::new(store.clone()), Arc::new(translator))
    }

    #[tokio::test]
    async fn successful_translation_completes_job() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        let mut translator = MockTranslator::new();
        translator
            .expect_translate()
            .withf(|text, source, target| {
                text.eq_ignore_ascii_case("hello")
                    && source.eq_ignore_ascii_case("en")
                    && target.eq_ignore_ascii_case("pt")
            })
            .times(1)
            .returning(|_, _, _| Ok("Olá".to_owned()));

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Completed));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_text.as_deref(), Some("Olá"));
    }

    #[tokio::test]
    async fn provider_error_fails_job() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        let mut translator = MockTranslator::new();
        translator
            .expect_translate()
            .returning(|_, _, _| Err(TranslateError::Provider("quota exceeded".to_owned())));

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Failed(reason)) if reason.contains("quota exceeded"));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.result_text.is_none());
    }

    #[tokio::test]
    async fn empty_translation_fails_job() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        let mut translator = MockTranslator::new();
        translator
            .expect_translate()
            .returning(|_, _, _| Ok("  \n".to_owned()));

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Failed(_)));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some(TranslateError::EmptyResponse.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn panicking_translator_fails_job() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;

        struct Exploding;
        #[async_trait::async_trait]
        impl Translator for Exploding {
            async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, TranslateError> {
                panic!("provider exploded")
            }
        }

        let runner = JobRunner::new(Arc::new(store.clone()), Arc::new(Exploding));
        let outcome = runner.execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Failed(reason)) if reason.contains("provider exploded"));
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_translation_times_out() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;

        struct Slow;
        #[async_trait::async_trait]
        impl Translator for Slow {
            async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, TranslateError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok("late".to_owned())
            }
        }

        let runner = JobRunner::new(Arc::new(store.clone()), Arc::new(Slow))
            .with_timeout(Some(Duration::from_secs(30)));
        let outcome = runner.execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Failed(_)));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("30s"));
    }

    #[tokio::test]
    async fn terminal_job_is_skipped_without_translating() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_processing(job.id).await.unwrap();
        store.mark_completed(job.id, "Olá").await.unwrap();
        let mut translator = MockTranslator::new();
        translator.expect_translate().never();

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Skipped(JobStatus::Completed)));
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().result_text.as_deref(),
            Some("Olá")
        );
    }

    #[tokio::test]
    async fn redelivered_processing_job_is_retranslated() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_processing(job.id).await.unwrap();
        let mut translator = MockTranslator::new();
        translator
            .expect_translate()
            .times(1)
            .returning(|_, _, _| Ok("Olá".to_owned()));

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Completed));
    }

    #[tokio::test]
    async fn missing_record_is_orphaned() {
        let store = InMemoryJobStore::new();
        let job = Job::queued(TranslationRequest::new("Hello", "en", "pt"));
        let mut translator = MockTranslator::new();
        translator.expect_translate().never();

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Ok(Outcome::Orphaned));
    }

    #[tokio::test]
    async fn unavailable_store_is_an_error() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.set_unavailable(true);
        let mut translator = MockTranslator::new();
        translator.expect_translate().never();

        let outcome = runner(&store, translator).execute(job.message()).await;

        assert_matches!(outcome, Err(StoreError::Unavailable(_)));
    }
}
