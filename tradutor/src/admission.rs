//! Accepting translation requests.
//!
//! [`AdmissionService::submit`] validates a request, records it as `queued` and publishes it to
//! the queue. It returns as soon as the message is published and never waits on the provider.
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::{
    job::{Job, JobId, TranslationRequest},
    queue::{Broker, Channel, QueueError},
    store::{JobStore, StoreError},
    supervisor::ConnectionSupervisor,
};

/// The longest language tag accepted, matching the width of the stored column.
pub const MAX_LANGUAGE_TAG_LEN: usize = 10;

/// Why a request was refused before any state was created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    Missing(&'static str),
    #[error("Field {field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Failed to record job: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to queue job {id}: {source}")]
    Queue {
        /// The id of the job left `queued` without a message.
        id: JobId,
        source: QueueError,
    },
}

/// Checks that every field of the request is present.
///
/// Whitespace only values count as missing.
pub fn validate(request: &TranslationRequest) -> Result<(), ValidationError> {
    let fields = [
        ("text", &request.text),
        ("sourceLanguage", &request.source_language),
        ("targetLanguage", &request.target_language),
    ];
    if let Some((field, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(ValidationError::Missing(*field));
    }
    for (field, value) in &fields[1..] {
        if value.trim().chars().count() > MAX_LANGUAGE_TAG_LEN {
            return Err(ValidationError::TooLong {
                field: *field,
                max: MAX_LANGUAGE_TAG_LEN,
            });
        }
    }
    Ok(())
}

/// Admits translation requests into the system.
pub struct AdmissionService<S: JobStore, B: Broker> {
    store: Arc<S>,
    supervisor: Arc<ConnectionSupervisor<B>>,
}

impl<S: JobStore, B: Broker> Clone for AdmissionService<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<S: JobStore, B: Broker> AdmissionService<S, B> {
    pub fn new(store: Arc<S>, supervisor: Arc<ConnectionSupervisor<B>>) -> Self {
        Self { store, supervisor }
    }

    /// Validates, records and queues a request, returning the new job's id.
    ///
    /// The record is written before the message is published. If publishing then fails the job
    /// stays visible as `queued` and the error carries its id.
    #[instrument(skip(self, request), fields(request_id))]
    pub async fn submit(&self, request: TranslationRequest) -> Result<JobId, AdmissionError> {
        validate(&request)?;

        let job = Job::queued(TranslationRequest {
            text: request.text,
            source_language: request.source_language.trim().to_owned(),
            target_language: request.target_language.trim().to_owned(),
        });
        let job_id = job.id;
        tracing::Span::current().record("request_id", tracing::field::display(&job_id));

        self.store.insert(&job).await.inspect_err(|error| {
            tracing::error!(?error, %job_id, "Failed to record job {job_id}");
        })?;

        if let Err(source) = self.publish(&job).await {
            tracing::error!(
                error = ?source,
                %job_id,
                "Job {job_id} recorded but could not be queued, it will remain queued"
            );
            return Err(AdmissionError::Queue { id: job_id, source });
        }

        tracing::info!(%job_id, "Job {job_id} queued");
        Ok(job_id)
    }

    async fn publish(&self, job: &Job) -> Result<(), QueueError> {
        let channel = self.supervisor.channel().await?;
        let result = channel.publish(&job.message()).await;
        if matches!(result, Err(QueueError::ConnectionClosed)) {
            self.supervisor.invalidate().await;
        }
        result
    }
}
