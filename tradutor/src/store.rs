//! The durable record of every translation job.
//!
//! Implementations must apply status transitions conditionally: a write that would move a job
//! out of a terminal state is not applied and reports [`Transition::Rejected`] instead. This
//! keeps redelivered queue messages from undoing completed work.
use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// Keyed storage for [`Job`] records.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Writes a new job record.
    ///
    /// Returns [`StoreError::Duplicate`] if a record with the same id already exists.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Loads the job with the given id, if any.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Moves the job to [`JobStatus::Processing`].
    ///
    /// Applied when the job is `queued` or already `processing`.
    async fn mark_processing(&self, id: JobId) -> Result<Transition, StoreError>;

    /// Moves a `processing` job to [`JobStatus::Completed`] recording the translation.
    async fn mark_completed(&self, id: JobId, translated_text: &str)
        -> Result<Transition, StoreError>;

    /// Moves a `processing` job to [`JobStatus::Failed`], clearing any translation.
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Transition, StoreError>;
}

/// The outcome of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The job was in a status from which the requested transition is not allowed.
    Rejected { current: JobStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} already exists")]
    Duplicate(JobId),
    #[error("Job store unavailable: {0}")]
    Unavailable(String),
    #[error("Stored job could not be decoded: {0}")]
    Decode(String),
    #[error("Job store in bad state")]
    BadState,
}
