//! The translation job and its lifecycle.
//!
//! A [`Job`] moves through a small state machine:
//!
//! ```text
//! queued ──▶ processing ──▶ completed
//!               │  ▲
//!               │  └── (redelivery)
//!               └────▶ failed
//! ```
//!
//! `completed` and `failed` are terminal. The transition methods on [`Job`] refuse to leave a
//! terminal state and return [`TransitionError`] instead.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod message;
pub(crate) mod runner;

pub use message::{QueueMessage, TranslationRequest};

/// The identifier of a translation job.
///
/// Assigned once at admission and never reused.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh, random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// A worker has picked the job up and is calling the provider.
    Processing,
    /// The translation succeeded. Terminal.
    Completed,
    /// The translation failed. Terminal.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions can happen from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed by the job state machine.
    ///
    /// `processing → processing` is permitted as delivery is at-least-once and a redelivered
    /// message re-enters processing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Processing, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

/// Returned when a transition would break the job state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Cannot move job from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A translation job as held by a [`crate::store::JobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub source_text: String,
    pub source_language: String,
    pub target_language: String,
    pub status: JobStatus,
    /// Only present when the status is [`JobStatus::Completed`].
    pub result_text: Option<String>,
    /// Only present when the status is [`JobStatus::Failed`].
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new `queued` job for the given request with a fresh id.
    pub fn queued(request: TranslationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            source_text: request.text,
            source_language: request.source_language,
            target_language: request.target_language,
            status: JobStatus::Queued,
            result_text: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)?;
        self.result_text = None;
        self.failure_reason = None;
        Ok(())
    }

    /// Marks the job completed with the given, non-empty, translation.
    ///
    /// An empty translation is not a valid completion; callers should record a failure instead.
    pub fn mark_completed(&mut self, result_text: impl Into<String>) -> Result<(), TransitionError> {
        let result_text = result_text.into();
        if result_text.trim().is_empty() {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Completed,
            });
        }
        self.transition(JobStatus::Completed)?;
        self.result_text = Some(result_text);
        self.failure_reason = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.result_text = None;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// The descriptor published to the queue for this job.
    pub fn message(&self) -> QueueMessage {
        QueueMessage {
            id: self.id,
            text: self.source_text.clone(),
            source_language: self.source_language.clone(),
            target_language: self.target_language.clone(),
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A read only snapshot of a job as exposed to clients.
///
/// Serializes to the shape returned by `GET /translations/{requestId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub request_id: JobId,
    pub status: JobStatus,
    pub original_text: String,
    pub translated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            request_id: job.id,
            status: job.status,
            original_text: job.source_text,
            translated_text: job.result_text,
            failure_reason: job.failure_reason,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
