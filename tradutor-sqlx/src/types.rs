use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use tradutor::{
    job::{Job, JobStatus},
    queue::{Delivery, DeliveryTag},
};
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "translation_status", rename_all = "lowercase")]
pub(crate) enum TranslationStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl From<TranslationStatus> for JobStatus {
    fn from(value: TranslationStatus) -> Self {
        match value {
            TranslationStatus::Queued => Self::Queued,
            TranslationStatus::Processing => Self::Processing,
            TranslationStatus::Completed => Self::Completed,
            TranslationStatus::Failed => Self::Failed,
        }
    }
}

impl From<JobStatus> for TranslationStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => Self::Queued,
            JobStatus::Processing => Self::Processing,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Translation {
    pub request_id: Uuid,
    pub original_text: String,
    pub source_language: String,
    pub target_language: String,
    pub translated_text: Option<String>,
    pub failure_reason: Option<String>,
    pub status: TranslationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Translation> for Job {
    fn from(value: Translation) -> Self {
        Self {
            id: value.request_id.into(),
            source_text: value.original_text,
            source_language: value.source_language,
            target_language: value.target_language,
            status: value.status.into(),
            result_text: value.translated_text,
            failure_reason: value.failure_reason,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct QueuedMessage {
    pub id: i64,
    pub payload: serde_json::Value,
    pub delivery_count: i32,
}

impl From<QueuedMessage> for Delivery {
    fn from(value: QueuedMessage) -> Self {
        Self {
            tag: DeliveryTag::from(value.id),
            payload: value.payload,
            redelivered: value.delivery_count > 1,
        }
    }
}
