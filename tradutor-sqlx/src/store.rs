use std::ops::Deref;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use tradutor::{
    job::{Job, JobId, JobStatus},
    store::{JobStore, StoreError, Transition},
};
use uuid::Uuid;

use crate::types::{Translation, TranslationStatus};

/// A [`JobStore`] backed by the `translations` table.
#[derive(Clone, Debug)]
pub struct PgJobStore {
    pool: PgPool,
}

impl Deref for PgJobStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgJobStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgJobStore {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Decode(error.to_string())
        }
        error => StoreError::Unavailable(error.to_string()),
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(request_id = %job.id))]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO translations (
                request_id,
                original_text,
                source_language,
                target_language,
                translated_text,
                failure_reason,
                status,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.source_text)
        .bind(&job.source_language)
        .bind(&job.target_language)
        .bind(&job.result_text)
        .bind(&job.failure_reason)
        .bind(TranslationStatus::from(job.status))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.deref())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(StoreError::Duplicate(job.id))
            }
            Err(error) => Err(store_error(error)),
        }
    }

    #[instrument(skip(self), fields(request_id = %id))]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(sqlx::query_as::<_, Translation>(
            r#"SELECT
                request_id,
                original_text,
                source_language,
                target_language,
                translated_text,
                failure_reason,
                status,
                created_at,
                updated_at
            FROM translations
            WHERE request_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.deref())
        .await
        .map_err(store_error)?
        .map(Job::from))
    }

    #[instrument(skip(self), fields(request_id = %id))]
    async fn mark_processing(&self, id: JobId) -> Result<Transition, StoreError> {
        let updated = sqlx::query_scalar::<_, Uuid>(
            r#"UPDATE translations
            SET
                status = 'processing',
                translated_text = NULL,
                failure_reason = NULL,
                updated_at = timezone('UTC'::text, now())
            WHERE request_id = $1
            AND status IN ('queued', 'processing')
            RETURNING request_id
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.deref())
        .await
        .map_err(store_error)?;

        self.transition(id, updated).await
    }

    #[instrument(skip(self, translated_text), fields(request_id = %id))]
    async fn mark_completed(
        &self,
        id: JobId,
        translated_text: &str,
    ) -> Result<Transition, StoreError> {
        if translated_text.trim().is_empty() {
            return self.transition(id, None).await;
        }
        let updated = sqlx::query_scalar::<_, Uuid>(
            r#"UPDATE translations
            SET
                status = 'completed',
                translated_text = $2,
                failure_reason = NULL,
                updated_at = timezone('UTC'::text, now())
            WHERE request_id = $1
            AND status = 'processing'
            RETURNING request_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(translated_text)
        .fetch_optional(self.deref())
        .await
        .map_err(store_error)?;

        self.transition(id, updated).await
    }

    #[instrument(skip(self, reason), fields(request_id = %id))]
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Transition, StoreError> {
        let updated = sqlx::query_scalar::<_, Uuid>(
            r#"UPDATE translations
            SET
                status = 'failed',
                translated_text = NULL,
                failure_reason = $2,
                updated_at = timezone('UTC'::text, now())
            WHERE request_id = $1
            AND status = 'processing'
            RETURNING request_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .fetch_optional(self.deref())
        .await
        .map_err(store_error)?;

        self.transition(id, updated).await
    }
}

impl PgJobStore {
    /// Turns the result of a conditional update into a [`Transition`], looking up the current
    /// status when nothing was updated.
    async fn transition(&self, id: JobId, updated: Option<Uuid>) -> Result<Transition, StoreError> {
        if updated.is_some() {
            return Ok(Transition::Applied);
        }
        match self.status(id).await? {
            Some(current) => Ok(Transition::Rejected { current }),
            None => Err(StoreError::JobNotFound(id)),
        }
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        Ok(sqlx::query_scalar::<_, TranslationStatus>(
            "SELECT status FROM translations WHERE request_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.deref())
        .await
        .map_err(store_error)?
        .map(JobStatus::from))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tradutor::{job::TranslationRequest, store_test_suite};

    store_test_suite!(
        attr: [sqlx::test, ignore = "requires a running postgres"],
        args: (pool: PgPool),
        store: PgJobStore::from(pool)
    );

    #[sqlx::test]
    #[ignore = "requires a running postgres"]
    async fn completed_text_is_stored(pool: PgPool) {
        let store = PgJobStore::from(&pool);
        let job = Job::queued(TranslationRequest::new("Hello", "en", "pt"));
        store.insert(&job).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        store.mark_completed(job.id, "Olá").await.unwrap();

        let (status, text): (TranslationStatus, Option<String>) = sqlx::query_as(
            "SELECT status, translated_text FROM translations WHERE request_id = $1",
        )
        .bind(job.id.as_uuid())
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(status, TranslationStatus::Completed);
        assert_eq!(text.as_deref(), Some("Olá"));
    }

    #[sqlx::test]
    #[ignore = "requires a running postgres"]
    async fn empty_completion_is_rejected(pool: PgPool) {
        let store = PgJobStore::from(pool);
        let job = Job::queued(TranslationRequest::new("Hello", "en", "pt"));
        store.insert(&job).await.unwrap();
        store.mark_processing(job.id).await.unwrap();

        assert_eq!(
            store.mark_completed(job.id, " ").await.unwrap(),
            Transition::Rejected {
                current: JobStatus::Processing
            }
        );
    }
}
