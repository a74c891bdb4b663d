//! Read only access to job status.
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::{
    job::{JobId, JobView},
    store::{JobStore, StoreError},
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Translation request {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Looks up jobs by id.
pub struct StatusService<S> {
    store: Arc<S>,
}

impl<S> Clone for StatusService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: JobStore> StatusService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// A snapshot of the job with the given id.
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn get_status(&self, id: JobId) -> Result<JobView, StatusError> {
        match self.store.get(id).await? {
            Some(job) => Ok(job.into()),
            None => {
                tracing::debug!(request_id = %id, "No job with id {id}");
                Err(StatusError::NotFound(id))
            }
        }
    }
}
