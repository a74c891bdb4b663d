//! Provides an in memory implementation of [`JobStore`].
//!
//! It is a correct, but not durable, implementation intended for tests and local runs.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;

use super::{JobStore, StoreError, Transition};
use crate::job::{Job, JobId, TransitionError};

/// An in memory implementation of [`JobStore`].
///
/// Clones share the same underlying records.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryJobStore {
    /// Creates a new, empty, instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable.
    ///
    /// While set every operation returns [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The number of records currently held.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in memory store offline".to_owned()));
        }
        Ok(())
    }

    fn update(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut Job) -> Result<(), TransitionError>,
    ) -> Result<Transition, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut updated = job.clone();
        match apply(&mut updated) {
            Ok(()) => {
                *job = updated;
                Ok(Transition::Applied)
            }
            Err(_) => Ok(Transition::Rejected {
                current: job.status,
            }),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn mark_processing(&self, id: JobId) -> Result<Transition, StoreError> {
        self.update(id, Job::mark_processing)
    }

    async fn mark_completed(
        &self,
        id: JobId,
        translated_text: &str,
    ) -> Result<Transition, StoreError> {
        self.update(id, |job| job.mark_completed(translated_text))
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Transition, StoreError> {
        self.update(id, |job| job.mark_failed(reason))
    }
}
