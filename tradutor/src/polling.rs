//! Waiting for a job to finish by polling its status.
//!
//! A [`PollingClient`] repeatedly asks a [`StatusSource`] for a job until it reaches a terminal
//! status or the attempt budget runs out. A missing job is not an error while polling: a client
//! may poll before the record is visible, so "not found" simply means "try again".
//!
//! # Example
//!
//! ```
//! # use std::{sync::Arc, time::Duration};
//! # use tradutor::prelude::*;
//! # use tradutor::store::memory::InMemoryJobStore;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let store = Arc::new(InMemoryJobStore::new());
//! let client = PollingClient::new(StatusService::new(store))
//!     .with_config(PollConfig::default().with_interval(Duration::from_millis(1)).with_max_attempts(3));
//!
//! let result = client.wait_for_terminal(JobId::new()).await;
//!
//! assert!(matches!(result, Err(PollError::TimedOut { attempts: 3, .. })));
//! # });
//! ```
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    job::{JobId, JobView},
    status::{StatusError, StatusService},
    store::{JobStore, StoreError},
};

/// Anywhere the status of a job can be read from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The current view of the job, or `None` if it is not known.
    async fn fetch_status(&self, id: JobId) -> Result<Option<JobView>, Self::Error>;
}

#[async_trait]
impl<S: JobStore> StatusSource for StatusService<S> {
    type Error = StoreError;

    async fn fetch_status(&self, id: JobId) -> Result<Option<JobView>, Self::Error> {
        match self.get_status(id).await {
            Ok(view) => Ok(Some(view)),
            Err(StatusError::NotFound(_)) => Ok(None),
            Err(StatusError::Store(error)) => Err(error),
        }
    }
}

/// How often, and for how long, to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

impl PollConfig {
    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }
}

/// A single observation made while polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    NotFound { attempt: u32 },
    Observed { attempt: u32, view: JobView },
}

impl PollEvent {
    pub fn attempt(&self) -> u32 {
        match self {
            Self::NotFound { attempt } | Self::Observed { attempt, .. } => *attempt,
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError<E: std::error::Error + 'static> {
    /// The job did not reach a terminal status in time. This says nothing about the job itself.
    #[error("Translation request {id} did not finish after {attempts} attempts")]
    TimedOut { id: JobId, attempts: u32 },
    #[error("Failed to fetch status: {0}")]
    Source(#[source] E),
}

/// Polls a [`StatusSource`] until a job finishes.
#[derive(Debug, Clone)]
pub struct PollingClient<S> {
    source: S,
    config: PollConfig,
}

impl<S: StatusSource> PollingClient<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            config: PollConfig::default(),
        }
    }

    pub fn with_config(self, config: PollConfig) -> Self {
        Self { config, ..self }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Polls until the job is `completed` or `failed`.
    pub async fn wait_for_terminal(&self, id: JobId) -> Result<JobView, PollError<S::Error>> {
        self.wait_with_progress(id, |_| {}).await
    }

    /// Polls until the job is `completed` or `failed`, reporting every observation.
    pub async fn wait_with_progress(
        &self,
        id: JobId,
        mut on_event: impl FnMut(&PollEvent) + Send,
    ) -> Result<JobView, PollError<S::Error>> {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let event = match self
                .source
                .fetch_status(id)
                .await
                .map_err(PollError::Source)?
            {
                Some(view) => PollEvent::Observed { attempt, view },
                None => PollEvent::NotFound { attempt },
            };
            on_event(&event);

            if let PollEvent::Observed { view, .. } = event {
                if view.status.is_terminal() {
                    return Ok(view);
                }
                tracing::trace!(request_id = %id, status = %view.status, attempt, "Job not finished");
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.interval).await;
            }
        }
        Err(PollError::TimedOut {
            id,
            attempts: max_attempts,
        })
    }
}
