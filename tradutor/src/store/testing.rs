//! Test suite for ensuring a correct implementation of a [`JobStore`].
use super::*;
use crate::job::{JobStatus, TranslationRequest};

fn mock_job() -> Job {
    Job::queued(TranslationRequest::new("Hello", "en", "pt"))
}

/// Create a test suite for a [`JobStore`] implementation.
///
/// Store implementors should include this as part of their test suites.
///
/// # Example
///
/// ```
/// use tradutor::store::memory::InMemoryJobStore;
/// use tradutor::store_test_suite;
/// store_test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// A different async test attribute can be supplied, for example `sqlx::test`. Several
/// attributes can be given as a list:
///
/// ```ignore
/// store_test_suite!(
///     attr: [sqlx::test, ignore = "requires a running postgres"],
///     args: (pool: PgPool),
///     store: PgJobStore::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: [$($attr:meta),+], args: $args:tt, store: $store:expr) => {
        $(#[$attr])+
        async fn insert_then_get $args {
            let store = $store;
            $crate::store::testing::insert_then_get(store).await;
        }
        $(#[$attr])+
        async fn insert_duplicate $args {
            let store = $store;
            $crate::store::testing::insert_duplicate(store).await;
        }
        $(#[$attr])+
        async fn get_unknown $args {
            let store = $store;
            $crate::store::testing::get_unknown(store).await;
        }
        $(#[$attr])+
        async fn complete_lifecycle $args {
            let store = $store;
            $crate::store::testing::complete_lifecycle(store).await;
        }
        $(#[$attr])+
        async fn failed_lifecycle $args {
            let store = $store;
            $crate::store::testing::failed_lifecycle(store).await;
        }
        $(#[$attr])+
        async fn processing_is_reentrant $args {
            let store = $store;
            $crate::store::testing::processing_is_reentrant(store).await;
        }
        $(#[$attr])+
        async fn terminal_jobs_reject_transitions $args {
            let store = $store;
            $crate::store::testing::terminal_jobs_reject_transitions(store).await;
        }
        $(#[$attr])+
        async fn queued_jobs_cannot_finish $args {
            let store = $store;
            $crate::store::testing::queued_jobs_cannot_finish(store).await;
        }
        $(#[$attr])+
        async fn transitions_on_unknown_job $args {
            let store = $store;
            $crate::store::testing::transitions_on_unknown_job(store).await;
        }
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::store_test_suite!(attr: [$attr], args: $args, store: $store);
    };
}

#[doc(hidden)]
pub async fn insert_then_get(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();

    let loaded = store.get(job.id).await.unwrap().unwrap();

    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.source_text, "Hello");
    assert_eq!(loaded.source_language, "en");
    assert_eq!(loaded.target_language, "pt");
    assert!(loaded.result_text.is_none());
    assert!(loaded.failure_reason.is_none());
}

#[doc(hidden)]
pub async fn insert_duplicate(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();

    let result = store.insert(&job).await;

    assert!(matches!(result, Err(StoreError::Duplicate(id)) if id == job.id));
}

#[doc(hidden)]
pub async fn get_unknown(store: impl JobStore) {
    assert!(store.get(JobId::new()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn complete_lifecycle(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();

    assert_eq!(
        store.mark_processing(job.id).await.unwrap(),
        Transition::Applied
    );
    let processing = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(processing.status, JobStatus::Processing);
    assert!(processing.updated_at >= job.updated_at);

    assert_eq!(
        store.mark_completed(job.id, "Olá").await.unwrap(),
        Transition::Applied
    );
    let completed = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.result_text.as_deref(), Some("Olá"));
    assert!(completed.failure_reason.is_none());
    assert!(completed.updated_at >= processing.updated_at);
}

#[doc(hidden)]
pub async fn failed_lifecycle(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();
    store.mark_processing(job.id).await.unwrap();

    assert_eq!(
        store.mark_failed(job.id, "provider error").await.unwrap(),
        Transition::Applied
    );
    let failed = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.result_text.is_none());
    assert_eq!(failed.failure_reason.as_deref(), Some("provider error"));
}

#[doc(hidden)]
pub async fn processing_is_reentrant(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();
    store.mark_processing(job.id).await.unwrap();

    assert_eq!(
        store.mark_processing(job.id).await.unwrap(),
        Transition::Applied
    );
    assert_eq!(
        store.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
}

#[doc(hidden)]
pub async fn terminal_jobs_reject_transitions(store: impl JobStore) {
    let completed = mock_job();
    store.insert(&completed).await.unwrap();
    store.mark_processing(completed.id).await.unwrap();
    store.mark_completed(completed.id, "Olá").await.unwrap();

    assert_eq!(
        store.mark_processing(completed.id).await.unwrap(),
        Transition::Rejected {
            current: JobStatus::Completed
        }
    );
    assert_eq!(
        store.mark_failed(completed.id, "late").await.unwrap(),
        Transition::Rejected {
            current: JobStatus::Completed
        }
    );
    let loaded = store.get(completed.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Completed);
    assert_eq!(loaded.result_text.as_deref(), Some("Olá"));

    let failed = mock_job();
    store.insert(&failed).await.unwrap();
    store.mark_processing(failed.id).await.unwrap();
    store.mark_failed(failed.id, "boom").await.unwrap();

    assert_eq!(
        store.mark_processing(failed.id).await.unwrap(),
        Transition::Rejected {
            current: JobStatus::Failed
        }
    );
    assert_eq!(
        store.mark_completed(failed.id, "Olá").await.unwrap(),
        Transition::Rejected {
            current: JobStatus::Failed
        }
    );
    let loaded = store.get(failed.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Failed);
    assert!(loaded.result_text.is_none());
}

#[doc(hidden)]
pub async fn queued_jobs_cannot_finish(store: impl JobStore) {
    let job = mock_job();
    store.insert(&job).await.unwrap();

    assert_eq!(
        store.mark_completed(job.id, "Olá").await.unwrap(),
        Transition::Rejected {
            current: JobStatus::Queued
        }
    );
    assert_eq!(
        store.mark_failed(job.id, "boom").await.unwrap(),
        Transition::Rejected {
            current: JobStatus::Queued
        }
    );
}

#[doc(hidden)]
pub async fn transitions_on_unknown_job(store: impl JobStore) {
    let id = JobId::new();

    assert!(matches!(
        store.mark_processing(id).await,
        Err(StoreError::JobNotFound(not_found)) if not_found == id
    ));
    assert!(matches!(
        store.mark_completed(id, "Olá").await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.mark_failed(id, "boom").await,
        Err(StoreError::JobNotFound(_))
    ));
}
