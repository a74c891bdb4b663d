//! Asynchronous translation jobs.
//!
//! A request to translate some text is admitted by the [`admission::AdmissionService`], which
//! records it in a [`store::JobStore`] as `queued` and publishes it on a durable queue
//! ([`queue::Broker`]). A [`worker::Worker`] consumes the queue, calls a
//! [`translator::Translator`] and records the job as `completed` or `failed`. Clients follow
//! progress through the [`status::StatusService`], usually by way of a
//! [`polling::PollingClient`].
//!
//! Delivery is at least once. Status writes are conditional, so a redelivered message never
//! moves a job out of a terminal status.
//!
//! In memory implementations of the store and the queue are provided for tests and local runs.
//! PostgreSQL implementations live in the `tradutor-sqlx` crate.
pub mod admission;
pub mod backoff;
pub mod job;
pub mod polling;
pub mod prelude;
pub mod queue;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod testing;
pub mod translator;
pub mod worker;
