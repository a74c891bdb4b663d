//! The purpose of this module is to alleviate the need to import many of the `[tradutor]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use tradutor::prelude::*;
//! ```
pub use crate::admission::{AdmissionError, AdmissionService, ValidationError};
pub use crate::backoff::{Backoff, Jitter};
pub use crate::job::{Job, JobId, JobStatus, JobView, QueueMessage, TranslationRequest};
pub use crate::polling::{PollConfig, PollError, PollEvent, PollingClient, StatusSource};
pub use crate::queue::{Broker, Channel, QueueError};
pub use crate::status::{StatusError, StatusService};
pub use crate::store::{JobStore, StoreError, Transition};
pub use crate::supervisor::{ConnectionSupervisor, ReconnectPolicy};
pub use crate::translator::{TranslateError, Translator};
pub use crate::worker::{Worker, WorkerError};
