//! Job Tracker — client-side tracking of background processing jobs
//!
//! After a job (for example an image-processing upload) is accepted by a
//! backend, this crate follows it to completion: it polls a status endpoint
//! with a bounded retry budget, interprets the answers, persists the tracked
//! job list across restarts and notifies observers of every change.
//!
//! # Overview
//!
//! - [`JobRegistry`] is the authoritative set of tracked jobs
//! - [`StatusSource`] is the backend seam: status checks and deletion
//! - [`StatusClassifier`] maps raw responses (status JSON or the artifact
//!   itself) to a [`JobState`]
//! - [`JobStore`] persists the job list ([`MemoryStore`], [`FileStore`])
//! - [`TrackerConfig`] holds the poll interval, attempt budget and
//!   [`RetentionPolicy`]
//! - [`TrackerError`] categorizes what can go wrong
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use job_tracker::{FileStore, JobEvent, JobRegistry, TrackerConfig};
//!
//! let registry = JobRegistry::builder(Arc::new(MyHttpSource::new(base_url)))
//!     .store(Arc::new(FileStore::new("jobs.json")))
//!     .config(TrackerConfig::default())
//!     .build()?;
//!
//! let _sub = registry.subscribe(|event: &JobEvent| render(event));
//! let record = registry.submit(upload_response.image_id)?;
//!
//! // Don't wait for the next poll
//! let record = registry.check_now(&record.id).await?;
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   submit() ──→ Submitted ──→ Processing ──→ Completed | Failed
//!    (sync)       (record)     (poller)        (terminal; poller stops)
//! ```

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
mod poller;
pub mod registry;
pub mod source;
pub mod store;

#[cfg(test)]
mod testing;

pub use classify::{Classification, StatusClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetentionPolicy, TrackerConfig};
pub use error::{ClassificationError, TrackerError, TrackerResult};
pub use job::{JobId, JobRecord, JobState};
pub use registry::{JobEvent, JobRegistry, JobRegistryBuilder, Subscription};
pub use source::{RawResponse, StatusSource};
pub use store::{FileStore, JobStore, MemoryStore};
