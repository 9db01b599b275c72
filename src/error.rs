//! Tracker error types.
//!
//! Errors are categorized by how the tracker absorbs them:
//!
//! | Category | Variants | Handling |
//! |----------|----------|----------|
//! | **Caller** | `Duplicate`, `NotFound` | Returned from registry calls |
//! | **Transient** | `Transport` | Retried by the poller within its budget |
//! | **Job-level** | `Classification` | Surfaced only as a `Failed` job |
//! | **Non-fatal** | `Persistence` | Logged; in-memory state stays authoritative |
//! | **Logic** | `IllegalTransition` | Logged; the transition is dropped |
//! | **Config** | `Configuration` | Fix setup |

use thiserror::Error;

use crate::job::JobId;

/// Errors that can occur while tracking jobs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrackerError {
    // ── Caller errors ────────────────────────────────────────────────
    /// The job is already tracked.
    #[error("Job already tracked: {0}")]
    Duplicate(JobId),

    /// The job is not tracked (or unknown to the backend).
    #[error("Job not found: {0}")]
    NotFound(JobId),

    // ── Transient errors (retried) ───────────────────────────────────
    /// Network failure or unexpected non-2xx response.
    #[error("Transport error: {0}")]
    Transport(String),

    // ── Job-level errors ─────────────────────────────────────────────
    /// Status payload could not be interpreted.
    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    // ── Non-fatal errors ─────────────────────────────────────────────
    /// Snapshot could not be written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    // ── Logic errors ─────────────────────────────────────────────────
    /// A transition outside the state machine was requested.
    #[error("Illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition { id: JobId, from: String, to: String },

    // ── Config errors ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TrackerError {
    /// Returns `true` if this error is transient and the check may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Why a status payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("malformed status payload: {0}")]
    MalformedPayload(String),

    #[error("status payload has no `status` field")]
    MissingStatus,

    #[error("unrecognized status `{0}`")]
    UnrecognizedStatus(String),
}

/// Result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;
