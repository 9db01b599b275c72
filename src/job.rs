//! Job lifecycle types.
//!
//! The job state machine:
//!
//! ```text
//!   submit() ──→ Submitted ──→ Processing ──┬──→ Completed
//!                                ↺ (check)   │
//!                                            └──→ Failed(reason)
//! ```
//!
//! A terminal outcome observed while still `Submitted` is applied as
//! `Submitted → Processing` followed by the terminal edge.
//!
//! **Invariants:**
//! - `submit()` creates the record in `Submitted`.
//! - Transitions are monotonic; a job never moves backward.
//! - Terminal states (`Completed`, `Failed`) are permanent.
//! - `result_locator` is present iff the state is `Completed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};

/// Unique identifier for a job, assigned by the backend at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create a new job ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Accepted by the backend, not yet observed by a status check.
    Submitted,
    /// Backend reports the job as queued or in progress.
    Processing,
    /// The artifact is ready.
    Completed,
    /// The job failed, with a diagnostic message.
    Failed(String),
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }

    /// Check if the job is still pending (submitted or processing).
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Submitted | JobState::Processing)
    }

    /// Check if the job completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Completed)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match self {
            JobState::Submitted => matches!(next, JobState::Processing),
            JobState::Processing => !matches!(next, JobState::Submitted),
            JobState::Completed | JobState::Failed(_) => false,
        }
    }

    /// Lowercase name, matching the backend's status vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Submitted => write!(f, "Submitted"),
            JobState::Processing => write!(f, "Processing"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed(msg) => write!(f, "Failed: {msg}"),
        }
    }
}

/// One tracked job.
///
/// Records handed out by the registry are snapshots; editing a clone has no
/// effect on the tracked job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    /// Where the finished artifact can be fetched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_locator: Option<String>,
    /// Status checks performed so far.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Backend-provided metadata (upload response, processing options).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl JobRecord {
    /// Create a freshly submitted record.
    pub fn new(id: JobId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: JobState::Submitted,
            result_locator: None,
            attempts: 0,
            created_at,
            last_checked_at: None,
            finished_at: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach backend metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Reference time for retention: when the job finished, falling back
    /// to its last check and then its creation for older snapshots.
    pub fn finished_or_last_seen(&self) -> DateTime<Utc> {
        self.finished_at
            .or(self.last_checked_at)
            .unwrap_or(self.created_at)
    }

    /// Count one status check.
    pub(crate) fn record_check(&mut self, at: DateTime<Utc>) {
        if !self.is_terminal() {
            self.attempts += 1;
            self.last_checked_at = Some(at);
        }
    }

    /// Move to `next`, returning the previous state.
    ///
    /// A `Completed` target requires a locator; any other target clears it.
    pub(crate) fn advance(
        &mut self,
        next: JobState,
        result_locator: Option<String>,
    ) -> TrackerResult<JobState> {
        let locator_ok = match next {
            JobState::Completed => result_locator.is_some(),
            _ => true,
        };
        if !self.state.can_transition_to(&next) || !locator_ok {
            return Err(TrackerError::IllegalTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.result_locator = match next {
            JobState::Completed => result_locator,
            _ => None,
        };
        Ok(std::mem::replace(&mut self.state, next))
    }
}
