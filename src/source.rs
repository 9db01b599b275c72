//! Status source trait and raw response types.
//!
//! The [`StatusSource`] trait is the tracker's only view of the processing
//! backend:
//!
//! ```text
//!   (caller submits) ──→ check() ──→ check() ──→ ... ──→ delete()
//!                        (async)     (async)             (async)
//! ```
//!
//! ## Design principles
//!
//! - **Async-native**: all I/O methods are async.
//! - **Thread-safe**: `Send + Sync` bound enables sharing one source between
//!   every poller.
//! - **Raw**: `check()` hands back the response as received; interpreting it
//!   is the job of [`StatusClassifier`](crate::StatusClassifier).
//!
//! ## Method table
//!
//! | Method | Kind | Returns |
//! |--------|------|---------|
//! | `name()` | sync | `&str` |
//! | `check()` | async | `TrackerResult<RawResponse>` |
//! | `delete()` | async | `TrackerResult<()>` |

use async_trait::async_trait;

use crate::error::TrackerResult;
use crate::job::JobId;

/// Backend collaborator queried by the pollers.
///
/// # Contract
///
/// - `check()` MUST map a "job unknown" answer (HTTP 404) to
///   `Ok(RawResponse::NotFound)`, not to an error.
/// - Network failures and unrelated non-2xx answers MUST be returned as
///   `Err(TrackerError::Transport(..))`; the poller retries those.
/// - `delete()` SHOULD be idempotent. `Err(TrackerError::NotFound(..))` is
///   treated as already deleted.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Fetch the current status of a job.
    async fn check(&self, job_id: &JobId) -> TrackerResult<RawResponse>;

    /// Delete a job on the backend.
    async fn delete(&self, job_id: &JobId) -> TrackerResult<()>;
}

/// A status-check response as received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResponse {
    /// The backend does not know the job.
    NotFound,
    /// A successful response: status metadata or the artifact itself,
    /// told apart by the content type.
    Body {
        content_type: Option<String>,
        body: Vec<u8>,
    },
}

impl RawResponse {
    /// A structured status payload.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::Body {
            content_type: Some("application/json".into()),
            body: value.to_string().into_bytes(),
        }
    }

    /// Raw artifact bytes.
    pub fn artifact(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::Body {
            content_type: Some(content_type.into()),
            body: body.into(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            Self::NotFound => None,
            Self::Body { content_type, .. } => content_type.as_deref(),
        }
    }
}
