//! Status classification.
//!
//! The backend answers a status check in one of two shapes:
//!
//! | Response | Meaning |
//! |----------|---------|
//! | 404 | job unknown → `Failed` |
//! | JSON body with `status` | `processing` / `uploaded` → `Processing`, `completed` → `Completed`, `failed` → `Failed` |
//! | any other body (e.g. `image/png`) | the finished artifact itself → `Completed` |
//!
//! Once a job is done the backend returns the artifact instead of a second
//! status hop. [`StatusClassifier`] is the only place that looks at content
//! types; everything downstream sees a [`JobState`].

use serde::Deserialize;

use crate::error::ClassificationError;
use crate::job::{JobId, JobState};
use crate::source::RawResponse;

/// Outcome of classifying one status response.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub state: JobState,
    /// Set iff `state` is `Completed`.
    pub result_locator: Option<String>,
    /// `metadata` object from a structured payload, if any.
    pub metadata: Option<serde_json::Value>,
}

impl Classification {
    fn new(state: JobState) -> Self {
        Self {
            state,
            result_locator: None,
            metadata: None,
        }
    }

    fn completed(locator: String) -> Self {
        Self {
            state: JobState::Completed,
            result_locator: Some(locator),
            metadata: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::new(JobState::Failed(reason.into()))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Structured status payload. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Translates raw status responses into lifecycle states.
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    artifact_base: String,
}

impl StatusClassifier {
    /// `artifact_base` prefixes the locator of artifacts delivered inline.
    pub fn new(artifact_base: impl Into<String>) -> Self {
        Self {
            artifact_base: artifact_base.into(),
        }
    }

    /// Locator of the artifact served at the job's status endpoint.
    pub fn artifact_locator(&self, job_id: &JobId) -> String {
        format!("{}/{}", self.artifact_base.trim_end_matches('/'), job_id)
    }

    pub fn classify(&self, job_id: &JobId, raw: &RawResponse) -> Classification {
        match raw {
            RawResponse::NotFound => Classification::failed("job not found on backend"),
            RawResponse::Body { content_type, body }
                if content_type.as_deref().is_some_and(is_structured) =>
            {
                self.classify_payload(job_id, body).unwrap_or_else(|err| {
                    tracing::warn!(job_id = %job_id, error = %err, "rejected status payload");
                    Classification::failed(err.to_string())
                })
            }
            RawResponse::Body { .. } => Classification::completed(self.artifact_locator(job_id)),
        }
    }

    fn classify_payload(
        &self,
        job_id: &JobId,
        body: &[u8],
    ) -> Result<Classification, ClassificationError> {
        let payload: StatusPayload = serde_json::from_slice(body)
            .map_err(|e| ClassificationError::MalformedPayload(e.to_string()))?;
        let status = payload
            .status
            .as_deref()
            .ok_or(ClassificationError::MissingStatus)?;

        let mut classification = match status.trim().to_ascii_lowercase().as_str() {
            "processing" | "uploaded" => Classification::new(JobState::Processing),
            "completed" => {
                let locator = payload
                    .image_url
                    .filter(|url| !url.is_empty())
                    .unwrap_or_else(|| self.artifact_locator(job_id));
                Classification::completed(locator)
            }
            "failed" => Classification::failed(
                payload
                    .error
                    .or(payload.message)
                    .unwrap_or_else(|| "backend reported failure".into()),
            ),
            _ => return Err(ClassificationError::UnrecognizedStatus(status.to_string())),
        };
        classification.metadata = payload.metadata.filter(|m| !m.is_null());
        Ok(classification)
    }
}

/// JSON media types, with or without parameters (`application/json; charset=utf-8`).
fn is_structured(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classifier() -> StatusClassifier {
        StatusClassifier::new("/image")
    }

    fn id() -> JobId {
        JobId::new("img-1")
    }

    #[test]
    fn test_not_found_is_failed() {
        let c = classifier().classify(&id(), &RawResponse::NotFound);
        assert!(matches!(c.state, JobState::Failed(_)));
        assert!(c.result_locator.is_none());
    }

    #[test]
    fn test_processing_and_uploaded() {
        for status in ["processing", "uploaded", "Processing"] {
            let raw = RawResponse::json(&json!({ "status": status }));
            let c = classifier().classify(&id(), &raw);
            assert_eq!(c.state, JobState::Processing, "status {status}");
            assert!(c.result_locator.is_none());
        }
    }

    #[test]
    fn test_structured_completed() {
        let raw = RawResponse::json(&json!({ "status": "completed" }));
        let c = classifier().classify(&id(), &raw);
        assert_eq!(c.state, JobState::Completed);
        assert_eq!(c.result_locator.as_deref(), Some("/image/img-1"));
    }

    #[test]
    fn test_structured_completed_prefers_image_url() {
        let raw = RawResponse::json(&json!({
            "status": "completed",
            "image_url": "https://cdn.example/img-1.png",
            "metadata": { "width": 640 }
        }));
        let c = classifier().classify(&id(), &raw);
        assert_eq!(c.result_locator.as_deref(), Some("https://cdn.example/img-1.png"));
        assert_eq!(c.metadata, Some(json!({ "width": 640 })));
    }

    #[test]
    fn test_raw_artifact_is_completed() {
        let raw = RawResponse::artifact("image/jpeg", vec![0xff, 0xd8, 0xff]);
        let c = classifier().classify(&id(), &raw);
        assert_eq!(c.state, JobState::Completed);
        assert_eq!(c.result_locator.as_deref(), Some("/image/img-1"));

        let untyped = RawResponse::Body {
            content_type: None,
            body: vec![1, 2, 3],
        };
        assert_eq!(classifier().classify(&id(), &untyped).state, JobState::Completed);
    }

    #[test]
    fn test_explicit_failure_keeps_reason() {
        let raw = RawResponse::json(&json!({ "status": "failed", "error": "unsupported format" }));
        let c = classifier().classify(&id(), &raw);
        assert_eq!(c.state, JobState::Failed("unsupported format".into()));

        let raw = RawResponse::json(&json!({ "status": "failed" }));
        let c = classifier().classify(&id(), &raw);
        assert_eq!(c.state, JobState::Failed("backend reported failure".into()));
    }

    #[test]
    fn test_unrecognized_status_never_succeeds() {
        let raw = RawResponse::json(&json!({ "status": "paused" }));
        let c = classifier().classify(&id(), &raw);
        assert_eq!(
            c.state,
            JobState::Failed(ClassificationError::UnrecognizedStatus("paused".into()).to_string())
        );
    }

    #[test]
    fn test_missing_status_and_malformed_json() {
        let raw = RawResponse::json(&json!({ "message": "hello" }));
        let c = classifier().classify(&id(), &raw);
        assert_eq!(
            c.state,
            JobState::Failed(ClassificationError::MissingStatus.to_string())
        );

        let raw = RawResponse::Body {
            content_type: Some("application/json; charset=utf-8".into()),
            body: b"{not json".to_vec(),
        };
        let c = classifier().classify(&id(), &raw);
        match c.state {
            JobState::Failed(reason) => assert!(reason.starts_with("malformed status payload")),
            other => panic!("expected failure, got {other}"),
        }
    }

    #[test]
    fn test_is_structured() {
        assert!(is_structured("application/json"));
        assert!(is_structured("Application/JSON; charset=utf-8"));
        assert!(is_structured("application/problem+json"));
        assert!(!is_structured("image/png"));
        assert!(!is_structured("application/octet-stream"));
    }

    #[test]
    fn test_artifact_base_trailing_slash() {
        let c = StatusClassifier::new("https://api.example/image/");
        assert_eq!(c.artifact_locator(&id()), "https://api.example/image/img-1");
    }
}
