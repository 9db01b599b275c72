//! Tracker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling and retention settings for a [`JobRegistry`](crate::JobRegistry).
///
/// Deserializes from partial input; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Delay between two status checks of the same job, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum status checks per job before it is marked failed.
    pub max_attempts: u32,
    /// Prefix of the default artifact locator (`{artifact_base}/{job_id}`).
    pub artifact_base: String,
    /// Restart polling for non-terminal jobs found in the persisted snapshot.
    pub resume_on_load: bool,
    pub retention: RetentionPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_attempts: 60,
            artifact_base: "/image".into(),
            resume_on_load: true,
            retention: RetentionPolicy::default(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Attempt budget; never less than one check.
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Set the delay between checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the default artifact locator prefix.
    pub fn with_artifact_base(mut self, base: impl Into<String>) -> Self {
        self.artifact_base = base.into();
        self
    }

    pub fn with_resume_on_load(mut self, resume: bool) -> Self {
        self.resume_on_load = resume;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Bounds on how many finished jobs are kept.
///
/// Only terminal jobs are evicted; pending jobs are never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many terminal jobs (newest win).
    pub max_finished: Option<usize>,
    /// Evict terminal jobs submitted longer ago than this.
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_finished: Some(100),
            max_age_secs: None,
        }
    }
}

impl RetentionPolicy {
    /// Keep every job forever.
    pub fn unbounded() -> Self {
        Self {
            max_finished: None,
            max_age_secs: None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_finished.is_none() && self.max_age_secs.is_none()
    }
}
