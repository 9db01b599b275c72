//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::sync::Notify;

use crate::error::{TrackerError, TrackerResult};
use crate::job::{JobId, JobRecord};
use crate::source::{RawResponse, StatusSource};
use crate::store::JobStore;

/// One scripted answer to a status check.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Respond(RawResponse),
    Transport(String),
}

impl Step {
    pub fn status(status: &str) -> Self {
        Self::Respond(RawResponse::json(&json!({ "status": status })))
    }

    pub fn processing() -> Self {
        Self::status("processing")
    }

    pub fn artifact(content_type: &str) -> Self {
        Self::Respond(RawResponse::artifact(content_type, vec![0u8; 16]))
    }

    pub fn not_found() -> Self {
        Self::Respond(RawResponse::NotFound)
    }

    pub fn transport(msg: &str) -> Self {
        Self::Transport(msg.to_string())
    }
}

/// Answers checks from a per-job script. The last step repeats forever.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    scripts: Mutex<FxHashMap<JobId, VecDeque<Step>>>,
    checks: Mutex<FxHashMap<JobId, u32>>,
    deleted: Mutex<Vec<JobId>>,
    fail_deletes: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(JobId::new(id), steps.into());
    }

    pub fn checks(&self, id: &str) -> u32 {
        self.checks
            .lock()
            .unwrap()
            .get(&JobId::new(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn deleted(&self) -> Vec<JobId> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check(&self, job_id: &JobId) -> TrackerResult<RawResponse> {
        *self.checks.lock().unwrap().entry(job_id.clone()).or_default() += 1;
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts
                .get_mut(job_id)
                .ok_or_else(|| TrackerError::Transport(format!("no script for {job_id}")))?;
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match step {
            Some(Step::Respond(raw)) => Ok(raw),
            Some(Step::Transport(msg)) => Err(TrackerError::Transport(msg)),
            None => Err(TrackerError::Transport("empty script".into())),
        }
    }

    async fn delete(&self, job_id: &JobId) -> TrackerResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(TrackerError::Transport("delete timed out".into()));
        }
        self.deleted.lock().unwrap().push(job_id.clone());
        Ok(())
    }
}

/// Holds every check until released; answers with an artifact.
#[derive(Default)]
pub(crate) struct GatedSource {
    pub entered: Notify,
    pub release: Notify,
    pub checks: AtomicU32,
}

#[async_trait]
impl StatusSource for GatedSource {
    fn name(&self) -> &str {
        "gated"
    }

    async fn check(&self, _job_id: &JobId) -> TrackerResult<RawResponse> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(RawResponse::artifact("image/png", vec![1, 2, 3]))
    }

    async fn delete(&self, _job_id: &JobId) -> TrackerResult<()> {
        Ok(())
    }
}

/// A store whose saves always fail.
#[derive(Default)]
pub(crate) struct BrokenStore {
    pub save_attempts: AtomicU32,
}

impl JobStore for BrokenStore {
    fn load(&self) -> Vec<JobRecord> {
        Vec::new()
    }

    fn save(&self, _records: &[JobRecord]) -> TrackerResult<()> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        Err(TrackerError::Persistence("disk full".into()))
    }
}
