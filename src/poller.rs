//! Per-job polling task.
//!
//! A [`JobPoller`] runs as one Tokio task per tracked job:
//!
//! ```text
//!   ┌─→ cancelled? ──yes──→ stop
//!   │       │ no
//!   │   budget spent? ──yes──→ report Exhausted, stop
//!   │       │ no
//!   │   acquire check gate ──→ check() ──→ cancelled? ──yes──→ discard, stop
//!   │       │ no
//!   │   classify / wrap transport error ──→ report ──→ Stop? ──→ stop
//!   │       │ Continue (gate released)
//!   └── sleep(poll_interval)
//! ```
//!
//! The poller never touches a [`JobRecord`]; it reports every outcome to
//! its [`CheckSink`] (the registry) and obeys the returned directive. The
//! check gate is shared with on-demand checks, so at most one check per job
//! is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::classify::{Classification, StatusClassifier};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::job::{JobId, JobRecord};
use crate::source::{RawResponse, StatusSource};

/// Held for the duration of one check and its report.
pub(crate) type CheckGate = Arc<AsyncMutex<()>>;

pub(crate) fn new_gate() -> CheckGate {
    Arc::new(AsyncMutex::new(()))
}

/// One status check against the backend, classified.
#[derive(Clone)]
pub(crate) struct StatusCheck {
    source: Arc<dyn StatusSource>,
    classifier: StatusClassifier,
}

impl StatusCheck {
    pub(crate) fn new(source: Arc<dyn StatusSource>, classifier: StatusClassifier) -> Self {
        Self { source, classifier }
    }

    pub(crate) fn source(&self) -> &Arc<dyn StatusSource> {
        &self.source
    }

    pub(crate) fn classifier(&self) -> &StatusClassifier {
        &self.classifier
    }

    /// Check once. A backend not-found is an observation, not an error;
    /// any other error is a transport failure.
    pub(crate) async fn run(&self, job_id: &JobId) -> Result<Classification, TrackerError> {
        match self.source.check(job_id).await {
            Ok(raw) => Ok(self.classifier.classify(job_id, &raw)),
            Err(TrackerError::NotFound(_)) => {
                Ok(self.classifier.classify(job_id, &RawResponse::NotFound))
            }
            Err(err) => Err(err),
        }
    }
}

/// Identifies one poller run for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PollTicket {
    pub job_id: JobId,
    pub generation: u64,
}

/// What a single poll produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CheckReport {
    /// The backend answered and the answer was classified.
    Observed(Classification),
    /// The check itself failed; counts against the budget.
    TransportFailed(String),
    /// No checks left. Not a check itself.
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },
}

/// Registry reply to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollDirective {
    Continue,
    Stop,
}

/// Receiver of poll outcomes.
pub(crate) trait CheckSink: Send + Sync {
    fn report(&self, ticket: &PollTicket, report: CheckReport) -> PollDirective;
}

/// Handle to a running poller.
#[derive(Debug)]
pub struct PollerHandle {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop scheduling checks. A check already in flight completes, but the
    /// poller drops its result.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Not cancelled and still running.
    pub fn is_active(&self) -> bool {
        !self.is_cancelled() && !self.task.is_finished()
    }
}

/// The polling loop for a single job.
pub(crate) struct JobPoller {
    ticket: PollTicket,
    attempts: u32,
    budget: u32,
    interval: Duration,
    check: StatusCheck,
    gate: CheckGate,
    sink: Weak<dyn CheckSink>,
    cancelled: Arc<AtomicBool>,
}

impl JobPoller {
    /// Spawn a poller for `snapshot` on `runtime`.
    ///
    /// Attempts already recorded on the snapshot count against the budget.
    pub(crate) fn start(
        snapshot: &JobRecord,
        generation: u64,
        check: StatusCheck,
        gate: CheckGate,
        sink: Weak<dyn CheckSink>,
        config: &TrackerConfig,
        runtime: &Handle,
    ) -> PollerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let poller = JobPoller {
            ticket: PollTicket {
                job_id: snapshot.id.clone(),
                generation,
            },
            attempts: snapshot.attempts,
            budget: config.attempt_budget(),
            interval: config.poll_interval(),
            check,
            gate,
            sink,
            cancelled: Arc::clone(&cancelled),
        };
        let task = runtime.spawn(poller.run());
        PollerHandle {
            generation,
            cancelled,
            task,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn report(&self, report: CheckReport) -> PollDirective {
        match self.sink.upgrade() {
            Some(sink) => sink.report(&self.ticket, report),
            None => PollDirective::Stop,
        }
    }

    async fn run(mut self) {
        let job_id = self.ticket.job_id.clone();
        let mut last_error = None;

        loop {
            if self.is_cancelled() {
                debug!(job_id = %job_id, "poller cancelled");
                return;
            }
            if self.attempts >= self.budget {
                self.report(CheckReport::Exhausted {
                    attempts: self.attempts,
                    last_error,
                });
                return;
            }

            let in_flight = Arc::clone(&self.gate);
            let permit = in_flight.lock().await;
            if self.is_cancelled() {
                debug!(job_id = %job_id, "poller cancelled while waiting for check gate");
                return;
            }
            let outcome = self.check.run(&job_id).await;
            if self.is_cancelled() {
                debug!(job_id = %job_id, "discarding result of check completed after cancel");
                return;
            }
            self.attempts += 1;

            let report = match outcome {
                Ok(classification) => {
                    debug!(job_id = %job_id, attempt = self.attempts, state = %classification.state, "status checked");
                    last_error = None;
                    CheckReport::Observed(classification)
                }
                Err(err) => {
                    warn!(
                        job_id = %job_id,
                        attempt = self.attempts,
                        source = self.check.source().name(),
                        error = %err,
                        "status check failed; will retry"
                    );
                    last_error = Some(err.to_string());
                    CheckReport::TransportFailed(err.to_string())
                }
            };

            let terminal = matches!(&report, CheckReport::Observed(c) if c.is_terminal());
            if self.report(report) == PollDirective::Stop || terminal {
                return;
            }
            drop(permit);
            if self.attempts < self.budget {
                tokio::time::sleep(self.interval).await;
            }
        }
    }
}
