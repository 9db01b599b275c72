//! The authoritative set of tracked jobs.
//!
//! [`JobRegistry`] owns every [`JobRecord`]. Pollers and on-demand checks
//! only report outcomes; the registry validates them against the state
//! machine, persists the full snapshot and notifies observers.
//!
//! ```text
//!   submit() ──→ record(Submitted) ──→ persist ──→ notify ──→ start poller
//!                                                                 │
//!   observers ←── notify ←── persist ←── validate ←── report ←───┘
//! ```
//!
//! At most one poller is active per job, and at most one check per job is
//! in flight: pollers and [`JobRegistry::check_now`] share a per-job gate.
//! Every poller carries a generation number and the registry ignores reports
//! whose generation is not the current one, so a cancelled poller can never
//! bring a removed job back.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::classify::StatusClassifier;
use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::poller::{
    CheckGate, CheckReport, CheckSink, JobPoller, PollDirective, PollTicket, PollerHandle,
    StatusCheck, new_gate,
};
use crate::source::StatusSource;
use crate::store::{JobStore, MemoryStore};

/// Change notification delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A job started being tracked.
    Submitted(JobRecord),
    /// A state-machine transition was applied.
    Transitioned {
        previous: JobState,
        record: JobRecord,
    },
    /// A job stopped being tracked (explicit removal or retention).
    Removed(JobId),
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Submitted(record) | JobEvent::Transitioned { record, .. } => &record.id,
            JobEvent::Removed(id) => id,
        }
    }
}

type Observer = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Registered observer; call [`Subscription::unsubscribe`] to detach it.
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the observer attached; call unsubscribe() to detach"]
pub struct Subscription {
    id: u64,
    registry: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().observers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Builder for [`JobRegistry`].
pub struct JobRegistryBuilder {
    source: Arc<dyn StatusSource>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl JobRegistryBuilder {
    /// Persistence adapter. Defaults to a [`MemoryStore`].
    pub fn store<S: JobStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = store;
        self
    }

    /// Time source. Defaults to [`SystemClock`].
    pub fn clock<C: Clock + 'static>(mut self, clock: Arc<C>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the registry and reconcile it with the persisted snapshot.
    ///
    /// Must be called from within a Tokio runtime; pollers are spawned on it.
    pub fn build(self) -> TrackerResult<JobRegistry> {
        let runtime = Handle::try_current().map_err(|_| {
            TrackerError::Configuration("JobRegistry must be built inside a Tokio runtime".into())
        })?;
        let classifier = StatusClassifier::new(self.config.artifact_base.clone());
        let inner = Arc::new_cyclic(|weak| Inner {
            config: self.config,
            check: StatusCheck::new(self.source, classifier),
            store: self.store,
            clock: self.clock,
            runtime,
            this: weak.clone(),
            state: Mutex::new(RegistryState::default()),
            saved_revision: Mutex::new(0),
        });
        inner.restore();
        Ok(JobRegistry { inner })
    }
}

/// Tracks background jobs until they complete or fail.
///
/// Cloning is cheap; clones share the same jobs.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    pub fn builder<S: StatusSource + 'static>(source: Arc<S>) -> JobRegistryBuilder {
        JobRegistryBuilder {
            source,
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(SystemClock),
            config: TrackerConfig::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Start tracking a job the backend just accepted.
    pub fn submit(&self, job_id: impl Into<JobId>) -> TrackerResult<JobRecord> {
        self.submit_with_metadata(job_id, serde_json::Value::Null)
    }

    /// Start tracking a job, keeping the backend's upload response.
    pub fn submit_with_metadata(
        &self,
        job_id: impl Into<JobId>,
        metadata: serde_json::Value,
    ) -> TrackerResult<JobRecord> {
        let inner = &self.inner;
        let job_id = job_id.into();
        let (record, pending) = {
            let mut state = inner.lock();
            if state.jobs.contains_key(&job_id) {
                return Err(TrackerError::Duplicate(job_id));
            }
            let record = JobRecord::new(job_id.clone(), inner.clock.now()).with_metadata(metadata);
            state.track(record.clone(), true);
            (record, state.pending_save())
        };
        inner.persist(pending);
        info!(job_id = %job_id, "job submitted");
        inner.notify(&JobEvent::Submitted(record.clone()));

        // Started after notifying so observers see `Submitted` first. A
        // concurrent remove() in between leaves nothing to poll.
        let mut state = inner.lock();
        if let Some(current) = state.jobs.get(&job_id).cloned() {
            if !current.is_terminal() {
                inner.start_poller(&mut state, &current);
            }
        }
        Ok(record)
    }

    pub fn get(&self, job_id: &JobId) -> TrackerResult<JobRecord> {
        self.inner
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(job_id.clone()))
    }

    /// Snapshot of all tracked jobs, most recently submitted first.
    pub fn list(&self) -> Vec<JobRecord> {
        self.inner.lock().snapshot()
    }

    /// Stop tracking a job. Unknown ids are a no-op.
    pub fn remove(&self, job_id: &JobId) {
        let pending = {
            let mut state = self.inner.lock();
            if !state.drop_job(job_id) {
                return;
            }
            state.pending_save()
        };
        self.inner.persist(pending);
        info!(job_id = %job_id, "job removed");
        self.inner.notify(&JobEvent::Removed(job_id.clone()));
    }

    /// Delete the job on the backend, then stop tracking it.
    ///
    /// A backend that no longer knows the job counts as deleted. On any
    /// other error the job stays tracked.
    pub async fn delete(&self, job_id: &JobId) -> TrackerResult<()> {
        match self.inner.check.source().delete(job_id).await {
            Ok(()) | Err(TrackerError::NotFound(_)) => {
                self.remove(job_id);
                Ok(())
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "backend delete failed; keeping job");
                Err(err)
            }
        }
    }

    /// Check a job's status now, outside the polling schedule.
    ///
    /// Waits for a check already in flight for the same job. The answer is
    /// applied like a poll result and counts as an attempt. A finished job
    /// is returned as is without contacting the backend; a transport
    /// failure is recorded and returned.
    pub async fn check_now(&self, job_id: &JobId) -> TrackerResult<JobRecord> {
        let inner = &self.inner;
        let gate = {
            let state = inner.lock();
            let record = state
                .jobs
                .get(job_id)
                .ok_or_else(|| TrackerError::NotFound(job_id.clone()))?;
            if record.is_terminal() {
                return Ok(record.clone());
            }
            state
                .gates
                .get(job_id)
                .cloned()
                .ok_or_else(|| TrackerError::NotFound(job_id.clone()))?
        };
        let _permit = gate.lock().await;

        // The job may have finished, or been removed and resubmitted,
        // while we waited for the gate.
        let same_job = |state: &RegistryState| {
            state
                .gates
                .get(job_id)
                .is_some_and(|current| Arc::ptr_eq(current, &gate))
        };
        {
            let state = inner.lock();
            if !same_job(&*state) {
                return Err(TrackerError::NotFound(job_id.clone()));
            }
            if let Some(record) = state.jobs.get(job_id).filter(|r| r.is_terminal()) {
                return Ok(record.clone());
            }
        }

        let outcome = inner.check.run(job_id).await;
        let report = match &outcome {
            Ok(classification) => CheckReport::Observed(classification.clone()),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "on-demand status check failed");
                CheckReport::TransportFailed(err.to_string())
            }
        };
        let (_, record) = inner.apply_report(job_id, report, same_job);
        let record = record.ok_or_else(|| TrackerError::NotFound(job_id.clone()))?;
        outcome.map(|_| record)
    }

    /// Restart polling for a pending job without an active poller.
    ///
    /// Returns `false` if the job is terminal or already being polled.
    pub fn resume(&self, job_id: &JobId) -> TrackerResult<bool> {
        let mut state = self.inner.lock();
        let record = state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(job_id.clone()))?;
        if record.is_terminal() {
            return Ok(false);
        }
        let started = self.inner.start_poller(&mut state, &record);
        if started {
            info!(job_id = %job_id, attempts = record.attempts, "polling resumed");
        }
        Ok(started)
    }

    /// Whether a poller is currently active for the job.
    pub fn is_polling(&self, job_id: &JobId) -> bool {
        self.inner
            .lock()
            .pollers
            .get(job_id)
            .is_some_and(PollerHandle::is_active)
    }

    /// Register an observer for every [`JobEvent`].
    ///
    /// Observers are called in registration order, outside the registry
    /// lock. A panicking observer is logged and skipped.
    pub fn subscribe(&self, observer: impl Fn(&JobEvent) + Send + Sync + 'static) -> Subscription {
        let mut state = self.inner.lock();
        state.next_observer += 1;
        let id = state.next_observer;
        let observer: Observer = Arc::new(observer);
        state.observers.push((id, observer));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }
}

/// Snapshot taken under the registry lock, saved after it is released.
struct PendingSave {
    revision: u64,
    records: Vec<JobRecord>,
}

#[derive(Default)]
struct RegistryState {
    jobs: FxHashMap<JobId, JobRecord>,
    /// Most recently submitted first.
    order: Vec<JobId>,
    pollers: FxHashMap<JobId, PollerHandle>,
    /// One per tracked job; replaced when a job id is tracked anew.
    gates: FxHashMap<JobId, CheckGate>,
    observers: Vec<(u64, Observer)>,
    next_generation: u64,
    next_observer: u64,
    revision: u64,
}

impl RegistryState {
    fn snapshot(&self) -> Vec<JobRecord> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id).cloned())
            .collect()
    }

    fn pending_save(&mut self) -> PendingSave {
        self.revision += 1;
        PendingSave {
            revision: self.revision,
            records: self.snapshot(),
        }
    }

    /// Start tracking a record; `newest` puts it at the front of the list.
    fn track(&mut self, record: JobRecord, newest: bool) {
        let id = record.id.clone();
        if newest {
            self.order.insert(0, id.clone());
        } else {
            self.order.push(id.clone());
        }
        self.gates.insert(id.clone(), new_gate());
        self.jobs.insert(id, record);
    }

    fn is_current(&self, ticket: &PollTicket) -> bool {
        self.pollers
            .get(&ticket.job_id)
            .is_some_and(|h| h.generation() == ticket.generation && !h.is_cancelled())
    }

    /// Forget a job and cancel its poller. Returns whether it was tracked.
    fn drop_job(&mut self, job_id: &JobId) -> bool {
        if let Some(handle) = self.pollers.remove(job_id) {
            handle.cancel();
        }
        self.gates.remove(job_id);
        if self.jobs.remove(job_id).is_none() {
            return false;
        }
        self.order.retain(|id| id != job_id);
        true
    }
}

struct Inner {
    config: TrackerConfig,
    check: StatusCheck,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    this: Weak<Inner>,
    state: Mutex<RegistryState>,
    /// Revision of the newest snapshot handed to the store.
    saved_revision: Mutex<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the persisted snapshot and resume pending jobs.
    fn restore(&self) {
        let loaded = self.store.load();
        let loaded_len = loaded.len();
        let mut state = self.lock();

        for mut record in loaded {
            if state.jobs.contains_key(&record.id) {
                warn!(job_id = %record.id, "duplicate job in snapshot; keeping the newest entry");
                continue;
            }
            // Older snapshots may carry a completed job without a locator.
            if record.state == JobState::Completed && record.result_locator.is_none() {
                record.result_locator = Some(self.check.classifier().artifact_locator(&record.id));
            } else if record.state != JobState::Completed {
                record.result_locator = None;
            }
            state.track(record, false);
        }

        let evicted = self.evict_locked(&mut state, None);
        let pending = (!evicted.is_empty() || state.jobs.len() != loaded_len)
            .then(|| state.pending_save());

        let mut resumed = 0;
        if self.config.resume_on_load {
            let pending_jobs: Vec<JobRecord> = state
                .snapshot()
                .into_iter()
                .filter(|r| !r.is_terminal())
                .collect();
            for record in &pending_jobs {
                if self.start_poller(&mut state, record) {
                    resumed += 1;
                }
            }
        }
        info!(
            jobs = state.jobs.len(),
            resumed,
            evicted = evicted.len(),
            "job registry restored"
        );
        drop(state);
        if let Some(pending) = pending {
            self.persist(pending);
        }
    }

    /// Spawn a poller unless one is already active for the job.
    fn start_poller(&self, state: &mut RegistryState, record: &JobRecord) -> bool {
        if state
            .pollers
            .get(&record.id)
            .is_some_and(PollerHandle::is_active)
        {
            debug!(job_id = %record.id, "poller already active");
            return false;
        }
        state.next_generation += 1;
        let gate = Arc::clone(state.gates.entry(record.id.clone()).or_insert_with(new_gate));
        let sink: Weak<dyn CheckSink> = self.this.clone();
        let handle = JobPoller::start(
            record,
            state.next_generation,
            self.check.clone(),
            gate,
            sink,
            &self.config,
            &self.runtime,
        );
        state.pollers.insert(record.id.clone(), handle);
        true
    }

    /// Apply a transition to a tracked job.
    ///
    /// A terminal outcome for a job still in `Submitted` goes through
    /// `Processing` first. Illegal transitions are logged and rejected; the
    /// record is unchanged. A terminal transition stops the job's poller
    /// and applies retention to the other finished jobs. The caller
    /// persists and notifies.
    fn apply_transition(
        &self,
        state: &mut RegistryState,
        job_id: &JobId,
        next: JobState,
        result_locator: Option<String>,
    ) -> TrackerResult<Vec<JobEvent>> {
        let now = self.clock.now();
        let record = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.clone()))?;

        let mut staged = record.clone();
        let mut events = Vec::new();
        if staged.state == JobState::Submitted && next.is_terminal() {
            events.push(Self::transition(&mut staged, JobState::Processing, None, now)?);
        }
        events.push(Self::transition(&mut staged, next, result_locator, now)?);
        let terminal = staged.is_terminal();
        *record = staged;

        if terminal {
            if let Some(handle) = state.pollers.remove(job_id) {
                handle.cancel();
            }
            events.extend(self.evict_locked(state, Some(job_id)));
        }
        Ok(events)
    }

    fn transition(
        record: &mut JobRecord,
        next: JobState,
        result_locator: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> TrackerResult<JobEvent> {
        match record.advance(next, result_locator) {
            Ok(previous) => {
                if record.is_terminal() {
                    record.finished_at = Some(now);
                    info!(job_id = %record.id, from = %previous, to = %record.state, attempts = record.attempts, "job finished");
                } else {
                    debug!(job_id = %record.id, from = %previous, to = %record.state, attempts = record.attempts, "job transitioned");
                }
                Ok(JobEvent::Transitioned {
                    previous,
                    record: record.clone(),
                })
            }
            Err(err) => {
                warn!(job_id = %record.id, error = %err, "dropping illegal transition");
                Err(err)
            }
        }
    }

    /// Apply the retention policy. Only terminal jobs are evicted, never
    /// `keep`; age counts from when a job finished.
    fn evict_locked(&self, state: &mut RegistryState, keep: Option<&JobId>) -> Vec<JobEvent> {
        let policy = &self.config.retention;
        if policy.is_unbounded() {
            return Vec::new();
        }
        let now = self.clock.now();
        let cutoff = policy
            .max_age_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
            .and_then(|age| now.checked_sub_signed(age));

        let mut kept_finished = 0usize;
        let mut evict = Vec::new();
        for id in &state.order {
            let Some(record) = state.jobs.get(id) else {
                continue;
            };
            if !record.is_terminal() {
                continue;
            }
            if keep == Some(id) {
                kept_finished += 1;
                continue;
            }
            let too_old = cutoff.is_some_and(|cutoff| record.finished_or_last_seen() < cutoff);
            let over_capacity = policy.max_finished.is_some_and(|max| kept_finished >= max);
            if too_old || over_capacity {
                evict.push(id.clone());
            } else {
                kept_finished += 1;
            }
        }

        evict
            .into_iter()
            .filter(|id| state.drop_job(id))
            .map(|id| {
                info!(job_id = %id, "finished job evicted by retention policy");
                JobEvent::Removed(id)
            })
            .collect()
    }

    /// Save a snapshot unless a newer one has already been saved.
    fn persist(&self, pending: PendingSave) {
        let mut saved = self
            .saved_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.revision <= *saved {
            debug!(revision = pending.revision, saved = *saved, "skipping superseded snapshot");
            return;
        }
        *saved = pending.revision;
        if let Err(err) = self.store.save(&pending.records) {
            warn!(error = %err, "failed to persist job list; in-memory state stays authoritative");
        }
    }

    fn notify(&self, event: &JobEvent) {
        let observers: Vec<Observer> = self
            .lock()
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                warn!(job_id = %event.job_id(), "job observer panicked");
            }
        }
    }

    fn exhausted_reason(attempts: u32, last_error: Option<String>) -> String {
        match last_error {
            Some(err) => format!("retry budget exhausted after {attempts} checks (last error: {err})"),
            None => format!("no terminal status after {attempts} checks"),
        }
    }

    /// Apply one check outcome if `is_current` still holds for the job.
    ///
    /// Returns the directive for a poller and the job as it stands
    /// afterwards (`None` if it is no longer tracked or the outcome was
    /// stale).
    fn apply_report(
        &self,
        job_id: &JobId,
        report: CheckReport,
        is_current: impl FnOnce(&RegistryState) -> bool,
    ) -> (PollDirective, Option<JobRecord>) {
        let mut events = Vec::new();
        let (directive, record, pending) = {
            let mut state = self.lock();
            if !is_current(&*state) {
                debug!(job_id = %job_id, "discarding stale check result");
                return (PollDirective::Stop, None);
            }
            let Some(record) = state.jobs.get_mut(job_id) else {
                return (PollDirective::Stop, None);
            };
            if record.is_terminal() {
                warn!(job_id = %job_id, state = %record.state, "unexpected status for finished job; discarded");
                let record = record.clone();
                state.pollers.remove(job_id);
                return (PollDirective::Stop, Some(record));
            }

            let next = match report {
                CheckReport::Observed(classification) => {
                    record.record_check(self.clock.now());
                    if let Some(metadata) = classification.metadata {
                        record.metadata = metadata;
                    }
                    Some((classification.state, classification.result_locator))
                }
                CheckReport::TransportFailed(_) => {
                    record.record_check(self.clock.now());
                    None
                }
                CheckReport::Exhausted {
                    attempts,
                    last_error,
                } => Some((
                    JobState::Failed(Self::exhausted_reason(attempts, last_error)),
                    None,
                )),
            };
            if let Some((next, locator)) = next {
                if let Ok(applied) = self.apply_transition(&mut state, job_id, next, locator) {
                    events.extend(applied);
                }
            }

            let record = state.jobs.get(job_id).cloned();
            let terminal = record.as_ref().is_none_or(JobRecord::is_terminal);
            let directive = if terminal {
                state.pollers.remove(job_id);
                PollDirective::Stop
            } else {
                PollDirective::Continue
            };
            (directive, record, state.pending_save())
        };
        self.persist(pending);
        for event in &events {
            self.notify(event);
        }
        (directive, record)
    }
}

impl CheckSink for Inner {
    fn report(&self, ticket: &PollTicket, report: CheckReport) -> PollDirective {
        let (directive, _) =
            self.apply_report(&ticket.job_id, report, |state| state.is_current(ticket));
        directive
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in state.pollers.values() {
            handle.cancel();
        }
    }
}
