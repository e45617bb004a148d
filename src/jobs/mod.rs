//! Job Orchestrator
//!
//! Tracks research jobs from submission until the document they produce shows
//! up in the library. The backend never says which document belongs to which
//! job, so completion is inferred:
//!
//! ```text
//! submit ──► queue tail ──► grace timer (300 s) ──► poll once ──► expire if still queued
//!                                                     │
//!                                                     ▼
//!                                shared poller (every 10 s while the queue is non-empty)
//!                                                     │
//!                                document count grew by N ──► drop N oldest jobs
//! ```
//!
//! Grace expiry and poll matches race for the same job. Removal is keyed by
//! job id, so whichever runs second is a no-op.

pub mod history;
pub mod prompt;
pub mod snapshot;

use crate::backend::{DocumentCounter, JobBackend};
use crate::models::ResearchParameters;
use crate::status::StatusProjector;
use crate::storage::KeyValueStore;
use crate::types::ClientResult;
use chrono::Utc;
use history::ResearchHistory;
use snapshot::PersistedJob;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type JobId = Uuid;

/// Timing knobs of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Delay before polling starts for a job, and after which it auto-expires
    pub grace_period: Duration,
    pub poll_interval: Duration,
    /// Snapshots older than this are never restored
    pub survival_window: Duration,
    /// Delay before a restored job whose grace window already elapsed is expired
    pub restore_settle: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            survival_window: Duration::from_secs(1800),
            restore_settle: Duration::from_millis(100),
        }
    }
}

/// Read-only view of a queued job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub id: JobId,
    pub parameters: ResearchParameters,
    pub start_time: i64,
}

/// Remote and storage dependencies of the orchestrator
pub struct JobCollaborators {
    pub backend: Arc<dyn JobBackend>,
    pub counter: Arc<dyn DocumentCounter>,
    pub store: Arc<dyn KeyValueStore>,
    pub history: Option<Arc<dyn ResearchHistory>>,
}

struct ResearchJob {
    id: JobId,
    parameters: ResearchParameters,
    start_time: i64,
    grace_timer: Option<JoinHandle<()>>,
}

impl ResearchJob {
    fn new(parameters: ResearchParameters, start_time: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            parameters,
            start_time,
            grace_timer: None,
        }
    }

    /// Safe on fired or already-cleared timers
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }

    fn snapshot(&self) -> PersistedJob {
        PersistedJob {
            parameters: self.parameters.clone(),
            start_time: self.start_time,
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            parameters: self.parameters.clone(),
            start_time: self.start_time,
        }
    }
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<ResearchJob>,
    last_document_count: Option<u64>,
    poller: Option<JoinHandle<()>>,
    restored: bool,
    /// Bumped on every change that has to reach the snapshot
    revision: u64,
}

/// Queue contents captured under the lock and written after it is released
struct PendingSnapshot {
    revision: u64,
    jobs: Vec<PersistedJob>,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Held from a document-count request until its result is applied, so
    /// observations are applied in the order they were taken
    poll_gate: AsyncMutex<()>,
    /// Revision of the newest snapshot written to the store
    written_revision: Mutex<u64>,
    collaborators: JobCollaborators,
    status: StatusProjector,
    settings: OrchestratorSettings,
    queue_len: watch::Sender<usize>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for job in state.jobs.iter_mut() {
            job.cancel_timers();
        }
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
    }
}

/// Owns the queue of in-flight research jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobOrchestrator {
    shared: Arc<Shared>,
}

impl JobOrchestrator {
    pub fn new(
        collaborators: JobCollaborators,
        status: StatusProjector,
        settings: OrchestratorSettings,
    ) -> Self {
        let (queue_len, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                poll_gate: AsyncMutex::new(()),
                written_revision: Mutex::new(0),
                collaborators,
                status,
                settings,
                queue_len,
            }),
        }
    }

    fn from_weak(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue_len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn jobs(&self) -> Vec<JobSummary> {
        self.lock().jobs.iter().map(ResearchJob::summary).collect()
    }

    /// Queue length updates for badge rendering
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.shared.queue_len.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.lock()
            .poller
            .as_ref()
            .is_some_and(|poller| !poller.is_finished())
    }

    /// Start a research job and track it until its document appears.
    ///
    /// A failed job-creation request leaves the queue untouched; the error is
    /// returned so the caller can tell the user. Nothing is retried.
    pub async fn submit(&self, parameters: ResearchParameters) -> ClientResult<JobId> {
        self.restore_on_load().await;

        // Documents that appeared while nothing was tracked belong to no job
        let needs_baseline = {
            let state = self.lock();
            state.jobs.is_empty() || state.last_document_count.is_none()
        };
        if needs_baseline {
            self.refresh_baseline().await;
        }

        let run = match self.shared.collaborators.backend.create_document_job(&parameters).await {
            Ok(run) => run,
            Err(e) => {
                error!("Failed to start research: {}", e);
                return Err(e);
            }
        };

        if let Some(history) = &self.shared.collaborators.history {
            history.record(&parameters);
        }

        let mut job = ResearchJob::new(parameters, Utc::now().timestamp_millis());
        let id = job.id;
        let (len, pending) = {
            let mut state = self.lock();
            job.grace_timer = Some(self.spawn_grace_timer(id, self.shared.settings.grace_period));
            state.jobs.push_back(job);
            let pending = self.snapshot_locked(&mut state);
            self.publish_locked(&mut state);
            (state.jobs.len(), pending)
        };
        self.write_snapshot(pending);

        info!(job_id = %id, run = %run, queue_len = len, "Research job queued");
        Ok(id)
    }

    /// Rebuild the queue from the persisted snapshot.
    ///
    /// Only the first call does anything; `submit` calls it implicitly so the
    /// restored jobs always precede new ones.
    pub async fn restore_on_load(&self) {
        let (restored, pending) = {
            let mut state = self.lock();
            if state.restored {
                return;
            }
            state.restored = true;
            let restored = self.restore_locked(&mut state, Utc::now().timestamp_millis());
            // Drops the entries that fell out of the survival window
            let pending = self.snapshot_locked(&mut state);
            self.publish_locked(&mut state);
            (restored, pending)
        };
        self.write_snapshot(pending);

        if restored > 0 {
            info!(restored, "Restored active research jobs");
        }
        self.refresh_baseline().await;
    }

    fn restore_locked(&self, state: &mut QueueState, now_ms: i64) -> usize {
        let settings = self.shared.settings;
        let saved = snapshot::load(
            self.shared.collaborators.store.as_ref(),
            now_ms,
            settings.survival_window,
        );

        for entry in saved {
            let elapsed = entry.elapsed(now_ms);
            let mut job = ResearchJob::new(entry.parameters, entry.start_time);

            // Grace window already over: poll right away, then expire
            let delay = match settings.grace_period.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => settings.restore_settle,
            };
            debug!(job_id = %job.id, ?elapsed, ?delay, "Rescheduling restored job");

            job.grace_timer = Some(self.spawn_grace_timer(job.id, delay));
            state.jobs.push_back(job);
        }

        state.jobs.len()
    }

    /// Remove a job whose grace window elapsed without a match.
    ///
    /// Returns `false` when the job was already gone.
    pub fn on_grace_expiry(&self, id: JobId) -> bool {
        let (len, pending) = {
            let mut state = self.lock();
            let Some(index) = state.jobs.iter().position(|job| job.id == id) else {
                debug!(job_id = %id, "Grace expiry for job already removed");
                return false;
            };
            if let Some(mut job) = state.jobs.remove(index) {
                job.cancel_timers();
            }
            let pending = self.snapshot_locked(&mut state);
            self.publish_locked(&mut state);
            (state.jobs.len(), pending)
        };
        self.write_snapshot(pending);

        info!(job_id = %id, queue_len = len, "Job auto-expired after grace period");
        true
    }

    /// Attribute growth of the document count to the oldest queued jobs.
    ///
    /// The first observation only records the baseline, and a lower count
    /// replaces it. Returns how many jobs were removed.
    pub fn on_poll_tick(&self, observed_count: u64) -> usize {
        let (removed, len, pending) = {
            let mut state = self.lock();
            let Some(previous) = state.last_document_count.replace(observed_count) else {
                debug!(observed_count, "Recorded baseline document count");
                return 0;
            };
            if observed_count <= previous {
                return 0;
            }

            let added = observed_count - previous;
            let mut removed = 0;
            while (removed as u64) < added {
                let Some(mut job) = state.jobs.pop_front() else { break };
                job.cancel_timers();
                info!(job_id = %job.id, "Job matched to new document");
                removed += 1;
            }

            let pending = self.snapshot_locked(&mut state);
            self.publish_locked(&mut state);
            (removed, state.jobs.len(), pending)
        };
        self.write_snapshot(pending);

        info!(removed, queue_len = len, "New documents detected");
        removed
    }

    async fn poll_once(&self) {
        let _gate = self.shared.poll_gate.lock().await;
        match self.shared.collaborators.counter.current_document_count().await {
            Ok(count) => {
                self.on_poll_tick(count);
            }
            Err(e) => warn!("Error checking for documents: {}", e),
        }
    }

    /// Take the current document count as the baseline while no job could
    /// have produced a document yet
    async fn refresh_baseline(&self) {
        let _gate = self.shared.poll_gate.lock().await;
        match self.shared.collaborators.counter.current_document_count().await {
            Ok(count) => {
                let mut state = self.lock();
                if state.jobs.is_empty() || state.last_document_count.is_none() {
                    debug!(count, "Baseline document count refreshed");
                    state.last_document_count = Some(count);
                }
            }
            Err(e) => warn!("Failed to read baseline document count: {}", e),
        }
    }

    fn spawn_grace_timer(&self, id: JobId, delay: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(orchestrator) = Self::from_weak(&shared) else { return };
            orchestrator.grace_elapsed(id).await;
        })
    }

    async fn grace_elapsed(&self, id: JobId) {
        {
            // The timer has fired; nothing left to cancel for it
            let mut state = self.lock();
            match state.jobs.iter_mut().find(|job| job.id == id) {
                Some(job) => job.grace_timer = None,
                None => return,
            }
        }

        // Documents that finished during the grace window get attributed first
        self.poll_once().await;
        self.on_grace_expiry(id);
        self.ensure_poller();
    }

    fn ensure_poller(&self) {
        let mut state = self.lock();
        if state.jobs.is_empty() {
            return;
        }
        if state.poller.as_ref().is_some_and(|poller| !poller.is_finished()) {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        let period = self.shared.settings.poll_interval;
        debug!(?period, "Starting document poller");

        state.poller = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = Self::from_weak(&shared) else { break };
                if orchestrator.queue_len() == 0 {
                    break;
                }
                orchestrator.poll_once().await;
            }
        }));
    }

    fn snapshot_locked(&self, state: &mut QueueState) -> PendingSnapshot {
        state.revision += 1;
        PendingSnapshot {
            revision: state.revision,
            jobs: state.jobs.iter().map(ResearchJob::snapshot).collect(),
        }
    }

    /// Write a snapshot unless a newer one already reached the store
    fn write_snapshot(&self, pending: PendingSnapshot) {
        let mut written = self
            .shared
            .written_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.revision <= *written {
            return;
        }
        snapshot::save(self.shared.collaborators.store.as_ref(), &pending.jobs);
        *written = pending.revision;
    }

    /// Render the queue length while the queue lock is held, so concurrent
    /// mutations reach the indicator in the order they happened
    fn publish_locked(&self, state: &mut QueueState) {
        let len = state.jobs.len();
        if len == 0 {
            if let Some(poller) = state.poller.take() {
                poller.abort();
            }
        }
        self.shared.status.render(len);
        self.shared.queue_len.send_replace(len);
    }
}
