//! Background calculation jobs: submit returns a job id at once, the run
//! happens on Tokio's blocking pool, callers poll `status`.

use super::{CalcOptions, RunObserver, RunStats, SignalCalculator};
use crate::storage::Repository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a calculation job is already running")]
    AlreadyRunning,

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Incremental,
    Full,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Incremental => "incremental",
            RunMode::Full => "full",
        }
    }
}

/// Pollable snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub state: JobState,
    pub mode: RunMode,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub missing_data: usize,
    pub signals_generated: usize,
    pub failures: Vec<(String, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobStatus {
    fn new(mode: RunMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Queued,
            mode,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            missing_data: 0,
            signals_generated: 0,
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    fn apply(&mut self, stats: &RunStats) {
        self.total = stats.total;
        self.processed = stats.processed;
        self.succeeded = stats.succeeded;
        self.failed = stats.failed;
        self.skipped = stats.skipped;
        self.missing_data = stats.missing_data;
        self.signals_generated = stats.signals_generated;
        self.failures.clone_from(&stats.failures);
    }
}

/// What to calculate.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    /// `None` means every company.
    pub companies: Option<Vec<String>>,
    pub options: CalcOptions,
}

impl JobRequest {
    fn mode(&self) -> RunMode {
        if self.options.incremental { RunMode::Incremental } else { RunMode::Full }
    }
}

struct JobEntry {
    status: Arc<Mutex<JobStatus>>,
    cancel: Arc<AtomicBool>,
}

struct JobObserver {
    status: Arc<Mutex<JobStatus>>,
    cancel: Arc<AtomicBool>,
}

impl RunObserver for JobObserver {
    fn progress(&self, stats: &RunStats) {
        lock(&self.status).apply(stats);
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Releases the single-run guard even if the job panics.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Finished jobs kept for `status` lookups; older ones are dropped on submit.
pub const MAX_FINISHED_JOBS: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the job table and the "one run at a time" guard.
pub struct JobManager {
    repo: Mutex<Repository>,
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    running: Arc<AtomicBool>,
}

impl JobManager {
    /// Jobs run on their own connection cloned from `repo`.
    pub fn new(repo: Repository) -> Self {
        Self {
            repo: Mutex::new(repo),
            jobs: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a job and return its id. Must be called inside a Tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<Uuid, JobError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(JobError::AlreadyRunning);
        }
        let guard = RunGuard(Arc::clone(&self.running));

        let repo = lock(&self.repo).try_clone()?;
        let status = JobStatus::new(request.mode());
        let id = status.id;
        let status = Arc::new(Mutex::new(status));
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let mut jobs = lock(&self.jobs);
            prune_finished(&mut jobs, MAX_FINISHED_JOBS);
            jobs.insert(id, JobEntry { status: Arc::clone(&status), cancel: Arc::clone(&cancel) });
        }

        let observer = JobObserver { status, cancel };
        tokio::task::spawn_blocking(move || {
            let span = info_span!("calc_job", job_id = %id);
            let _enter = span.enter();
            let finished = run_job(&repo, request, &observer);
            // free the slot before pollers can see a terminal state
            drop(guard);
            *lock(&observer.status) = finished;
        });

        info!("Submitted calculation job {}", id);
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Result<JobStatus, JobError> {
        let jobs = lock(&self.jobs);
        let entry = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        let status = lock(&entry.status).clone();
        Ok(status)
    }

    /// Ask a job to stop; it finishes the company in hand first.
    pub fn cancel(&self, id: Uuid) -> Result<(), JobError> {
        let jobs = lock(&self.jobs);
        let entry = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        entry.cancel.store(true, Ordering::Relaxed);
        info!("Cancellation requested for job {}", id);
        Ok(())
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, id: Uuid, poll_interval: Duration) -> Result<JobStatus, JobError> {
        loop {
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Drop the oldest terminal entries until at most `keep` remain.
fn prune_finished(jobs: &mut HashMap<Uuid, JobEntry>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .iter()
        .filter_map(|(id, entry)| {
            let status = lock(&entry.status);
            status.state.is_terminal().then_some((status.started_at, *id))
        })
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    debug!("Pruned {} finished jobs", excess);
}

/// Run to completion and return the final status. The terminal state is
/// persisted here but published to pollers by the caller.
fn run_job(repo: &Repository, request: JobRequest, observer: &JobObserver) -> JobStatus {
    let snapshot = {
        let mut s = lock(&observer.status);
        s.state = JobState::Running;
        s.clone()
    };
    if let Err(e) = repo.begin_job(&snapshot) {
        warn!("Could not record job start: {:#}", e);
    }

    let result = SignalCalculator::new(repo).and_then(|calc| {
        calc.run(request.companies.as_deref(), &request.options, observer)
    });

    let mut finished = lock(&observer.status).clone();
    match &result {
        Ok(stats) => {
            finished.apply(stats);
            finished.state = if stats.cancelled { JobState::Cancelled } else { JobState::Completed };
        }
        Err(e) => {
            error!("Job failed: {:#}", e);
            finished.state = JobState::Failed;
            finished.error = Some(format!("{:#}", e));
        }
    }
    finished.finished_at = Some(Utc::now());

    let summary = match (&finished.error, finished.failed) {
        (Some(e), _) => Some(e.clone()),
        (None, 0) => None,
        (None, n) => Some(format!("{} companies failed", n)),
    };
    if let Err(e) = repo.finish_job(&finished, summary.as_deref()) {
        warn!("Could not record job end: {:#}", e);
    }
    info!(
        "Job {} {}: {}/{} processed, {} signals",
        finished.id,
        finished.state.as_str(),
        finished.processed,
        finished.total,
        finished.signals_generated
    );
    finished
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, FormulaKind, FormulaScope, NewFormula};
    use tokio_test::{assert_err, assert_ok};

    fn seeded() -> Repository {
        seeded_with(&["A", "B", "C"])
    }

    fn seeded_with(ids: &[&str]) -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        let companies: Vec<Company> = ids
            .iter()
            .map(|id| Company {
                id: id.to_string(),
                name: id.to_string(),
                sector_id: None,
                assigned_formula_id: None,
                signals_calculated_at: None,
            })
            .collect();
        repo.upsert_companies(&companies).unwrap();
        repo.insert_formula(&NewFormula {
            name: "always".into(),
            kind: FormulaKind::Expression,
            scope: FormulaScope::Global,
            scope_value: None,
            condition: "TRUE".into(),
            signal: "WATCH".into(),
            priority: 1,
            enabled: true,
            is_active_global: true,
        })
        .unwrap();
        repo
    }

    #[tokio::test]
    async fn submitted_job_completes_and_is_persisted() {
        let repo = seeded();
        let reader = repo.try_clone().unwrap();
        let manager = JobManager::new(repo);

        let request = JobRequest {
            companies: None,
            options: CalcOptions { incremental: false, ..CalcOptions::default() },
        };
        let id = assert_ok!(manager.submit(request));
        let status = assert_ok!(manager.wait(id, Duration::from_millis(5)).await);

        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.mode, RunMode::Full);
        assert_eq!(status.total, 3);
        assert_eq!(status.processed, 3);
        assert_eq!(status.signals_generated, 3);
        assert!(status.finished_at.is_some());
        assert!(!manager.is_running());

        let rows = reader.recent_jobs(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].signals_generated, 3);
        assert_eq!(reader.signal_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn second_submit_while_running_is_rejected() {
        let manager = JobManager::new(seeded());
        manager.running.store(true, Ordering::Release);
        let err = assert_err!(manager.submit(JobRequest::default()));
        assert!(matches!(err, JobError::AlreadyRunning));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_is_rejected_while_a_real_job_runs() {
        let ids: Vec<String> = (0..200).map(|i| format!("C{:03}", i)).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let manager = JobManager::new(seeded_with(&ids));

        let first = assert_ok!(manager.submit(JobRequest::default()));
        let status = Arc::clone(&lock(&manager.jobs)[&first].status);
        {
            // the job cannot start or report progress while this is held
            let held = lock(&status);
            assert!(!held.state.is_terminal());
            assert!(manager.is_running());
            let err = assert_err!(manager.submit(JobRequest::default()));
            assert!(matches!(err, JobError::AlreadyRunning));
        }

        let done = assert_ok!(manager.wait(first, Duration::from_millis(5)).await);
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.processed, 200);
        assert_eq!(lock(&manager.jobs).len(), 1);
    }

    #[tokio::test]
    async fn only_recent_finished_jobs_are_kept() {
        let manager = JobManager::new(seeded());
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = manager.submit(JobRequest::default()).unwrap();
            manager.wait(id, Duration::from_millis(5)).await.unwrap();
            ids.push(id);
        }

        let mut jobs = lock(&manager.jobs);
        prune_finished(&mut jobs, 2);
        assert_eq!(jobs.len(), 2);
        assert!(!jobs.contains_key(&ids[0]));
        assert!(jobs.contains_key(&ids[2]));

        let running = JobStatus { state: JobState::Running, ..JobStatus::new(RunMode::Full) };
        let running_id = running.id;
        jobs.insert(
            running_id,
            JobEntry { status: Arc::new(Mutex::new(running)), cancel: Arc::new(AtomicBool::new(false)) },
        );
        prune_finished(&mut jobs, 0);
        assert_eq!(jobs.keys().copied().collect::<Vec<_>>(), vec![running_id]);
    }

    #[tokio::test]
    async fn guard_is_released_for_the_next_job() {
        let manager = JobManager::new(seeded());
        let first = manager.submit(JobRequest::default()).unwrap();
        manager.wait(first, Duration::from_millis(5)).await.unwrap();

        let second = assert_ok!(manager.submit(JobRequest::default()));
        let status = manager.wait(second, Duration::from_millis(5)).await.unwrap();
        // incremental: nothing changed since the first run
        assert_eq!(status.skipped, 3);
        assert_eq!(status.signals_generated, 0);
    }

    #[tokio::test]
    async fn unknown_job_ids_are_reported() {
        let manager = JobManager::new(seeded());
        let id = Uuid::new_v4();
        assert!(matches!(manager.status(id), Err(JobError::NotFound(_))));
        assert!(matches!(manager.cancel(id), Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn job_cancelled_before_first_company_processes_nothing() {
        let manager = JobManager::new(seeded());
        let status = Arc::new(Mutex::new(JobStatus::new(RunMode::Full)));
        let observer = JobObserver {
            status: Arc::clone(&status),
            cancel: Arc::new(AtomicBool::new(true)),
        };
        let repo = lock(&manager.repo).try_clone().unwrap();

        let finished = run_job(&repo, JobRequest::default(), &observer);

        assert_eq!(finished.state, JobState::Cancelled);
        assert_eq!(finished.processed, 0);
        assert_eq!(lock(&status).state, JobState::Running);
    }
}
