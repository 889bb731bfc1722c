/// Submission Queue - owns job lifecycle and bounded concurrency
///
/// **State Machine:**
/// PENDING → RUNNING → COMPLETED | FAILED, and PENDING → FAILED on cancel.
/// No automatic retries.
///
/// **Dispatch:**
/// - `enqueue` validates, consults the availability gate, stores the job
///   and pushes its id onto an unbounded FIFO channel
/// - One dispatcher task takes ids in order, waits for a worker slot
///   (semaphore permit) and claims the job under the job-table lock;
///   only a Pending job can be claimed, so a job never runs twice
/// - Jobs beyond the pool size stay Pending
///
/// **Gate:**
/// The availability gate is consulted at enqueue and again when a worker
/// slot picks the job up; an unavailable backend fails the job as
/// FAILED/EXECUTION_UNAVAILABLE without touching the sandbox.
///
/// **Supervision (per job):**
/// The execution runs in its own task raced against cancellation and the
/// job ceiling. Panics become FAILED/INTERNAL_ERROR; the ceiling aborts
/// the task and marks FAILED/TIME_LIMIT_EXCEEDED. Aborting drops the
/// executor future, whose guards tear down containers and the workspace.
/// The worker slot is released once the terminal state is recorded.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::TestCaseExecutor;
use crate::gate::AvailabilityGate;
use crate::languages::LanguageProfile;
use crate::metrics;
use crate::sink::ResultSink;
use arbiter_common::types::{
    ExecutionRequest, ExecutionSummary, JobFailure, JobState, QueuedJob, TestCase, Verdict,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queue tuning, usually derived from `EngineConfig`.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub pool_size: usize,
    pub job_overhead_ms: u64,
    pub per_case_overhead_ms: u64,
    pub max_job_ceiling_ms: u64,
    pub result_retention: Duration,
}

impl From<&EngineConfig> for QueueConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            pool_size: config.worker_pool_size.max(1),
            job_overhead_ms: config.job_overhead_ms,
            per_case_overhead_ms: config.per_case_overhead_ms,
            max_job_ceiling_ms: config.max_job_ceiling_ms,
            result_retention: config.result_retention(),
        }
    }
}

/// Wall-clock budget for a whole job.
///
/// Compile limit, every case's time limit, a fixed overhead and a
/// container start allowance per case, capped by `max_job_ceiling_ms`.
pub fn job_ceiling(
    profile: &LanguageProfile,
    cases: &[TestCase],
    config: &QueueConfig,
) -> Duration {
    let case_limits = cases
        .iter()
        .map(|c| c.time_limit_ms.unwrap_or(profile.default_time_limit_ms))
        .fold(0u64, u64::saturating_add);
    let start_allowance = config
        .per_case_overhead_ms
        .saturating_mul(cases.len() as u64);

    let total = profile
        .compile_time_limit_ms
        .saturating_add(case_limits)
        .saturating_add(config.job_overhead_ms)
        .saturating_add(start_allowance);

    Duration::from_millis(total.min(config.max_job_ceiling_ms))
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub pool_size: usize,
}

impl QueueStats {
    pub fn in_flight(&self) -> usize {
        self.pending + self.running
    }
}

/// What the dispatcher hands to a job task.
type Claimed = (ExecutionRequest, oneshot::Receiver<()>, QueuedJob);

struct JobEntry {
    job: QueuedJob,
    cancel: Option<oneshot::Sender<()>>,
}

/// How a supervised execution ended.
enum Finish {
    Completed(ExecutionSummary),
    Errored(EngineError),
    Panicked(String),
    Cancelled,
    CeilingExceeded(Duration),
}

struct Inner {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
    executor: TestCaseExecutor,
    gate: Arc<AvailabilityGate>,
    sink: Arc<dyn ResultSink>,
    config: QueueConfig,
}

pub struct SubmissionQueue {
    inner: Arc<Inner>,
    dispatcher: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl SubmissionQueue {
    /// Start the dispatcher and retention reaper. Must be called inside a
    /// tokio runtime.
    pub fn start(
        executor: TestCaseExecutor,
        gate: Arc<AvailabilityGate>,
        sink: Arc<dyn ResultSink>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.pool_size.max(1)));

        let inner = Arc::new(Inner {
            jobs: Mutex::new(HashMap::new()),
            sender: Mutex::new(Some(tx)),
            executor,
            gate,
            sink,
            config,
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), rx, semaphore));
        let reaper = tokio::spawn(reap_loop(inner.clone()));

        info!(pool_size = inner.config.pool_size, "Submission queue started");

        Arc::new(Self {
            inner,
            dispatcher,
            reaper,
        })
    }

    /// Accept a submission for execution.
    ///
    /// Fails fast, without touching the sandbox, when the language is
    /// unknown, the payload is invalid or the backend is unavailable.
    pub async fn enqueue(
        &self,
        submission_id: impl Into<String>,
        request: ExecutionRequest,
    ) -> Result<Uuid> {
        let submission_id = submission_id.into();
        match self.try_enqueue(submission_id.clone(), request).await {
            Ok(job_id) => Ok(job_id),
            Err(err) => {
                metrics::JOBS_REJECTED.with_label_values(&[err.kind()]).inc();
                warn!(submission_id = %submission_id, reason = err.kind(), error = %err, "Submission rejected");
                Err(err)
            }
        }
    }

    async fn try_enqueue(&self, submission_id: String, request: ExecutionRequest) -> Result<Uuid> {
        if self.inner.sender.lock().await.is_none() {
            return Err(EngineError::QueueClosed);
        }

        let profile = self.inner.executor.registry().resolve(&request.language)?;
        self.inner.executor.validate(&request)?;
        self.inner.gate.check().await?;

        let job = QueuedJob::new(submission_id, request);
        let job_id = job.job_id;
        let snapshot = job.clone();

        self.inner.jobs.lock().await.insert(
            job_id,
            JobEntry {
                job,
                cancel: None,
            },
        );
        metrics::JOBS_PENDING.inc();
        metrics::JOBS_ENQUEUED
            .with_label_values(&[profile.id.as_str()])
            .inc();
        self.inner.publish(&snapshot).await;

        // Published before dispatch so the sink sees PENDING first.
        let sent = match self.inner.sender.lock().await.as_ref() {
            Some(tx) => tx.send(job_id).is_ok(),
            None => false,
        };
        if !sent {
            if self.inner.jobs.lock().await.remove(&job_id).is_some() {
                metrics::JOBS_PENDING.dec();
            }
            return Err(EngineError::QueueClosed);
        }

        info!(
            job_id = %job_id,
            submission_id = %snapshot.submission_id,
            language = %profile.id,
            test_count = snapshot.request.test_cases.len(),
            "Job enqueued"
        );
        Ok(job_id)
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<QueuedJob> {
        self.inner
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Latest job for a submission id.
    pub async fn find_by_submission(&self, submission_id: &str) -> Option<QueuedJob> {
        self.inner
            .jobs
            .lock()
            .await
            .values()
            .filter(|entry| entry.job.submission_id == submission_id)
            .max_by_key(|entry| entry.job.enqueued_at)
            .map(|entry| entry.job.clone())
    }

    /// Cancel a job.
    ///
    /// A pending job fails immediately. A running job has its execution
    /// aborted; it reaches FAILED/CANCELLED once teardown is under way.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let snapshot = {
            let mut jobs = self.inner.jobs.lock().await;
            let entry = jobs.get_mut(&job_id).ok_or(EngineError::JobNotFound(job_id))?;

            match entry.job.state {
                JobState::Pending => {
                    entry
                        .job
                        .transition(JobState::Failed)
                        .map_err(|e| EngineError::Internal(e.to_string()))?;
                    entry.job.failure = Some(JobFailure::Cancelled);
                    entry.job.clone()
                }
                JobState::Running => {
                    if let Some(tx) = entry.cancel.take() {
                        let _ = tx.send(());
                        info!(job_id = %job_id, "Cancellation requested for running job");
                    }
                    return Ok(());
                }
                JobState::Completed | JobState::Failed => {
                    return Err(EngineError::AlreadyFinished(job_id));
                }
            }
        };

        metrics::JOBS_PENDING.dec();
        metrics::JOB_FAILURES
            .with_label_values(&[failure_label(JobFailure::Cancelled)])
            .inc();
        info!(job_id = %job_id, submission_id = %snapshot.submission_id, "Pending job cancelled");
        self.inner.publish(&snapshot).await;
        Ok(())
    }

    /// Cancel the latest job of a submission.
    pub async fn cancel_submission(&self, submission_id: &str) -> Result<Uuid> {
        let job = self.find_by_submission(submission_id).await.ok_or_else(|| {
            EngineError::InvalidRequest(format!("unknown submission {}", submission_id))
        })?;
        self.cancel(job.job_id).await?;
        Ok(job.job_id)
    }

    pub async fn stats(&self) -> QueueStats {
        let jobs = self.inner.jobs.lock().await;
        let mut stats = QueueStats {
            pool_size: self.inner.config.pool_size,
            ..Default::default()
        };
        for entry in jobs.values() {
            match entry.job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop terminal jobs that finished longer than `retention` ago.
    pub async fn purge_finished(&self, retention: Duration) -> usize {
        self.inner.purge_finished(retention).await
    }

    /// Stop accepting submissions. Jobs already queued still run.
    pub async fn close(&self) {
        if self.inner.sender.lock().await.take().is_some() {
            info!("Submission queue closed to new work");
        }
    }

    /// Wait until nothing is pending or running. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let stats = self.stats().await;
            if stats.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    pending = stats.pending,
                    running = stats.running,
                    "Drain timed out with jobs in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.reaper.abort();
    }
}

impl Inner {
    async fn publish(&self, job: &QueuedJob) {
        if let Err(e) = self.sink.record(job).await {
            warn!(
                job_id = %job.job_id,
                submission_id = %job.submission_id,
                state = %job.state,
                error = %e,
                "Result sink failed to record transition"
            );
        }
    }

    /// PENDING → RUNNING under the table lock. `None` when the job is gone
    /// or no longer pending (cancelled while waiting).
    async fn claim(&self, job_id: Uuid) -> Option<Claimed> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(&job_id)?;
        if entry.job.state != JobState::Pending {
            debug!(job_id = %job_id, state = %entry.job.state, "Skipping job that is no longer pending");
            return None;
        }
        if let Err(e) = entry.job.transition(JobState::Running) {
            error!(job_id = %job_id, error = %e, "Failed to claim job");
            return None;
        }

        let (tx, rx) = oneshot::channel();
        entry.cancel = Some(tx);
        metrics::JOBS_PENDING.dec();
        metrics::JOBS_RUNNING.inc();
        Some((entry.job.request.clone(), rx, entry.job.clone()))
    }

    async fn run_job(
        self: Arc<Self>,
        job_id: Uuid,
        request: ExecutionRequest,
        mut cancel_rx: oneshot::Receiver<()>,
        snapshot: QueuedJob,
        permit: OwnedSemaphorePermit,
    ) {
        let started = Instant::now();
        self.publish(&snapshot).await;

        let language = request.language.clone();

        // The backend may have gone away while the job waited for a slot.
        if let Err(err) = self.gate.check().await {
            self.finish(job_id, &language, Finish::Errored(err)).await;
            drop(permit);
            return;
        }

        let ceiling = match self.executor.registry().resolve(&language) {
            Ok(profile) => job_ceiling(&profile, &request.test_cases, &self.config),
            Err(_) => Duration::from_millis(self.config.max_job_ceiling_ms),
        };

        info!(
            job_id = %job_id,
            submission_id = %snapshot.submission_id,
            language = %language,
            ceiling_ms = ceiling.as_millis() as u64,
            "Job started"
        );

        let executor = self.executor.clone();
        let tag = job_id.to_string();
        let mut handle = tokio::spawn(async move { executor.execute(&request, &tag).await });

        let finish = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(summary)) => Finish::Completed(summary),
                Ok(Err(err)) => Finish::Errored(err),
                Err(join_err) => Finish::Panicked(join_err.to_string()),
            },
            Ok(()) = &mut cancel_rx => {
                handle.abort();
                Finish::Cancelled
            }
            _ = tokio::time::sleep(ceiling) => {
                handle.abort();
                Finish::CeilingExceeded(ceiling)
            }
        };

        metrics::JOB_DURATION
            .with_label_values(&[language.as_str()])
            .observe(started.elapsed().as_secs_f64());
        self.finish(job_id, &language, finish).await;
        drop(permit);
    }

    async fn finish(&self, job_id: Uuid, language: &str, finish: Finish) {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(&job_id) else {
                error!(job_id = %job_id, "Finished job missing from job table");
                metrics::JOBS_RUNNING.dec();
                return;
            };
            entry.cancel = None;
            let total = entry.job.request.test_cases.len();
            let max_score = TestCase::total_weight(&entry.job.request.test_cases);
            let job = &mut entry.job;

            let (state, failure, summary) = match finish {
                Finish::Completed(summary) => (JobState::Completed, None, Some(summary)),
                Finish::Errored(EngineError::ExecutionUnavailable(msg)) => {
                    warn!(job_id = %job_id, error = %msg, "Sandbox unavailable for job");
                    (
                        JobState::Failed,
                        Some(JobFailure::ExecutionUnavailable),
                        Some(ExecutionSummary::not_executed(
                            Verdict::ExecutionUnavailable,
                            total,
                            max_score,
                        )),
                    )
                }
                Finish::Errored(err) => {
                    error!(
                        job_id = %job_id,
                        submission_id = %job.submission_id,
                        error = %err,
                        "Job execution failed"
                    );
                    internal_failure(total, max_score)
                }
                Finish::Panicked(msg) => {
                    error!(
                        job_id = %job_id,
                        submission_id = %job.submission_id,
                        error = %msg,
                        "Job execution panicked"
                    );
                    internal_failure(total, max_score)
                }
                Finish::Cancelled => {
                    info!(job_id = %job_id, "Running job cancelled");
                    (JobState::Failed, Some(JobFailure::Cancelled), None)
                }
                Finish::CeilingExceeded(ceiling) => {
                    warn!(
                        job_id = %job_id,
                        ceiling_ms = ceiling.as_millis() as u64,
                        "Job exceeded its wall-clock ceiling"
                    );
                    (
                        JobState::Failed,
                        Some(JobFailure::TimeLimitExceeded),
                        Some(ExecutionSummary::not_executed(
                            Verdict::TimeLimitExceeded,
                            total,
                            max_score,
                        )),
                    )
                }
            };

            if let Err(e) = job.transition(state) {
                error!(job_id = %job_id, error = %e, "Rejected terminal transition");
                metrics::JOBS_RUNNING.dec();
                return;
            }
            job.failure = failure;
            job.summary = summary;
            job.clone()
        };

        metrics::JOBS_RUNNING.dec();
        match (snapshot.failure, snapshot.verdict()) {
            (Some(failure), _) => metrics::JOB_FAILURES
                .with_label_values(&[failure_label(failure)])
                .inc(),
            (None, Some(verdict)) => metrics::VERDICTS
                .with_label_values(&[language, verdict.as_str()])
                .inc(),
            (None, None) => {}
        }

        info!(
            job_id = %job_id,
            submission_id = %snapshot.submission_id,
            state = %snapshot.state,
            verdict = snapshot.verdict().map(|v| v.as_str()).unwrap_or("-"),
            "Job finished"
        );
        self.publish(&snapshot).await;
    }

    async fn purge_finished(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let expired = entry.job.state.is_terminal()
                && entry
                    .job
                    .finished_at
                    .and_then(|at| (now - at).to_std().ok())
                    .map(|age| age >= retention)
                    .unwrap_or(false);
            !expired
        });
        let purged = before - jobs.len();
        if purged > 0 {
            debug!(purged, remaining = jobs.len(), "Purged finished jobs");
        }
        purged
    }
}

fn internal_failure(
    total: usize,
    max_score: u32,
) -> (JobState, Option<JobFailure>, Option<ExecutionSummary>) {
    (
        JobState::Failed,
        Some(JobFailure::InternalError),
        Some(ExecutionSummary::not_executed(
            Verdict::InternalError,
            total,
            max_score,
        )),
    )
}

fn failure_label(failure: JobFailure) -> &'static str {
    match failure {
        JobFailure::Cancelled => "cancelled",
        JobFailure::InternalError => "internal_error",
        JobFailure::TimeLimitExceeded => "time_limit_exceeded",
        JobFailure::ExecutionUnavailable => "execution_unavailable",
        JobFailure::Rejected => "rejected",
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    semaphore: Arc<Semaphore>,
) {
    while let Some(job_id) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let Some((request, cancel_rx, snapshot)) = inner.claim(job_id).await else {
            continue;
        };

        tokio::spawn(inner.clone().run_job(job_id, request, cancel_rx, snapshot, permit));
    }
    debug!("Dispatcher stopped");
}

async fn reap_loop(inner: Arc<Inner>) {
    let retention = inner.config.result_retention;
    let period = (retention / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        inner.purge_finished(retention).await;
    }
}
