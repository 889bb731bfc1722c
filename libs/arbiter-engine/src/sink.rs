// Result sink: where job transitions are published

use arbiter_common::types::{JobState, QueuedJob};
use async_trait::async_trait;
use tracing::info;

/// Receives every job transition.
///
/// Called from the queue after each state change with a snapshot of the
/// job. Errors are logged by the caller and never affect the job.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, job: &QueuedJob) -> anyhow::Result<()>;
}

/// Sink that only logs transitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn record(&self, job: &QueuedJob) -> anyhow::Result<()> {
        match job.state {
            JobState::Completed => info!(
                job_id = %job.job_id,
                submission_id = %job.submission_id,
                verdict = job.verdict().map(|v| v.as_str()).unwrap_or("-"),
                "Job completed"
            ),
            JobState::Failed => info!(
                job_id = %job.job_id,
                submission_id = %job.submission_id,
                failure = ?job.failure,
                "Job failed"
            ),
            state => info!(
                job_id = %job.job_id,
                submission_id = %job.submission_id,
                state = %state,
                "Job transition"
            ),
        }
        Ok(())
    }
}
