use crate::types::{ExecutionSummary, QueuedJob, SubmissionEnvelope};
use redis::{AsyncCommands, RedisResult};

/// Redis key layout shared by the HTTP layer and the worker.
/// Submissions and cancellations travel on lists; status and results are
/// plain keys addressed by submission id.

pub const SUBMISSION_QUEUE: &str = "arbiter:queue:submissions";
pub const CANCEL_QUEUE: &str = "arbiter:queue:cancel";
pub const RESULT_PREFIX: &str = "arbiter:result";
pub const STATUS_PREFIX: &str = "arbiter:status";

/// Result key for a submission
pub fn result_key(submission_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, submission_id)
}

/// Status key for a submission
pub fn status_key(submission_id: &str) -> String {
    format!("{}:{}", STATUS_PREFIX, submission_id)
}

fn encode<T: serde::Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

/// Push a submission onto the intake queue (RPUSH for FIFO semantics)
pub async fn push_submission(
    conn: &mut redis::aio::ConnectionManager,
    envelope: &SubmissionEnvelope,
) -> RedisResult<()> {
    let payload = encode(envelope)?;
    conn.rpush(SUBMISSION_QUEUE, payload).await
}

/// Pop a submission from the intake queue.
/// BLPOP with timeout so the caller can observe shutdown.
pub async fn pop_submission(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<SubmissionEnvelope>> {
    let result: Option<(String, String)> = conn.blpop(SUBMISSION_QUEUE, timeout_seconds).await?;
    match result {
        Some((_key, payload)) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

/// Request cancellation of a submission
pub async fn push_cancel(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
) -> RedisResult<()> {
    conn.rpush(CANCEL_QUEUE, submission_id).await
}

pub async fn pop_cancel(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<String>> {
    let result: Option<(String, String)> = conn.blpop(CANCEL_QUEUE, timeout_seconds).await?;
    Ok(result.map(|(_key, submission_id)| submission_id))
}

/// Store the status record of a job, and its summary once terminal.
pub async fn store_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &QueuedJob,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = encode(job)?;
    let _: () = conn
        .set_ex(status_key(&job.submission_id), payload, ttl_seconds)
        .await?;

    if let Some(summary) = job.summary.as_ref().filter(|_| job.state.is_terminal()) {
        store_result(conn, &job.submission_id, summary, ttl_seconds).await?;
    }
    Ok(())
}

/// Store the execution summary of a submission
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
    summary: &ExecutionSummary,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = encode(summary)?;
    conn.set_ex(result_key(submission_id), payload, ttl_seconds).await
}

/// Retrieve the execution summary of a submission
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
) -> RedisResult<Option<ExecutionSummary>> {
    let payload: Option<String> = conn.get(result_key(submission_id)).await?;
    payload.as_deref().map(decode).transpose()
}

/// Retrieve the last status record of a submission
pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
) -> RedisResult<Option<QueuedJob>> {
    let payload: Option<String> = conn.get(status_key(submission_id)).await?;
    payload.as_deref().map(decode).transpose()
}
