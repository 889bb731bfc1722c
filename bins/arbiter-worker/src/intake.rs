// Redis intake: submissions in, cancellations in, rejections out

use arbiter_common::redis;
use arbiter_common::types::{ExecutionSummary, QueuedJob, SubmissionEnvelope, TestCase};
use arbiter_engine::{EngineError, SubmissionQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Terminal record stored for a submission the queue refused.
pub fn rejection_record(envelope: &SubmissionEnvelope, err: &EngineError) -> QueuedJob {
    let cases = &envelope.request.test_cases;
    let max_score = TestCase::total_weight(cases);
    let summary = ExecutionSummary::not_executed(err.verdict(), cases.len(), max_score);

    // Sandbox and internal failures carry host details; callers get a fixed text.
    let message = match err {
        EngineError::ExecutionUnavailable(_) => "execution unavailable".to_string(),
        _ if err.is_client_error() => err.to_string(),
        _ => "internal error".to_string(),
    };
    QueuedJob::rejected(envelope.submission_id.clone(), message, summary)
}

/// Pull submissions off Redis and hand them to the queue until shutdown.
#[instrument(skip_all)]
pub async fn intake_loop(
    mut conn: ::redis::aio::ConnectionManager,
    queue: Arc<SubmissionQueue>,
    result_ttl_secs: u64,
    poll_timeout_secs: f64,
    shutdown: watch::Receiver<bool>,
) {
    info!(queue = redis::SUBMISSION_QUEUE, "Intake loop started");

    while !*shutdown.borrow() {
        // BLPOP with a short timeout so shutdown is observed between polls
        let envelope = match redis::pop_submission(&mut conn, poll_timeout_secs).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) if e.kind() == ::redis::ErrorKind::TypeError => {
                warn!(error = %e, "Dropping malformed submission payload");
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let submission_id = envelope.submission_id.clone();
        info!(
            submission_id = %submission_id,
            language = %envelope.request.language,
            test_cases = envelope.request.test_cases.len(),
            source_size = envelope.request.source_code.len(),
            "Received submission"
        );

        match queue.enqueue(submission_id.clone(), envelope.request.clone()).await {
            Ok(job_id) => {
                info!(submission_id = %submission_id, job_id = %job_id, "Submission queued");
            }
            Err(EngineError::QueueClosed) => {
                // Hand it back for another worker.
                if let Err(e) = redis::push_submission(&mut conn, &envelope).await {
                    error!(submission_id = %submission_id, error = %e, "Failed to requeue submission");
                }
                break;
            }
            Err(err) => {
                let record = rejection_record(&envelope, &err);
                if let Err(e) = redis::store_job(&mut conn, &record, result_ttl_secs).await {
                    // Non-fatal - intake continues
                    error!(submission_id = %submission_id, error = %e, "Failed to persist rejection");
                }
            }
        }
    }

    info!("Intake loop stopped");
}

/// Apply cancellation requests (submission ids) until shutdown.
#[instrument(skip_all)]
pub async fn cancel_loop(
    mut conn: ::redis::aio::ConnectionManager,
    queue: Arc<SubmissionQueue>,
    poll_timeout_secs: f64,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let submission_id = match redis::pop_cancel(&mut conn, poll_timeout_secs).await {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match queue.cancel_submission(&submission_id).await {
            Ok(job_id) => info!(submission_id = %submission_id, job_id = %job_id, "Cancellation applied"),
            Err(e) => warn!(submission_id = %submission_id, error = %e, "Cancellation ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::types::{ExecutionRequest, JobFailure, JobState, Verdict};

    fn envelope() -> SubmissionEnvelope {
        let mut weighted = TestCase::new("1", "1");
        weighted.points = Some(5);
        SubmissionEnvelope {
            submission_id: "sub-9".to_string(),
            request: ExecutionRequest {
                source_code: "x".to_string(),
                language: "brainfuck".to_string(),
                test_cases: vec![weighted, TestCase::new("2", "2")],
                problem_id: None,
            },
        }
    }

    #[test]
    fn test_unavailable_rejection_keeps_verdict() {
        let err = EngineError::ExecutionUnavailable(
            "Docker ping failed: error trying to connect: /var/run/docker.sock".into(),
        );
        let record = rejection_record(&envelope(), &err);
        assert_eq!(record.error.as_deref(), Some("execution unavailable"));
        assert!(!serde_json::to_string(&record).unwrap().contains("docker.sock"));

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failure, Some(JobFailure::Rejected));
        let summary = record.summary.unwrap();
        assert_eq!(summary.overall_result, Verdict::ExecutionUnavailable);
        assert_eq!(summary.total_tests, 2);
        assert_eq!(summary.max_score, 6);
        assert!(!summary.success);
    }

    #[test]
    fn test_unsupported_language_message_is_visible() {
        let err = EngineError::UnsupportedLanguage("brainfuck".into());
        let record = rejection_record(&envelope(), &err);
        assert!(record.error.unwrap().contains("brainfuck"));
    }

    #[test]
    fn test_internal_rejection_hides_detail() {
        let err = EngineError::Internal("bollard exploded at 0xdeadbeef".into());
        let record = rejection_record(&envelope(), &err);
        assert_eq!(record.error.as_deref(), Some("internal error"));
        assert_eq!(record.verdict(), Some(Verdict::InternalError));
    }
}
