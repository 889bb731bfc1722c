//! Prometheus metrics for the judging engine

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Jobs accepted by the submission queue
    pub static ref JOBS_ENQUEUED: IntCounterVec = register_int_counter_vec!(
        "arbiter_jobs_enqueued_total",
        "Jobs accepted by the submission queue",
        &["language"]
    )
    .expect("Failed to register arbiter_jobs_enqueued_total");

    /// Submissions refused at enqueue time
    pub static ref JOBS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "arbiter_jobs_rejected_total",
        "Submissions refused before execution",
        &["reason"]
    )
    .expect("Failed to register arbiter_jobs_rejected_total");

    pub static ref VERDICTS: IntCounterVec = register_int_counter_vec!(
        "arbiter_verdicts_total",
        "Completed jobs by language and overall verdict",
        &["language", "verdict"]
    )
    .expect("Failed to register arbiter_verdicts_total");

    pub static ref JOB_FAILURES: IntCounterVec = register_int_counter_vec!(
        "arbiter_job_failures_total",
        "Jobs that ended in the failed state, by reason",
        &["reason"]
    )
    .expect("Failed to register arbiter_job_failures_total");

    /// Wall time from dispatch to terminal state
    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "arbiter_job_duration_seconds",
        "Time spent executing a job, compile included",
        &["language"],
        vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("Failed to register arbiter_job_duration_seconds");

    pub static ref JOBS_PENDING: IntGauge = register_int_gauge!(
        "arbiter_jobs_pending",
        "Jobs waiting for a worker slot"
    )
    .expect("Failed to register arbiter_jobs_pending");

    pub static ref JOBS_RUNNING: IntGauge = register_int_gauge!(
        "arbiter_jobs_running",
        "Jobs currently executing"
    )
    .expect("Failed to register arbiter_jobs_running");

    /// 1 when the last sandbox probe succeeded
    pub static ref SANDBOX_AVAILABLE: IntGauge = register_int_gauge!(
        "arbiter_sandbox_available",
        "Whether the sandbox backend answered the last probe"
    )
    .expect("Failed to register arbiter_sandbox_available");
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
