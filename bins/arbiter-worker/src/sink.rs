// Result sink that persists job records to Redis for the HTTP layer to poll

use anyhow::Context;
use arbiter_common::redis;
use arbiter_common::types::QueuedJob;
use arbiter_engine::ResultSink;
use async_trait::async_trait;
use tracing::debug;

pub struct RedisResultSink {
    conn: ::redis::aio::ConnectionManager,
    ttl_secs: u64,
}

impl RedisResultSink {
    pub fn new(conn: ::redis::aio::ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }
}

#[async_trait]
impl ResultSink for RedisResultSink {
    async fn record(&self, job: &QueuedJob) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        redis::store_job(&mut conn, job, self.ttl_secs)
            .await
            .with_context(|| format!("Failed to persist job {}", job.job_id))?;

        debug!(
            job_id = %job.job_id,
            submission_id = %job.submission_id,
            state = %job.state,
            "Job record persisted to Redis"
        );
        Ok(())
    }
}
