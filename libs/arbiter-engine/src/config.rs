// Engine configuration loaded from environment variables

use crate::sandbox::CaseLimitBounds;
use arbiter_common::config::{flag_or, parse_or, process_env, string_opt};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the Docker sandbox backend.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker endpoint (`unix://...`, `tcp://...`). Local defaults when unset.
    pub docker_host: Option<String>,
    /// Per-request timeout for Docker API calls, in seconds.
    pub docker_timeout_secs: u64,
    /// Pull missing base images on demand.
    pub pull_images: bool,
    /// Process/thread ceiling per container.
    pub max_processes: i64,
    /// Largest file a program may write, in bytes.
    pub max_file_size_bytes: i64,
    /// Captured stdout/stderr ceiling per stream, in bytes.
    pub max_output_bytes: usize,
    /// Memory granted to compile containers, in MB.
    pub compile_memory_mb: u64,
    /// Size of the `/tmp` scratch tmpfs, in MB.
    pub scratch_size_mb: u64,
    /// User run containers execute as.
    pub run_user: String,
    /// Largest per-case time limit a request may ask for, in milliseconds.
    pub max_case_time_limit_ms: u64,
    /// Largest per-case memory limit a request may ask for, in MB.
    pub max_case_memory_mb: u64,
}

impl SandboxConfig {
    pub fn case_bounds(&self) -> CaseLimitBounds {
        CaseLimitBounds {
            max_time_limit_ms: self.max_case_time_limit_ms,
            max_memory_limit_mb: self.max_case_memory_mb,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            docker_timeout_secs: 120,
            pull_images: true,
            max_processes: 64,
            max_file_size_bytes: 16 * 1024 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
            compile_memory_mb: 1024,
            scratch_size_mb: 64,
            run_user: "65534:65534".to_string(),
            max_case_time_limit_ms: CaseLimitBounds::default().max_time_limit_ms,
            max_case_memory_mb: CaseLimitBounds::default().max_memory_limit_mb,
        }
    }
}

/// Settings for the submission queue and the surrounding engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of jobs allowed to execute at the same time.
    pub worker_pool_size: usize,
    /// Fixed margin added to every job ceiling, in milliseconds.
    pub job_overhead_ms: u64,
    /// Container start allowance added per test case, in milliseconds.
    pub per_case_overhead_ms: u64,
    /// Upper bound for any job ceiling, in milliseconds.
    pub max_job_ceiling_ms: u64,
    /// Interval between availability probes, in seconds.
    pub health_check_interval_secs: u64,
    /// How long a probe result is trusted by `enqueue`, in milliseconds.
    pub health_ttl_ms: u64,
    /// How long terminal jobs stay queryable in memory, in seconds.
    pub result_retention_secs: u64,
    /// Optional languages JSON file merged over the built-in profiles.
    pub languages_file: Option<PathBuf>,
    pub sandbox: SandboxConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            job_overhead_ms: 10_000,
            per_case_overhead_ms: 2_000,
            max_job_ceiling_ms: 600_000,
            health_check_interval_secs: 10,
            health_ttl_ms: 5_000,
            result_retention_secs: 3_600,
            languages_file: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let sd = SandboxConfig::default();

        Self {
            worker_pool_size: parse_or(&lookup, "ARBITER_WORKER_POOL_SIZE", d.worker_pool_size)
                .max(1),
            job_overhead_ms: parse_or(&lookup, "ARBITER_JOB_OVERHEAD_MS", d.job_overhead_ms),
            per_case_overhead_ms: parse_or(
                &lookup,
                "ARBITER_PER_CASE_OVERHEAD_MS",
                d.per_case_overhead_ms,
            ),
            max_job_ceiling_ms: parse_or(&lookup, "ARBITER_MAX_JOB_CEILING_MS", d.max_job_ceiling_ms),
            health_check_interval_secs: parse_or(
                &lookup,
                "ARBITER_HEALTH_CHECK_INTERVAL_SECS",
                d.health_check_interval_secs,
            )
            .max(1),
            health_ttl_ms: parse_or(&lookup, "ARBITER_HEALTH_TTL_MS", d.health_ttl_ms),
            result_retention_secs: parse_or(
                &lookup,
                "ARBITER_RESULT_RETENTION_SECS",
                d.result_retention_secs,
            ),
            languages_file: string_opt(&lookup, "ARBITER_LANGUAGES_FILE").map(PathBuf::from),
            sandbox: SandboxConfig {
                docker_host: string_opt(&lookup, "DOCKER_HOST"),
                docker_timeout_secs: parse_or(
                    &lookup,
                    "ARBITER_DOCKER_TIMEOUT_SECS",
                    sd.docker_timeout_secs,
                ),
                pull_images: flag_or(&lookup, "ARBITER_PULL_IMAGES", sd.pull_images),
                max_processes: parse_or(&lookup, "ARBITER_MAX_PROCESSES", sd.max_processes),
                max_file_size_bytes: parse_or(
                    &lookup,
                    "ARBITER_MAX_FILE_SIZE_BYTES",
                    sd.max_file_size_bytes,
                ),
                max_output_bytes: parse_or(&lookup, "ARBITER_MAX_OUTPUT_BYTES", sd.max_output_bytes),
                compile_memory_mb: parse_or(
                    &lookup,
                    "ARBITER_COMPILE_MEMORY_MB",
                    sd.compile_memory_mb,
                ),
                scratch_size_mb: parse_or(&lookup, "ARBITER_SCRATCH_SIZE_MB", sd.scratch_size_mb),
                run_user: string_opt(&lookup, "ARBITER_RUN_USER").unwrap_or(sd.run_user),
                max_case_time_limit_ms: parse_or(
                    &lookup,
                    "ARBITER_MAX_CASE_TIME_LIMIT_MS",
                    sd.max_case_time_limit_ms,
                )
                .max(1),
                max_case_memory_mb: parse_or(
                    &lookup,
                    "ARBITER_MAX_CASE_MEMORY_MB",
                    sd.max_case_memory_mb,
                )
                .max(1),
            },
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_millis(self.health_ttl_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }
}
