// Worker service configuration (Redis, HTTP, shutdown)

use arbiter_common::config::{parse_or, process_env, string_opt};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Port serving `/health` and `/metrics`.
    pub metrics_port: u16,
    /// TTL of status and result keys, in seconds.
    pub result_ttl_secs: u64,
    /// How long shutdown waits for in-flight jobs, in seconds.
    pub drain_timeout_secs: u64,
    /// BLPOP timeout between shutdown checks, in seconds.
    pub poll_timeout_secs: f64,
    pub json_logs: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            metrics_port: 9091,
            result_ttl_secs: 86_400,
            drain_timeout_secs: 60,
            poll_timeout_secs: 2.0,
            json_logs: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            redis_url: string_opt(&lookup, "REDIS_URL").unwrap_or(d.redis_url),
            metrics_port: parse_or(&lookup, "ARBITER_METRICS_PORT", d.metrics_port),
            result_ttl_secs: parse_or(&lookup, "ARBITER_RESULT_TTL_SECS", d.result_ttl_secs)
                .max(1),
            drain_timeout_secs: parse_or(
                &lookup,
                "ARBITER_DRAIN_TIMEOUT_SECS",
                d.drain_timeout_secs,
            ),
            poll_timeout_secs: parse_or(&lookup, "ARBITER_POLL_TIMEOUT_SECS", d.poll_timeout_secs),
            json_logs: string_opt(&lookup, "LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(d.json_logs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(|_| None);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.result_ttl_secs, 86_400);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(|key| match key {
            "REDIS_URL" => Some("redis://redis:6379".to_string()),
            "ARBITER_METRICS_PORT" => Some("9200".to_string()),
            "ARBITER_RESULT_TTL_SECS" => Some("0".to_string()),
            "LOG_FORMAT" => Some("JSON".to_string()),
            _ => None,
        });
        assert_eq!(config.redis_url, "redis://redis:6379");
        assert_eq!(config.metrics_port, 9200);
        assert_eq!(config.result_ttl_secs, 1);
        assert!(config.json_logs);
    }
}
