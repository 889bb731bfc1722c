/// Execution Availability Gate
///
/// Tracks whether the sandbox backend can create isolated contexts and lets
/// the queue refuse work up front instead of failing mid-job.
///
/// **Rules:**
/// - Starts `Unknown` and fails closed until a probe succeeds
/// - `check()` trusts a probe younger than the TTL, otherwise probes again
/// - A background monitor refreshes on a fixed interval and logs transitions

use crate::error::{EngineError, Result};
use crate::metrics;
use crate::sandbox::SandboxBackend;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on a single backend probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Unknown,
    Available,
    Unavailable,
}

/// Point-in-time view of the gate, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl GateStatus {
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}

#[derive(Debug)]
struct GateState {
    availability: Availability,
    checked_at: Option<Instant>,
    checked_at_wall: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

pub struct AvailabilityGate {
    backend: Arc<dyn SandboxBackend>,
    ttl: Duration,
    state: RwLock<GateState>,
}

impl AvailabilityGate {
    pub fn new(backend: Arc<dyn SandboxBackend>, ttl: Duration) -> Self {
        metrics::SANDBOX_AVAILABLE.set(0);
        Self {
            backend,
            ttl,
            state: RwLock::new(GateState {
                availability: Availability::Unknown,
                checked_at: None,
                checked_at_wall: None,
                last_error: None,
                consecutive_failures: 0,
            }),
        }
    }

    /// Probe the backend now and record the result.
    pub async fn refresh(&self) -> bool {
        let probe = match tokio::time::timeout(PROBE_TIMEOUT, self.backend.ping()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("probe timed out after {:?}", PROBE_TIMEOUT)),
        };

        let mut state = self.state.write().await;
        let previous = state.availability;
        state.checked_at = Some(Instant::now());
        state.checked_at_wall = Some(Utc::now());

        match probe {
            Ok(()) => {
                state.availability = Availability::Available;
                state.last_error = None;
                state.consecutive_failures = 0;
                metrics::SANDBOX_AVAILABLE.set(1);
                if previous != Availability::Available {
                    info!(previous = ?previous, "Sandbox backend available");
                }
                true
            }
            Err(error) => {
                state.availability = Availability::Unavailable;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                metrics::SANDBOX_AVAILABLE.set(0);
                if previous != Availability::Unavailable {
                    warn!(previous = ?previous, error = %error, "Sandbox backend unavailable");
                } else {
                    debug!(
                        error = %error,
                        consecutive_failures = state.consecutive_failures,
                        "Sandbox backend still unavailable"
                    );
                }
                state.last_error = Some(error);
                false
            }
        }
    }

    /// Fail with `ExecutionUnavailable` unless the backend is known healthy.
    pub async fn check(&self) -> Result<()> {
        let fresh = {
            let state = self.state.read().await;
            state
                .checked_at
                .map(|at| at.elapsed() < self.ttl)
                .unwrap_or(false)
        };

        if !fresh {
            self.refresh().await;
        }

        let state = self.state.read().await;
        match state.availability {
            Availability::Available => Ok(()),
            Availability::Unavailable => Err(EngineError::ExecutionUnavailable(
                state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "sandbox backend unavailable".to_string()),
            )),
            Availability::Unknown => Err(EngineError::ExecutionUnavailable(
                "sandbox backend has not been probed".to_string(),
            )),
        }
    }

    pub async fn snapshot(&self) -> GateStatus {
        let state = self.state.read().await;
        GateStatus {
            availability: state.availability,
            last_checked: state.checked_at_wall,
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Refresh every `interval` until the returned handle is aborted.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                gate.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSandbox;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_starts_unknown() {
        let backend = FakeSandbox::shared();
        let gate = AvailabilityGate::new(backend.clone(), Duration::from_secs(60));

        let status = gate.snapshot().await;
        assert_eq!(status.availability, Availability::Unknown);
        assert!(!status.is_available());
        assert_eq!(backend.pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_probes_when_unknown() {
        let backend = FakeSandbox::shared();
        let gate = AvailabilityGate::new(backend.clone(), Duration::from_secs(60));

        gate.check().await.unwrap();
        assert_eq!(backend.pings.load(Ordering::SeqCst), 1);
        assert!(gate.snapshot().await.is_available());
    }

    #[tokio::test]
    async fn test_check_fails_closed() {
        let backend = FakeSandbox::shared();
        backend.set_available(false);
        let gate = AvailabilityGate::new(backend.clone(), Duration::from_secs(60));

        let err = gate.check().await.unwrap_err();
        assert!(matches!(err, EngineError::ExecutionUnavailable(_)));

        let status = gate.snapshot().await;
        assert_eq!(status.availability, Availability::Unavailable);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_cached_result_within_ttl() {
        let backend = FakeSandbox::shared();
        let gate = AvailabilityGate::new(backend.clone(), Duration::from_secs(60));

        gate.check().await.unwrap();
        gate.check().await.unwrap();
        gate.check().await.unwrap();
        assert_eq!(backend.pings.load(Ordering::SeqCst), 1);

        // The cached state wins until the next refresh.
        backend.set_available(false);
        assert!(gate.check().await.is_ok());
        assert!(!gate.refresh().await);
        assert!(gate.check().await.is_err());
    }

    #[tokio::test]
    async fn test_zero_ttl_probes_every_time() {
        let backend = FakeSandbox::shared();
        let gate = AvailabilityGate::new(backend.clone(), Duration::ZERO);

        gate.check().await.unwrap();
        gate.check().await.unwrap();
        assert_eq!(backend.pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recovery_resets_failures() {
        let backend = FakeSandbox::shared();
        backend.set_available(false);
        let gate = AvailabilityGate::new(backend.clone(), Duration::ZERO);

        assert!(!gate.refresh().await);
        assert!(!gate.refresh().await);
        assert_eq!(gate.snapshot().await.consecutive_failures, 2);

        backend.set_available(true);
        assert!(gate.refresh().await);
        let status = gate.snapshot().await;
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_monitor_refreshes_periodically() {
        let backend = FakeSandbox::shared();
        let gate = Arc::new(AvailabilityGate::new(backend.clone(), Duration::from_secs(60)));

        let monitor = gate.spawn_monitor(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.abort();

        assert!(backend.pings.load(Ordering::SeqCst) >= 2);
        assert!(gate.snapshot().await.is_available());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let status = GateStatus {
            availability: Availability::Unavailable,
            last_checked: None,
            last_error: Some("daemon down".to_string()),
            consecutive_failures: 3,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["availability"], "unavailable");
        assert_eq!(value["consecutiveFailures"], 3);
        assert!(value.get("lastChecked").is_none());
    }
}
