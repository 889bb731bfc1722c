pub mod comparator;
pub mod config;
pub mod docker;
pub mod error;
pub mod executor;
pub mod gate;
pub mod languages;
pub mod metrics;
pub mod queue;
pub mod sandbox;
pub mod sink;

#[cfg(test)]
mod docker_tests;
#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, SandboxConfig};
pub use docker::DockerSandbox;
pub use error::{EngineError, SandboxError};
pub use executor::TestCaseExecutor;
pub use gate::{AvailabilityGate, GateStatus};
pub use languages::{LanguageProfile, LanguageRegistry};
pub use queue::{QueueConfig, QueueStats, SubmissionQueue};
pub use sandbox::{CaseLimitBounds, SandboxBackend};
pub use sink::{LogSink, ResultSink};
