//! Sandbox Runner abstraction
//!
//! A backend knows HOW to execute untrusted code in isolation. It never
//! judges output; the executor classifies what the backend reports.

use crate::error::SandboxError;
use crate::languages::LanguageProfile;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Hard ceiling on submitted source size.
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
/// Hard ceiling on stdin fed to one test case.
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
/// Compiler diagnostics kept verbatim up to this size.
pub const MAX_COMPILE_MESSAGE_BYTES: usize = 8 * 1024;

/// Range a caller-supplied per-case limit must fall within. Zero is never
/// accepted: Docker reads a zero memory limit as unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseLimitBounds {
    pub max_time_limit_ms: u64,
    pub max_memory_limit_mb: u64,
}

impl Default for CaseLimitBounds {
    fn default() -> Self {
        Self {
            max_time_limit_ms: 60_000,
            max_memory_limit_mb: 4096,
        }
    }
}

/// Resource caps for one compile or run step.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
}

impl ResourceLimits {
    /// Run limits for a test case: the case overrides, the profile defaults.
    pub fn for_case(
        profile: &LanguageProfile,
        time_limit_ms: Option<u64>,
        memory_limit_mb: Option<u64>,
    ) -> Self {
        Self {
            time_limit_ms: time_limit_ms.unwrap_or(profile.default_time_limit_ms),
            memory_limit_mb: memory_limit_mb.unwrap_or(profile.default_memory_limit_mb),
            cpu_limit: profile.cpu_limit,
        }
    }

    /// Compile limits for a profile.
    pub fn for_compile(profile: &LanguageProfile, memory_limit_mb: u64) -> Self {
        Self {
            time_limit_ms: profile.compile_time_limit_ms,
            memory_limit_mb,
            cpu_limit: profile.cpu_limit.max(1.0),
        }
    }
}

/// How a run step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i64),
    TimedOut,
    OomKilled,
}

/// Raw result of running the program against one stdin.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: RunStatus,
    pub elapsed_ms: u64,
    pub memory_kb: u64,
}

impl RunOutput {
    pub fn exited(stdout: impl Into<String>, code: i64, elapsed_ms: u64, memory_kb: u64) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: RunStatus::Exited(code),
            elapsed_ms,
            memory_kb,
        }
    }
}

/// Result of staging (and compiling, when the language needs it) a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutput {
    Success,
    Failed { message: String },
}

/// Per-job scratch area holding the staged source and compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
}

/// Isolated execution backend.
///
/// Implementations must never fall back to running code outside isolation:
/// if the isolated context cannot be created they return
/// [`SandboxError::Unavailable`].
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Cheap reachability check used by the availability gate.
    async fn ping(&self) -> Result<(), SandboxError>;

    async fn create_workspace(&self, tag: &str) -> Result<Workspace, SandboxError>;

    /// Write the source into the workspace and run the profile's compile
    /// command, if any.
    async fn compile(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        source_code: &str,
        limits: &ResourceLimits,
    ) -> Result<CompileOutput, SandboxError>;

    /// Run the compiled artifact once with `stdin`. The execution context is
    /// torn down before this returns.
    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        stdin: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutput, SandboxError>;

    async fn destroy_workspace(&self, workspace: &Workspace) -> Result<(), SandboxError>;
}

/// Workspace cleanup guard - guarantees the workspace is destroyed even if
/// the owning future is aborted or panics.
pub struct WorkspaceGuard {
    backend: Arc<dyn SandboxBackend>,
    workspace: Workspace,
    armed: bool,
}

impl WorkspaceGuard {
    pub fn new(backend: Arc<dyn SandboxBackend>, workspace: Workspace) -> Self {
        Self {
            backend,
            workspace,
            armed: true,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Destroy the workspace now and wait for it.
    pub async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.backend.destroy_workspace(&self.workspace).await {
            warn!(workspace = %self.workspace.id, error = %e, "Failed to destroy workspace");
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = self.backend.clone();
        let workspace = self.workspace.clone();

        // Cannot await in Drop; hand the cleanup to the runtime.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.destroy_workspace(&workspace).await {
                        warn!(workspace = %workspace.id, error = %e, "Failed to destroy workspace");
                    }
                });
            }
            Err(_) => {
                warn!(workspace = %workspace.id, "No runtime available to destroy workspace");
            }
        }
    }
}

/// Truncate `s` to at most `max` bytes on a char boundary.
pub fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Reject oversized payloads before they reach a backend.
pub fn check_input_sizes(source_code: &str, stdin: Option<&str>) -> Result<(), SandboxError> {
    if source_code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SandboxError::InputTooLarge {
            what: "source code",
            size: source_code.len(),
            limit: MAX_SOURCE_CODE_BYTES,
        });
    }
    if let Some(input) = stdin {
        if input.len() > MAX_TEST_INPUT_BYTES {
            return Err(SandboxError::InputTooLarge {
                what: "test input",
                size: input.len(),
                limit: MAX_TEST_INPUT_BYTES,
            });
        }
    }
    Ok(())
}
