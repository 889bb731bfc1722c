/// Test Case Executor - compile once, run every case, aggregate
///
/// **Responsibility:**
/// Drive a sandbox backend through one submission and turn what it reports
/// into an `ExecutionSummary`.
///
/// **Flow:**
/// 1. Resolve the language profile (unknown language is rejected here)
/// 2. Create a workspace and compile the source once
/// 3. Run every test case in order against the compiled artifact;
///    a failing case never aborts the remaining cases
/// 4. Classify each run (TLE / MLE / RE / comparator) and aggregate
///
/// **Aggregation Rules:**
/// - ACCEPTED iff every case passed
/// - otherwise the first timeout/runtime/memory error in case order
/// - otherwise WRONG_ANSWER
/// - averages are taken over completed cases only
///
/// Sandbox unavailability propagates as `EngineError::ExecutionUnavailable`;
/// it is never folded into a per-case outcome.

use crate::comparator;
use crate::error::{EngineError, Result};
use crate::languages::{LanguageProfile, LanguageRegistry};
use crate::sandbox::{
    check_input_sizes, truncate_utf8, CaseLimitBounds, CompileOutput, ResourceLimits, RunOutput,
    RunStatus, SandboxBackend, Workspace, WorkspaceGuard, MAX_COMPILE_MESSAGE_BYTES,
};
use arbiter_common::types::{
    CaseError, ExecutionOutcome, ExecutionRequest, ExecutionSummary, TestCase, Verdict,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Stderr kept per outcome for display.
const MAX_STDERR_BYTES: usize = 4 * 1024;
/// Largest weight a single test case may carry.
pub const MAX_CASE_POINTS: u32 = 1_000_000;

/// Runs submissions against a sandbox backend.
#[derive(Clone)]
pub struct TestCaseExecutor {
    backend: Arc<dyn SandboxBackend>,
    registry: Arc<LanguageRegistry>,
    compile_memory_mb: u64,
    bounds: CaseLimitBounds,
}

impl TestCaseExecutor {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        registry: Arc<LanguageRegistry>,
        compile_memory_mb: u64,
    ) -> Self {
        Self {
            backend,
            registry,
            compile_memory_mb,
            bounds: CaseLimitBounds::default(),
        }
    }

    /// Replace the accepted range for per-case limits.
    pub fn with_case_bounds(mut self, bounds: CaseLimitBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Check a request against this executor's limits without running it.
    pub fn validate(&self, request: &ExecutionRequest) -> Result<()> {
        validate_request(request, &self.bounds)
    }

    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Execute one submission end to end.
    ///
    /// `tag` names the workspace, usually the job id.
    #[instrument(skip(self, request), fields(language = %request.language, test_count = request.test_cases.len()))]
    pub async fn execute(&self, request: &ExecutionRequest, tag: &str) -> Result<ExecutionSummary> {
        let profile = self.registry.resolve(&request.language)?;
        self.validate(request)?;

        let workspace = self.backend.create_workspace(tag).await?;
        let guard = WorkspaceGuard::new(self.backend.clone(), workspace);

        let result = self
            .execute_in_workspace(guard.workspace(), &profile, request)
            .await;

        guard.release().await;
        result
    }

    async fn execute_in_workspace(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
    ) -> Result<ExecutionSummary> {
        let compile_limits = ResourceLimits::for_compile(profile, self.compile_memory_mb);
        let compiled = self
            .backend
            .compile(workspace, profile, &request.source_code, &compile_limits)
            .await?;

        if let CompileOutput::Failed { mut message } = compiled {
            truncate_utf8(&mut message, MAX_COMPILE_MESSAGE_BYTES);
            warn!(
                language = %profile.id,
                error_preview = message.lines().next().unwrap_or(""),
                "Compilation failed; no test case will run"
            );
            return Ok(compilation_failed(&request.test_cases, message));
        }

        let total = request.test_cases.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, case) in request.test_cases.iter().enumerate() {
            let limits = ResourceLimits::for_case(profile, case.time_limit_ms, case.memory_limit_mb);
            let output = self
                .backend
                .run(workspace, profile, &case.input, &limits)
                .await?;

            let outcome = evaluate_case(case, output);
            debug!(
                test_number = index + 1,
                total_tests = total,
                passed = outcome.passed,
                error_kind = ?outcome.error_kind,
                execution_time_ms = outcome.execution_time_ms,
                memory_used_kb = outcome.memory_used_kb,
                "Test case finished"
            );
            outcomes.push(outcome);
        }

        let summary = summarize(&request.test_cases, outcomes);
        info!(
            verdict = %summary.overall_result,
            passed = summary.passed_tests,
            total = summary.total_tests,
            score = summary.score,
            max_score = summary.max_score,
            "Execution complete"
        );
        Ok(summary)
    }
}

/// Reject requests that can never be judged before any sandbox work.
pub fn validate_request(request: &ExecutionRequest, bounds: &CaseLimitBounds) -> Result<()> {
    if request.test_cases.is_empty() {
        return Err(EngineError::InvalidRequest(
            "at least one test case is required".to_string(),
        ));
    }

    check_input_sizes(&request.source_code, None)?;
    for (index, case) in request.test_cases.iter().enumerate() {
        check_input_sizes("", Some(&case.input))?;
        check_limit(index, "timeLimitMs", case.time_limit_ms, bounds.max_time_limit_ms)?;
        check_limit(
            index,
            "memoryLimitMb",
            case.memory_limit_mb,
            bounds.max_memory_limit_mb,
        )?;
        check_limit(
            index,
            "points",
            case.points.map(u64::from),
            u64::from(MAX_CASE_POINTS),
        )?;
    }
    Ok(())
}

fn check_limit(index: usize, field: &str, value: Option<u64>, max: u64) -> Result<()> {
    match value {
        Some(v) if v == 0 || v > max => Err(EngineError::InvalidRequest(format!(
            "test case {}: {} must be between 1 and {} (got {})",
            index + 1,
            field,
            max,
            v
        ))),
        _ => Ok(()),
    }
}

/// Classify one run against its test case.
///
/// Priority: timeout, then OOM kill, then non-zero exit, then comparison.
pub fn evaluate_case(case: &TestCase, output: RunOutput) -> ExecutionOutcome {
    let (passed, error_kind, actual_output) = match output.status {
        RunStatus::TimedOut => (false, Some(CaseError::TimeLimitExceeded), output.stdout),
        RunStatus::OomKilled => (false, Some(CaseError::MemoryLimitExceeded), output.stdout),
        RunStatus::Exited(code) if code != 0 => {
            (false, Some(CaseError::RuntimeError), output.stdout)
        }
        RunStatus::Exited(_) => {
            let comparison = comparator::compare(&output.stdout, &case.expected_output);
            (comparison.passed, None, comparison.normalized_actual)
        }
    };

    let mut stderr = output.stderr;
    truncate_utf8(&mut stderr, MAX_STDERR_BYTES);

    ExecutionOutcome {
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output,
        passed,
        execution_time_ms: output.elapsed_ms,
        memory_used_kb: output.memory_kb,
        error_kind,
        is_public: case.is_public,
        stderr: (!passed && !stderr.is_empty()).then_some(stderr),
    }
}

/// Aggregate per-case outcomes into the summary.
pub fn summarize(cases: &[TestCase], outcomes: Vec<ExecutionOutcome>) -> ExecutionSummary {
    let total_tests = cases.len();
    let passed_tests = outcomes.iter().filter(|o| o.passed).count();
    let max_score = TestCase::total_weight(cases);
    let score = TestCase::total_weight(
        cases
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| outcome.passed)
            .map(|(case, _)| case),
    );

    let overall_result = if total_tests > 0 && passed_tests == total_tests {
        Verdict::Accepted
    } else {
        outcomes
            .iter()
            .find_map(|o| o.error_kind)
            .map(CaseError::verdict)
            .unwrap_or(Verdict::WrongAnswer)
    };

    let completed = outcomes.len();
    let (execution_time, memory_used) = if completed == 0 {
        (0.0, 0.0)
    } else {
        let time: u64 = outcomes.iter().map(|o| o.execution_time_ms).sum();
        let memory: u64 = outcomes.iter().map(|o| o.memory_used_kb).sum();
        (time as f64 / completed as f64, memory as f64 / completed as f64)
    };

    ExecutionSummary {
        success: overall_result.ran_all_cases(),
        results: outcomes,
        total_tests,
        passed_tests,
        execution_time,
        memory_used,
        overall_result,
        compile_error: None,
        score,
        max_score,
    }
}

/// Summary for a source that did not compile: no case ran.
pub fn compilation_failed(cases: &[TestCase], message: String) -> ExecutionSummary {
    let max_score = TestCase::total_weight(cases);
    ExecutionSummary {
        compile_error: Some(message),
        ..ExecutionSummary::not_executed(Verdict::CompilationError, cases.len(), max_score)
    }
}
