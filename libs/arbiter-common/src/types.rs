use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One (input, expected output) pair supplied by the problem-management layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            ..Default::default()
        }
    }

    /// Points awarded when this case passes. Unweighted cases are worth 1.
    pub fn weight(&self) -> u32 {
        self.points.unwrap_or(1)
    }

    /// Sum of weights, saturating at `u32::MAX`.
    pub fn total_weight<'a>(cases: impl IntoIterator<Item = &'a TestCase>) -> u32 {
        cases
            .into_iter()
            .map(TestCase::weight)
            .fold(0, u32::saturating_add)
    }
}

/// A validated submission handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_id: Option<String>,
}

/// Payload pushed onto the intake queue by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEnvelope {
    pub submission_id: String,
    pub request: ExecutionRequest,
}

/// Final classification of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    CompilationError,
    TimeLimitExceeded,
    RuntimeError,
    MemoryLimitExceeded,
    ExecutionUnavailable,
    InternalError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "ACCEPTED",
            Verdict::WrongAnswer => "WRONG_ANSWER",
            Verdict::CompilationError => "COMPILATION_ERROR",
            Verdict::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Verdict::RuntimeError => "RUNTIME_ERROR",
            Verdict::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Verdict::ExecutionUnavailable => "EXECUTION_UNAVAILABLE",
            Verdict::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether every test case was executed to produce this verdict.
    pub fn ran_all_cases(&self) -> bool {
        matches!(
            self,
            Verdict::Accepted
                | Verdict::WrongAnswer
                | Verdict::TimeLimitExceeded
                | Verdict::RuntimeError
                | Verdict::MemoryLimitExceeded
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single test case that is not a plain output mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseError {
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
}

impl CaseError {
    pub fn verdict(self) -> Verdict {
        match self {
            CaseError::RuntimeError => Verdict::RuntimeError,
            CaseError::TimeLimitExceeded => Verdict::TimeLimitExceeded,
            CaseError::MemoryLimitExceeded => Verdict::MemoryLimitExceeded,
        }
    }
}

/// Result of running one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub passed: bool,
    pub execution_time_ms: u64,
    pub memory_used_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CaseError>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Terminal artifact returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub success: bool,
    pub results: Vec<ExecutionOutcome>,
    pub total_tests: usize,
    pub passed_tests: usize,
    /// Mean execution time over completed cases, in milliseconds.
    pub execution_time: f64,
    /// Mean peak memory over completed cases, in kilobytes.
    pub memory_used: f64,
    pub overall_result: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
    pub score: u32,
    pub max_score: u32,
}

impl ExecutionSummary {
    /// Summary for a job that never ran its test cases.
    pub fn not_executed(verdict: Verdict, total_tests: usize, max_score: u32) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            total_tests,
            passed_tests: 0,
            execution_time: 0.0,
            memory_used: 0.0,
            overall_result: verdict,
            compile_error: None,
            score: 0,
            max_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Allowed transitions: Pending→Running, Pending→Failed (cancel),
    /// Running→Completed, Running→Failed.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobFailure {
    Cancelled,
    InternalError,
    TimeLimitExceeded,
    ExecutionUnavailable,
    /// Refused before it was ever queued.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// A unit of work owned by the submission queue.
///
/// The request carries the submitted source and is never serialized into
/// status records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub submission_id: String,
    #[serde(skip)]
    pub request: ExecutionRequest,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Caller-facing reason for a rejected job. Internal errors carry no detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
}

impl QueuedJob {
    pub fn new(submission_id: impl Into<String>, request: ExecutionRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            submission_id: submission_id.into(),
            request,
            state: JobState::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure: None,
            error: None,
            summary: None,
        }
    }

    /// Terminal record for a submission refused before queueing.
    pub fn rejected(
        submission_id: impl Into<String>,
        error: impl Into<String>,
        summary: ExecutionSummary,
    ) -> Self {
        let now = Utc::now();
        Self {
            state: JobState::Failed,
            finished_at: Some(now),
            failure: Some(JobFailure::Rejected),
            error: Some(error.into()),
            summary: Some(summary),
            ..Self::new(submission_id, ExecutionRequest::default())
        }
    }

    /// Move to `next`, stamping the matching timestamp. Never reverts.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            JobState::Running => self.started_at = Some(now),
            JobState::Completed | JobState::Failed => self.finished_at = Some(now),
            JobState::Pending => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.summary.as_ref().map(|s| s.overall_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            source_code: "print(1)".to_string(),
            language: "python".to_string(),
            test_cases: vec![TestCase::new("", "1")],
            problem_id: None,
        }
    }

    #[test]
    fn test_total_weight_saturates() {
        let mut heavy = TestCase::new("", "");
        heavy.points = Some(u32::MAX);
        let cases = vec![heavy.clone(), heavy, TestCase::new("", "")];
        assert_eq!(TestCase::total_weight(&cases), u32::MAX);
        assert_eq!(TestCase::total_weight(&cases[2..]), 1);
        assert_eq!(TestCase::total_weight(&[]), 0);
    }

    #[test]
    fn test_job_state_is_monotonic() {
        let mut job = QueuedJob::new("sub-1", request());
        assert_eq!(job.state, JobState::Pending);

        job.transition(JobState::Running).unwrap();
        assert!(job.started_at.is_some());

        job.transition(JobState::Completed).unwrap();
        assert!(job.finished_at.is_some());

        let err = job.transition(JobState::Running).unwrap_err();
        assert_eq!(err.from, JobState::Completed);
        assert_eq!(err.to, JobState::Running);
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_pending_job_can_fail_directly() {
        let mut job = QueuedJob::new("sub-2", request());
        job.transition(JobState::Failed).unwrap();
        assert!(job.started_at.is_none());
        assert!(job.transition(JobState::Pending).is_err());
    }

    #[test]
    fn test_pending_cannot_complete_without_running() {
        let mut job = QueuedJob::new("sub-3", request());
        assert!(job.transition(JobState::Completed).is_err());
    }

    #[test]
    fn test_summary_wire_format() {
        let summary = ExecutionSummary {
            success: true,
            results: vec![ExecutionOutcome {
                input: "5 3".to_string(),
                expected_output: "8".to_string(),
                actual_output: "8".to_string(),
                passed: true,
                execution_time_ms: 12,
                memory_used_kb: 2048,
                error_kind: None,
                is_public: true,
                stderr: None,
            }],
            total_tests: 1,
            passed_tests: 1,
            execution_time: 12.0,
            memory_used: 2048.0,
            overall_result: Verdict::Accepted,
            compile_error: None,
            score: 1,
            max_score: 1,
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["overallResult"], "ACCEPTED");
        assert_eq!(value["totalTests"], 1);
        assert_eq!(value["passedTests"], 1);
        assert_eq!(value["executionTime"], 12.0);
        assert_eq!(value["memoryUsed"], 2048.0);
        assert_eq!(value["results"][0]["expectedOutput"], "8");
        assert_eq!(value["results"][0]["memoryUsedKb"], 2048);
        assert!(value.get("compileError").is_none());
    }

    #[test]
    fn test_request_accepts_minimal_test_cases() {
        let json = r#"{
            "sourceCode": "int main(){}",
            "language": "cpp",
            "testCases": [{"input": "5 3", "expectedOutput": "8"}]
        }"#;
        let req: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.test_cases.len(), 1);
        assert!(!req.test_cases[0].is_public);
        assert_eq!(req.test_cases[0].weight(), 1);
        assert!(req.problem_id.is_none());
    }

    #[test]
    fn test_status_record_omits_source() {
        let job = QueuedJob::new("sub-4", request());
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("request").is_none());
        assert_eq!(value["state"], "PENDING");
        assert_eq!(value["submissionId"], "sub-4");
    }

    #[test]
    fn test_rejected_record_is_terminal() {
        let summary = ExecutionSummary::not_executed(Verdict::ExecutionUnavailable, 3, 3);
        let job = QueuedJob::rejected("sub-5", "sandbox down", summary);
        assert!(job.state.is_terminal());
        assert_eq!(job.failure, Some(JobFailure::Rejected));
        assert_eq!(job.verdict(), Some(Verdict::ExecutionUnavailable));

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["failure"], "REJECTED");
        assert_eq!(value["error"], "sandbox down");
        assert_eq!(value["summary"]["totalTests"], 3);
    }

    #[test]
    fn test_case_error_maps_to_verdict() {
        assert_eq!(CaseError::RuntimeError.verdict(), Verdict::RuntimeError);
        assert_eq!(CaseError::TimeLimitExceeded.verdict(), Verdict::TimeLimitExceeded);
        assert_eq!(CaseError::MemoryLimitExceeded.verdict(), Verdict::MemoryLimitExceeded);
        assert!(!Verdict::CompilationError.ran_all_cases());
        assert!(Verdict::WrongAnswer.ran_all_cases());
    }
}
