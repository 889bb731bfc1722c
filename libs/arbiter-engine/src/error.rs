use arbiter_common::types::Verdict;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by a sandbox backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolated execution context cannot be created at all.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("{what} exceeds maximum size of {limit} bytes ({size} bytes)")]
    InputTooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("sandbox backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the judging engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("execution unavailable: {0}")]
    ExecutionUnavailable(String),

    #[error("{what} exceeds maximum size of {limit} bytes ({size} bytes)")]
    PayloadTooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {0} already finished")]
    AlreadyFinished(Uuid),

    #[error("submission queue is closed")]
    QueueClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Verdict reported to the caller when this error ends a submission.
    pub fn verdict(&self) -> Verdict {
        match self {
            EngineError::ExecutionUnavailable(_) => Verdict::ExecutionUnavailable,
            _ => Verdict::InternalError,
        }
    }

    /// Short machine-readable label, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnsupportedLanguage(_) => "unsupported_language",
            EngineError::ExecutionUnavailable(_) => "execution_unavailable",
            EngineError::PayloadTooLarge { .. } => "payload_too_large",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::JobNotFound(_) => "job_not_found",
            EngineError::AlreadyFinished(_) => "already_finished",
            EngineError::QueueClosed => "queue_closed",
            EngineError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may see this error's message.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Internal(_))
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Unavailable(msg) => EngineError::ExecutionUnavailable(msg),
            SandboxError::InputTooLarge { what, size, limit } => {
                EngineError::PayloadTooLarge { what, size, limit }
            }
            SandboxError::Backend(msg) => EngineError::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
