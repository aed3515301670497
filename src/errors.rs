//! The closed error-kind taxonomy shared by every stage, transport adapter,
//! and the client facade. Stages either recover from an error or forward it
//! as the completion of the operation that triggered it; the root stage is
//! the only place a `PipelineError` becomes visible to a caller.

use thiserror::Error;

/// A single named error kind. Every fallible operation in the pipeline
/// eventually reduces to one of these variants — the retry policy in
/// [`crate::retry`] dispatches purely on the kind, never on the inner detail.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal service error: {0}")]
    InternalServiceError(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// An irrecoverable defect. Propagating this out of an executor's job
    /// loop terminates that executor; there is no retry.
    #[error("fatal pipeline error: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// Whether the external retry policy (see [`crate::retry`]) should
    /// consider resubmitting the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ConnectionDropped(_)
                | PipelineError::ConnectionFailed(_)
                | PipelineError::Timeout(_)
                | PipelineError::InternalServiceError(_)
                | PipelineError::QuotaExceeded(_)
                | PipelineError::Throttled(_)
                | PipelineError::ServiceUnavailable(_)
        )
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, PipelineError::Throttled(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Fatal(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
