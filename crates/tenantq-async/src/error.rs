use thiserror::Error;

/// A blocking buffer call was aborted by its cancellation token.
///
/// Never a failure: callers stop quietly when they see it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Failure reported by a [`MessageSource`](crate::MessageSource) transport call.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unknown ack token {0}")]
    UnknownToken(String),

    #[error("message source closed")]
    Closed,
}

/// Failure reported by a [`MessageProcessor`](crate::MessageProcessor).
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Processing observed the shutdown signal and stopped early.
    #[error("processing cancelled")]
    Cancelled,

    #[error("processing failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ProcessError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ProcessError::Failed(reason.into())
    }
}
