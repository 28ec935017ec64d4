//! Error taxonomy for the job pipeline core.
//!
//! Mirrors the category/should_retry/backoff_delay_ms pattern used for NATS
//! worker errors elsewhere in this codebase, adapted to the six kinds the
//! job pipeline distinguishes.

use thiserror::Error;

/// Whether an error should be retried in-process or surfaced/recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    pub fn should_retry(&self, attempt: u32) -> bool {
        matches!(self, ErrorCategory::Transient) && attempt < 5
    }

    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        match self {
            ErrorCategory::Transient => 100 * 2u64.pow(attempt.min(6)),
            ErrorCategory::Permanent => 0,
        }
    }
}

/// Cap on a stored `error_message`, matching the column width `fail` writes
/// against.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 8192;

/// Truncate `message` to at most `MAX_ERROR_MESSAGE_BYTES` bytes, backing off
/// to the nearest earlier char boundary so a multibyte codepoint straddling
/// the cutoff is never split.
pub fn truncate_error_message(message: &str) -> &str {
    if message.len() <= MAX_ERROR_MESSAGE_BYTES {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before any state change: bad payload, unknown type. No job created.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Store unreachable or a serialization conflict. Never mutates job state.
    #[error("transient store error: {0}")]
    TransientStoreError(#[from] sqlx::Error),

    /// An atomic operation found the row in an unexpected state.
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// Returned by the stage handler; recorded via `fail`.
    #[error("handler error: {0}")]
    HandlerError(String),

    /// Publish or fetch against the broker failed. Never fails the job lifecycle.
    #[error("broker error: {0}")]
    BrokerError(String),

    /// Invariant violation. The worker that observes this must refuse to
    /// finalize and exit rather than risk further damage.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::TransientStoreError(_) => ErrorCategory::Transient,
            PipelineError::BrokerError(_) => ErrorCategory::Transient,
            PipelineError::ValidationError(_)
            | PipelineError::PreconditionFailure(_)
            | PipelineError::HandlerError(_)
            | PipelineError::Fatal(_) => ErrorCategory::Permanent,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.category().should_retry(attempt)
    }

    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        self.category().backoff_delay_ms(attempt)
    }
}
