//! Error types for timestamp capture.
//!
//! Every failure in the capture path maps onto one of the [`TimelineError`]
//! kinds. None of them is fatal to the hosting process: callers log the error
//! and treat the current capture cycle as having produced no data.

use std::time::Duration;

use thiserror::Error;

use crate::xrt::XrtError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Capture error kinds.
#[derive(Debug, Error)]
pub enum TimelineError {
    /// The device configuration is missing a field or is inconsistent.
    #[error("Device configuration incomplete: {0}")]
    ConfigIncomplete(String),

    /// The named kernel could not be resolved from the hardware context.
    #[error("Unable to find {name} kernel from hardware context: {reason}")]
    KernelNotFound { name: String, reason: String },

    /// A device-visible buffer could not be allocated or is unusable.
    #[error("Unable to allocate {size:#x} byte buffer: {reason}")]
    BufferAllocationFailed { size: usize, reason: String },

    /// The device run failed or did not complete.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The raw transaction blob violates the encoder's input contract.
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// A bounded completion wait expired.
    #[error("Timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    /// Writing the report failed.
    #[error("Report error: {0}")]
    Report(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TimelineError {
    /// Whether the error only invalidates the current capture cycle.
    ///
    /// Configuration and encoding errors are input contract violations and
    /// will fail again on retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConfigIncomplete(_) | Self::EncodingError(_))
    }
}

impl From<XrtError> for TimelineError {
    fn from(e: XrtError) -> Self {
        match e {
            XrtError::KernelNotFound(name) => Self::KernelNotFound {
                reason: format!("no kernel named '{}'", name),
                name,
            },
            XrtError::OutOfMemory { size } => Self::BufferAllocationFailed {
                size,
                reason: "device out of memory".to_string(),
            },
            XrtError::Timeout(d) => Self::Timeout(d),
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}
