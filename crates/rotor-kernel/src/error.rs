//! Tagged error types shared by every Rotor crate.
//!
//! Errors are tagged values, not text (spec §7): each variant maps to a
//! stable `code()` a caller can match on without string comparison.

use thiserror::Error;

/// Errors raised by a [`ModelProvider`](crate::provider::ModelProvider)
/// implementation.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("model unload failed: {0}")]
    UnloadFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("provider timed out after {0}ms")]
    Timeout(u64),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Stable failure-taxonomy tag, surfaced to consumers (spec §4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RotationErrorCode {
    InvalidInput,
    ModelNotFound,
    QueueFull,
    ModelLoadFailed,
    ModelUnloadFailed,
    Timeout,
    MemoryExhausted,
    ConfigurationError,
    EmergencyCleanupFailed,
    ProviderError,
}

impl RotationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::QueueFull => "QUEUE_FULL",
            Self::ModelLoadFailed => "MODEL_LOAD_FAILED",
            Self::ModelUnloadFailed => "MODEL_UNLOAD_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::MemoryExhausted => "MEMORY_EXHAUSTED",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::EmergencyCleanupFailed => "EMERGENCY_CLEANUP_FAILED",
            Self::ProviderError => "PROVIDER_ERROR",
        }
    }
}

impl std::fmt::Display for RotationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
