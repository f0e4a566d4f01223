//! Error types for the generation engine

use thiserror::Error;

/// Result type alias using the engine's error
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the generation engine.
///
/// Validation errors (`ContextOverflow`, `InvalidSamplingParameter`) are
/// returned before any generation starts. `ModelRuntimeFailure` aborts a
/// running generation. `CacheCorruption` is recovered inside the engine and
/// only escapes from [`CachedState::verify`](crate::state_cache::CachedState::verify).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("requested tokens ({prompt_tokens}) exceed context window of {max_context_length}")]
    ContextOverflow {
        prompt_tokens: usize,
        max_context_length: usize,
    },

    #[error("invalid sampling parameter `{name}` = {value}: {reason}")]
    InvalidSamplingParameter {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("model runtime failure: {0:#}")]
    ModelRuntimeFailure(#[source] anyhow::Error),

    #[error("cached state blob declares {declared} bytes but holds {actual}")]
    CacheCorruption { declared: usize, actual: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn invalid(name: &'static str, value: impl ToString, reason: &'static str) -> Self {
        Self::InvalidSamplingParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }

    /// Whether the error was raised before generation started.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ContextOverflow { .. } | Self::InvalidSamplingParameter { .. } | Self::Config(_)
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::ModelRuntimeFailure(e)
    }
}
