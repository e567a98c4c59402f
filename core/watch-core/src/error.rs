//! Error types for stagewatch-core operations.

use std::path::PathBuf;

/// All errors that can occur in stagewatch-core operations.
///
/// None of these are fatal to the frame loop: callers degrade to "skip this
/// frame" or "disable this optional feature".
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // Model Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid model endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Model request failed: {context}: {source}")]
    LlmRequest {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Model response unusable: {0}")]
    LlmResponse(String),

    #[error("Reasoning engine is not loaded")]
    EngineNotLoaded,
}

/// Convenience type alias for Results using WatchError.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Raised by an observation source when a frame cannot be turned into a count.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObservationError {
    #[error("detection {index} has invalid confidence {confidence}")]
    InvalidConfidence { index: usize, confidence: f32 },

    #[error("detection {index} has an empty label")]
    EmptyLabel { index: usize },
}
