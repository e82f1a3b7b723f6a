//! Typed error kinds for the engine's public API.
//!
//! The CLI and server shells wrap these in `anyhow` at their boundary;
//! inside the library callers match on variants (e.g. to retry with a
//! different language) so errors carry structured fields, not just strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QwenAsrError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse safetensors header: {0}")]
    HeaderParseError(String),

    #[error("unsupported tensor dtype for `{name}`: {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing tensor: {0}")]
    MissingTensor(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("out of memory allocating {context}")]
    OutOfMemory { context: String },

    #[error("audio too long: {n_frames} encoder frames exceeds the {max_frames} frame limit")]
    AudioTooLong { n_frames: usize, max_frames: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, QwenAsrError>;
