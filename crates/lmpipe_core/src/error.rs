//! Error taxonomy for the pipeline.
//!
//! Failures fall into five categories that callers can match on:
//! configuration, pre-flight output conflicts, shape consistency,
//! source resolution, and in-worker task failures. The remaining
//! variants carry I/O context for the layer that raised them.

use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid construction-time configuration (bad extension, missing
    /// video parameters). Never deferred to write time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Exist-rule `error` mode hit a pre-existing target. Raised before
    /// any frame is processed.
    #[error("output conflict at {path}: {msg}")]
    Conflict { path: PathBuf, msg: String },

    /// Sample width changed between appends for the same key.
    #[error("shape mismatch for key '{key}': {msg}")]
    Shape { key: String, msg: String },

    /// Missing or unsupported source, raised before the frame iterator
    /// opens.
    #[error("source error: {msg}")]
    Source { msg: String },

    /// An estimator failed inside a worker; surfaces when the runner
    /// collects that frame's result.
    #[error("task failed on frame {frame_id}: {msg}")]
    Task { frame_id: u64, msg: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn source(msg: impl Into<String>) -> Self {
        PipelineError::Source { msg: msg.into() }
    }

    pub fn task(frame_id: u64, msg: impl Into<String>) -> Self {
        PipelineError::Task {
            frame_id,
            msg: msg.into(),
        }
    }
}
