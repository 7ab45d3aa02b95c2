//! Collector subsystem for the landmark pipeline.
//!
//! Consumes the runner's ordered `ProcessResult` stream and persists it
//! under two structural contracts: per-key streaming files and
//! single-container accumulation. Shape consistency and pre-flight
//! exist-rule policy hold identically across every storage backend.

pub mod collector;
pub mod frames;
pub mod matrix;

pub use collector::{evaluate_exist_rule, Collector};
pub use frames::{
    codec_for_extension, FfmpegEncoderFactory, SequenceFramesCollector, VideoFramesCollector,
};
pub use matrix::{
    matrix_collector, matrix_collector_from_options, read_array, read_container, read_flat,
    read_json, ChunkedStoreReader, MatrixFormat,
};
