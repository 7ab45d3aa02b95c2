//! The value object naming one processing job's source and destination.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to read: a filesystem path or a camera index.
///
/// Stream handles don't fit a serializable value object; they enter the
/// runner through its `run_source` entry point instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Path(PathBuf),
    Camera(u32),
}

/// Immutable job description: one source, one destination directory.
/// Constructed once per invocation and consumed by a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub src: Source,
    pub dst: PathBuf,
}

impl RunSpec {
    /// Build from two pathlikes, validating that `src` exists eagerly.
    /// A missing source is a domain error, not a deferred I/O failure.
    pub fn from_pathlikes(
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> PipelineResult<Self> {
        let src = src.as_ref();
        if !src.exists() {
            return Err(PipelineError::source(format!(
                "source path does not exist: {}",
                src.display()
            )));
        }
        Ok(Self {
            src: Source::Path(src.to_path_buf()),
            dst: dst.as_ref().to_path_buf(),
        })
    }

    /// Build for a camera stream. Camera indices are never validated
    /// for existence; the decoder finds out at open time.
    pub fn from_index(camera_index: u32, dst: impl AsRef<Path>) -> Self {
        Self {
            src: Source::Camera(camera_index),
            dst: dst.as_ref().to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pathlikes_rejects_missing_source() {
        let err = RunSpec::from_pathlikes("/definitely/not/here.mp4", "/tmp/out").unwrap_err();
        assert!(matches!(err, PipelineError::Source { .. }));
    }

    #[test]
    fn from_pathlikes_accepts_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RunSpec::from_pathlikes(dir.path(), dir.path().join("out")).unwrap();
        assert_eq!(spec.src, Source::Path(dir.path().to_path_buf()));
    }

    #[test]
    fn from_index_never_validates() {
        let spec = RunSpec::from_index(99, "/tmp/out");
        assert_eq!(spec.src, Source::Camera(99));
    }
}
