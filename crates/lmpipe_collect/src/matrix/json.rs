//! JSON tensor-container collector (`.json`).
//!
//! One `<dst>/landmarks.json` file: key -> `{ "shape": [...],
//! "data": [flat f32] }`, stacked shape law as for the binary
//! containers.

use super::{buffer_result, BufferMap};
use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonArrayEntry {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

pub struct JsonMatrixCollector {
    exist_rule: ExistRule,
    out_path: Option<PathBuf>,
    buffers: BufferMap,
}

impl JsonMatrixCollector {
    pub fn new() -> Self {
        Self {
            exist_rule: ExistRule::Proceed,
            out_path: None,
            buffers: BufferMap::new(),
        }
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(format!("{}.json", super::LANDMARKS_STEM))
    }
}

impl Default for JsonMatrixCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for JsonMatrixCollector {
    fn configure(&mut self, options: &LmPipeOptions) {
        self.exist_rule = options.exist_rule;
    }

    fn apply_exist_rule(&self, spec: &RunSpec) -> PipelineResult<bool> {
        evaluate_exist_rule(self.exist_rule, &self.target(spec))
    }

    fn open(&mut self, spec: &RunSpec) -> PipelineResult<()> {
        self.out_path = Some(self.target(spec));
        self.buffers.clear();
        Ok(())
    }

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()> {
        buffer_result(&mut self.buffers, result)
    }

    fn close(&mut self) -> PipelineResult<()> {
        let path = self
            .out_path
            .take()
            .ok_or_else(|| PipelineError::Config("close before open".into()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let entries: BTreeMap<&String, JsonArrayEntry> = self
            .buffers
            .iter()
            .map(|(key, buf)| {
                (
                    key,
                    JsonArrayEntry {
                        shape: buf.stacked_shape(),
                        data: buf.data().to_vec(),
                    },
                )
            })
            .collect();
        let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &entries).map_err(|e| PipelineError::Json {
            path: path.clone(),
            source: e,
        })?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| PipelineError::io(&path, e))?;
        debug!(keys = entries.len(), path = %path.display(), "json landmarks flushed");
        self.buffers.clear();
        Ok(())
    }
}

/// Load a `.json` container back into key -> entry.
pub fn read_json(path: &Path) -> PipelineResult<BTreeMap<String, JsonArrayEntry>> {
    let raw = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| PipelineError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}
