//! Delimited-text per-key collector.
//!
//! One file per key under `<dst>/landmarks/`, one header row taken
//! verbatim from the estimator's declared column names, then one data
//! row per frame per append. Rows accumulate; there is no stacking
//! dimension. A column-count change across rows is a hard error.

use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

struct KeyWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    width: usize,
    rows: u64,
}

pub struct TextMatrixCollector {
    delimiter: char,
    extension: String,
    exist_rule: ExistRule,
    out_dir: Option<PathBuf>,
    writers: BTreeMap<String, KeyWriter>,
}

impl TextMatrixCollector {
    pub fn new(delimiter: char, extension: impl Into<String>) -> Self {
        Self {
            delimiter,
            extension: extension.into(),
            exist_rule: ExistRule::Proceed,
            out_dir: None,
            writers: BTreeMap::new(),
        }
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(super::LANDMARKS_STEM)
    }

    /// Writers are created lazily on the first append for a key; the
    /// header row and the binding column width are fixed there.
    fn writer_for(
        &mut self,
        key: &str,
        width: usize,
        headers: &HeaderMap,
    ) -> PipelineResult<&mut KeyWriter> {
        if !self.writers.contains_key(key) {
            let dir = self
                .out_dir
                .as_ref()
                .ok_or_else(|| PipelineError::Config("append before open".into()))?;
            let path = dir.join(format!("{key}{}", self.extension));
            let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
            let mut writer = BufWriter::new(file);
            if let Some(columns) = headers.get(key) {
                let header_row = columns.join(&self.delimiter.to_string());
                writeln!(writer, "{header_row}").map_err(|e| PipelineError::io(&path, e))?;
            }
            self.writers.insert(
                key.to_string(),
                KeyWriter {
                    writer,
                    path,
                    width,
                    rows: 0,
                },
            );
        }
        Ok(self.writers.get_mut(key).expect("writer just inserted"))
    }
}

impl Collector for TextMatrixCollector {
    fn configure(&mut self, options: &LmPipeOptions) {
        self.exist_rule = options.exist_rule;
    }

    fn apply_exist_rule(&self, spec: &RunSpec) -> PipelineResult<bool> {
        evaluate_exist_rule(self.exist_rule, &self.target(spec))
    }

    fn open(&mut self, spec: &RunSpec) -> PipelineResult<()> {
        let dir = self.target(spec);
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        self.out_dir = Some(dir);
        self.writers.clear();
        Ok(())
    }

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()> {
        let delimiter = self.delimiter;
        for (key, sample) in &result.landmarks {
            let (rows, width) = sample.frame_rows();
            let entry = self.writer_for(key, width, &result.headers)?;
            if width != entry.width {
                return Err(PipelineError::Shape {
                    key: key.clone(),
                    msg: format!(
                        "row width {} differs from first-seen {} at row {}",
                        width, entry.width, entry.rows
                    ),
                });
            }
            for row in 0..rows {
                let cells: Vec<String> = sample.data()[row * width..(row + 1) * width]
                    .iter()
                    .map(|v| v.to_string())
                    .collect();
                writeln!(entry.writer, "{}", cells.join(&delimiter.to_string()))
                    .map_err(|e| PipelineError::io(&entry.path, e))?;
                entry.rows += 1;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> PipelineResult<()> {
        for (key, entry) in self.writers.iter_mut() {
            entry
                .writer
                .flush()
                .map_err(|e| PipelineError::io(&entry.path, e))?;
            debug!(key, rows = entry.rows, path = %entry.path.display(), "text landmarks flushed");
        }
        self.writers.clear();
        self.out_dir = None;
        Ok(())
    }
}
