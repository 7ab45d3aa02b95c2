//! Flat serialized-tensor container collector (`.lmf`).
//!
//! Single file, little-endian: a u64 header length, a JSON header
//! mapping each key to its stacked shape, dtype, and byte range, then
//! one contiguous payload region holding every key's f32 data back to
//! back in key order. The header is self-describing, so a reader can
//! slice any key without touching the rest of the payload.

use super::{buffer_result, decode_payload, encode_payload, BufferMap};
use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const DTYPE_F32: &str = "f32";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FlatTensorEntry {
    pub shape: Vec<usize>,
    pub dtype: String,
    /// `[start, end)` byte range within the payload region.
    pub offsets: [usize; 2],
}

pub struct FlatMatrixCollector {
    exist_rule: ExistRule,
    out_path: Option<PathBuf>,
    buffers: BufferMap,
}

impl FlatMatrixCollector {
    pub fn new() -> Self {
        Self {
            exist_rule: ExistRule::Proceed,
            out_path: None,
            buffers: BufferMap::new(),
        }
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(format!("{}.lmf", super::LANDMARKS_STEM))
    }
}

impl Default for FlatMatrixCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for FlatMatrixCollector {
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

    /// Zero appends still close into a valid container: an empty JSON
    /// header and an empty payload region.
    fn close(&mut self) -> PipelineResult<()> {
        let path = self
            .out_path
            .take()
            .ok_or_else(|| PipelineError::Config("close before open".into()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let mut cursor = 0usize;
        let entries: BTreeMap<&String, FlatTensorEntry> = self
            .buffers
            .iter()
            .map(|(key, buf)| {
                let len = buf.data().len() * 4;
                let entry = FlatTensorEntry {
                    shape: buf.stacked_shape(),
                    dtype: DTYPE_F32.to_string(),
                    offsets: [cursor, cursor + len],
                };
                cursor += len;
                (key, entry)
            })
            .collect();
        let header = serde_json::to_vec(&entries).map_err(|e| PipelineError::Json {
            path: path.clone(),
            source: e,
        })?;

        let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&(header.len() as u64).to_le_bytes())
            .and_then(|_| writer.write_all(&header))
            .and_then(|_| {
                for buf in self.buffers.values() {
                    writer.write_all(&encode_payload(buf.data()))?;
                }
                writer.flush()
            })
            .map_err(|e| PipelineError::io(&path, e))?;
        debug!(keys = entries.len(), path = %path.display(), "flat landmarks flushed");
        self.buffers.clear();
        Ok(())
    }
}

/// Load an `.lmf` container back into key -> `(shape, data)`.
pub fn read_flat(path: &Path) -> PipelineResult<BTreeMap<String, (Vec<usize>, Vec<f32>)>> {
    let raw = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    parse_flat(&raw).map_err(|msg| PipelineError::Config(format!("{}: {msg}", path.display())))
}

fn parse_flat(raw: &[u8]) -> Result<BTreeMap<String, (Vec<usize>, Vec<f32>)>, String> {
    if raw.len() < 8 {
        return Err("truncated header length".into());
    }
    let header_len = u64::from_le_bytes(raw[0..8].try_into().expect("sized slice")) as usize;
    let payload_start = 8 + header_len;
    if raw.len() < payload_start {
        return Err("truncated header".into());
    }
    let header: BTreeMap<String, FlatTensorEntry> =
        serde_json::from_slice(&raw[8..payload_start]).map_err(|e| e.to_string())?;
    let payload = &raw[payload_start..];
    let mut out = BTreeMap::new();
    for (key, entry) in header {
        if entry.dtype != DTYPE_F32 {
            return Err(format!("unsupported dtype '{}' for key '{key}'", entry.dtype));
        }
        let [start, end] = entry.offsets;
        let expected: usize = entry.shape.iter().product();
        if start > end || end > payload.len() || end - start != expected * 4 {
            return Err(format!("bad byte range {:?} for key '{key}'", entry.offsets));
        }
        out.insert(key, (entry.shape, decode_payload(&payload[start..end])));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(frame_id: u64, entries: &[(&str, Vec<usize>, f32)]) -> ProcessResult {
        let mut landmarks = LandmarkMap::new();
        for (key, shape, fill) in entries {
            let len = shape.iter().product();
            landmarks.insert(
                key.to_string(),
                LandmarkArray::new(shape.clone(), vec![*fill; len]).unwrap(),
            );
        }
        ProcessResult {
            frame_id,
            headers: std::sync::Arc::new(HeaderMap::new()),
            landmarks,
            annotated: None,
        }
    }

    #[test]
    fn payload_ranges_are_contiguous_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RunSpec {
            src: Source::Camera(0),
            dst: dir.path().join("out"),
        };
        let mut collector = FlatMatrixCollector::new();
        collector.open(&spec).unwrap();
        collector
            .append(&result_with(
                0,
                &[("a", vec![2, 3], 1.0), ("b", vec![4], 2.0)],
            ))
            .unwrap();
        collector.close().unwrap();

        let loaded = read_flat(&spec.dst.join("landmarks.lmf")).unwrap();
        assert_eq!(loaded["a"].0, vec![1, 2, 3]);
        assert_eq!(loaded["b"].0, vec![1, 4]);
        assert_eq!(loaded["a"].1, vec![1.0; 6]);
        assert_eq!(loaded["b"].1, vec![2.0; 4]);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RunSpec {
            src: Source::Camera(0),
            dst: dir.path().join("out"),
        };
        let mut collector = FlatMatrixCollector::new();
        collector.open(&spec).unwrap();
        collector
            .append(&result_with(0, &[("pose", vec![3], 0.5)]))
            .unwrap();
        collector.close().unwrap();

        let path = spec.dst.join("landmarks.lmf");
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 4);
        fs::write(&path, raw).unwrap();
        assert!(read_flat(&path).is_err());
    }
}
