//! Binary multi-array container collector (`.lmc`).
//!
//! Single file holding every key. Layout, little-endian: magic `LMC1`,
//! u32 format version, u32 key count, then per key: u16 key length,
//! key bytes, u32 rank, rank x u64 dims, payload. Payload bytes are
//! identical to the `.lma` encoding for identical buffers.

use super::{buffer_result, decode_payload, encode_payload, BufferMap};
use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAGIC: &[u8; 4] = b"LMC1";
const VERSION: u32 = 1;

pub struct ContainerMatrixCollector {
    exist_rule: ExistRule,
    out_path: Option<PathBuf>,
    buffers: BufferMap,
}

impl ContainerMatrixCollector {
    pub fn new() -> Self {
        Self {
            exist_rule: ExistRule::Proceed,
            out_path: None,
            buffers: BufferMap::new(),
        }
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(format!("{}.lmc", super::LANDMARKS_STEM))
    }
}

impl Default for ContainerMatrixCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ContainerMatrixCollector {
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

    /// Zero appends still close into a valid container with zero keys.
    fn close(&mut self) -> PipelineResult<()> {
        let path = self
            .out_path
            .take()
            .ok_or_else(|| PipelineError::Config("close before open".into()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        write_container_inner(&mut writer, &self.buffers).map_err(|e| PipelineError::io(&path, e))?;
        writer.flush().map_err(|e| PipelineError::io(&path, e))?;
        debug!(keys = self.buffers.len(), path = %path.display(), "container landmarks flushed");
        self.buffers.clear();
        Ok(())
    }
}

fn write_container_inner<W: Write>(writer: &mut W, buffers: &BufferMap) -> std::io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(buffers.len() as u32).to_le_bytes())?;
    for (key, buf) in buffers {
        let key_bytes = key.as_bytes();
        writer.write_all(&(key_bytes.len() as u16).to_le_bytes())?;
        writer.write_all(key_bytes)?;
        let shape = buf.stacked_shape();
        writer.write_all(&(shape.len() as u32).to_le_bytes())?;
        for dim in &shape {
            writer.write_all(&(*dim as u64).to_le_bytes())?;
        }
        writer.write_all(&encode_payload(buf.data()))?;
    }
    Ok(())
}

/// Load an `.lmc` container back into key -> `(shape, data)`.
pub fn read_container(path: &Path) -> PipelineResult<BTreeMap<String, (Vec<usize>, Vec<f32>)>> {
    let mut raw = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .map_err(|e| PipelineError::io(path, e))?;
    parse_container(&raw)
        .map_err(|msg| PipelineError::Config(format!("{}: {msg}", path.display())))
}

fn parse_container(raw: &[u8]) -> Result<BTreeMap<String, (Vec<usize>, Vec<f32>)>, String> {
    if raw.len() < 12 || &raw[0..4] != MAGIC {
        return Err("bad magic or truncated header".into());
    }
    let version = u32::from_le_bytes(raw[4..8].try_into().expect("sized slice"));
    if version != VERSION {
        return Err(format!("unsupported version {version}"));
    }
    let key_count = u32::from_le_bytes(raw[8..12].try_into().expect("sized slice")) as usize;
    let mut at = 12usize;
    let mut out = BTreeMap::new();
    for _ in 0..key_count {
        if raw.len() < at + 2 {
            return Err("truncated key length".into());
        }
        let key_len = u16::from_le_bytes(raw[at..at + 2].try_into().expect("sized slice")) as usize;
        at += 2;
        if raw.len() < at + key_len + 4 {
            return Err("truncated key entry".into());
        }
        let key = String::from_utf8(raw[at..at + key_len].to_vec())
            .map_err(|_| "key is not utf-8".to_string())?;
        at += key_len;
        let rank = u32::from_le_bytes(raw[at..at + 4].try_into().expect("sized slice")) as usize;
        at += 4;
        if raw.len() < at + rank * 8 {
            return Err("truncated dims".into());
        }
        let shape: Vec<usize> = (0..rank)
            .map(|i| {
                let base = at + i * 8;
                u64::from_le_bytes(raw[base..base + 8].try_into().expect("sized slice")) as usize
            })
            .collect();
        at += rank * 8;
        let elems: usize = shape.iter().product();
        let payload_bytes = elems * 4;
        if raw.len() < at + payload_bytes {
            return Err(format!("truncated payload for key '{key}'"));
        }
        let data = decode_payload(&raw[at..at + payload_bytes]);
        at += payload_bytes;
        out.insert(key, (shape, data));
    }
    Ok(out)
}
