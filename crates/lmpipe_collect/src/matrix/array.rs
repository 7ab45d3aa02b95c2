//! Binary single-array per-key collector (`.lma`).
//!
//! Layout, little-endian: magic `LMA1`, u32 format version, u32 dtype
//! (0 = f32), u32 rank, rank x u64 dims, then the row-major payload.

use super::{buffer_result, encode_payload, BufferMap, StackBuffer};
use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAGIC: &[u8; 4] = b"LMA1";
const VERSION: u32 = 1;
const DTYPE_F32: u32 = 0;

pub struct ArrayMatrixCollector {
    exist_rule: ExistRule,
    out_dir: Option<PathBuf>,
    buffers: BufferMap,
}

impl ArrayMatrixCollector {
    pub fn new() -> Self {
        Self {
            exist_rule: ExistRule::Proceed,
            out_dir: None,
            buffers: BufferMap::new(),
        }
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(super::LANDMARKS_STEM)
    }
}

impl Default for ArrayMatrixCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ArrayMatrixCollector {
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
        self.buffers.clear();
        Ok(())
    }

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()> {
        buffer_result(&mut self.buffers, result)
    }

    fn close(&mut self) -> PipelineResult<()> {
        let dir = self
            .out_dir
            .take()
            .ok_or_else(|| PipelineError::Config("close before open".into()))?;
        for (key, buf) in &self.buffers {
            let path = dir.join(format!("{key}.lma"));
            write_array(&path, buf)?;
            debug!(key, appends = buf.count(), path = %path.display(), "array landmarks flushed");
        }
        self.buffers.clear();
        Ok(())
    }
}

fn write_array(path: &Path, buf: &StackBuffer) -> PipelineResult<()> {
    let file = File::create(path).map_err(|e| PipelineError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let shape = buf.stacked_shape();
    write_header(&mut writer, &shape).map_err(|e| PipelineError::io(path, e))?;
    writer
        .write_all(&encode_payload(buf.data()))
        .map_err(|e| PipelineError::io(path, e))?;
    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

fn write_header<W: Write>(writer: &mut W, shape: &[usize]) -> std::io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&DTYPE_F32.to_le_bytes())?;
    writer.write_all(&(shape.len() as u32).to_le_bytes())?;
    for dim in shape {
        writer.write_all(&(*dim as u64).to_le_bytes())?;
    }
    Ok(())
}

/// Load a `.lma` file back into `(shape, data)`.
pub fn read_array(path: &Path) -> PipelineResult<(Vec<usize>, Vec<f32>)> {
    let mut raw = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .map_err(|e| PipelineError::io(path, e))?;
    parse_array(&raw).map_err(|msg| PipelineError::Config(format!("{}: {msg}", path.display())))
}

pub(crate) fn parse_array(raw: &[u8]) -> Result<(Vec<usize>, Vec<f32>), String> {
    if raw.len() < 16 || &raw[0..4] != MAGIC {
        return Err("bad magic or truncated header".into());
    }
    let version = u32::from_le_bytes(raw[4..8].try_into().expect("sized slice"));
    if version != VERSION {
        return Err(format!("unsupported version {version}"));
    }
    let dtype = u32::from_le_bytes(raw[8..12].try_into().expect("sized slice"));
    if dtype != DTYPE_F32 {
        return Err(format!("unsupported dtype {dtype}"));
    }
    let rank = u32::from_le_bytes(raw[12..16].try_into().expect("sized slice")) as usize;
    let dims_end = 16 + rank * 8;
    if raw.len() < dims_end {
        return Err("truncated dims".into());
    }
    let shape: Vec<usize> = (0..rank)
        .map(|i| {
            let at = 16 + i * 8;
            u64::from_le_bytes(raw[at..at + 8].try_into().expect("sized slice")) as usize
        })
        .collect();
    let expected: usize = shape.iter().product();
    let payload = &raw[dims_end..];
    if payload.len() != expected * 4 {
        return Err(format!(
            "payload is {} bytes, shape {:?} wants {}",
            payload.len(),
            shape,
            expected * 4
        ));
    }
    Ok((shape, super::decode_payload(payload)))
}
