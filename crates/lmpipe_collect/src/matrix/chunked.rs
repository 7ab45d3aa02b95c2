//! Chunked directory-store collector (`.lmx`).
//!
//! The target is a directory, `<dst>/landmarks.lmx/`, holding one raw
//! f32 chunk file per append per key plus a `manifest.json` that
//! records the sample shape, the ordered chunk list, and a hex sha256
//! per chunk. Loading re-stacks the chunks into the `(N, *S)` law.

use super::{buffer_result, decode_payload, encode_payload, BufferMap};
use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Path relative to the store root.
    pub relative_path: String,
    pub checksum_sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyManifest {
    /// Shape of one append's sample; the store stacks to
    /// `(chunks.len(), *sample_shape)`.
    pub sample_shape: Vec<usize>,
    pub chunks: Vec<ChunkEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreManifest {
    pub version: u32,
    pub keys: BTreeMap<String, KeyManifest>,
}

pub struct ChunkedMatrixCollector {
    exist_rule: ExistRule,
    root: Option<PathBuf>,
    buffers: BufferMap,
}

impl ChunkedMatrixCollector {
    pub fn new() -> Self {
        Self {
            exist_rule: ExistRule::Proceed,
            root: None,
            buffers: BufferMap::new(),
        }
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(format!("{}.lmx", super::LANDMARKS_STEM))
    }
}

impl Default for ChunkedMatrixCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ChunkedMatrixCollector {
    fn configure(&mut self, options: &LmPipeOptions) {
        self.exist_rule = options.exist_rule;
    }

    fn apply_exist_rule(&self, spec: &RunSpec) -> PipelineResult<bool> {
        evaluate_exist_rule(self.exist_rule, &self.target(spec))
    }

    fn open(&mut self, spec: &RunSpec) -> PipelineResult<()> {
        let root = self.target(spec);
        fs::create_dir_all(&root).map_err(|e| PipelineError::io(&root, e))?;
        self.root = Some(root);
        self.buffers.clear();
        Ok(())
    }

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()> {
        buffer_result(&mut self.buffers, result)
    }

    fn close(&mut self) -> PipelineResult<()> {
        let root = self
            .root
            .take()
            .ok_or_else(|| PipelineError::Config("close before open".into()))?;

        // Keys flush independently, one chunk file per append.
        let flushed: Vec<(String, KeyManifest)> = self
            .buffers
            .par_iter()
            .map(|(key, buf)| -> PipelineResult<(String, KeyManifest)> {
                let key_dir = root.join(key);
                fs::create_dir_all(&key_dir).map_err(|e| PipelineError::io(&key_dir, e))?;
                let mut chunks = Vec::with_capacity(buf.count());
                for i in 0..buf.count() {
                    let payload = encode_payload(buf.chunk(i));
                    let fname = format!("chunk_{i:05}.bin");
                    let chunk_path = key_dir.join(&fname);
                    fs::write(&chunk_path, &payload)
                        .map_err(|e| PipelineError::io(&chunk_path, e))?;
                    let checksum = sha2::Sha256::digest(&payload);
                    chunks.push(ChunkEntry {
                        relative_path: format!("{key}/{fname}"),
                        checksum_sha256: format!("{checksum:x}"),
                    });
                }
                Ok((
                    key.clone(),
                    KeyManifest {
                        sample_shape: buf.sample_shape().to_vec(),
                        chunks,
                    },
                ))
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        let manifest = StoreManifest {
            version: MANIFEST_VERSION,
            keys: flushed.into_iter().collect(),
        };
        let manifest_path = root.join("manifest.json");
        let data = serde_json::to_vec_pretty(&manifest).map_err(|e| PipelineError::Json {
            path: manifest_path.clone(),
            source: e,
        })?;
        fs::write(&manifest_path, data).map_err(|e| PipelineError::io(&manifest_path, e))?;
        debug!(keys = manifest.keys.len(), root = %root.display(), "chunked landmarks flushed");
        self.buffers.clear();
        Ok(())
    }
}

/// Reader side of the chunked store.
pub struct ChunkedStoreReader {
    root: PathBuf,
    manifest: StoreManifest,
}

impl ChunkedStoreReader {
    pub fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        let manifest_path = root.join("manifest.json");
        let raw = fs::read(&manifest_path).map_err(|e| PipelineError::io(&manifest_path, e))?;
        let manifest: StoreManifest =
            serde_json::from_slice(&raw).map_err(|e| PipelineError::Json {
                path: manifest_path,
                source: e,
            })?;
        Ok(Self { root, manifest })
    }

    pub fn keys(&self) -> Vec<&str> {
        self.manifest.keys.keys().map(String::as_str).collect()
    }

    /// Re-stack one key's chunks into `(shape, data)`, verifying each
    /// chunk's checksum on the way.
    pub fn load_key(&self, key: &str) -> PipelineResult<(Vec<usize>, Vec<f32>)> {
        let entry = self.manifest.keys.get(key).ok_or_else(|| {
            PipelineError::Config(format!("key '{key}' not present in chunked store"))
        })?;
        let mut data = Vec::new();
        for chunk in &entry.chunks {
            let path = self.root.join(&chunk.relative_path);
            let raw = fs::read(&path).map_err(|e| PipelineError::io(&path, e))?;
            let checksum = format!("{:x}", sha2::Sha256::digest(&raw));
            if checksum != chunk.checksum_sha256 {
                return Err(PipelineError::Config(format!(
                    "checksum mismatch for chunk {}",
                    chunk.relative_path
                )));
            }
            data.extend(decode_payload(&raw));
        }
        let mut shape = Vec::with_capacity(entry.sample_shape.len() + 1);
        shape.push(entry.chunks.len());
        shape.extend_from_slice(&entry.sample_shape);
        Ok((shape, data))
    }
}
