//! The landmark-matrix collector family.
//!
//! Two structural modes share one contract: per-key mode writes one
//! physical file per key under `<dst>/landmarks/`, container mode
//! writes a single `<dst>/landmarks<ext>` artifact holding every key.
//!
//! The stacking invariant applies to every numeric backend: each
//! `append` call for a key contributes one new leading-dimension slot
//! holding that call's full sample, so N appends of shape `S` land on
//! disk as `(N, *S)`. Appends stack; they never concatenate along the
//! frame axis. Text formats instead flatten each frame into one row
//! per frame per append.

mod array;
mod chunked;
mod container;
mod flat;
mod json;
mod text;

pub use array::{read_array, ArrayMatrixCollector};
pub use chunked::{ChunkedMatrixCollector, ChunkedStoreReader};
pub use container::{read_container, ContainerMatrixCollector};
pub use flat::{read_flat, FlatMatrixCollector};
pub use json::{read_json, JsonMatrixCollector};
pub use text::TextMatrixCollector;

use crate::collector::Collector;
use lmpipe_core::prelude::*;
use std::collections::BTreeMap;

pub(crate) const LANDMARKS_STEM: &str = "landmarks";

/// Storage backend for landmark matrices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixFormat {
    /// Delimited text, one file per key, one row per frame.
    Text { delimiter: char, extension: String },
    /// Binary single-array file per key (`.lma`).
    Array,
    /// Binary multi-array container (`.lmc`).
    Container,
    /// JSON tensor container (`.json`).
    Json,
    /// Flat serialized-tensor container (`.lmf`): JSON header plus one
    /// contiguous payload region.
    Flat,
    /// Chunked directory store (`.lmx`): one chunk file per append per
    /// key plus a checksummed manifest.
    Chunked,
}

impl MatrixFormat {
    /// Resolve a format from options. An explicit extension overrides
    /// delimiter auto-detection; an unknown delimiter falls back to a
    /// generic `.txt` text format; an unknown extension is a
    /// configuration error, raised here and never at write time.
    pub fn from_options(options: &LmPipeOptions) -> PipelineResult<Self> {
        if let Some(ext) = options.extension.as_deref() {
            return Self::from_extension(ext, options.delimiter);
        }
        Ok(match options.delimiter {
            None | Some(',') => MatrixFormat::Text {
                delimiter: ',',
                extension: ".csv".to_string(),
            },
            Some('\t') => MatrixFormat::Text {
                delimiter: '\t',
                extension: ".tsv".to_string(),
            },
            Some(other) => MatrixFormat::Text {
                delimiter: other,
                extension: ".txt".to_string(),
            },
        })
    }

    pub fn from_extension(ext: &str, delimiter: Option<char>) -> PipelineResult<Self> {
        let normalized = if ext.starts_with('.') {
            ext.to_string()
        } else {
            format!(".{ext}")
        };
        match normalized.as_str() {
            ".csv" => Ok(MatrixFormat::Text {
                delimiter: delimiter.unwrap_or(','),
                extension: normalized,
            }),
            ".tsv" => Ok(MatrixFormat::Text {
                delimiter: delimiter.unwrap_or('\t'),
                extension: normalized,
            }),
            ".txt" => Ok(MatrixFormat::Text {
                delimiter: delimiter.unwrap_or(','),
                extension: normalized,
            }),
            ".lma" => Ok(MatrixFormat::Array),
            ".lmc" => Ok(MatrixFormat::Container),
            ".json" => Ok(MatrixFormat::Json),
            ".lmf" => Ok(MatrixFormat::Flat),
            ".lmx" => Ok(MatrixFormat::Chunked),
            other => Err(PipelineError::Config(format!(
                "unknown landmark output extension '{other}'"
            ))),
        }
    }

    /// Per-key formats write `<dst>/landmarks/<key><ext>`.
    pub fn is_perkey(&self) -> bool {
        matches!(self, MatrixFormat::Text { .. } | MatrixFormat::Array)
    }

    /// Container formats write a single `<dst>/landmarks<ext>`.
    pub fn is_container(&self) -> bool {
        !self.is_perkey()
    }

    pub fn extension(&self) -> &str {
        match self {
            MatrixFormat::Text { extension, .. } => extension,
            MatrixFormat::Array => ".lma",
            MatrixFormat::Container => ".lmc",
            MatrixFormat::Json => ".json",
            MatrixFormat::Flat => ".lmf",
            MatrixFormat::Chunked => ".lmx",
        }
    }
}

/// Creator function per format; keeps the family flat rather than deep.
pub fn matrix_collector(format: MatrixFormat) -> Box<dyn Collector> {
    match format {
        MatrixFormat::Text {
            delimiter,
            extension,
        } => Box::new(TextMatrixCollector::new(delimiter, extension)),
        MatrixFormat::Array => Box::new(ArrayMatrixCollector::new()),
        MatrixFormat::Container => Box::new(ContainerMatrixCollector::new()),
        MatrixFormat::Json => Box::new(JsonMatrixCollector::new()),
        MatrixFormat::Flat => Box::new(FlatMatrixCollector::new()),
        MatrixFormat::Chunked => Box::new(ChunkedMatrixCollector::new()),
    }
}

/// Resolve the format from options, build the collector, and let it
/// absorb the rest of the configuration.
pub fn matrix_collector_from_options(
    options: &LmPipeOptions,
) -> PipelineResult<Box<dyn Collector>> {
    let format = MatrixFormat::from_options(options)?;
    let mut collector = matrix_collector(format);
    collector.configure(options);
    Ok(collector)
}

/// Buffered accumulation state for one key in a stacking backend.
///
/// The first append binds the sample shape; every later append must
/// match it exactly or the offending append fails with no partial
/// write. Samples live contiguously so the stacked payload is a
/// single flat slice.
#[derive(Debug, Clone)]
pub(crate) struct StackBuffer {
    sample_shape: Vec<usize>,
    sample_len: usize,
    count: usize,
    data: Vec<f32>,
}

impl StackBuffer {
    pub(crate) fn new(first: &LandmarkArray) -> Self {
        let mut buf = Self {
            sample_shape: first.shape().to_vec(),
            sample_len: first.len(),
            count: 0,
            data: Vec::new(),
        };
        buf.accept(first);
        buf
    }

    pub(crate) fn push(&mut self, key: &str, sample: &LandmarkArray) -> PipelineResult<()> {
        if sample.shape() != self.sample_shape.as_slice() {
            return Err(PipelineError::Shape {
                key: key.to_string(),
                msg: format!(
                    "append sample shape {:?} differs from first-seen {:?}",
                    sample.shape(),
                    self.sample_shape
                ),
            });
        }
        self.accept(sample);
        Ok(())
    }

    fn accept(&mut self, sample: &LandmarkArray) {
        self.data.extend_from_slice(sample.data());
        self.count += 1;
    }

    /// On-disk shape after stacking: `(count, *sample_shape)`.
    pub(crate) fn stacked_shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.sample_shape.len() + 1);
        shape.push(self.count);
        shape.extend_from_slice(&self.sample_shape);
        shape
    }

    pub(crate) fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    pub(crate) fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// The i-th append's payload slice.
    pub(crate) fn chunk(&self, i: usize) -> &[f32] {
        &self.data[i * self.sample_len..(i + 1) * self.sample_len]
    }
}

/// Little-endian f32 payload encoding shared by every binary backend,
/// so identical buffers serialize byte-for-byte identically across
/// the single-array and container formats.
pub(crate) fn encode_payload(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn decode_payload(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(c);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Per-key buffers keyed deterministically.
pub(crate) type BufferMap = BTreeMap<String, StackBuffer>;

/// Route one result's keys into the buffer map, enforcing the shape
/// invariant per key.
pub(crate) fn buffer_result(buffers: &mut BufferMap, result: &ProcessResult) -> PipelineResult<()> {
    for (key, sample) in &result.landmarks {
        match buffers.get_mut(key) {
            Some(buf) => buf.push(key, sample)?,
            None => {
                buffers.insert(key.clone(), StackBuffer::new(sample));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(shape: &[usize]) -> LandmarkArray {
        let len = shape.iter().product();
        LandmarkArray::new(shape.to_vec(), vec![1.0; len]).unwrap()
    }

    #[test]
    fn format_selection_by_delimiter() {
        let mut opts = LmPipeOptions::default();
        assert_eq!(
            MatrixFormat::from_options(&opts).unwrap().extension(),
            ".csv"
        );
        opts.delimiter = Some('\t');
        assert_eq!(
            MatrixFormat::from_options(&opts).unwrap().extension(),
            ".tsv"
        );
        opts.delimiter = Some(';');
        // unknown delimiter falls back to the generic textual extension
        assert_eq!(
            MatrixFormat::from_options(&opts).unwrap().extension(),
            ".txt"
        );
    }

    #[test]
    fn explicit_extension_overrides_delimiter() {
        let opts = LmPipeOptions {
            delimiter: Some('\t'),
            extension: Some(".lmc".into()),
            ..Default::default()
        };
        assert_eq!(MatrixFormat::from_options(&opts).unwrap(), MatrixFormat::Container);
    }

    #[test]
    fn unknown_extension_is_a_config_error() {
        let err = MatrixFormat::from_extension(".parquet", None).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn perkey_and_container_modes_are_disjoint() {
        for (format, perkey) in [
            (MatrixFormat::from_extension(".csv", None).unwrap(), true),
            (MatrixFormat::Array, true),
            (MatrixFormat::Container, false),
            (MatrixFormat::Json, false),
            (MatrixFormat::Flat, false),
            (MatrixFormat::Chunked, false),
        ] {
            assert_eq!(format.is_perkey(), perkey);
            assert_eq!(format.is_container(), !perkey);
        }
    }

    #[test]
    fn stack_buffer_stacks_along_new_leading_dim() {
        let mut buf = StackBuffer::new(&sample(&[4, 3, 3]));
        buf.push("pose", &sample(&[4, 3, 3])).unwrap();
        assert_eq!(buf.stacked_shape(), vec![2, 4, 3, 3]);
        assert_eq!(buf.data().len(), 2 * 4 * 3 * 3);
    }

    #[test]
    fn stack_buffer_rejects_shape_drift() {
        let mut buf = StackBuffer::new(&sample(&[3, 3]));
        let err = buf.push("pose", &sample(&[3, 2])).unwrap_err();
        assert!(matches!(err, PipelineError::Shape { ref key, .. } if key == "pose"));
        // nothing partial was written
        assert_eq!(buf.count(), 1);
        assert_eq!(buf.data().len(), 9);
    }

    #[test]
    fn payload_roundtrip() {
        let values = [0.0f32, -1.5, 3.25, f32::MAX];
        assert_eq!(decode_payload(&encode_payload(&values)), values);
    }
}
