//! Shared estimator/source/sink interfaces.

use crate::error::{PipelineError, PipelineResult};
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Ordered column names per landmark key.
pub type HeaderMap = BTreeMap<String, Vec<String>>;
/// Per-key numeric output of one estimate call.
pub type LandmarkMap = BTreeMap<String, LandmarkArray>;

/// A decoded frame of input, handed to the estimator.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(id: u64, image: RgbImage) -> Self {
        Self { id, image }
    }
}

/// A dense numeric sample: a shape and its row-major f32 payload.
///
/// One `LandmarkArray` is what an estimator emits for one key on one
/// frame (typically `(rows, cols)`), and what a matrix collector
/// stacks or row-flattens into storage.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl LandmarkArray {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> PipelineResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(PipelineError::Config(format!(
                "landmark array shape {:?} wants {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shape of everything after the leading axis ("sample width").
    pub fn tail_shape(&self) -> &[usize] {
        if self.shape.len() <= 1 {
            &[]
        } else {
            &self.shape[1..]
        }
    }

    /// Text-format view: `(rows, row_width)`.
    ///
    /// Rank <= 2 samples flatten to a single row of their full width;
    /// rank >= 3 samples contribute `shape[0]` rows of the flattened
    /// tail width each.
    pub fn frame_rows(&self) -> (usize, usize) {
        if self.shape.len() <= 2 {
            (1, self.data.len())
        } else {
            (self.shape[0], self.shape[1..].iter().product())
        }
    }
}

/// Landmark-detection capability consumed by the runner.
///
/// The key set exposed by `shape`/`headers` is stable for the lifetime
/// of one estimator instance, and `estimate` yields one array per key.
pub trait Estimator: Send {
    /// One-time initialization (model loading). Worker-pool backends
    /// call this once per worker, never sharing the initialized state.
    fn setup(&mut self) -> PipelineResult<()>;

    /// Per-key `(rows, cols)` of a single-frame sample.
    fn shape(&self) -> BTreeMap<String, (usize, usize)>;

    /// Per-key ordered column names for text output.
    fn headers(&self) -> HeaderMap;

    fn estimate(&mut self, frame: &Frame) -> PipelineResult<LandmarkMap>;

    /// Draw landmarks onto a copy of the frame.
    fn annotate(&self, frame: &Frame, landmarks: &LandmarkMap) -> PipelineResult<RgbImage>;
}

/// Factory for per-worker estimator instances.
pub type EstimatorFactory = Arc<dyn Fn() -> Box<dyn Estimator> + Send + Sync>;

/// One processed frame, in `frame_id` order at the collector boundary.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub frame_id: u64,
    pub headers: Arc<HeaderMap>,
    pub landmarks: LandmarkMap,
    pub annotated: Option<RgbImage>,
}

/// Pulls frames from some source (image sequence, decoder stream, test
/// generator). Finite sources return `None` when exhausted; camera
/// streams run until the caller stops pulling.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<PipelineResult<Frame>>;
}

/// External decoding collaborator for video files and camera streams.
/// Decoding primitives are not part of this crate; the runner only
/// needs "open this, give me frames".
pub trait VideoDecoder: Send + Sync {
    fn open_file(&self, path: &Path) -> PipelineResult<Box<dyn FrameSource>>;
    fn open_camera(&self, index: u32) -> PipelineResult<Box<dyn FrameSource>>;
}

/// Parameters a video sink must know before the first frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Consumes annotated frames into a single video container.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()>;
    fn finish(&mut self) -> PipelineResult<()>;
}

/// Opens a `VideoEncoder` for a target path, codec, and geometry.
pub trait VideoEncoderFactory: Send + Sync {
    fn open(
        &self,
        path: &Path,
        codec: &str,
        params: VideoParams,
    ) -> PipelineResult<Box<dyn VideoEncoder>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmark_array_rejects_shape_data_mismatch() {
        let err = LandmarkArray::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn frame_rows_flattens_low_rank_to_one_row() {
        let arr = LandmarkArray::new(vec![3, 3], vec![0.0; 9]).unwrap();
        assert_eq!(arr.frame_rows(), (1, 9));
        assert_eq!(arr.tail_shape(), &[3]);
    }

    #[test]
    fn frame_rows_keeps_leading_axis_for_high_rank() {
        let arr = LandmarkArray::new(vec![4, 3, 2], vec![0.0; 24]).unwrap();
        assert_eq!(arr.frame_rows(), (4, 6));
        assert_eq!(arr.tail_shape(), &[3, 2]);
    }
}
