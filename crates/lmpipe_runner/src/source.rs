//! Source classification and the filesystem-backed frame iterators.
//!
//! Classification is driven by a media-type table keyed on file
//! extension. A directory counts as an image sequence only when every
//! visible entry in it is an image file; an empty directory passes
//! vacuously. Video files and camera indices additionally need an
//! attached [`VideoDecoder`] to become frame iterators.

use lmpipe_core::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// What kind of input a [`Source`] resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    VideoFile,
    Camera,
    ImageSequence,
    SingleImage,
}

/// Extension -> media type, the union of what the decoders and the
/// image loader are expected to handle.
const MEDIA_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("mpg", "video/mpeg"),
    ("mpeg", "video/mpeg"),
];

fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    MEDIA_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && media_type_for(path)
            .map(|mime| mime.starts_with("image/"))
            .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Resolve a [`Source`] to its [`SourceKind`], or a source error when
/// it names something the pipeline cannot iterate.
pub fn classify(source: &Source) -> PipelineResult<SourceKind> {
    let path = match source {
        Source::Camera(_) => return Ok(SourceKind::Camera),
        Source::Path(path) => path,
    };
    if path.is_dir() {
        let mut entries = fs::read_dir(path)
            .map_err(|e| PipelineError::io(path, e))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| !is_hidden(p));
        if let Some(stray) = entries.find(|p| !is_image_file(p)) {
            return Err(PipelineError::source(format!(
                "directory {} is not an image sequence: {} is not an image",
                path.display(),
                stray.display()
            )));
        }
        return Ok(SourceKind::ImageSequence);
    }
    match media_type_for(path) {
        Some(mime) if mime.starts_with("image/") => Ok(SourceKind::SingleImage),
        Some(mime) if mime.starts_with("video/") => Ok(SourceKind::VideoFile),
        _ => Err(PipelineError::source(format!(
            "unsupported source type: {}",
            path.display()
        ))),
    }
}

/// Build the frame iterator for a classified source. Video and camera
/// inputs require a decoder collaborator.
pub fn frame_source_for(
    source: &Source,
    kind: SourceKind,
    decoder: Option<&Arc<dyn VideoDecoder>>,
) -> PipelineResult<Box<dyn FrameSource>> {
    match (kind, source) {
        (SourceKind::ImageSequence, Source::Path(path)) => {
            Ok(Box::new(ImageSequenceSource::open(path)?))
        }
        (SourceKind::SingleImage, Source::Path(path)) => {
            Ok(Box::new(SingleImageSource::new(path.clone())))
        }
        (SourceKind::VideoFile, Source::Path(path)) => decoder
            .ok_or_else(|| {
                PipelineError::source("video sources need a decoder and none is attached")
            })?
            .open_file(path),
        (SourceKind::Camera, Source::Camera(index)) => decoder
            .ok_or_else(|| {
                PipelineError::source("camera sources need a decoder and none is attached")
            })?
            .open_camera(*index),
        (kind, source) => Err(PipelineError::source(format!(
            "source {source:?} does not match kind {kind:?}"
        ))),
    }
}

/// Frame iterator over a directory of images, visited in lexicographic
/// filename order.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> PipelineResult<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| PipelineError::io(dir, e))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| is_image_file(p) && !is_hidden(p))
            .collect();
        paths.sort();
        debug!(frames = paths.len(), dir = %dir.display(), "image sequence opened");
        Ok(Self { paths, next: 0 })
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Option<PipelineResult<Frame>> {
        let path = self.paths.get(self.next)?.clone();
        let id = self.next as u64;
        self.next += 1;
        Some(load_frame(&path, id))
    }
}

/// Frame iterator over one image file: a single frame, then exhausted.
pub struct SingleImageSource {
    path: Option<PathBuf>,
}

impl SingleImageSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }
}

impl FrameSource for SingleImageSource {
    fn next_frame(&mut self) -> Option<PipelineResult<Frame>> {
        let path = self.path.take()?;
        Some(load_frame(&path, 0))
    }
}

fn load_frame(path: &Path, id: u64) -> PipelineResult<Frame> {
    let image = image::open(path)
        .map_err(|e| PipelineError::Image {
            path: path.to_path_buf(),
            source: e,
        })?
        .to_rgb8();
    Ok(Frame::new(id, image))
}
