//! Annotated-frame collectors: numbered image sequences or a single
//! video container.

use crate::collector::{evaluate_exist_rule, Collector};
use lmpipe_core::prelude::*;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) const FRAMES_STEM: &str = "annotated_frames";

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".bmp", ".tiff"];

/// Extension-driven codec selection with a safe fallback for anything
/// unrecognized.
pub fn codec_for_extension(ext: &str) -> &'static str {
    match ext.trim_start_matches('.') {
        "mp4" | "mov" | "mkv" => "libx264",
        "avi" => "mjpeg",
        "webm" => "libvpx-vp9",
        _ => "mjpeg",
    }
}

/// Writes one numbered image per annotated frame under
/// `<dst>/annotated_frames/`.
pub struct SequenceFramesCollector {
    extension: String,
    exist_rule: ExistRule,
    out_dir: Option<PathBuf>,
    written: u64,
}

impl SequenceFramesCollector {
    /// Extension must name a supported image format; anything else is
    /// a configuration error raised here, not at write time.
    pub fn new(extension: impl Into<String>) -> PipelineResult<Self> {
        let extension = extension.into();
        if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            return Err(PipelineError::Config(format!(
                "unsupported annotated-frame image extension '{extension}'"
            )));
        }
        Ok(Self {
            extension,
            exist_rule: ExistRule::Proceed,
            out_dir: None,
            written: 0,
        })
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(FRAMES_STEM)
    }
}

impl Collector for SequenceFramesCollector {
    fn configure(&mut self, options: &LmPipeOptions) {
        self.exist_rule = options.exist_rule;
    }

    fn apply_exist_rule(&self, spec: &RunSpec) -> PipelineResult<bool> {
        evaluate_exist_rule(self.exist_rule, &self.target(spec))
    }

    fn wants_annotated(&self) -> bool {
        true
    }

    fn open(&mut self, spec: &RunSpec) -> PipelineResult<()> {
        let dir = self.target(spec);
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        self.out_dir = Some(dir);
        self.written = 0;
        Ok(())
    }

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()> {
        let Some(frame) = result.annotated.as_ref() else {
            warn!(frame_id = result.frame_id, "result carries no annotated frame; skipping");
            return Ok(());
        };
        let dir = self
            .out_dir
            .as_ref()
            .ok_or_else(|| PipelineError::Config("append before open".into()))?;
        let path = dir.join(format!("frame_{:06}{}", result.frame_id, self.extension));
        frame.save(&path).map_err(|e| PipelineError::Image {
            path: path.clone(),
            source: e,
        })?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> PipelineResult<()> {
        if let Some(dir) = self.out_dir.take() {
            debug!(frames = self.written, dir = %dir.display(), "annotated frame sequence closed");
        }
        Ok(())
    }
}

/// Writes every annotated frame into one `<dst>/annotated_frames<ext>`
/// video container through a caller-supplied encoder factory.
pub struct VideoFramesCollector {
    factory: Arc<dyn VideoEncoderFactory>,
    params: VideoParams,
    extension: String,
    codec: &'static str,
    exist_rule: ExistRule,
    encoder: Option<Box<dyn VideoEncoder>>,
    written: u64,
}

impl VideoFramesCollector {
    /// Video mode must know its geometry and frame rate up front.
    pub fn new(
        factory: Arc<dyn VideoEncoderFactory>,
        params: Option<VideoParams>,
        extension: impl Into<String>,
    ) -> PipelineResult<Self> {
        let params = params.ok_or_else(|| {
            PipelineError::Config(
                "video output requires height, width, and frame rate up front".into(),
            )
        })?;
        if params.width == 0 || params.height == 0 || params.fps <= 0.0 {
            return Err(PipelineError::Config(format!(
                "invalid video parameters {}x{} @ {}",
                params.width, params.height, params.fps
            )));
        }
        let extension = extension.into();
        let codec = codec_for_extension(&extension);
        Ok(Self {
            factory,
            params,
            extension,
            codec,
            exist_rule: ExistRule::Proceed,
            encoder: None,
            written: 0,
        })
    }

    fn target(&self, spec: &RunSpec) -> PathBuf {
        spec.dst.join(format!("{}{}", FRAMES_STEM, self.extension))
    }
}

impl Collector for VideoFramesCollector {
    fn configure(&mut self, options: &LmPipeOptions) {
        self.exist_rule = options.exist_rule;
    }

    fn apply_exist_rule(&self, spec: &RunSpec) -> PipelineResult<bool> {
        evaluate_exist_rule(self.exist_rule, &self.target(spec))
    }

    fn wants_annotated(&self) -> bool {
        true
    }

    fn open(&mut self, spec: &RunSpec) -> PipelineResult<()> {
        fs::create_dir_all(&spec.dst).map_err(|e| PipelineError::io(&spec.dst, e))?;
        let path = self.target(spec);
        self.encoder = Some(self.factory.open(&path, self.codec, self.params)?);
        self.written = 0;
        Ok(())
    }

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()> {
        let Some(frame) = result.annotated.as_ref() else {
            warn!(frame_id = result.frame_id, "result carries no annotated frame; skipping");
            return Ok(());
        };
        if (frame.width(), frame.height()) != (self.params.width, self.params.height) {
            return Err(PipelineError::Config(format!(
                "frame {} is {}x{}, encoder expects {}x{}",
                result.frame_id,
                frame.width(),
                frame.height(),
                self.params.width,
                self.params.height
            )));
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| PipelineError::Config("append before open".into()))?;
        encoder.write_frame(frame)?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> PipelineResult<()> {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.finish()?;
            debug!(frames = self.written, codec = self.codec, "annotated video closed");
        }
        Ok(())
    }
}

/// Default real encoder: pipes raw RGB24 into a child `ffmpeg`.
pub struct FfmpegEncoderFactory;

impl VideoEncoderFactory for FfmpegEncoderFactory {
    fn open(
        &self,
        path: &Path,
        codec: &str,
        params: VideoParams,
    ) -> PipelineResult<Box<dyn VideoEncoder>> {
        let child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{}x{}", params.width, params.height))
            .arg("-r")
            .arg(format!("{}", params.fps))
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg(codec)
            .arg(path)
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::io(path, e))?;
        Ok(Box::new(FfmpegEncoder {
            child,
            path: path.to_path_buf(),
        }))
    }
}

struct FfmpegEncoder {
    child: Child,
    path: PathBuf,
}

impl VideoEncoder for FfmpegEncoder {
    fn write_frame(&mut self, frame: &image::RgbImage) -> PipelineResult<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Config("ffmpeg stdin already closed".into()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| PipelineError::io(&self.path, e))
    }

    fn finish(&mut self) -> PipelineResult<()> {
        drop(self.child.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| PipelineError::io(&self.path, e))?;
        if !status.success() {
            return Err(PipelineError::Config(format!(
                "ffmpeg exited with {status} while writing {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct EncoderLog {
        frames: AtomicUsize,
        finishes: AtomicUsize,
        opened: Mutex<Vec<(PathBuf, String)>>,
    }

    struct RecordingFactory {
        log: Arc<EncoderLog>,
    }

    impl VideoEncoderFactory for RecordingFactory {
        fn open(
            &self,
            path: &Path,
            codec: &str,
            _params: VideoParams,
        ) -> PipelineResult<Box<dyn VideoEncoder>> {
            self.log
                .opened
                .lock()
                .unwrap()
                .push((path.to_path_buf(), codec.to_string()));
            Ok(Box::new(RecordingEncoder {
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct RecordingEncoder {
        log: Arc<EncoderLog>,
    }

    impl VideoEncoder for RecordingEncoder {
        fn write_frame(&mut self, _frame: &image::RgbImage) -> PipelineResult<()> {
            self.log.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&mut self) -> PipelineResult<()> {
            self.log.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn annotated_result(frame_id: u64, w: u32, h: u32) -> ProcessResult {
        ProcessResult {
            frame_id,
            headers: Arc::new(HeaderMap::new()),
            landmarks: LandmarkMap::new(),
            annotated: Some(image::RgbImage::new(w, h)),
        }
    }

    fn video_collector(log: &Arc<EncoderLog>) -> VideoFramesCollector {
        VideoFramesCollector::new(
            Arc::new(RecordingFactory {
                log: Arc::clone(log),
            }),
            Some(VideoParams {
                width: 4,
                height: 3,
                fps: 10.0,
            }),
            ".mp4",
        )
        .unwrap()
    }

    #[test]
    fn video_collector_writes_frames_and_finishes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = RunSpec {
            src: Source::Camera(0),
            dst: tmp.path().join("out"),
        };
        let log = Arc::new(EncoderLog::default());
        let mut collector = video_collector(&log);
        let results = [annotated_result(0, 4, 3), annotated_result(1, 4, 3)];
        collector
            .collect_results(&spec, &mut results.iter())
            .unwrap();

        assert_eq!(log.frames.load(Ordering::SeqCst), 2);
        assert_eq!(log.finishes.load(Ordering::SeqCst), 1);
        let opened = log.opened.lock().unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, spec.dst.join("annotated_frames.mp4"));
        assert_eq!(opened[0].1, "libx264");
    }

    #[test]
    fn video_collector_rejects_geometry_drift_but_still_finishes() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = RunSpec {
            src: Source::Camera(0),
            dst: tmp.path().join("out"),
        };
        let log = Arc::new(EncoderLog::default());
        let mut collector = video_collector(&log);
        let results = [annotated_result(0, 4, 3), annotated_result(1, 5, 3)];
        let err = collector
            .collect_results(&spec, &mut results.iter())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        // the good frame was encoded, the encoder was closed anyway
        assert_eq!(log.frames.load(Ordering::SeqCst), 1);
        assert_eq!(log.finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn codec_table_falls_back_safely() {
        assert_eq!(codec_for_extension(".mp4"), "libx264");
        assert_eq!(codec_for_extension(".avi"), "mjpeg");
        assert_eq!(codec_for_extension(".weird"), "mjpeg");
    }

    #[test]
    fn sequence_collector_rejects_unknown_extension() {
        let err = SequenceFramesCollector::new(".exr").err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn video_collector_requires_params_up_front() {
        let err = VideoFramesCollector::new(Arc::new(FfmpegEncoderFactory), None, ".mp4")
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
