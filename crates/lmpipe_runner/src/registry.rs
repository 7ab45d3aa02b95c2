//! Named estimator factories.

use image::{Rgb, RgbImage};
use lmpipe_core::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name -> factory map so callers (the CLI, embedders) can pick an
/// estimator by string without linking its constructor directly.
pub struct EstimatorRegistry {
    factories: BTreeMap<String, EstimatorFactory>,
}

impl EstimatorRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in estimators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("grid", Arc::new(|| Box::new(GridEstimator::new(3, 3))));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: EstimatorFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> PipelineResult<EstimatorFactory> {
        self.factories.get(name).cloned().ok_or_else(|| {
            PipelineError::Config(format!(
                "no estimator named '{name}'; known: {}",
                self.names().join(", ")
            ))
        })
    }
}

impl Default for EstimatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Deterministic synthetic estimator: places a `rows x cols` grid of
/// points over the frame and reports each point's pixel position plus
/// a confidence derived from the frame id. Exists for pipeline
/// exercise and smoke runs, not for real detection.
pub struct GridEstimator {
    rows: usize,
    cols: usize,
}

impl GridEstimator {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    fn points(&self, frame: &Frame) -> Vec<(u32, u32)> {
        let (w, h) = frame.image.dimensions();
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                let x = (c as u32 + 1) * w / (self.cols as u32 + 1);
                let y = (r as u32 + 1) * h / (self.rows as u32 + 1);
                out.push((x.min(w.saturating_sub(1)), y.min(h.saturating_sub(1))));
            }
        }
        out
    }
}

impl Estimator for GridEstimator {
    fn setup(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    fn shape(&self) -> BTreeMap<String, (usize, usize)> {
        BTreeMap::from([("grid".to_string(), (self.rows * self.cols, 3))])
    }

    fn headers(&self) -> HeaderMap {
        let mut columns = Vec::with_capacity(self.rows * self.cols * 3);
        for p in 0..self.rows * self.cols {
            for axis in ["x", "y", "conf"] {
                columns.push(format!("p{p}_{axis}"));
            }
        }
        BTreeMap::from([("grid".to_string(), columns)])
    }

    fn estimate(&mut self, frame: &Frame) -> PipelineResult<LandmarkMap> {
        let conf = 1.0 / (1.0 + frame.id as f32);
        let mut data = Vec::with_capacity(self.rows * self.cols * 3);
        for (x, y) in self.points(frame) {
            data.push(x as f32);
            data.push(y as f32);
            data.push(conf);
        }
        let mut out = LandmarkMap::new();
        out.insert(
            "grid".to_string(),
            LandmarkArray::new(vec![self.rows * self.cols, 3], data)?,
        );
        Ok(out)
    }

    fn annotate(&self, frame: &Frame, _landmarks: &LandmarkMap) -> PipelineResult<RgbImage> {
        let mut image = frame.image.clone();
        for (x, y) in self.points(frame) {
            image.put_pixel(x, y, Rgb([255, 0, 0]));
        }
        Ok(image)
    }
}
