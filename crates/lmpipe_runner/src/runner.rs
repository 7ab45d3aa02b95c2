//! The run loop: classify, pre-flight, pump, collect, close.

use crate::executor::{executor_from_options, TaskHandle};
use crate::source::{classify, frame_source_for};
use lmpipe_collect::Collector;
use lmpipe_core::prelude::*;
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Summary of one completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub frames: u64,
    pub collectors_run: usize,
    pub collectors_skipped: usize,
}

/// Owns the estimator factory, the attached collectors, and the
/// options; drives one source through the pipeline per `run` call.
pub struct Runner {
    options: LmPipeOptions,
    factory: EstimatorFactory,
    collectors: Vec<Box<dyn Collector>>,
    decoder: Option<Arc<dyn VideoDecoder>>,
}

impl Runner {
    pub fn new(factory: EstimatorFactory, options: LmPipeOptions) -> Self {
        Self {
            options,
            factory,
            collectors: Vec::new(),
            decoder: None,
        }
    }

    /// Attach a collector; it absorbs the runner's options here.
    pub fn attach(&mut self, mut collector: Box<dyn Collector>) -> &mut Self {
        collector.configure(&self.options);
        self.collectors.push(collector);
        self
    }

    /// Attach the decoding collaborator for video and camera sources.
    pub fn attach_decoder(&mut self, decoder: Arc<dyn VideoDecoder>) -> &mut Self {
        self.decoder = Some(decoder);
        self
    }

    /// Process the source named by `spec` to completion.
    pub fn run(&mut self, spec: &RunSpec) -> PipelineResult<RunReport> {
        let kind = classify(&spec.src)?;
        debug!(?kind, src = ?spec.src, "source classified");
        let source = frame_source_for(&spec.src, kind, self.decoder.as_ref())?;
        self.run_source(spec, source)
    }

    /// Process an already-open frame iterator. `spec.src` is kept for
    /// provenance only; frames come from `source`.
    pub fn run_source(
        &mut self,
        spec: &RunSpec,
        mut source: Box<dyn FrameSource>,
    ) -> PipelineResult<RunReport> {
        // Pre-flight strictly before any frame work or dst creation:
        // an exist-rule conflict aborts with the target untouched, a
        // skip drops that collector from this run.
        let mut active = Vec::with_capacity(self.collectors.len());
        for (i, collector) in self.collectors.iter().enumerate() {
            if collector.apply_exist_rule(spec)? {
                active.push(i);
            }
        }
        let skipped = self.collectors.len() - active.len();
        if active.is_empty() {
            info!(dst = %spec.dst.display(), "every collector skipped; nothing to do");
            return Ok(RunReport {
                frames: 0,
                collectors_run: 0,
                collectors_skipped: skipped,
            });
        }

        fs::create_dir_all(&spec.dst).map_err(|e| PipelineError::io(&spec.dst, e))?;

        let annotate = active.iter().any(|&i| self.collectors[i].wants_annotated());
        let mut executor =
            executor_from_options(&self.options, Arc::clone(&self.factory), annotate)?;

        let mut opened: Vec<usize> = Vec::with_capacity(active.len());
        for &i in &active {
            if let Err(e) = self.collectors[i].open(spec) {
                for &j in &opened {
                    if let Err(close_err) = self.collectors[j].close() {
                        error!(error = %close_err, "collector close failed during abort");
                    }
                }
                return Err(e);
            }
            opened.push(i);
        }

        // Bounded in-flight window. Handles are awaited in submission
        // order, so collectors observe frames in frame order no matter
        // how the executor interleaves completion.
        let cap = self.options.max_in_flight.max(1);
        let mut window: VecDeque<TaskHandle> = VecDeque::with_capacity(cap);
        let mut frames = 0u64;
        let mut outcome = Ok(());

        loop {
            match source.next_frame() {
                Some(Ok(frame)) => {
                    window.push_back(executor.submit(frame));
                    if window.len() >= cap {
                        if let Err(e) = self.drain_one(&mut window, &opened, &mut frames) {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    outcome = Err(e);
                    break;
                }
                None => break,
            }
        }
        while outcome.is_ok() && !window.is_empty() {
            if let Err(e) = self.drain_one(&mut window, &opened, &mut frames) {
                outcome = Err(e);
            }
        }

        executor.shutdown(outcome.is_ok(), outcome.is_err());

        // Every opened collector closes even when the run failed; the
        // run error wins over a close error.
        let mut close_outcome = Ok(());
        for &i in &opened {
            match self.collectors[i].close() {
                Ok(()) => {}
                Err(e) if close_outcome.is_ok() => close_outcome = Err(e),
                Err(e) => error!(error = %e, "additional collector close failure"),
            }
        }
        outcome.and(close_outcome)?;

        info!(frames, collectors = opened.len(), skipped, dst = %spec.dst.display(), "run complete");
        Ok(RunReport {
            frames,
            collectors_run: opened.len(),
            collectors_skipped: skipped,
        })
    }

    fn drain_one(
        &mut self,
        window: &mut VecDeque<TaskHandle>,
        opened: &[usize],
        frames: &mut u64,
    ) -> PipelineResult<()> {
        let Some(handle) = window.pop_front() else {
            return Ok(());
        };
        let result = handle.wait()?;
        for &i in opened {
            self.collectors[i].append(&result)?;
        }
        *frames += 1;
        Ok(())
    }
}
