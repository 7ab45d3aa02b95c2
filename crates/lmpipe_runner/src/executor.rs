//! Execution backends for per-frame estimation.
//!
//! Every backend speaks the same submit/wait protocol: `submit` hands a
//! frame over and returns a [`TaskHandle`]; waiting on handles in
//! submission order is what gives the run loop its ordering guarantee,
//! whatever order the backend completes work in. A handle whose task
//! was cancelled or whose worker died resolves to a task error rather
//! than hanging.

use crossbeam_channel::{bounded, Receiver, Sender};
use lmpipe_core::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A claim on one submitted frame's eventual result.
pub struct TaskHandle {
    frame_id: u64,
    rx: Receiver<PipelineResult<ProcessResult>>,
}

impl TaskHandle {
    fn pending(frame_id: u64) -> (Self, Sender<PipelineResult<ProcessResult>>) {
        let (tx, rx) = bounded(1);
        (Self { frame_id, rx }, tx)
    }

    fn completed(frame_id: u64, result: PipelineResult<ProcessResult>) -> Self {
        let (handle, tx) = Self::pending(frame_id);
        let _ = tx.send(result);
        handle
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Block until the task resolves. A disconnected channel means the
    /// task was dropped before completion (cancel or worker death).
    pub fn wait(self) -> PipelineResult<ProcessResult> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(PipelineError::task(self.frame_id, "task dropped before completion")))
    }
}

/// Dispatches frames to an estimation backend.
pub trait Executor: Send {
    fn submit(&mut self, frame: Frame) -> TaskHandle;

    /// Submit a batch; handles come back in submission order.
    fn map_frames(&mut self, frames: Vec<Frame>) -> Vec<TaskHandle> {
        frames.into_iter().map(|f| self.submit(f)).collect()
    }

    /// Stop accepting work. `wait` blocks until in-flight tasks finish;
    /// `cancel_pending` drops tasks that have not started, resolving
    /// their handles to task errors.
    fn shutdown(&mut self, wait: bool, cancel_pending: bool);
}

fn run_task(
    estimator: &mut dyn Estimator,
    headers: &Arc<HeaderMap>,
    frame: &Frame,
    annotate: bool,
) -> PipelineResult<ProcessResult> {
    let landmarks = estimator
        .estimate(frame)
        .map_err(|e| PipelineError::task(frame.id, e.to_string()))?;
    let annotated = if annotate {
        Some(
            estimator
                .annotate(frame, &landmarks)
                .map_err(|e| PipelineError::task(frame.id, e.to_string()))?,
        )
    } else {
        None
    };
    Ok(ProcessResult {
        frame_id: frame.id,
        headers: Arc::clone(headers),
        landmarks,
        annotated,
    })
}

fn resolve_workers(requested: usize) -> usize {
    if requested == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        requested
    }
}

/// Runs every task inline on the calling thread; handles come back
/// already resolved.
pub struct SerialExecutor {
    estimator: Box<dyn Estimator>,
    headers: Arc<HeaderMap>,
    annotate: bool,
}

impl SerialExecutor {
    pub fn new(factory: &EstimatorFactory, annotate: bool) -> PipelineResult<Self> {
        let mut estimator = factory();
        estimator.setup()?;
        let headers = Arc::new(estimator.headers());
        Ok(Self {
            estimator,
            headers,
            annotate,
        })
    }
}

impl Executor for SerialExecutor {
    fn submit(&mut self, frame: Frame) -> TaskHandle {
        let result = run_task(self.estimator.as_mut(), &self.headers, &frame, self.annotate);
        TaskHandle::completed(frame.id, result)
    }

    fn shutdown(&mut self, _wait: bool, _cancel_pending: bool) {}
}

struct Job {
    frame: Frame,
    reply: Sender<PipelineResult<ProcessResult>>,
}

/// Worker threads sharing one estimator instance behind a mutex.
/// Parallelizes annotation and channel traffic; estimation itself
/// serializes on the shared instance.
pub struct ThreadPoolExecutor {
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

impl ThreadPoolExecutor {
    pub fn new(
        factory: &EstimatorFactory,
        annotate: bool,
        workers: usize,
    ) -> PipelineResult<Self> {
        let mut estimator = factory();
        estimator.setup()?;
        let headers = Arc::new(estimator.headers());
        let shared = Arc::new(Mutex::new(estimator));

        let workers = resolve_workers(workers);
        let (job_tx, job_rx) = bounded::<Job>(workers * 2);
        let cancel = Arc::new(AtomicBool::new(false));
        let handles = (0..workers)
            .map(|_| {
                let rx = job_rx.clone();
                let shared = Arc::clone(&shared);
                let headers = Arc::clone(&headers);
                let cancel = Arc::clone(&cancel);
                std::thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if cancel.load(Ordering::SeqCst) {
                            // dropping the reply disconnects the handle
                            continue;
                        }
                        let result = match shared.lock() {
                            Ok(mut guard) => {
                                run_task(guard.as_mut(), &headers, &job.frame, annotate)
                            }
                            Err(_) => Err(PipelineError::task(
                                job.frame.id,
                                "shared estimator lock poisoned",
                            )),
                        };
                        let _ = job.reply.send(result);
                    }
                })
            })
            .collect();
        debug!(workers, "thread-pool executor started");
        Ok(Self {
            job_tx: Some(job_tx),
            handles,
            cancel,
        })
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit(&mut self, frame: Frame) -> TaskHandle {
        submit_job(self.job_tx.as_ref(), frame)
    }

    fn shutdown(&mut self, wait: bool, cancel_pending: bool) {
        shutdown_pool(&mut self.job_tx, &mut self.handles, &self.cancel, wait, cancel_pending);
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown(true, false);
    }
}

/// Worker threads each owning a private estimator built from the
/// factory; `setup` runs once per worker and state is never shared.
pub struct WorkerPoolExecutor {
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

impl WorkerPoolExecutor {
    pub fn new(factory: EstimatorFactory, annotate: bool, workers: usize) -> Self {
        let workers = resolve_workers(workers);
        let (job_tx, job_rx) = bounded::<Job>(workers * 2);
        let cancel = Arc::new(AtomicBool::new(false));
        let handles = (0..workers)
            .map(|worker| {
                let rx = job_rx.clone();
                let factory = Arc::clone(&factory);
                let cancel = Arc::clone(&cancel);
                std::thread::spawn(move || {
                    let mut estimator = factory();
                    if let Err(e) = estimator.setup() {
                        warn!(worker, error = %e, "worker estimator setup failed");
                        while let Ok(job) = rx.recv() {
                            let _ = job.reply.send(Err(PipelineError::task(
                                job.frame.id,
                                format!("worker setup failed: {e}"),
                            )));
                        }
                        return;
                    }
                    let headers = Arc::new(estimator.headers());
                    while let Ok(job) = rx.recv() {
                        if cancel.load(Ordering::SeqCst) {
                            continue;
                        }
                        let result = run_task(estimator.as_mut(), &headers, &job.frame, annotate);
                        let _ = job.reply.send(result);
                    }
                })
            })
            .collect();
        debug!(workers, "worker-pool executor started");
        Self {
            job_tx: Some(job_tx),
            handles,
            cancel,
        }
    }
}

impl Executor for WorkerPoolExecutor {
    fn submit(&mut self, frame: Frame) -> TaskHandle {
        submit_job(self.job_tx.as_ref(), frame)
    }

    fn shutdown(&mut self, wait: bool, cancel_pending: bool) {
        shutdown_pool(&mut self.job_tx, &mut self.handles, &self.cancel, wait, cancel_pending);
    }
}

impl Drop for WorkerPoolExecutor {
    fn drop(&mut self) {
        self.shutdown(true, false);
    }
}

fn submit_job(job_tx: Option<&Sender<Job>>, frame: Frame) -> TaskHandle {
    let frame_id = frame.id;
    let Some(tx) = job_tx else {
        return TaskHandle::completed(
            frame_id,
            Err(PipelineError::task(frame_id, "submit after shutdown")),
        );
    };
    let (handle, reply) = TaskHandle::pending(frame_id);
    if tx.send(Job { frame, reply }).is_err() {
        return TaskHandle::completed(
            frame_id,
            Err(PipelineError::task(frame_id, "executor workers are gone")),
        );
    }
    handle
}

fn shutdown_pool(
    job_tx: &mut Option<Sender<Job>>,
    handles: &mut Vec<JoinHandle<()>>,
    cancel: &Arc<AtomicBool>,
    wait: bool,
    cancel_pending: bool,
) {
    if cancel_pending {
        cancel.store(true, Ordering::SeqCst);
    }
    job_tx.take();
    if wait {
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Build the backend the options ask for.
pub fn executor_from_options(
    options: &LmPipeOptions,
    factory: EstimatorFactory,
    annotate: bool,
) -> PipelineResult<Box<dyn Executor>> {
    Ok(match options.executor {
        ExecutorKind::Serial => Box::new(SerialExecutor::new(&factory, annotate)?),
        ExecutorKind::ThreadPool => {
            Box::new(ThreadPoolExecutor::new(&factory, annotate, options.workers)?)
        }
        ExecutorKind::WorkerPool => {
            Box::new(WorkerPoolExecutor::new(factory, annotate, options.workers))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct ToyEstimator {
        setup_counter: Arc<AtomicUsize>,
        delay_per_frame: Option<Duration>,
    }

    impl Estimator for ToyEstimator {
        fn setup(&mut self) -> PipelineResult<()> {
            self.setup_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shape(&self) -> BTreeMap<String, (usize, usize)> {
            BTreeMap::from([("k".to_string(), (1, 2))])
        }

        fn headers(&self) -> HeaderMap {
            BTreeMap::from([("k".to_string(), vec!["a".to_string(), "b".to_string()])])
        }

        fn estimate(&mut self, frame: &Frame) -> PipelineResult<LandmarkMap> {
            if let Some(delay) = self.delay_per_frame {
                // later frames finish sooner, to stress ordering
                let factor = 8u64.saturating_sub(frame.id);
                std::thread::sleep(delay * factor as u32);
            }
            let v = frame.id as f32;
            let mut out = LandmarkMap::new();
            out.insert(
                "k".to_string(),
                LandmarkArray::new(vec![1, 2], vec![v, v * 2.0])?,
            );
            Ok(out)
        }

        fn annotate(&self, frame: &Frame, _landmarks: &LandmarkMap) -> PipelineResult<RgbImage> {
            Ok(frame.image.clone())
        }
    }

    fn toy_factory(
        counter: Arc<AtomicUsize>,
        delay_per_frame: Option<Duration>,
    ) -> EstimatorFactory {
        Arc::new(move || {
            Box::new(ToyEstimator {
                setup_counter: Arc::clone(&counter),
                delay_per_frame,
            })
        })
    }

    fn frame(id: u64) -> Frame {
        Frame::new(id, RgbImage::new(2, 2))
    }

    #[test]
    fn serial_executor_resolves_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut exec = SerialExecutor::new(&toy_factory(Arc::clone(&counter), None), false).unwrap();
        let result = exec.submit(frame(7)).wait().unwrap();
        assert_eq!(result.frame_id, 7);
        assert_eq!(result.landmarks["k"].data(), &[7.0, 14.0]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_pool_completes_every_submission() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut exec =
            ThreadPoolExecutor::new(&toy_factory(Arc::clone(&counter), None), false, 3).unwrap();
        let handles = exec.map_frames((0..16).map(frame).collect());
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.wait().unwrap();
            assert_eq!(result.frame_id, i as u64);
        }
        exec.shutdown(true, false);
        // the pool shares one instance, set up once
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_pool_sets_up_each_worker_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut exec = WorkerPoolExecutor::new(toy_factory(Arc::clone(&counter), None), false, 3);
        let handles = exec.map_frames((0..12).map(frame).collect());
        for handle in handles {
            handle.wait().unwrap();
        }
        exec.shutdown(true, false);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn handles_resolve_in_submission_order_despite_latency_inversion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut exec = WorkerPoolExecutor::new(
            toy_factory(Arc::clone(&counter), Some(Duration::from_millis(3))),
            false,
            4,
        );
        let handles = exec.map_frames((0..8).map(frame).collect());
        let ids: Vec<u64> = handles
            .into_iter()
            .map(|h| h.wait().unwrap().frame_id)
            .collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        exec.shutdown(true, false);
    }

    #[test]
    fn cancel_pending_resolves_unstarted_tasks_to_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut exec = WorkerPoolExecutor::new(
            toy_factory(Arc::clone(&counter), Some(Duration::from_millis(20))),
            false,
            1,
        );
        let handles = exec.map_frames((0..4).map(frame).collect());
        exec.shutdown(false, true);
        let outcomes: Vec<_> = handles.into_iter().map(TaskHandle::wait).collect();
        // nothing hangs, and the tail of the queue was dropped
        assert!(matches!(
            outcomes.last().unwrap(),
            Err(PipelineError::Task { .. })
        ));
    }

    #[test]
    fn submit_after_shutdown_errors_instead_of_hanging() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut exec = WorkerPoolExecutor::new(toy_factory(counter, None), false, 1);
        exec.shutdown(true, false);
        let err = exec.submit(frame(0)).wait().unwrap_err();
        assert!(matches!(err, PipelineError::Task { .. }));
    }
}
