//! The run loop and everything it needs: source classification, frame
//! iterators, execution backends, and the estimator registry.

pub mod executor;
pub mod registry;
pub mod runner;
pub mod source;

pub use executor::{
    executor_from_options, Executor, SerialExecutor, TaskHandle, ThreadPoolExecutor,
    WorkerPoolExecutor,
};
pub use registry::{EstimatorRegistry, GridEstimator};
pub use runner::{RunReport, Runner};
pub use source::{
    classify, frame_source_for, ImageSequenceSource, SingleImageSource, SourceKind,
};
