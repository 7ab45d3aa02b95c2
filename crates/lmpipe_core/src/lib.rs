//! lmpipe_core: shared estimator/collector/runner contracts.

pub mod error;
pub mod interfaces;
pub mod options;
pub mod runspec;

pub mod prelude {
    pub use crate::error::{PipelineError, PipelineResult};
    pub use crate::interfaces::*;
    pub use crate::options::{ExecutorKind, ExistRule, LmPipeOptions, LmPipeOptionsPatch};
    pub use crate::runspec::{RunSpec, Source};
}
