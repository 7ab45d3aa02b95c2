//! Pipeline options and partial-override merging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which execution backend dispatches per-frame estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Run on the calling thread; submission order equals execution order.
    Serial,
    /// Bounded worker threads sharing one estimator instance.
    ThreadPool,
    /// Bounded worker threads, each with its own estimator instance.
    WorkerPool,
}

/// Pre-flight policy when a collector's target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistRule {
    /// Base-contract default: always run, regardless of the target.
    Proceed,
    /// Leave the existing target untouched and drop the collector from
    /// the run.
    Skip,
    /// Replace the existing target.
    Overwrite,
    /// Abort before any write.
    Error,
    /// Present in configuration for compatibility; behaves identically
    /// to `Overwrite` (see DESIGN.md).
    Suffix,
}

/// Fully-specified pipeline configuration. No field is optional at
/// consumption time; partial overrides happen through
/// [`LmPipeOptionsPatch`] before anything consumes the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmPipeOptions {
    pub executor: ExecutorKind,
    /// Worker cap for pool backends; 0 means available parallelism.
    pub workers: usize,
    /// Maximum results outstanding between submit and collect. 1 keeps
    /// exactly one estimate in flight.
    pub max_in_flight: usize,
    /// Resource hint forwarded to estimator factories.
    pub use_gpu: bool,
    /// Free-form scheduling tags forwarded to estimator factories.
    pub resource_tags: Vec<String>,
    pub exist_rule: ExistRule,
    /// Requested text delimiter; drives format auto-detection.
    pub delimiter: Option<char>,
    /// Explicit output extension; overrides auto-detection when set.
    pub extension: Option<String>,
    pub log_level: String,
    /// Optional log destination file; stderr when unset.
    pub log_target: Option<PathBuf>,
}

impl Default for LmPipeOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Serial,
            workers: 0,
            max_in_flight: 1,
            use_gpu: false,
            resource_tags: Vec::new(),
            exist_rule: ExistRule::Proceed,
            delimiter: None,
            extension: None,
            log_level: "info".to_string(),
            log_target: None,
        }
    }
}

impl LmPipeOptions {
    /// Left-to-right merge of `patches` over `base`; later values win,
    /// unset patch fields retain prior values, `base` is not mutated.
    pub fn merged(base: &LmPipeOptions, patches: &[LmPipeOptionsPatch]) -> LmPipeOptions {
        let mut out = base.clone();
        for patch in patches {
            patch.apply_to(&mut out);
        }
        out
    }
}

/// Partial override record: every field of [`LmPipeOptions`], optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LmPipeOptionsPatch {
    pub executor: Option<ExecutorKind>,
    pub workers: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub use_gpu: Option<bool>,
    pub resource_tags: Option<Vec<String>>,
    pub exist_rule: Option<ExistRule>,
    pub delimiter: Option<char>,
    pub extension: Option<String>,
    pub log_level: Option<String>,
    pub log_target: Option<PathBuf>,
}

impl LmPipeOptionsPatch {
    fn apply_to(&self, target: &mut LmPipeOptions) {
        if let Some(v) = self.executor {
            target.executor = v;
        }
        if let Some(v) = self.workers {
            target.workers = v;
        }
        if let Some(v) = self.max_in_flight {
            target.max_in_flight = v;
        }
        if let Some(v) = self.use_gpu {
            target.use_gpu = v;
        }
        if let Some(v) = &self.resource_tags {
            target.resource_tags = v.clone();
        }
        if let Some(v) = self.exist_rule {
            target.exist_rule = v;
        }
        if let Some(v) = self.delimiter {
            target.delimiter = Some(v);
        }
        if let Some(v) = &self.extension {
            target.extension = Some(v.clone());
        }
        if let Some(v) = &self.log_level {
            target.log_level = v.clone();
        }
        if let Some(v) = &self.log_target {
            target.log_target = Some(v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_later_patches_win() {
        let base = LmPipeOptions::default();
        let first = LmPipeOptionsPatch {
            workers: Some(2),
            exist_rule: Some(ExistRule::Skip),
            ..Default::default()
        };
        let second = LmPipeOptionsPatch {
            workers: Some(8),
            ..Default::default()
        };
        let merged = LmPipeOptions::merged(&base, &[first, second]);
        assert_eq!(merged.workers, 8);
        assert_eq!(merged.exist_rule, ExistRule::Skip);
        // base untouched
        assert_eq!(base.workers, 0);
        assert_eq!(base.exist_rule, ExistRule::Proceed);
    }

    #[test]
    fn merged_with_no_patches_is_base() {
        let base = LmPipeOptions {
            executor: ExecutorKind::WorkerPool,
            ..Default::default()
        };
        assert_eq!(LmPipeOptions::merged(&base, &[]), base);
    }

    #[test]
    fn unset_fields_retain_prior_values() {
        let base = LmPipeOptions {
            delimiter: Some('\t'),
            log_level: "debug".into(),
            ..Default::default()
        };
        let patch = LmPipeOptionsPatch {
            use_gpu: Some(true),
            ..Default::default()
        };
        let merged = LmPipeOptions::merged(&base, &[patch]);
        assert_eq!(merged.delimiter, Some('\t'));
        assert_eq!(merged.log_level, "debug");
        assert!(merged.use_gpu);
    }
}
