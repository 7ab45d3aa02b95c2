//! The collector base contract.

use lmpipe_core::prelude::*;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Persists an ordered stream of processed frames to one target.
///
/// Lifecycle per run: `configure` (pure absorption, no I/O), then
/// `apply_exist_rule` strictly before any frame work, then
/// `open -> append* -> close`. A collector instance may serve a new
/// `RunSpec` only after a fresh `open`.
pub trait Collector: Send {
    /// Absorb configuration. No I/O happens here.
    fn configure(&mut self, _options: &LmPipeOptions) {}

    /// Decide whether this collector should take part in the run.
    /// `Ok(false)` drops it without touching the existing target;
    /// an `Err` aborts the whole run before any frame is processed.
    fn apply_exist_rule(&self, _spec: &RunSpec) -> PipelineResult<bool> {
        Ok(true)
    }

    /// Whether this collector consumes annotated frame images. The
    /// runner only asks the estimator to annotate when some attached
    /// collector wants it.
    fn wants_annotated(&self) -> bool {
        false
    }

    fn open(&mut self, spec: &RunSpec) -> PipelineResult<()>;

    fn append(&mut self, result: &ProcessResult) -> PipelineResult<()>;

    fn close(&mut self) -> PipelineResult<()>;

    /// Drive a full `open -> append* -> close` cycle. `close` runs even
    /// when an append fails; the append error wins over a close error.
    fn collect_results(
        &mut self,
        spec: &RunSpec,
        results: &mut dyn Iterator<Item = &ProcessResult>,
    ) -> PipelineResult<()> {
        if !self.apply_exist_rule(spec)? {
            debug!(dst = %spec.dst.display(), "exist rule says skip; leaving target untouched");
            return Ok(());
        }
        self.open(spec)?;
        let mut outcome = Ok(());
        for result in results {
            outcome = self.append(result);
            if outcome.is_err() {
                break;
            }
        }
        let closed = self.close();
        outcome.and(closed)
    }
}

/// Evaluate an exist rule against a target path, before any write.
///
/// Returns whether the collector should proceed. `Overwrite` (and its
/// `Suffix` alias) removes a pre-existing target so the run starts
/// from a clean slate whether the target is a file or a directory.
pub fn evaluate_exist_rule(rule: ExistRule, target: &Path) -> PipelineResult<bool> {
    if !target.exists() {
        return Ok(true);
    }
    match rule {
        ExistRule::Proceed => Ok(true),
        ExistRule::Skip => Ok(false),
        ExistRule::Overwrite | ExistRule::Suffix => {
            let removed = if target.is_dir() {
                fs::remove_dir_all(target)
            } else {
                fs::remove_file(target)
            };
            removed.map_err(|e| PipelineError::io(target, e))?;
            Ok(true)
        }
        ExistRule::Error => Err(PipelineError::Conflict {
            path: target.to_path_buf(),
            msg: "target already exists and exist rule is 'error'".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exist_rule_proceeds_on_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("landmarks.lmc");
        for rule in [
            ExistRule::Proceed,
            ExistRule::Skip,
            ExistRule::Overwrite,
            ExistRule::Error,
        ] {
            assert!(evaluate_exist_rule(rule, &target).unwrap());
        }
    }

    #[test]
    fn exist_rule_skip_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("landmarks.lmc");
        fs::write(&target, b"old").unwrap();
        assert!(!evaluate_exist_rule(ExistRule::Skip, &target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn exist_rule_overwrite_clears_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("landmarks.lmc");
        fs::write(&file, b"old").unwrap();
        assert!(evaluate_exist_rule(ExistRule::Overwrite, &file).unwrap());
        assert!(!file.exists());

        let sub = dir.path().join("landmarks");
        fs::create_dir_all(sub.join("nested")).unwrap();
        assert!(evaluate_exist_rule(ExistRule::Suffix, &sub).unwrap());
        assert!(!sub.exists());
    }

    #[test]
    fn exist_rule_error_raises_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("landmarks.lmc");
        fs::write(&target, b"old").unwrap();
        let err = evaluate_exist_rule(ExistRule::Error, &target).unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
    }
}
