//! Exist-rule behavior driven through the full collector lifecycle
//! rather than the helper alone.

use lmpipe_collect::{matrix_collector, read_container, Collector, MatrixFormat};
use lmpipe_core::prelude::*;
use std::fs;
use std::sync::Arc;

fn one_result(frame_id: u64) -> ProcessResult {
    let mut landmarks = LandmarkMap::new();
    landmarks.insert(
        "pose".to_string(),
        LandmarkArray::new(vec![3, 3], vec![frame_id as f32; 9]).unwrap(),
    );
    ProcessResult {
        frame_id,
        headers: Arc::new(HeaderMap::new()),
        landmarks,
        annotated: None,
    }
}

fn configured_container(rule: ExistRule) -> Box<dyn Collector> {
    let mut collector = matrix_collector(MatrixFormat::Container);
    collector.configure(&LmPipeOptions {
        exist_rule: rule,
        ..Default::default()
    });
    collector
}

#[test]
fn skip_leaves_a_previous_run_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = RunSpec {
        src: Source::Camera(0),
        dst: tmp.path().to_path_buf(),
    };
    let target = spec.dst.join("landmarks.lmc");
    fs::write(&target, b"stale bytes").unwrap();

    let results = [one_result(0)];
    configured_container(ExistRule::Skip)
        .collect_results(&spec, &mut results.iter())
        .unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"stale bytes");
}

#[test]
fn overwrite_replaces_a_previous_run() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = RunSpec {
        src: Source::Camera(0),
        dst: tmp.path().to_path_buf(),
    };
    let target = spec.dst.join("landmarks.lmc");
    fs::write(&target, b"stale bytes").unwrap();

    let results = [one_result(0), one_result(1)];
    let mut collector = configured_container(ExistRule::Overwrite);
    collector.apply_exist_rule(&spec).unwrap();
    collector.open(&spec).unwrap();
    for r in &results {
        collector.append(r).unwrap();
    }
    collector.close().unwrap();

    let loaded = read_container(&target).unwrap();
    assert_eq!(loaded["pose"].0, vec![2, 3, 3]);
}

#[test]
fn error_rule_aborts_before_any_write() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = RunSpec {
        src: Source::Camera(0),
        dst: tmp.path().to_path_buf(),
    };
    let target = spec.dst.join("landmarks.lmc");
    fs::write(&target, b"stale bytes").unwrap();

    let results = [one_result(0)];
    let err = configured_container(ExistRule::Error)
        .collect_results(&spec, &mut results.iter())
        .unwrap_err();
    assert!(matches!(err, PipelineError::Conflict { .. }));
    assert_eq!(fs::read(&target).unwrap(), b"stale bytes");
}
