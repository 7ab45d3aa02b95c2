//! Extract per-frame landmarks from a video, camera, image sequence,
//! or single image into one of the on-disk matrix layouts, optionally
//! alongside annotated frames.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use lmpipe_collect::{matrix_collector_from_options, SequenceFramesCollector};
use lmpipe_core::prelude::*;
use lmpipe_runner::{EstimatorRegistry, Runner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lm_extract", about = "Run the landmark pipeline over one source")]
struct Args {
    /// Source path: video file, image file, or image-sequence directory.
    source: Option<PathBuf>,

    /// Read from a camera index instead of a path.
    #[arg(long, conflicts_with = "source")]
    camera: Option<u32>,

    /// Destination directory for all artifacts.
    #[arg(short, long)]
    output: PathBuf,

    /// Registered estimator name.
    #[arg(long, default_value = "grid")]
    estimator: String,

    #[arg(long, value_enum)]
    executor: Option<ExecutorArg>,

    /// Worker cap for pool executors; 0 uses available parallelism.
    #[arg(long)]
    workers: Option<usize>,

    /// Results allowed in flight between submit and collect.
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Policy when an output target already exists.
    #[arg(long, value_enum)]
    on_exist: Option<ExistArg>,

    /// Text delimiter; drives landmark format auto-detection.
    #[arg(long)]
    delimiter: Option<char>,

    /// Explicit landmark output extension (.csv, .tsv, .lma, .lmc,
    /// .json, .lmf, .lmx); overrides delimiter auto-detection.
    #[arg(long)]
    format: Option<String>,

    /// Also write annotated frames with this image extension.
    #[arg(long)]
    annotated: Option<String>,

    /// Prefer GPU resources when the estimator supports it.
    #[arg(long)]
    use_gpu: bool,

    /// Free-form resource tags forwarded to the estimator factory.
    #[arg(long = "tag")]
    resource_tags: Vec<String>,

    #[arg(long)]
    log_level: Option<String>,

    /// Log destination file; stderr when unset.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExecutorArg {
    Serial,
    ThreadPool,
    WorkerPool,
}

impl From<ExecutorArg> for ExecutorKind {
    fn from(value: ExecutorArg) -> Self {
        match value {
            ExecutorArg::Serial => ExecutorKind::Serial,
            ExecutorArg::ThreadPool => ExecutorKind::ThreadPool,
            ExecutorArg::WorkerPool => ExecutorKind::WorkerPool,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExistArg {
    Proceed,
    Skip,
    Overwrite,
    Error,
    Suffix,
}

impl From<ExistArg> for ExistRule {
    fn from(value: ExistArg) -> Self {
        match value {
            ExistArg::Proceed => ExistRule::Proceed,
            ExistArg::Skip => ExistRule::Skip,
            ExistArg::Overwrite => ExistRule::Overwrite,
            ExistArg::Error => ExistRule::Error,
            ExistArg::Suffix => ExistRule::Suffix,
        }
    }
}

impl Args {
    fn patch(&self) -> LmPipeOptionsPatch {
        LmPipeOptionsPatch {
            executor: self.executor.map(Into::into),
            workers: self.workers,
            max_in_flight: self.max_in_flight,
            use_gpu: self.use_gpu.then_some(true),
            resource_tags: (!self.resource_tags.is_empty()).then(|| self.resource_tags.clone()),
            exist_rule: self.on_exist.map(Into::into),
            delimiter: self.delimiter,
            extension: self.format.as_deref().map(normalize_extension),
            log_level: self.log_level.clone(),
            log_target: self.log_file.clone(),
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

fn init_logging(options: &LmPipeOptions) -> Result<()> {
    let filter = EnvFilter::try_new(&options.log_level)
        .with_context(|| format!("invalid log level '{}'", options.log_level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &options.log_target {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let options = LmPipeOptions::merged(&LmPipeOptions::default(), &[args.patch()]);
    init_logging(&options)?;

    let spec = match (&args.source, args.camera) {
        (Some(path), None) => RunSpec::from_pathlikes(path, &args.output)
            .context("source path did not resolve")?,
        (None, Some(index)) => RunSpec::from_index(index, &args.output),
        _ => bail!("exactly one of a source path or --camera is required"),
    };

    let registry = EstimatorRegistry::with_builtins();
    let factory = registry
        .get(&args.estimator)
        .context("estimator lookup failed")?;

    let mut runner = Runner::new(factory, options.clone());
    runner.attach(
        matrix_collector_from_options(&options).context("landmark output configuration")?,
    );
    if let Some(ext) = &args.annotated {
        let collector = SequenceFramesCollector::new(normalize_extension(ext))
            .context("annotated output configuration")?;
        runner.attach(Box::new(collector));
    }

    info!(src = ?spec.src, dst = %spec.dst.display(), estimator = %args.estimator, "starting run");
    let report = runner.run(&spec).context("pipeline run failed")?;
    println!(
        "processed {} frames into {} ({} collectors, {} skipped)",
        report.frames,
        spec.dst.display(),
        report.collectors_run,
        report.collectors_skipped,
    );
    Ok(())
}
