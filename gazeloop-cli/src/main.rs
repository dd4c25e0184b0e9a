// gazeloop command line interface
// Drives the gaze pipeline from a fixed-rate host loop over image files or synthetic frames

mod demo;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use gazeloop_core::GazeEstimate;
use gazeloop_eye::{
    CycleStart, GazeConfig, GazePipeline, ImageFrame, InferenceBackend, PipelinePhase, StatusSink,
    TracingStatusSink,
};
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gazeloop")]
#[command(about = "Frame-amortized gaze estimation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline in a host loop
    Run {
        /// Configuration file (TOML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Image files to feed, in order (repeats when exhausted)
        #[arg(long, num_args = 1..)]
        frames: Vec<PathBuf>,

        /// Number of synthetic frames when no files are given
        #[arg(long, default_value = "300")]
        synthetic: u64,

        /// Host loop rate
        #[arg(long, default_value = "60")]
        fps: f64,

        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,

        /// One JSON object per finished cycle
        #[arg(long)]
        json: bool,

        #[arg(long, value_enum, default_value = "simulated")]
        backend: BackendKind,
    },

    /// Validate and print the effective configuration
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Simulated,
    Onnx,
}

/// Where the host loop takes its frames from.
enum FrameFeed {
    Files { paths: Vec<PathBuf>, next: usize },
    Synthetic { remaining: u64, index: u64, size: (u32, u32) },
}

impl FrameFeed {
    /// `None` once the feed is exhausted. A file that cannot be read is an
    /// `Err` for that frame only.
    fn next_frame(&mut self) -> Option<gazeloop_core::Result<ImageFrame>> {
        match self {
            FrameFeed::Files { paths, next } => {
                if paths.is_empty() {
                    return None;
                }
                let path = &paths[*next % paths.len()];
                *next += 1;
                Some(ImageFrame::open(path))
            }
            FrameFeed::Synthetic {
                remaining,
                index,
                size,
            } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                let frame = demo::synthetic_frame(*index, size.0, size.1);
                *index += 1;
                Some(Ok(frame))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CycleOutcome {
    Gaze,
    NoDetection,
    Failed,
}

/// One finished detection cycle.
#[derive(Debug, Clone, Serialize)]
struct CycleReport {
    timestamp: DateTime<Utc>,
    cycle: u64,
    ticks: u64,
    outcome: CycleOutcome,
    detections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    gaze: Option<GazeEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    smoothed: Option<GazeEstimate>,
    looking_at_camera: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CycleReport {
    fn line(&self) -> String {
        match self.outcome {
            CycleOutcome::Gaze => {
                let (gaze, smoothed) = (self.gaze.unwrap_or_default(), self.smoothed.unwrap_or_default());
                format!(
                    "cycle {:>4} ({:>3} ticks) gaze yaw={:>7.2} pitch={:>7.2} smoothed yaw={:>7.2} pitch={:>7.2}{}",
                    self.cycle,
                    self.ticks,
                    gaze.yaw,
                    gaze.pitch,
                    smoothed.yaw,
                    smoothed.pitch,
                    if self.looking_at_camera { " [looking]" } else { "" }
                )
            }
            CycleOutcome::NoDetection => {
                format!("cycle {:>4} ({:>3} ticks) no detection", self.cycle, self.ticks)
            }
            CycleOutcome::Failed => format!(
                "cycle {:>4} ({:>3} ticks) failed: {}",
                self.cycle,
                self.ticks,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Shortest host loop period; higher rates are clamped to it.
const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct LoopOptions {
    period: Duration,
    max_ticks: Option<u64>,
    json: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LoopSummary {
    ticks: u64,
    completed: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            frames,
            synthetic,
            fps,
            max_ticks,
            json,
            backend,
        } => {
            let period = tick_period(fps)?;
            let config = load_config(config.as_ref())?;
            let feed = if frames.is_empty() {
                FrameFeed::Synthetic {
                    remaining: synthetic,
                    index: 0,
                    size: (320, 240),
                }
            } else {
                FrameFeed::Files { paths: frames, next: 0 }
            };
            let options = LoopOptions {
                period,
                max_ticks,
                json,
            };

            let sink: Arc<dyn StatusSink> = Arc::new(TracingStatusSink);
            let mut pipeline = build_pipeline(backend, config, sink)?;
            if !pipeline.is_enabled() {
                anyhow::bail!(
                    "models failed to load: {}",
                    pipeline.last_error().unwrap_or("unknown error")
                );
            }

            let stdout = std::io::stdout();
            let summary = run_loop(&mut pipeline, feed, options, &mut stdout.lock(), shutdown_signal()).await?;
            info!(
                "Stopped after {} ticks: {} cycles completed, {} failed",
                summary.ticks, summary.completed, summary.failed
            );
        }
        Commands::Config { config } => {
            let config = load_config(config.as_ref())?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().with_current_span(false).init();
    } else {
        builder.with_target(false).init();
    }
}

fn tick_period(fps: f64) -> anyhow::Result<Duration> {
    if !(fps > 0.0 && fps.is_finite()) {
        anyhow::bail!("--fps must be a positive number");
    }
    let period = Duration::try_from_secs_f64(1.0 / fps)
        .map_err(|_| anyhow::anyhow!("--fps {} is too low", fps))?;
    Ok(period.max(MIN_TICK_PERIOD))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<GazeConfig> {
    let mut config = match path {
        Some(path) => GazeConfig::from_file(path).with_context(|| format!("loading config {:?}", path))?,
        None => GazeConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn build_pipeline(
    kind: BackendKind,
    config: GazeConfig,
    sink: Arc<dyn StatusSink>,
) -> anyhow::Result<GazePipeline> {
    match kind {
        BackendKind::Simulated => {
            let backend = demo::simulated_backend(&config);
            new_pipeline(config, &backend, sink)
        }
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => new_pipeline(config, &gazeloop_eye::backend::OnnxBackend::new(), sink),
        #[cfg(not(feature = "onnx"))]
        BackendKind::Onnx => anyhow::bail!("gazeloop was built without the `onnx` feature"),
    }
}

fn new_pipeline<B: InferenceBackend>(
    config: GazeConfig,
    backend: &B,
    sink: Arc<dyn StatusSink>,
) -> anyhow::Result<GazePipeline> {
    info!("Using backend with device {:?}", config.device);
    Ok(GazePipeline::new(config, backend, sink)?)
}

/// Wait for Ctrl+C (and SIGTERM on unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Tick the pipeline at a fixed rate, starting a cycle whenever it is idle.
///
/// Ends when the feed runs dry and the last cycle finishes, when
/// `max_ticks` is reached, or when `shutdown` resolves.
async fn run_loop<W, S>(
    pipeline: &mut GazePipeline,
    mut feed: FrameFeed,
    options: LoopOptions,
    out: &mut W,
    shutdown: S,
) -> anyhow::Result<LoopSummary>
where
    W: Write,
    S: Future<Output = ()>,
{
    let mut interval = time::interval(options.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut summary = LoopSummary::default();
    let mut cycle_ticks = 0u64;
    let mut feed_done = false;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = interval.tick() => {}
        }

        if options.max_ticks.map_or(false, |max| summary.ticks >= max) {
            break;
        }

        if !pipeline.is_cycle_active() && !feed_done {
            let start = match feed.next_frame() {
                Some(Ok(frame)) => Some(pipeline.start_cycle(frame)),
                Some(Err(error)) => Some(pipeline.reject_frame(error)),
                None => {
                    feed_done = true;
                    None
                }
            };

            match start {
                Some(CycleStart::Started) => cycle_ticks = 0,
                Some(CycleStart::Rejected) => {
                    // the frame never reached the models; it still gets a report line
                    emit(out, &report(pipeline, true, 0), options.json)?;
                    summary.ticks += 1;
                    continue;
                }
                Some(CycleStart::AlreadyActive) => debug!("Cycle already active"),
                Some(CycleStart::Disabled) => anyhow::bail!("pipeline is disabled"),
                None => {}
            }
        }

        if feed_done && !pipeline.is_cycle_active() {
            break;
        }

        let (completed, failed) = (pipeline.cycles_completed(), pipeline.cycles_failed());
        let phase = pipeline.tick();
        summary.ticks += 1;
        cycle_ticks += 1;

        if pipeline.cycles_completed() > completed || pipeline.cycles_failed() > failed {
            let report = report(pipeline, pipeline.cycles_failed() > failed, cycle_ticks);
            emit(out, &report, options.json)?;
            cycle_ticks = 0;
        } else if phase != PipelinePhase::Idle {
            debug!("Tick {} in {}", summary.ticks, phase);
        }
    }

    pipeline.shutdown();
    summary.completed = pipeline.cycles_completed();
    summary.failed = pipeline.cycles_failed();
    Ok(summary)
}

fn emit<W: Write>(out: &mut W, report: &CycleReport, json: bool) -> anyhow::Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string(report)?)?;
    } else {
        writeln!(out, "{}", report.line())?;
    }
    Ok(())
}

fn report(pipeline: &GazePipeline, failed: bool, ticks: u64) -> CycleReport {
    let cycle = pipeline.cycles_completed() + pipeline.cycles_failed();
    // a failed cycle keeps the previous detections; they are not this cycle's
    let detections = if failed { 0 } else { pipeline.latest_detections().len() };
    let has_gaze = !failed && detections > 0;

    let outcome = if failed {
        CycleOutcome::Failed
    } else if has_gaze {
        CycleOutcome::Gaze
    } else {
        CycleOutcome::NoDetection
    };

    CycleReport {
        timestamp: Utc::now(),
        cycle,
        ticks,
        outcome,
        detections,
        gaze: has_gaze.then(|| pipeline.latest_gaze()),
        smoothed: has_gaze.then(|| pipeline.smoothed_gaze()),
        looking_at_camera: has_gaze && pipeline.looking_at_camera(),
        error: if failed {
            pipeline.last_error().map(str::to_string)
        } else {
            None
        },
    }
}
