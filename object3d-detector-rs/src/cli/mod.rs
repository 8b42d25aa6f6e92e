//! Command-line interface for the detector.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::config::FeatureSet;
use crate::core::loaders::{self, Frame};
use crate::core::writers::{self, CsvDetectionWriter, WriteError};
use crate::model::{ClassifierModel, LoadedModel, ScalingTable, SvmModel};
use crate::pipeline::{
    DetectionSink, Detector, FrameDetections, FrameError, FrameQueue, LogSink,
};
use crate::visualization::{self, PlotOptions};
use crate::DetectorConfig;

#[derive(Parser)]
#[command(name = "object3d-detector")]
#[command(about = "LiDAR pedestrian candidate detector", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that override values from the config file.
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// libsvm model file
    #[arg(long)]
    model: Option<PathBuf>,
    /// svm-scale range file
    #[arg(long)]
    range: Option<PathBuf>,
    /// Use the extended feature set
    #[arg(long)]
    extended: bool,
    /// Reject clusters outside human proportions
    #[arg(long)]
    human_size_limit: bool,
    /// Log the frame rate
    #[arg(long)]
    print_fps: bool,
}

impl Overrides {
    fn apply(&self, config: &mut DetectorConfig) {
        if let Some(model) = &self.model {
            config.model_file_name = Some(model.clone());
        }
        if let Some(range) = &self.range {
            config.range_file_name = Some(range.clone());
        }
        if self.extended {
            config.features.set = FeatureSet::Extended;
        }
        if self.human_size_limit {
            config.human_size_limit = true;
        }
        if self.print_fps {
            config.print_fps = true;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Detect pedestrian candidates in point cloud frames
    Detect {
        /// Frame files (PLY or CSV) or directories of frames
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Write detections to this CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write one wireframe PLY per frame with detections into this directory
        #[arg(long)]
        boxes_dir: Option<PathBuf>,
        /// Load frames on a separate thread through a bounded queue
        #[arg(long)]
        stream: bool,
        /// In stream mode, wait for the detector instead of dropping the oldest frame
        #[arg(long, requires = "stream")]
        lossless: bool,
        /// Limit number of frames to process
        #[arg(long)]
        limit: Option<usize>,
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Summarize a libsvm model and its range file
    InspectModel {
        /// libsvm model file (defaults to model_file_name from the config)
        #[arg(long)]
        model: Option<PathBuf>,
        /// svm-scale range file (defaults to range_file_name from the config)
        #[arg(long)]
        range: Option<PathBuf>,
        /// Interpret the range file for the extended feature set
        #[arg(long)]
        extended: bool,
    },

    /// Render one frame from above with its detections (PNG)
    Visualize {
        /// Input frame file (PLY or CSV)
        frame: PathBuf,
        /// Output PNG file path (defaults to same name as the frame with .png extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Maximum number of points to plot (subsamples if exceeded)
        #[arg(long, default_value_t = 500_000)]
        max_points: usize,
        /// Alpha/transparency value for background points (0.0 to 1.0)
        #[arg(long, default_value_t = 0.6)]
        alpha: f32,
        /// Do not draw zone boundaries
        #[arg(long)]
        no_rings: bool,
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Write the effective configuration as YAML
    DumpConfig {
        /// Output YAML file
        output: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Create a progress bar over a known number of frames
fn create_progress(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} frames {msg}")
            .unwrap()
            .progress_chars("=> "),
    );
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let config = match &cli.config {
        Some(path) => match DetectorConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                DetectorConfig::default()
            }
        },
        None => DetectorConfig::default(),
    };

    let result = match cli.command {
        Commands::Detect { inputs, output, boxes_dir, stream, lossless, limit, overrides } => {
            let mode = if stream {
                ReadMode::Stream { lossless }
            } else {
                ReadMode::Inline
            };
            cmd_detect(&inputs, output, boxes_dir, mode, limit, &overrides, config)
        }
        Commands::InspectModel { model, range, extended } => {
            cmd_inspect_model(model, range, extended, &config)
        }
        Commands::Visualize { frame, output, max_points, alpha, no_rings, overrides } => {
            cmd_visualize(&frame, output, max_points, alpha, !no_rings, &overrides, config)
        }
        Commands::DumpConfig { output } => cmd_dump_config(&output, &config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

/// Expand directories into their frame files, keeping argument order.
fn collect_frames(inputs: &[PathBuf], limit: Option<usize>) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let found = loaders::find_frames(input)
                .with_context(|| format!("cannot list frames in {}", input.display()))?;
            debug!("{}: {} frame file(s)", input.display(), found.len());
            paths.extend(found);
        } else {
            paths.push(input.clone());
        }
    }
    if let Some(limit) = limit {
        paths.truncate(limit);
    }
    Ok(paths)
}

fn load_frame(seq: u64, path: &Path, frame_id: &str) -> Result<Frame> {
    let cloud = loaders::load_points(path)
        .with_context(|| format!("cannot load frame {}", path.display()))?;
    Ok(Frame::new(seq, frame_id, cloud))
}

/// How the `detect` command reads frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// Load and process each frame in turn.
    Inline,
    /// Load on a reader thread through a bounded queue.
    Stream { lossless: bool },
}

/// Load `paths` into `queue`, then close it. Stops early once the consumer
/// closes the queue. Returns the number of frames enqueued.
fn feed_queue(queue: &FrameQueue<Frame>, paths: &[PathBuf], frame_id: &str, lossless: bool) -> usize {
    let mut enqueued = 0;
    for (seq, path) in paths.iter().enumerate() {
        if queue.is_closed() {
            break;
        }
        let frame = match load_frame(seq as u64, path, frame_id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{:#}", e);
                continue;
            }
        };
        let pushed = if lossless {
            queue.push_blocking(frame)
        } else {
            queue.push(frame).map(|evicted| {
                if let Some(old) = evicted {
                    debug!("queue full, dropped frame {}", old.seq);
                }
            })
        };
        if pushed.is_err() {
            break;
        }
        enqueued += 1;
    }
    queue.close();
    enqueued
}

/// Where detections of the `detect` command go.
struct OutputSinks {
    csv: Option<CsvDetectionWriter>,
    boxes_dir: Option<PathBuf>,
    log: LogSink,
    published: usize,
}

impl DetectionSink for OutputSinks {
    fn publish(&mut self, frame: &FrameDetections) -> Result<(), WriteError> {
        self.log.publish(frame)?;
        if let Some(csv) = self.csv.as_mut() {
            csv.publish(frame)?;
        }
        if let Some(dir) = &self.boxes_dir {
            let path = dir.join(format!("boxes_{:06}.ply", frame.seq));
            writers::write_wireframe_ply(&path, frame)?;
        }
        self.published += 1;
        Ok(())
    }
}

#[derive(Default)]
struct DetectTotals {
    frames: usize,
    skipped: usize,
    points: usize,
    clusters: usize,
    detections: usize,
}

fn process_one(
    detector: &mut Detector,
    frame: &Frame,
    sinks: &mut OutputSinks,
    totals: &mut DetectTotals,
) -> Result<()> {
    match detector.process_and_publish(frame, sinks) {
        Ok(report) => {
            totals.frames += 1;
            totals.points += report.input_points;
            totals.clusters += report.clusters;
            totals.detections += report.detections.len();
            Ok(())
        }
        Err(e @ FrameError::Clustering { .. }) => {
            warn!("{}", e);
            totals.skipped += 1;
            Ok(())
        }
        Err(e) => Err(e).context("cannot write detections"),
    }
}

fn cmd_detect(
    inputs: &[PathBuf],
    output: Option<PathBuf>,
    boxes_dir: Option<PathBuf>,
    mode: ReadMode,
    limit: Option<usize>,
    overrides: &Overrides,
    mut config: DetectorConfig,
) -> Result<()> {
    let start = Instant::now();
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let paths = collect_frames(inputs, limit)?;
    if paths.is_empty() {
        bail!("no frame files found");
    }

    println!("Detecting pedestrian candidates...");
    println!("Frames: {}", paths.len());
    println!(
        "Zones: {} out to {:.1} m",
        config.zones.widths.len(),
        config.zones.outer_radius()
    );
    if let Some(out) = &output {
        println!("Output CSV: {}", out.display());
    }

    let csv = match &output {
        Some(path) => Some(
            CsvDetectionWriter::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => None,
    };
    let mut sinks = OutputSinks {
        csv,
        boxes_dir: boxes_dir.clone(),
        log: LogSink,
        published: 0,
    };

    let frame_id = config.frame_id.clone();
    let queue_capacity = config.diagnostics.queue_capacity;
    let mut detector = Detector::new(config);
    let model_mode = if detector.is_model_free() {
        "model-free"
    } else {
        "classified"
    };

    let progress = create_progress(paths.len());
    let mut totals = DetectTotals::default();
    let mut dropped = 0u64;

    if let ReadMode::Stream { lossless } = mode {
        let queue: Arc<FrameQueue<Frame>> = Arc::new(FrameQueue::new(queue_capacity));
        let producer = {
            let queue = Arc::clone(&queue);
            let paths = paths.clone();
            let frame_id = frame_id.clone();
            thread::spawn(move || feed_queue(&queue, &paths, &frame_id, lossless))
        };

        while let Some(frame) = queue.pop() {
            let result = process_one(&mut detector, &frame, &mut sinks, &mut totals);
            progress.set_position(frame.seq + 1);
            if let Err(e) = result {
                queue.close();
                let _ = producer.join();
                progress.abandon();
                return Err(e);
            }
        }
        match producer.join() {
            Ok(enqueued) => totals.skipped += paths.len() - enqueued,
            Err(_) => warn!("frame reader thread panicked"),
        }
        dropped = queue.dropped_count();
    } else {
        for (seq, path) in paths.iter().enumerate() {
            match load_frame(seq as u64, path, &frame_id) {
                Ok(frame) => process_one(&mut detector, &frame, &mut sinks, &mut totals)?,
                Err(e) => {
                    warn!("{:#}", e);
                    totals.skipped += 1;
                }
            }
            progress.inc(1);
        }
    }
    progress.finish_and_clear();

    if let Some(csv) = sinks.csv.as_mut() {
        csv.flush().context("cannot flush detection CSV")?;
    }

    let mut items = vec![
        ("Mode", model_mode.to_string()),
        ("Frames processed", totals.frames.to_string()),
        ("Frames skipped", totals.skipped.to_string()),
        ("Points", totals.points.to_string()),
        ("Clusters", totals.clusters.to_string()),
        ("Detections", totals.detections.to_string()),
        ("Frames published", sinks.published.to_string()),
    ];
    if matches!(mode, ReadMode::Stream { .. }) {
        items.push(("Frames dropped", dropped.to_string()));
    }
    if let Some(out) = &output {
        items.push(("Output CSV", out.display().to_string()));
    }
    if let Some(dir) = &boxes_dir {
        items.push(("Boxes directory", dir.display().to_string()));
    }
    if let Some(fps) = detector.frame_rate().and_then(|c| c.last_fps()) {
        items.push(("Last fps", format!("{:.2}", fps)));
    }
    items.push(("Duration", format!("{:.2?}", start.elapsed())));
    print_summary("Detection Complete", &items);

    Ok(())
}

fn cmd_inspect_model(
    model: Option<PathBuf>,
    range: Option<PathBuf>,
    extended: bool,
    config: &DetectorConfig,
) -> Result<()> {
    let model_path = model
        .or_else(|| config.model_file_name.clone())
        .context("no model file given (use --model or model_file_name)")?;
    let set = if extended {
        FeatureSet::Extended
    } else {
        config.features.set
    };

    let spinner = create_spinner("Loading model...");
    let svm = SvmModel::load(&model_path);
    spinner.finish_and_clear();
    let svm = svm.with_context(|| format!("cannot load model {}", model_path.display()))?;

    let labels = svm.labels().to_vec();
    let mut items = vec![
        ("Model file", model_path.display().to_string()),
        ("Kernel", svm.kernel_name().to_string()),
        ("Classes", format!("{:?}", labels)),
        ("Support vectors", svm.total_sv().to_string()),
        ("Probability", svm.supports_probability().to_string()),
    ];

    let range_path = range.or_else(|| config.range_file_name.clone());
    if let Some(range_path) = &range_path {
        let table = ScalingTable::load(range_path, set.len())
            .with_context(|| format!("cannot load range file {}", range_path.display()))?;
        items.push(("Range file", range_path.display().to_string()));
        items.push(("Target interval", format!("[{}, {}]", table.x_lower, table.x_upper)));
        items.push((
            "Scaled features",
            format!("{} of {}", table.scaled_count(), table.dimension()),
        ));

        let positive = config.classifier.positive_label;
        let status = match LoadedModel::new(Box::new(svm), table, positive) {
            Ok(_) => "present".to_string(),
            Err(e) => e.to_string(),
        };
        items.push(("Positive label", format!("{} ({})", positive, status)));
    }

    print_summary("Model Summary", &items);
    Ok(())
}

/// Outer radius of every zone, for range rings.
fn zone_radii(config: &DetectorConfig) -> Vec<f64> {
    config
        .zones
        .widths
        .iter()
        .scan(0.0, |r, w| {
            *r += w;
            Some(*r)
        })
        .collect()
}

fn cmd_visualize(
    frame_path: &Path,
    output: Option<PathBuf>,
    max_points: usize,
    alpha: f32,
    rings: bool,
    overrides: &Overrides,
    mut config: DetectorConfig,
) -> Result<()> {
    let start = Instant::now();
    overrides.apply(&mut config);

    // Determine output path (default to same name as input with .png extension)
    let output_path = output.unwrap_or_else(|| frame_path.with_extension("png"));

    println!("Visualizing frame...");
    println!("Input: {}", frame_path.display());
    println!("Output: {}", output_path.display());

    let spinner = create_spinner("Loading frame...");
    let frame = match load_frame(0, frame_path, &config.frame_id) {
        Ok(f) => f,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e);
        }
    };

    spinner.set_message("Detecting...");
    let options = PlotOptions {
        max_points,
        alpha,
        rings: if rings { zone_radii(&config) } else { Vec::new() },
        ..PlotOptions::default()
    };
    let mut detector = Detector::new(config);
    let report = match detector.process(&frame) {
        Ok(r) => r,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).context("detection failed");
        }
    };

    spinner.set_message("Generating plot...");
    let points = frame.cloud.to_coords();
    let plotted = visualization::plot_frame(&output_path, &points, Some(&report.detections), &options);
    spinner.finish_and_clear();
    plotted.with_context(|| format!("cannot render {}", output_path.display()))?;

    print_summary(
        "Visualization Complete",
        &[
            ("Input file", frame_path.display().to_string()),
            ("Output PNG", output_path.display().to_string()),
            ("Points in frame", frame.cloud.len().to_string()),
            ("Detections", report.detections.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_dump_config(output: &Path, config: &DetectorConfig) -> Result<()> {
    config
        .to_yaml(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}
