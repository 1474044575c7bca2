#![warn(unused_extern_crates)]
use anyhow::{Context, Result};
use clap::{Args, Parser};
use facemask::app::{AppContext, process_image, run};
use facemask::options::SolutionOptions;
use facemask::panel::PanelView;
use facemask::render::model::ModelLoader;
use facemask::render::{EffectRenderer, WgpuBackend};
use facemask::solution::mediapipe::SolutionConfig;
use facemask::solution::{MediapipeSolution, SolutionWorker};
use facemask::video::{FrameSource, ImageSource, SourceChoice, VideoSink, initial_source, list_sources};
use num_cpus::get as get_cpu_count;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CmdArgs {
    /// Directory holding the face detection and landmark onnx models
    #[arg(short, long, value_name = "DIR", default_value = "models")]
    models: PathBuf,

    /// Canonical face model, vertices in landmark order
    #[arg(long, value_name = "OBJ", default_value = "models/canonical_face_model.obj")]
    canonical_model: PathBuf,

    /// Model drawn over the face
    #[arg(long, value_name = "OBJ", default_value = "models/head.obj")]
    head_model: PathBuf,

    /// Camera to start with. Uses the last camera found if unset
    #[arg(long)]
    camera: Option<u32>,

    /// Target frame rate
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Size of the area the output is fitted into
    #[arg(long, value_name = "WxH", default_value = "1280x720", value_parser = parse_viewport)]
    viewport: (u32, u32),

    /// Run without the terminal control panel
    #[arg(long)]
    no_panel: bool,

    /// Where logs go while the control panel owns the terminal
    #[arg(long, value_name = "FILE", default_value = "facemask.log")]
    log_file: PathBuf,

    /// Upper bound on inference threads
    #[arg(long)]
    max_threads: Option<usize>,

    /// Start from a still image. It stays selectable next to the cameras
    #[arg(short, long)]
    input: Option<PathBuf>,

    #[command(flatten)]
    out: Out,

    #[command(flatten)]
    options: OptionArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct Out {
    /// Loopback device to write to. Displays in window if unset
    #[arg(group = "dest", short, long)]
    device: Option<String>,

    /// Process single input frame, writing to output path
    #[arg(group = "dest", short, long, requires = "input")]
    output: Option<PathBuf>,
}

/// Initial solution options; the control panel can change them later.
#[derive(Args, Debug)]
struct OptionArgs {
    /// Do not mirror the input
    #[arg(long)]
    no_selfie_mode: bool,

    /// Skip pose estimation
    #[arg(long)]
    no_face_geometry: bool,

    #[arg(long, default_value = "1")]
    max_num_faces: u32,

    /// Use the attention landmark model with iris points
    #[arg(long)]
    refine_landmarks: bool,

    #[arg(long, default_value = "0.5")]
    min_detection_confidence: f32,

    #[arg(long, default_value = "0.5")]
    min_tracking_confidence: f32,
}

impl From<&OptionArgs> for SolutionOptions {
    fn from(args: &OptionArgs) -> Self {
        SolutionOptions {
            selfie_mode: !args.no_selfie_mode,
            enable_face_geometry: !args.no_face_geometry,
            max_num_faces: args.max_num_faces,
            refine_landmarks: args.refine_landmarks,
            min_detection_confidence: args.min_detection_confidence,
            min_tracking_confidence: args.min_tracking_confidence,
        }
        .sanitized()
    }
}

fn parse_viewport(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
    let w = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
    let h = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
    if w == 0 || h == 0 {
        return Err(format!("viewport must be non-empty, got {w}x{h}"));
    }
    Ok((w, h))
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::from_default_env();
    let builder = tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("Failed to create log file {path:?}"))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CmdArgs::parse();

    let single_frame = args.out.output.is_some();
    let use_panel = !args.no_panel && !single_frame;
    init_logging(use_panel.then_some(args.log_file.as_path()))?;

    let options = SolutionOptions::from(&args.options);
    let total_threads = get_cpu_count();
    let threads = args.max_threads.unwrap_or(total_threads).min(total_threads);
    debug!("Using up to {threads} threads, options {options:?}");

    let loader = ModelLoader::spawn(args.head_model.clone())?;
    let solution = MediapipeSolution::new(
        SolutionConfig {
            model_dir: args.models.clone(),
            canonical_model: args.canonical_model.clone(),
            threads: (threads / 2).max(1),
        },
        options,
    )?;
    let worker = SolutionWorker::spawn(solution)?;

    let (width, height) = args.viewport;
    let renderer = EffectRenderer::new(WgpuBackend::new(width, height)?, loader);

    if let (Some(input), Some(output)) = (&args.input, &args.out.output) {
        // Process single image at file and exit
        let mut source = ImageSource::open(input)?;
        let label = SourceChoice::Image(input.clone()).label();
        let mut ctx = AppContext::new(options, vec![label], 0, worker, renderer, args.viewport);
        return process_image(&mut ctx, &mut source, output);
    }

    let sources = list_sources(args.input.as_deref());
    let active = initial_source(&sources, args.camera).context("No usable frame source found")?;
    let source = sources[active].open(args.fps)?;
    info!("Reading from {}", source.describe());

    let labels = sources.iter().map(SourceChoice::label).collect();
    let mut ctx = AppContext::new(options, labels, active, worker, renderer, args.viewport);

    let panel = if use_panel {
        Some(PanelView::new()?)
    } else {
        None
    };
    let mut sink = VideoSink::new(args.out.device.clone());
    run(&mut ctx, &sources, source, &mut sink, panel, args.fps)
}
