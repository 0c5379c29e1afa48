use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use blurcam::{
    OnnxModelFactory, PipelineConfig, PipelineCoordinator, PipelineState, V4l2LoopbackBackend,
    WebcamBackend,
};
use clap::Parser;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input webcam device index
    #[arg(short, long)]
    input_device: Option<u32>,

    /// Preferred v4l2loopback device path (falls back to /dev/video10)
    #[arg(short, long)]
    output_device: Option<String>,

    /// Capture resolution width
    #[arg(long)]
    capture_width: Option<u32>,

    /// Capture resolution height
    #[arg(long)]
    capture_height: Option<u32>,

    /// Output resolution width
    #[arg(long)]
    output_width: Option<u32>,

    /// Output resolution height
    #[arg(long)]
    output_height: Option<u32>,

    /// Target frames per second for capture and output
    #[arg(long)]
    fps: Option<u32>,

    /// Segmentation working width
    #[arg(long)]
    ai_width: Option<u32>,

    /// Segmentation working height
    #[arg(long)]
    ai_height: Option<u32>,

    /// Fast (performance mode) ONNX model
    #[arg(long)]
    fast_model: Option<PathBuf>,

    /// Accurate ONNX model
    #[arg(long)]
    accurate_model: Option<PathBuf>,

    /// Background blur intensity, 1-25
    #[arg(short, long)]
    blur: Option<u8>,

    /// Use the fast segmentation model
    #[arg(long)]
    performance_mode: bool,

    #[arg(long)]
    no_edge_smoothing: bool,

    #[arg(long)]
    no_temporal_smoothing: bool,

    /// Bilateral denoise before segmentation
    #[arg(long)]
    noise_reduction: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        let video = &mut config.video;
        video.camera_index = self.input_device.unwrap_or(video.camera_index);
        video.camera_width = self.capture_width.unwrap_or(video.camera_width);
        video.camera_height = self.capture_height.unwrap_or(video.camera_height);
        video.fps = self.fps.unwrap_or(video.fps);
        video.ai_width = self.ai_width.unwrap_or(video.ai_width);
        video.ai_height = self.ai_height.unwrap_or(video.ai_height);

        let output = &mut config.output;
        output.width = self.output_width.unwrap_or(output.width);
        output.height = self.output_height.unwrap_or(output.height);
        output.fps = self.fps.unwrap_or(output.fps);
        if self.output_device.is_some() {
            output.device = self.output_device;
        }

        let ai = &mut config.ai;
        if let Some(path) = self.fast_model {
            ai.fast_model = path;
        }
        if let Some(path) = self.accurate_model {
            ai.accurate_model = path;
        }
        ai.performance_mode |= self.performance_mode;

        let effects = &mut config.effects;
        effects.blur_intensity = self.blur.unwrap_or(effects.blur_intensity);
        effects.edge_smoothing &= !self.no_edge_smoothing;
        effects.temporal_smoothing &= !self.no_temporal_smoothing;
        effects.noise_reduction |= self.noise_reduction;

        Ok(config.validated())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = args.into_config().context("Failed to load configuration")?;

    tracing::info!("blurcam starting");
    tracing::info!(
        "Capture: camera {} at {}x{}@{}",
        config.video.camera_index,
        config.video.camera_width,
        config.video.camera_height,
        config.video.fps
    );
    tracing::info!(
        "Output: {}x{}@{}",
        config.output.width,
        config.output.height,
        config.output.fps
    );
    tracing::info!(
        "Blur intensity {}, {} model",
        config.effects.blur_intensity,
        config.model_mode()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || shutdown_flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl+C handler")?;

    let models = Arc::new(OnnxModelFactory::new(&config.ai));
    let mut coordinator = PipelineCoordinator::new(
        config,
        Arc::new(WebcamBackend),
        models,
        Arc::new(V4l2LoopbackBackend::default()),
    );

    coordinator
        .start()
        .context("Failed to start background blur pipeline")?;
    if let Some(mode) = coordinator.camera_mode() {
        tracing::info!("Camera running at {}", mode);
    }
    tracing::info!("Press Ctrl+C to stop");

    let mut last_report = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));

        if last_report.elapsed() >= STATS_INTERVAL {
            last_report = Instant::now();
            let stats = coordinator.stats();
            tracing::info!(
                "fps={:.1} (avg {:.1}), processing={:.1}ms (avg {:.1}), latency={:.1}ms, captured={}, sent={}, dropped={}, grade={}",
                stats.performance.current_fps,
                stats.performance.average_fps,
                stats.performance.current_processing_ms,
                stats.performance.average_processing_ms,
                stats.performance.average_latency_ms,
                stats.frames_captured,
                stats.frames_sent,
                stats.frames_dropped,
                stats.grade
            );
            tracing::info!(
                "cpu={:.1}%, memory={:.1}%",
                stats.performance.system.cpu_percent,
                stats.performance.system.memory_percent
            );
            if stats.state == PipelineState::Faulted {
                coordinator.stop();
                anyhow::bail!("Frame processing stopped unexpectedly");
            }
            if let Ok(json) = serde_json::to_string(&stats) {
                tracing::debug!("stats {}", json);
            }
        }
    }

    tracing::info!("Shutting down");
    coordinator.stop();
    Ok(())
}
