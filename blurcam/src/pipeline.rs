use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::buffer::FrameBuffer;
use crate::capture::{CameraBackend, CameraMode, CaptureCounters, CaptureStage};
use crate::compositor::Compositor;
use crate::config::{BlurConfig, EffectSettings, LiveSettings, PipelineConfig, RefineConfig};
use crate::error::StartError;
use crate::frame::{Frame, Mask};
use crate::output::{OutputCounters, OutputQueue, OutputStage, PixelFormat, SinkBackend, SinkSpec};
use crate::performance::{PerformanceGrade, PerformanceMonitor, PerformanceStats, SystemSampler};
use crate::refine::MaskRefiner;
use crate::segmentation::{ModelFactory, ModelMode, SegmentationStage};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    /// Running, but the processing thread died and frames no longer flow
    Faulted,
    Stopping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Faulted => "faulted",
            PipelineState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Written only by the processing thread
#[derive(Debug, Default)]
pub struct ProcessingCounters {
    processed: AtomicU64,
    masks_missed: AtomicU64,
    history_len: AtomicUsize,
}

impl ProcessingCounters {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Frames composited without a mask because the model produced none
    pub fn masks_missed(&self) -> u64 {
        self.masks_missed.load(Ordering::Relaxed)
    }

    /// Temporal history depth after the last processed frame
    pub fn history_len(&self) -> usize {
        self.history_len.load(Ordering::Relaxed)
    }
}

/// Segmentation, refinement and compositing for one frame at a time
pub struct ProcessingStage {
    segmentation: SegmentationStage,
    refiner: MaskRefiner,
    compositor: Compositor,
    settings: Arc<LiveSettings>,
    monitor: Arc<PerformanceMonitor>,
    counters: Arc<ProcessingCounters>,
    /// Mode whose model failed to build; not retried until the setting changes
    failed_mode: Option<ModelMode>,
}

impl ProcessingStage {
    pub fn new(
        segmentation: SegmentationStage,
        refine: &RefineConfig,
        blur: BlurConfig,
        settings: Arc<LiveSettings>,
        monitor: Arc<PerformanceMonitor>,
        counters: Arc<ProcessingCounters>,
    ) -> Self {
        let refiner = MaskRefiner::new(refine, settings.edge_smoothing(), settings.temporal_smoothing());
        Self {
            segmentation,
            refiner,
            compositor: Compositor::new(blur),
            settings,
            monitor,
            counters,
            failed_mode: None,
        }
    }

    pub fn model_mode(&self) -> ModelMode {
        self.segmentation.mode()
    }

    pub fn history_len(&self) -> usize {
        self.refiner.history_len()
    }

    /// Noise reduction, segmentation, refinement and background blur
    ///
    /// The output has the same size as `frame`.
    pub fn process_frame(&mut self, frame: Frame) -> Frame {
        let _span = tracing::debug_span!("process_frame").entered();
        let start = Instant::now();

        let settings = self.settings.snapshot();
        self.apply_settings(&settings);

        let frame = self
            .compositor
            .apply_noise_reduction(frame, settings.noise_reduction);

        let mask = match self.segmentation.process(&frame) {
            Some(mask) => self.refiner.refine(mask),
            None => {
                self.counters.masks_missed.fetch_add(1, Ordering::Relaxed);
                Mask::new(frame.width(), frame.height())
            }
        };

        let output = self
            .compositor
            .apply_background_blur(&frame, &mask, settings.blur_intensity);

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .history_len
            .store(self.refiner.history_len(), Ordering::Relaxed);
        self.monitor.record_processing_time(start.elapsed());
        output
    }

    fn apply_settings(&mut self, settings: &EffectSettings) {
        if self.failed_mode.is_some_and(|mode| mode != settings.model_mode) {
            self.failed_mode = None;
        }
        if settings.model_mode != self.segmentation.mode() && self.failed_mode.is_none() {
            match self.segmentation.set_model_mode(settings.model_mode) {
                // Masks from the old model must not bleed into the new one.
                Ok(true) => self.refiner.clear_history(),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "Failed to switch to {} model, keeping {}: {:#}",
                        settings.model_mode,
                        self.segmentation.mode(),
                        e
                    );
                    self.failed_mode = Some(settings.model_mode);
                }
            }
        }

        self.refiner.set_edge_smoothing(settings.edge_smoothing);
        self.refiner.set_temporal_smoothing(settings.temporal_smoothing);
    }
}

/// Read-only snapshot for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub performance: PerformanceStats,
    pub grade: PerformanceGrade,
    pub frames_captured: u64,
    pub capture_dropped: u64,
    pub frames_processed: u64,
    pub masks_missed: u64,
    pub frames_sent: u64,
    pub output_dropped: u64,
    /// Capture and output drops combined
    pub frames_dropped: u64,
    pub capture_queue_depth: usize,
    pub output_queue_depth: usize,
    pub camera_mode: Option<CameraMode>,
    pub temporal_history_len: usize,
    pub settings: EffectSettings,
}

/// Everything `start` opened; dropping it stops every stage
struct RunningStages {
    capture: CaptureStage,
    processing_running: Arc<AtomicBool>,
    processing_handle: Option<JoinHandle<()>>,
    output: OutputStage,
}

impl RunningStages {
    /// The processing thread ended while it was still meant to run
    fn processing_exited(&self) -> bool {
        self.processing_running.load(Ordering::Acquire)
            && self
                .processing_handle
                .as_ref()
                .is_some_and(|handle| handle.is_finished())
    }

    /// Stop in pipeline order: capture, processing, output
    fn shutdown(&mut self) {
        self.capture.stop();

        self.processing_running.store(false, Ordering::Release);
        if let Some(handle) = self.processing_handle.take() {
            if let Err(payload) = handle.join() {
                tracing::error!("Frame processing thread panicked: {}", panic_message(payload.as_ref()));
            }
        }

        self.output.stop();
    }
}

impl Drop for RunningStages {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Owns the stages and the only path between pipeline states
pub struct PipelineCoordinator {
    config: PipelineConfig,
    camera_backend: Arc<dyn CameraBackend>,
    model_factory: Arc<dyn ModelFactory>,
    sink_backend: Arc<dyn SinkBackend>,
    settings: Arc<LiveSettings>,
    monitor: Arc<PerformanceMonitor>,
    capture_queue: Arc<FrameBuffer<Frame>>,
    output_queue: Arc<FrameBuffer<Frame>>,
    capture_counters: Arc<CaptureCounters>,
    processing_counters: Arc<ProcessingCounters>,
    output_counters: Arc<OutputCounters>,
    state: PipelineState,
    camera_mode: Option<CameraMode>,
    stages: Option<RunningStages>,
}

impl PipelineCoordinator {
    pub fn new(
        config: PipelineConfig,
        camera_backend: Arc<dyn CameraBackend>,
        model_factory: Arc<dyn ModelFactory>,
        sink_backend: Arc<dyn SinkBackend>,
    ) -> Self {
        let config = config.validated();
        let settings = Arc::new(LiveSettings::new(&config));
        Self {
            capture_queue: Arc::new(FrameBuffer::new(config.buffers.capture_capacity)),
            output_queue: Arc::new(FrameBuffer::new(config.buffers.output_capacity)),
            config,
            camera_backend,
            model_factory,
            sink_backend,
            settings,
            monitor: Arc::new(PerformanceMonitor::new()),
            capture_counters: Arc::new(CaptureCounters::default()),
            processing_counters: Arc::new(ProcessingCounters::default()),
            output_counters: Arc::new(OutputCounters::default()),
            state: PipelineState::Idle,
            camera_mode: None,
            stages: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// `Faulted` once the processing thread has died; `stop` recovers to `Idle`
    pub fn state(&self) -> PipelineState {
        let faulted = self.state == PipelineState::Running
            && self.stages.as_ref().is_some_and(RunningStages::processing_exited);
        if faulted {
            PipelineState::Faulted
        } else {
            self.state
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Mode the camera negotiated on the last successful start
    pub fn camera_mode(&self) -> Option<CameraMode> {
        self.camera_mode
    }

    /// Open camera, model and virtual camera, then start every stage
    ///
    /// On failure everything opened so far is released and the pipeline
    /// is back in `Idle`.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != PipelineState::Idle {
            return Err(StartError::AlreadyRunning);
        }

        tracing::info!("Starting pipeline");
        self.state = PipelineState::Starting;

        match self.launch() {
            Ok(stages) => {
                self.camera_mode = Some(stages.capture.mode());
                self.stages = Some(stages);
                self.state = PipelineState::Running;
                tracing::info!("Pipeline running");
                Ok(())
            }
            Err(e) => {
                self.capture_queue.clear();
                self.output_queue.clear();
                self.state = PipelineState::Idle;
                tracing::error!("Pipeline failed to start: {}", e);
                Err(e)
            }
        }
    }

    // Stages stop when dropped, so every early return below releases
    // whatever was opened before it.
    fn launch(&mut self) -> Result<RunningStages, StartError> {
        self.reset_counters();

        let video = &self.config.video;
        let requested = CameraMode {
            width: video.camera_width,
            height: video.camera_height,
            fps: video.fps,
        };
        let capture = CaptureStage::initialize(
            self.camera_backend.clone(),
            video.camera_index,
            requested,
            self.capture_queue.clone(),
            self.capture_counters.clone(),
        )?;

        let segmentation = SegmentationStage::new(
            self.model_factory.clone(),
            self.settings.model_mode(),
            (video.ai_width, video.ai_height),
        )
        .map_err(StartError::Model)?;

        let output_config = &self.config.output;
        let sink = self.sink_backend.open(&SinkSpec {
            width: output_config.width,
            height: output_config.height,
            fps: output_config.fps,
            pixel_format: PixelFormat::Yuyv,
            preferred_name: output_config.device.clone(),
        })?;
        let resolution = sink.resolution();
        let output = OutputStage::start(
            sink,
            self.output_queue.clone(),
            self.output_counters.clone(),
            self.monitor.clone(),
        )?;

        let stage = ProcessingStage::new(
            segmentation,
            &self.config.refine,
            self.config.blur.clone(),
            self.settings.clone(),
            self.monitor.clone(),
            self.processing_counters.clone(),
        );
        let input = self.capture_queue.clone();
        let output_queue = OutputQueue::new(self.output_queue.clone(), resolution, self.output_counters.clone());
        let processing_running = Arc::new(AtomicBool::new(true));
        let running_clone = processing_running.clone();

        let mut stages = RunningStages {
            capture,
            processing_running,
            processing_handle: None,
            output,
        };
        let handle = std::thread::Builder::new()
            .name("frame-processing".to_string())
            .spawn(move || run_processing(stage, &input, &output_queue, &running_clone))
            .map_err(StartError::Spawn)?;
        stages.processing_handle = Some(handle);

        Ok(stages)
    }

    fn reset_counters(&mut self) {
        self.capture_counters = Arc::new(CaptureCounters::default());
        self.processing_counters = Arc::new(ProcessingCounters::default());
        self.output_counters = Arc::new(OutputCounters::default());
        self.monitor.reset();
        self.capture_queue.clear();
        self.output_queue.clear();
    }

    /// Stop every stage and release camera and sink. Idempotent.
    pub fn stop(&mut self) {
        let Some(mut stages) = self.stages.take() else {
            self.state = PipelineState::Idle;
            return;
        };

        tracing::info!("Stopping pipeline");
        self.state = PipelineState::Stopping;
        stages.shutdown();

        self.capture_queue.clear();
        self.output_queue.clear();
        self.state = PipelineState::Idle;
        tracing::info!("Pipeline stopped");
    }

    /// Returns the clamped intensity actually stored
    pub fn set_blur_intensity(&self, intensity: u8) -> u8 {
        let stored = self.settings.set_blur_intensity(intensity);
        tracing::debug!("Blur intensity set to {}", stored);
        stored
    }

    pub fn blur_intensity(&self) -> u8 {
        self.settings.blur_intensity()
    }

    pub fn set_edge_smoothing(&self, enabled: bool) {
        self.settings.set_edge_smoothing(enabled);
    }

    pub fn edge_smoothing(&self) -> bool {
        self.settings.edge_smoothing()
    }

    pub fn set_temporal_smoothing(&self, enabled: bool) {
        self.settings.set_temporal_smoothing(enabled);
    }

    pub fn temporal_smoothing(&self) -> bool {
        self.settings.temporal_smoothing()
    }

    pub fn set_noise_reduction(&self, enabled: bool) {
        self.settings.set_noise_reduction(enabled);
    }

    pub fn noise_reduction(&self) -> bool {
        self.settings.noise_reduction()
    }

    /// Picks the fast model when `performance` is set; the swap happens on
    /// the next processed frame.
    pub fn set_performance_mode(&self, performance: bool) {
        tracing::info!(
            "Model mode set to {}",
            ModelMode::from_performance(performance)
        );
        self.settings.set_performance_mode(performance);
    }

    pub fn performance_mode(&self) -> bool {
        self.settings.performance_mode()
    }

    pub fn set_model_mode(&self, mode: ModelMode) {
        self.set_performance_mode(mode.is_performance());
    }

    pub fn model_mode(&self) -> ModelMode {
        self.settings.model_mode()
    }

    pub fn effect_settings(&self) -> EffectSettings {
        self.settings.snapshot()
    }

    pub fn stats(&self) -> PipelineStats {
        let performance = self.monitor.stats();
        let capture_dropped = self.capture_counters.dropped();
        let output_dropped = self.output_counters.dropped();
        PipelineStats {
            state: self.state(),
            performance,
            grade: PerformanceGrade::from_stats(&performance),
            frames_captured: self.capture_counters.captured(),
            capture_dropped,
            frames_processed: self.processing_counters.processed(),
            masks_missed: self.processing_counters.masks_missed(),
            frames_sent: self.output_counters.sent(),
            output_dropped,
            frames_dropped: capture_dropped + output_dropped,
            capture_queue_depth: self.capture_queue.len(),
            output_queue_depth: self.output_queue.len(),
            camera_mode: self.camera_mode,
            temporal_history_len: self.processing_counters.history_len(),
            settings: self.settings.snapshot(),
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_processing(
    mut stage: ProcessingStage,
    input: &FrameBuffer<Frame>,
    output: &OutputQueue,
    running: &AtomicBool,
) {
    tracing::info!("Frame processing thread started");
    let mut sampler = SystemSampler::default();

    while running.load(Ordering::Acquire) {
        if let Some(metrics) = sampler.poll(Instant::now()) {
            stage.monitor.record_system_metrics(metrics);
        }
        let Some(frame) = input.pop_timeout(POLL_INTERVAL) else {
            continue;
        };
        let processed = stage.process_frame(frame);
        if !output.send(processed) {
            tracing::trace!("Output queue full, dropped oldest frame");
        }
    }

    tracing::info!("Frame processing thread stopped");
}
