use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::filters::odd_kernel;
use crate::segmentation::ModelMode;

pub const MIN_BLUR_INTENSITY: u8 = 1;
pub const MAX_BLUR_INTENSITY: u8 = 25;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub video: VideoConfig,
    pub effects: EffectsConfig,
    pub ai: AiConfig,
    pub blur: BlurConfig,
    pub refine: RefineConfig,
    pub buffers: BufferConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub camera_index: u32,
    pub camera_width: u32,
    pub camera_height: u32,
    pub fps: u32,
    /// Segmentation working resolution, independent of the camera
    pub ai_width: u32,
    pub ai_height: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            camera_width: 1280,
            camera_height: 720,
            fps: 30,
            ai_width: 512,
            ai_height: 288,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub blur_intensity: u8,
    pub edge_smoothing: bool,
    pub temporal_smoothing: bool,
    pub noise_reduction: bool,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            blur_intensity: 15,
            edge_smoothing: true,
            temporal_smoothing: true,
            noise_reduction: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// true = fast model, false = accurate model
    pub performance_mode: bool,
    pub fast_model: PathBuf,
    pub accurate_model: PathBuf,
    pub intra_threads: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            performance_mode: false,
            fast_model: PathBuf::from("models/selfie_segmentation_landscape.onnx"),
            accurate_model: PathBuf::from("models/rvm_mobilenetv3_fp32.onnx"),
            intra_threads: 4,
        }
    }
}

/// Background blur algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlurAlgorithm {
    /// Tiered Gaussian passes chosen by effective radius
    #[default]
    Optimized,
    /// One large Gaussian pass, plus a median pass at high intensity
    Quality,
}

/// Tiered background blur tuning
///
/// Tier boundaries apply to the effective radius
/// `trunc(intensity * intensity_multiplier)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub algorithm: BlurAlgorithm,
    pub intensity_multiplier: f64,
    /// Largest effective radius handled by a single pass
    pub low_tier_max: u32,
    /// Largest effective radius handled by two cascaded passes
    pub mid_tier_max: u32,
    pub mid_first_factor: f64,
    pub mid_second_factor: f64,
    pub high_factor: f64,
    pub high_finish_factor: f64,
    /// Kernel and sigma used to soften the alpha mask before blending
    pub alpha_kernel: u32,
    pub alpha_sigma: f32,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            algorithm: BlurAlgorithm::Optimized,
            intensity_multiplier: 1.8,
            low_tier_max: 15,
            mid_tier_max: 36,
            mid_first_factor: 0.6,
            mid_second_factor: 0.8,
            high_factor: 0.4,
            high_finish_factor: 0.3,
            alpha_kernel: 5,
            alpha_sigma: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    /// Closing structuring element size
    pub edge_kernel_size: u32,
    pub temporal_history: usize,
    /// Weight of the current mask in the temporal blend
    pub temporal_weight: f32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            edge_kernel_size: 3,
            temporal_history: 2,
            temporal_weight: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capture_capacity: usize,
    pub output_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capture_capacity: 2,
            output_capacity: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Preferred virtual camera device; the sink falls back to its default
    pub device: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            device: None,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config.validated())
    }

    /// Clamp every value into its legal range
    pub fn validated(mut self) -> Self {
        self.effects.blur_intensity = clamp_intensity(self.effects.blur_intensity);

        let video = &mut self.video;
        video.camera_width = video.camera_width.max(1);
        video.camera_height = video.camera_height.max(1);
        video.fps = video.fps.max(1);
        video.ai_width = video.ai_width.max(1);
        video.ai_height = video.ai_height.max(1);

        let blur = &mut self.blur;
        if !(blur.intensity_multiplier.is_finite() && blur.intensity_multiplier > 0.0) {
            blur.intensity_multiplier = BlurConfig::default().intensity_multiplier;
        }
        blur.mid_tier_max = blur.mid_tier_max.max(blur.low_tier_max);
        blur.alpha_kernel = odd_kernel(blur.alpha_kernel);

        self.refine.edge_kernel_size = odd_kernel(self.refine.edge_kernel_size);
        self.refine.temporal_history = self.refine.temporal_history.max(2);
        if !self.refine.temporal_weight.is_finite() {
            self.refine.temporal_weight = RefineConfig::default().temporal_weight;
        }
        self.refine.temporal_weight = self.refine.temporal_weight.clamp(0.0, 1.0);

        self.buffers.capture_capacity = self.buffers.capture_capacity.max(1);
        self.buffers.output_capacity = self.buffers.output_capacity.max(1);

        self.output.width = self.output.width.max(1);
        self.output.height = self.output.height.max(1);
        self.output.fps = self.output.fps.max(1);
        self
    }

    pub fn model_mode(&self) -> ModelMode {
        ModelMode::from_performance(self.ai.performance_mode)
    }
}

pub fn clamp_intensity(intensity: u8) -> u8 {
    intensity.clamp(MIN_BLUR_INTENSITY, MAX_BLUR_INTENSITY)
}

/// Per-frame view of the live settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectSettings {
    pub blur_intensity: u8,
    pub edge_smoothing: bool,
    pub temporal_smoothing: bool,
    pub noise_reduction: bool,
    pub model_mode: ModelMode,
}

/// Runtime-tunable values shared between the control surface and stages
///
/// Each value is read atomically; a change to one value may land a frame
/// before or after a simultaneous change to another.
#[derive(Debug)]
pub struct LiveSettings {
    blur_intensity: AtomicU8,
    edge_smoothing: AtomicBool,
    temporal_smoothing: AtomicBool,
    noise_reduction: AtomicBool,
    performance_mode: AtomicBool,
}

impl LiveSettings {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            blur_intensity: AtomicU8::new(clamp_intensity(config.effects.blur_intensity)),
            edge_smoothing: AtomicBool::new(config.effects.edge_smoothing),
            temporal_smoothing: AtomicBool::new(config.effects.temporal_smoothing),
            noise_reduction: AtomicBool::new(config.effects.noise_reduction),
            performance_mode: AtomicBool::new(config.ai.performance_mode),
        }
    }

    pub fn snapshot(&self) -> EffectSettings {
        EffectSettings {
            blur_intensity: self.blur_intensity(),
            edge_smoothing: self.edge_smoothing(),
            temporal_smoothing: self.temporal_smoothing(),
            noise_reduction: self.noise_reduction(),
            model_mode: self.model_mode(),
        }
    }

    /// Stores the clamped value and returns it
    pub fn set_blur_intensity(&self, intensity: u8) -> u8 {
        let intensity = clamp_intensity(intensity);
        self.blur_intensity.store(intensity, Ordering::Relaxed);
        intensity
    }

    pub fn blur_intensity(&self) -> u8 {
        self.blur_intensity.load(Ordering::Relaxed)
    }

    pub fn set_edge_smoothing(&self, enabled: bool) {
        self.edge_smoothing.store(enabled, Ordering::Relaxed);
    }

    pub fn edge_smoothing(&self) -> bool {
        self.edge_smoothing.load(Ordering::Relaxed)
    }

    pub fn set_temporal_smoothing(&self, enabled: bool) {
        self.temporal_smoothing.store(enabled, Ordering::Relaxed);
    }

    pub fn temporal_smoothing(&self) -> bool {
        self.temporal_smoothing.load(Ordering::Relaxed)
    }

    pub fn set_noise_reduction(&self, enabled: bool) {
        self.noise_reduction.store(enabled, Ordering::Relaxed);
    }

    pub fn noise_reduction(&self) -> bool {
        self.noise_reduction.load(Ordering::Relaxed)
    }

    pub fn set_performance_mode(&self, performance: bool) {
        self.performance_mode.store(performance, Ordering::Relaxed);
    }

    pub fn performance_mode(&self) -> bool {
        self.performance_mode.load(Ordering::Relaxed)
    }

    pub fn model_mode(&self) -> ModelMode {
        ModelMode::from_performance(self.performance_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.video.camera_width, 1280);
        assert_eq!(config.video.ai_width, 512);
        assert_eq!(config.video.ai_height, 288);
        assert_eq!(config.effects.blur_intensity, 15);
        assert!(config.effects.edge_smoothing);
        assert!(config.effects.temporal_smoothing);
        assert!(!config.effects.noise_reduction);
        assert!((config.blur.intensity_multiplier - 1.8).abs() < f64::EPSILON);
        assert_eq!(config.blur.algorithm, BlurAlgorithm::Optimized);
        assert_eq!((config.blur.low_tier_max, config.blur.mid_tier_max), (15, 36));
        assert_eq!(config.buffers.capture_capacity, 2);
        assert_eq!(config.refine.temporal_history, 2);
        assert_eq!(config.model_mode(), ModelMode::Accurate);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let json = r#"{ "effects": { "blur_intensity": 40 }, "refine": { "edge_kernel_size": 4 } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        let config = config.validated();
        assert_eq!(config.effects.blur_intensity, 25);
        assert!(config.effects.edge_smoothing);
        assert_eq!(config.refine.edge_kernel_size, 5);
        assert_eq!(config.video.fps, 30);
    }

    #[test]
    fn blur_algorithm_is_read_from_json() {
        let json = r#"{ "blur": { "algorithm": "quality" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.blur.algorithm, BlurAlgorithm::Quality);
        assert_eq!(config.blur.low_tier_max, 15);
    }

    #[test]
    fn validation_repairs_bad_values() {
        let mut config = PipelineConfig::default();
        config.effects.blur_intensity = 0;
        config.blur.alpha_kernel = 0;
        config.blur.intensity_multiplier = -1.0;
        config.refine.temporal_history = 0;
        config.refine.temporal_weight = 3.0;
        config.buffers.output_capacity = 0;
        let config = config.validated();
        assert_eq!(config.effects.blur_intensity, 1);
        assert_eq!(config.blur.alpha_kernel, 1);
        assert!((config.blur.intensity_multiplier - 1.8).abs() < f64::EPSILON);
        assert_eq!(config.refine.temporal_history, 2);
        assert_eq!(config.refine.temporal_weight, 1.0);
        assert_eq!(config.buffers.output_capacity, 1);
    }

    #[test]
    fn live_settings_clamp_intensity() {
        let settings = LiveSettings::new(&PipelineConfig::default());
        assert_eq!(settings.set_blur_intensity(0), 1);
        assert_eq!(settings.set_blur_intensity(99), 25);
        assert_eq!(settings.blur_intensity(), 25);
    }

    #[test]
    fn snapshot_reflects_updates() {
        let settings = LiveSettings::new(&PipelineConfig::default());
        settings.set_noise_reduction(true);
        settings.set_performance_mode(true);
        let snapshot = settings.snapshot();
        assert!(snapshot.noise_reduction);
        assert_eq!(snapshot.model_mode, ModelMode::Fast);
    }
}
