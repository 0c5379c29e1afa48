use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Foreground probability map at model resolution
///
/// Values are 0.0 = background, 1.0 = foreground, flattened in row-major order.
#[derive(Debug, Clone)]
pub struct Matte {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl Matte {
    /// Returns `None` when `values` doesn't cover `width * height`
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Option<Self> {
        if values.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            values,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Accuracy/speed tradeoff of the segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Fast,
    Accurate,
}

impl ModelMode {
    pub fn from_performance(performance: bool) -> Self {
        if performance {
            ModelMode::Fast
        } else {
            ModelMode::Accurate
        }
    }

    pub fn is_performance(self) -> bool {
        self == ModelMode::Fast
    }
}

impl std::fmt::Display for ModelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelMode::Fast => f.write_str("fast"),
            ModelMode::Accurate => f.write_str("accurate"),
        }
    }
}

/// Trait for segmentation models
/// Allows swapping between different backends (RVM, MediaPipe selfie, ...)
pub trait SegmentationModel: Send {
    /// Infer a foreground matte for an RGB frame
    ///
    /// # Returns
    /// * `Ok(None)` when the model produced no mask for this frame
    fn segment(&mut self, frame: &RgbImage) -> Result<Option<Matte>>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Call this when:
    /// - Switching cameras
    /// - The frame size changes
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Which variant this model is
    fn mode(&self) -> ModelMode;
}

/// Builds a model for a given mode
///
/// Models are not switched in place; a mode change discards the current
/// model and asks the factory for a new one.
pub trait ModelFactory: Send + Sync {
    fn create(&self, mode: ModelMode) -> Result<Box<dyn SegmentationModel>>;
}
