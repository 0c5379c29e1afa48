mod preprocess;
mod rvm;
mod selfie;
mod stage;
pub mod types;

pub use preprocess::{Preprocessor, TensorLayout};
pub use rvm::RobustVideoMatting;
pub use selfie::SelfieSegmentation;
pub use stage::{matte_to_mask, SegmentationStage};
pub use types::{Matte, ModelFactory, ModelMode, SegmentationModel};

use anyhow::{Context, Result};
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::{Path, PathBuf};

use crate::config::AiConfig;

/// Open an ONNX session, preferring GPU execution providers when present
fn build_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_execution_providers([
            TensorRTExecutionProvider::default().build(),
            CUDAExecutionProvider::default().build(),
        ])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model from {}", path.display()))?;
    Ok(session)
}

/// Builds the ONNX model matching each mode from files on disk
pub struct OnnxModelFactory {
    fast_model: PathBuf,
    accurate_model: PathBuf,
    intra_threads: usize,
}

impl OnnxModelFactory {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            fast_model: config.fast_model.clone(),
            accurate_model: config.accurate_model.clone(),
            intra_threads: config.intra_threads.max(1),
        }
    }
}

impl ModelFactory for OnnxModelFactory {
    fn create(&self, mode: ModelMode) -> Result<Box<dyn SegmentationModel>> {
        let model: Box<dyn SegmentationModel> = match mode {
            ModelMode::Fast => Box::new(SelfieSegmentation::new(&self.fast_model, self.intra_threads)?),
            ModelMode::Accurate => Box::new(RobustVideoMatting::new(
                &self.accurate_model,
                self.intra_threads,
            )?),
        };
        Ok(model)
    }
}
