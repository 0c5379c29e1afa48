use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{Matte, ModelMode, SegmentationModel};
use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{Array1, ArrayD, IxDyn};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// RobustVideoMatting segmentation model, the accurate variant
///
/// This model uses recurrent connections to maintain temporal consistency.
/// Hidden states (r1-r4) are carried between frames for smooth results.
pub struct RobustVideoMatting {
    session: Session,
    preprocessor: Preprocessor,

    // Recurrent hidden states
    // These are updated after each inference and fed back in the next frame
    recurrent: [ArrayD<f32>; 4],

    // Resolution of the recurrent states relative to the input
    downsample_ratio: f32,
}

fn zero_state() -> ArrayD<f32> {
    // The model sizes its states itself once it sees a 1x1x1x1 zero tensor.
    ArrayD::zeros(IxDyn(&[1, 1, 1, 1]))
}

impl RobustVideoMatting {
    /// Create a new RVM model from an ONNX file
    ///
    /// # Default Configuration
    /// - Input size: whatever the segmentation stage feeds it (the AI resolution)
    /// - Downsample ratio: 0.375, suited to 512x288 inputs
    pub fn new<P: AsRef<Path>>(model_path: P, intra_threads: usize) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading RVM model from {}", path.display());
        let session = super::build_session(path, intra_threads)?;
        tracing::info!("RVM model loaded successfully");

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(None, TensorLayout::Nchw),
            recurrent: [zero_state(), zero_state(), zero_state(), zero_state()],
            downsample_ratio: 0.375,
        })
    }
}

impl SegmentationModel for RobustVideoMatting {
    fn segment(&mut self, frame: &RgbImage) -> Result<Option<Matte>> {
        let _span = tracing::debug_span!("rvm_segment").entered();

        let input_tensor = self.preprocessor.preprocess(frame);
        let ratio = Array1::from_elem(1, self.downsample_ratio);

        // RVM expects: src, r1i..r4i, downsample_ratio
        // and returns: fgr, pha, r1o..r4o
        let (pha, next_states) = {
            let _infer_span = tracing::debug_span!("inference").entered();
            let [r1, r2, r3, r4] = &self.recurrent;
            let outputs = self
                .session
                .run(ort::inputs![
                    TensorRef::from_array_view(input_tensor.view())?,
                    TensorRef::from_array_view(r1.view())?,
                    TensorRef::from_array_view(r2.view())?,
                    TensorRef::from_array_view(r3.view())?,
                    TensorRef::from_array_view(r4.view())?,
                    TensorRef::from_array_view(ratio.view())?,
                ])
                .context("Failed to run inference")?;

            let pha = outputs["pha"].try_extract_array::<f32>()?.to_owned();
            let mut next_states = Vec::with_capacity(4);
            for name in ["r1o", "r2o", "r3o", "r4o"] {
                next_states.push(outputs[name].try_extract_array::<f32>()?.to_owned());
            }
            (pha, next_states)
        };

        // Update hidden states for next frame
        for (slot, state) in self.recurrent.iter_mut().zip(next_states) {
            *slot = state;
        }

        // Alpha matte shape: [1, 1, H, W]
        let shape = pha.shape();
        if shape.len() != 4 {
            tracing::warn!("Unexpected RVM matte shape {:?}", shape);
            return Ok(None);
        }
        let (matte_height, matte_width) = (shape[2] as u32, shape[3] as u32);
        Ok(Matte::new(
            matte_width,
            matte_height,
            pha.iter().copied().collect(),
        ))
    }

    fn reset_state(&mut self) {
        tracing::info!("Resetting RVM hidden states");
        self.recurrent = [zero_state(), zero_state(), zero_state(), zero_state()];
    }

    fn mode(&self) -> ModelMode {
        ModelMode::Accurate
    }
}
