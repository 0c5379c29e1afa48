use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{Matte, ModelMode, SegmentationModel};
use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// MediaPipe selfie segmentation (landscape), the fast variant
///
/// Stateless: every frame is segmented independently at 256x144.
pub struct SelfieSegmentation {
    session: Session,
    preprocessor: Preprocessor,
}

impl SelfieSegmentation {
    const INPUT_WIDTH: u32 = 256;
    const INPUT_HEIGHT: u32 = 144;

    pub fn new<P: AsRef<Path>>(model_path: P, intra_threads: usize) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading selfie segmentation model from {}", path.display());
        let session = super::build_session(path, intra_threads)?;
        tracing::info!("Selfie segmentation model loaded successfully");

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(
                Some((Self::INPUT_WIDTH, Self::INPUT_HEIGHT)),
                TensorLayout::Nhwc,
            ),
        })
    }
}

impl SegmentationModel for SelfieSegmentation {
    fn segment(&mut self, frame: &RgbImage) -> Result<Option<Matte>> {
        let _span = tracing::debug_span!("selfie_segment").entered();

        let input_tensor = self.preprocessor.preprocess(frame);

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input_tensor.view())?])
            .context("Failed to run inference")?;

        // Single output, shape [1, H, W, 1]
        let mask = outputs[0].try_extract_array::<f32>()?;
        let shape = mask.shape();
        if shape.len() != 4 {
            tracing::warn!("Unexpected selfie mask shape {:?}", shape);
            return Ok(None);
        }
        let (height, width) = (shape[1] as u32, shape[2] as u32);
        Ok(Matte::new(width, height, mask.iter().copied().collect()))
    }

    fn mode(&self) -> ModelMode {
        ModelMode::Fast
    }
}
