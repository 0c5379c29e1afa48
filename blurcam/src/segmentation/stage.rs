use std::sync::Arc;

use anyhow::Result;

use super::types::{Matte, ModelFactory, ModelMode, SegmentationModel};
use crate::frame::{probability_to_u8, resize_mask, Frame, Mask};

/// Turns camera frames into full-resolution foreground masks
pub struct SegmentationStage {
    model: Box<dyn SegmentationModel>,
    factory: Arc<dyn ModelFactory>,
    ai_width: u32,
    ai_height: u32,
    /// Frame size seen last, to notice camera renegotiation
    last_frame_size: Option<(u32, u32)>,
}

impl SegmentationStage {
    /// Build the initial model for `mode`. Failure here is fatal to start.
    pub fn new(factory: Arc<dyn ModelFactory>, mode: ModelMode, ai_size: (u32, u32)) -> Result<Self> {
        let model = factory.create(mode)?;
        Ok(Self {
            model,
            factory,
            ai_width: ai_size.0.max(1),
            ai_height: ai_size.1.max(1),
            last_frame_size: None,
        })
    }

    pub fn mode(&self) -> ModelMode {
        self.model.mode()
    }

    pub fn ai_resolution(&self) -> (u32, u32) {
        (self.ai_width, self.ai_height)
    }

    /// Switch between the fast and accurate model
    ///
    /// Returns `Ok(true)` when the model was replaced; masks produced before
    /// the switch must not be blended with later ones. On failure the
    /// current model stays in place.
    pub fn set_model_mode(&mut self, mode: ModelMode) -> Result<bool> {
        if mode == self.model.mode() {
            return Ok(false);
        }
        tracing::info!("Switching segmentation model to {} mode", mode);
        self.model = self.factory.create(mode)?;
        Ok(true)
    }

    /// Foreground mask for `frame`, or `None` when the model has nothing
    pub fn process(&mut self, frame: &Frame) -> Option<Mask> {
        let _span = tracing::debug_span!("segment_frame").entered();

        let frame_size = frame.dimensions();
        if self.last_frame_size.is_some_and(|size| size != frame_size) {
            tracing::info!(
                "Frame size changed to {}x{}, resetting model state",
                frame_size.0,
                frame_size.1
            );
            self.model.reset_state();
        }
        self.last_frame_size = Some(frame_size);

        // BGR -> RGB at AI resolution
        let rgb = frame.to_rgb_image(self.ai_width, self.ai_height);

        let matte = match self.model.segment(&rgb) {
            Ok(Some(matte)) => matte,
            Ok(None) => {
                tracing::debug!("Model produced no mask");
                return None;
            }
            Err(e) => {
                tracing::warn!("Segmentation failed: {:#}", e);
                return None;
            }
        };

        Some(matte_to_mask(&matte, frame_size.0, frame_size.1))
    }
}

/// Rescale a model matte to 8-bit and resize it to the frame
pub fn matte_to_mask(matte: &Matte, width: u32, height: u32) -> Mask {
    let _span = tracing::debug_span!("postprocess").entered();

    let values = matte.values();
    let gray = Mask::from_fn(matte.width(), matte.height(), |x, y| {
        let idx = (y * matte.width() + x) as usize;
        image::Luma([probability_to_u8(values[idx])])
    });
    resize_mask(&gray, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use parking_lot::Mutex;

    /// Records input sizes and returns a constant matte
    struct ConstantModel {
        mode: ModelMode,
        value: Option<f32>,
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
        resets: Arc<Mutex<usize>>,
    }

    impl SegmentationModel for ConstantModel {
        fn segment(&mut self, frame: &RgbImage) -> Result<Option<Matte>> {
            self.seen.lock().push(frame.dimensions());
            Ok(self.value.map(|v| {
                let (w, h) = (16, 9);
                Matte::new(w, h, vec![v; (w * h) as usize]).unwrap()
            }))
        }

        fn reset_state(&mut self) {
            *self.resets.lock() += 1;
        }

        fn mode(&self) -> ModelMode {
            self.mode
        }
    }

    #[derive(Default)]
    struct Factory {
        value: Option<f32>,
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
        resets: Arc<Mutex<usize>>,
        created: Mutex<Vec<ModelMode>>,
        fail_fast: bool,
    }

    impl ModelFactory for Factory {
        fn create(&self, mode: ModelMode) -> Result<Box<dyn SegmentationModel>> {
            if self.fail_fast && mode == ModelMode::Fast {
                anyhow::bail!("fast model missing");
            }
            self.created.lock().push(mode);
            Ok(Box::new(ConstantModel {
                mode,
                value: self.value,
                seen: self.seen.clone(),
                resets: self.resets.clone(),
            }))
        }
    }

    #[test]
    fn mask_matches_frame_size_and_model_sees_ai_size() {
        let factory = Arc::new(Factory {
            value: Some(1.0),
            ..Default::default()
        });
        let mut stage =
            SegmentationStage::new(factory.clone(), ModelMode::Accurate, (64, 36)).unwrap();
        let mask = stage.process(&Frame::filled(640, 480, [0, 0, 0])).unwrap();
        assert_eq!(mask.dimensions(), (640, 480));
        assert!(mask.pixels().all(|p| p[0] == 255));
        assert_eq!(factory.seen.lock().as_slice(), &[(64, 36)]);
    }

    #[test]
    fn missing_mask_is_none() {
        let factory = Arc::new(Factory::default());
        let mut stage = SegmentationStage::new(factory, ModelMode::Fast, (32, 18)).unwrap();
        assert!(stage.process(&Frame::filled(64, 48, [1, 2, 3])).is_none());
    }

    #[test]
    fn mode_switch_rebuilds_only_on_change() {
        let factory = Arc::new(Factory {
            value: Some(0.5),
            ..Default::default()
        });
        let mut stage =
            SegmentationStage::new(factory.clone(), ModelMode::Accurate, (32, 18)).unwrap();
        assert!(!stage.set_model_mode(ModelMode::Accurate).unwrap());
        assert!(stage.set_model_mode(ModelMode::Fast).unwrap());
        assert_eq!(stage.mode(), ModelMode::Fast);
        assert_eq!(
            factory.created.lock().as_slice(),
            &[ModelMode::Accurate, ModelMode::Fast]
        );
    }

    #[test]
    fn failed_switch_keeps_current_model() {
        let factory = Arc::new(Factory {
            value: Some(0.5),
            fail_fast: true,
            ..Default::default()
        });
        let mut stage = SegmentationStage::new(factory, ModelMode::Accurate, (32, 18)).unwrap();
        assert!(stage.set_model_mode(ModelMode::Fast).is_err());
        assert_eq!(stage.mode(), ModelMode::Accurate);
        assert!(stage.process(&Frame::filled(64, 48, [0, 0, 0])).is_some());
    }

    #[test]
    fn frame_size_change_resets_model_state() {
        let factory = Arc::new(Factory {
            value: Some(0.2),
            ..Default::default()
        });
        let mut stage =
            SegmentationStage::new(factory.clone(), ModelMode::Accurate, (32, 18)).unwrap();
        stage.process(&Frame::filled(64, 48, [0, 0, 0]));
        stage.process(&Frame::filled(64, 48, [0, 0, 0]));
        assert_eq!(*factory.resets.lock(), 0);
        stage.process(&Frame::filled(32, 24, [0, 0, 0]));
        assert_eq!(*factory.resets.lock(), 1);
    }

    #[test]
    fn matte_rescale_is_consistent_across_resizes() {
        let matte = Matte::new(4, 4, vec![0.5; 16]).unwrap();
        let mask = matte_to_mask(&matte, 4, 4);
        let upscaled = matte_to_mask(&matte, 40, 40);
        assert!(mask.pixels().all(|p| p[0] == 128));
        assert!(upscaled.pixels().all(|p| p[0] == 128));
    }
}
