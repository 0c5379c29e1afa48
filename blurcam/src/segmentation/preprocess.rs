use image::{imageops, RgbImage};
use ndarray::Array4;

/// Memory layout expected by a model's image input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [1, 3, H, W]
    Nchw,
    /// [1, H, W, 3]
    Nhwc,
}

/// Preprocessor for converting RGB images to model input tensors
pub struct Preprocessor {
    /// Fixed model input size, or `None` to feed the frame at its own size
    target: Option<(u32, u32)>,
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(target: Option<(u32, u32)>, layout: TensorLayout) -> Self {
        Self { target, layout }
    }

    /// Dimensions the tensor will have for an image of `source` size
    pub fn input_size(&self, source: (u32, u32)) -> (u32, u32) {
        self.target.unwrap_or(source)
    }

    /// Preprocess an RGB image into a normalized tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions if the model has a fixed input
    /// 2. Convert to float and normalize to [0, 1]
    /// 3. Lay out as NCHW or NHWC
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let (width, height) = self.input_size(image.dimensions());
        let resized;
        let source = if image.dimensions() != (width, height) {
            resized = imageops::resize(image, width, height, imageops::FilterType::Triangle);
            &resized
        } else {
            image
        };

        let (w, h) = (width as usize, height as usize);
        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        };

        for (x, y, pixel) in source.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }

        tensor
    }
}
