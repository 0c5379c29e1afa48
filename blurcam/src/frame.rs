use image::{imageops, GrayImage, ImageBuffer, Rgb, RgbImage};
use std::time::Instant;

/// Single-channel foreground mask: 0 = background, 255 = foreground.
/// Always the same size as the frame it was computed for.
pub type Mask = GrayImage;

/// Packed 3-channel BGR frame
///
/// Rows are tightly packed, so the stride is always `width * 3`.
/// Frames are moved between stages, never shared.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    /// Wrap raw BGR bytes. Returns `None` if the buffer length doesn't match.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) * 3 {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
        })
    }

    /// Frame filled with one BGR colour
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take((width as usize) * (height as usize) * 3)
            .collect();
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    /// Convert a decoded RGB camera image to BGR order
    pub fn from_rgb_image(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for pixel in image.pixels() {
            data.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        }
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    /// Copy into an RGB image, optionally resizing, for model input
    pub fn to_rgb_image(&self, width: u32, height: u32) -> RgbImage {
        let resized = self.resized(width, height);
        RgbImage::from_fn(width, height, |x, y| {
            let [b, g, r] = resized.pixel(x, y);
            Rgb([r, g, b])
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 3
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = y as usize * self.stride() + x as usize * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Same timestamp, new pixel data of identical size
    pub(crate) fn with_data(&self, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), self.data.len());
        Self {
            data,
            width: self.width,
            height: self.height,
            timestamp: self.timestamp,
        }
    }

    /// Bilinear resize. A no-op clone when dimensions already match.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        let _span = tracing::debug_span!("resize_frame").entered();

        // Resizing is channel-order agnostic, so the BGR bytes ride in an RGB container.
        let Some(buffer) =
            ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(self.width, self.height, self.data.clone())
        else {
            return Frame::filled(width, height, [0, 0, 0]);
        };
        let resized = imageops::resize(&buffer, width, height, imageops::FilterType::Triangle);
        Frame {
            data: resized.into_raw(),
            width,
            height,
            timestamp: self.timestamp,
        }
    }
}

/// Bilinear mask resize, identity when sizes match
pub fn resize_mask(mask: &Mask, width: u32, height: u32) -> Mask {
    if mask.dimensions() == (width, height) {
        return mask.clone();
    }
    imageops::resize(mask, width, height, imageops::FilterType::Triangle)
}

/// Rescale a probability in [0, 1] to the 8-bit mask range
#[inline]
pub fn probability_to_u8(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
