use serde::Serialize;

use crate::config::{clamp_intensity, BlurAlgorithm, BlurConfig};
use crate::filters::{
    bilateral_filter, gaussian_blur_f32, gaussian_blur_u8, median_filter_u8, odd_kernel,
};
use crate::frame::{Frame, Mask};

const NOISE_DIAMETER: u32 = 5;
const NOISE_SIGMA_COLOR: f32 = 50.0;
const NOISE_SIGMA_SPACE: f32 = 50.0;

/// Quality blur adds a median pass above this intensity
const QUALITY_MEDIAN_ABOVE: u8 = 20;
const QUALITY_MEDIAN_MAX: u32 = 15;
const QUALITY_ALPHA_KERNEL: u32 = 3;
const QUALITY_ALPHA_SIGMA: f32 = 1.0;

/// Blur strategy for one intensity, cheapest that looks right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlurPlan {
    /// One Gaussian pass
    Single { kernel: u32 },
    /// Two cascaded passes, smaller kernel first
    Cascade { first: u32, second: u32 },
    /// Two passes at half resolution, upsample, one finishing pass
    Downsampled { kernel: u32, finish: u32 },
    /// One full-size Gaussian pass, optionally followed by a median pass
    Quality { kernel: u32, median: Option<u32> },
}

impl BlurPlan {
    /// Every kernel size the plan will use
    pub fn kernels(&self) -> Vec<u32> {
        match *self {
            BlurPlan::Single { kernel } => vec![kernel],
            BlurPlan::Cascade { first, second } => vec![first, second],
            BlurPlan::Downsampled { kernel, finish } => vec![kernel, kernel, finish],
            BlurPlan::Quality { kernel, median } => std::iter::once(kernel).chain(median).collect(),
        }
    }
}

/// `max(floor, radius * factor + 1)`, forced odd
fn scaled_kernel(radius: u32, factor: f64, floor: u32) -> u32 {
    odd_kernel(((radius as f64 * factor) as u32 + 1).max(floor))
}

pub struct Compositor {
    config: BlurConfig,
}

impl Compositor {
    pub fn new(config: BlurConfig) -> Self {
        Self { config }
    }

    /// Intensity scaled onto the wider blur range
    pub fn effective_radius(&self, intensity: u8) -> u32 {
        (clamp_intensity(intensity) as f64 * self.config.intensity_multiplier) as u32
    }

    pub fn plan(&self, intensity: u8) -> BlurPlan {
        if self.config.algorithm == BlurAlgorithm::Quality {
            let intensity = clamp_intensity(intensity);
            let kernel = odd_kernel((2 * intensity as u32 + 1).max(3));
            let median = (intensity > QUALITY_MEDIAN_ABOVE)
                .then(|| odd_kernel(kernel.min(QUALITY_MEDIAN_MAX)));
            return BlurPlan::Quality { kernel, median };
        }

        let radius = self.effective_radius(intensity);
        let config = &self.config;
        if radius <= config.low_tier_max {
            BlurPlan::Single {
                kernel: scaled_kernel(radius, 1.0, 3),
            }
        } else if radius <= config.mid_tier_max {
            BlurPlan::Cascade {
                first: scaled_kernel(radius, config.mid_first_factor, 5),
                second: scaled_kernel(radius, config.mid_second_factor, 7),
            }
        } else {
            BlurPlan::Downsampled {
                kernel: scaled_kernel(radius, config.high_factor, 7),
                finish: scaled_kernel(radius, config.high_finish_factor, 5),
            }
        }
    }

    /// Blur the whole frame according to `plan`
    pub fn blur_frame(&self, frame: &Frame, plan: BlurPlan) -> Frame {
        let _span = tracing::debug_span!("blur_background", ?plan).entered();
        let (width, height) = frame.dimensions();
        match plan {
            BlurPlan::Single { kernel } => {
                frame.with_data(gaussian_blur_u8(frame.as_bytes(), width, height, 3, kernel, 0.0))
            }
            BlurPlan::Cascade { first, second } => {
                let pass = gaussian_blur_u8(frame.as_bytes(), width, height, 3, first, 0.0);
                frame.with_data(gaussian_blur_u8(&pass, width, height, 3, second, 0.0))
            }
            BlurPlan::Downsampled { kernel, finish } => {
                let (small_w, small_h) = ((width / 2).max(1), (height / 2).max(1));
                let small = frame.resized(small_w, small_h);
                let pass = gaussian_blur_u8(small.as_bytes(), small_w, small_h, 3, kernel, 0.0);
                let pass = gaussian_blur_u8(&pass, small_w, small_h, 3, kernel, 0.0);
                let restored = small.with_data(pass).resized(width, height);
                frame.with_data(gaussian_blur_u8(
                    restored.as_bytes(),
                    width,
                    height,
                    3,
                    finish,
                    0.0,
                ))
            }
            BlurPlan::Quality { kernel, median } => {
                let pass = gaussian_blur_u8(frame.as_bytes(), width, height, 3, kernel, 0.0);
                match median {
                    Some(ksize) => frame.with_data(median_filter_u8(&pass, width, height, 3, ksize)),
                    None => frame.with_data(pass),
                }
            }
        }
    }

    /// Sharp foreground over blurred background, using `mask` as alpha
    ///
    /// `frame` and `mask` must have the same dimensions.
    pub fn apply_background_blur(&self, frame: &Frame, mask: &Mask, intensity: u8) -> Frame {
        let _span = tracing::debug_span!("composite").entered();
        debug_assert_eq!(frame.dimensions(), mask.dimensions());

        let (width, height) = frame.dimensions();
        let background = self.blur_frame(frame, self.plan(intensity));

        let (alpha_kernel, alpha_sigma) = match self.config.algorithm {
            BlurAlgorithm::Optimized => (self.config.alpha_kernel, self.config.alpha_sigma),
            BlurAlgorithm::Quality => (QUALITY_ALPHA_KERNEL, QUALITY_ALPHA_SIGMA),
        };
        let alpha: Vec<f32> = mask.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        let alpha = gaussian_blur_f32(&alpha, width, height, alpha_kernel, alpha_sigma);

        let blended: Vec<u8> = frame
            .as_bytes()
            .chunks_exact(3)
            .zip(background.as_bytes().chunks_exact(3))
            .zip(&alpha)
            .flat_map(|((fg, bg), &a)| {
                let a = a.clamp(0.0, 1.0);
                let mix = |f: u8, b: u8| (f as f32 * a + b as f32 * (1.0 - a)).round().clamp(0.0, 255.0) as u8;
                [mix(fg[0], bg[0]), mix(fg[1], bg[1]), mix(fg[2], bg[2])]
            })
            .collect();
        frame.with_data(blended)
    }

    /// Edge-preserving denoise, identity when disabled
    pub fn apply_noise_reduction(&self, frame: Frame, enabled: bool) -> Frame {
        if !enabled {
            return frame;
        }
        let _span = tracing::debug_span!("noise_reduction").entered();
        let (width, height) = frame.dimensions();
        let filtered = bilateral_filter(
            frame.as_bytes(),
            width,
            height,
            NOISE_DIAMETER,
            NOISE_SIGMA_COLOR,
            NOISE_SIGMA_SPACE,
        );
        frame.with_data(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_BLUR_INTENSITY, MIN_BLUR_INTENSITY};
    use image::Luma;

    fn compositor() -> Compositor {
        Compositor::new(BlurConfig::default())
    }

    fn quality() -> Compositor {
        Compositor::new(BlurConfig {
            algorithm: BlurAlgorithm::Quality,
            ..Default::default()
        })
    }

    /// Vertical stripes, so any blur visibly changes pixels
    fn stripes(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..height {
            for x in 0..width {
                let v = if (x / 2) % 2 == 0 { 0 } else { 240 };
                data.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        Frame::from_bgr(width, height, data).unwrap()
    }

    #[test]
    fn tiers_match_default_boundaries() {
        let c = compositor();
        assert!(matches!(c.plan(5), BlurPlan::Single { .. }));
        assert!(matches!(c.plan(18), BlurPlan::Cascade { .. }));
        assert!(matches!(c.plan(24), BlurPlan::Downsampled { .. }));
    }

    #[test]
    fn low_tier_ends_at_radius_fifteen() {
        let c = compositor();
        // 8 * 1.8 = 14.4 -> 14, 9 * 1.8 = 16.2 -> 16
        assert!(matches!(c.plan(8), BlurPlan::Single { .. }));
        assert!(matches!(c.plan(9), BlurPlan::Cascade { .. }));
        let at_bound = Compositor::new(BlurConfig {
            intensity_multiplier: 1.0,
            ..Default::default()
        });
        assert!(matches!(at_bound.plan(15), BlurPlan::Single { kernel: 17 }));
        assert!(matches!(at_bound.plan(16), BlurPlan::Cascade { .. }));
    }

    #[test]
    fn quality_kernel_grows_with_raw_intensity() {
        let c = quality();
        assert_eq!(c.plan(1), BlurPlan::Quality { kernel: 3, median: None });
        assert_eq!(c.plan(10), BlurPlan::Quality { kernel: 21, median: None });
        assert_eq!(c.plan(20), BlurPlan::Quality { kernel: 41, median: None });
    }

    #[test]
    fn quality_adds_capped_median_above_twenty() {
        let c = quality();
        assert_eq!(c.plan(21), BlurPlan::Quality { kernel: 43, median: Some(15) });
        assert_eq!(c.plan(25), BlurPlan::Quality { kernel: 51, median: Some(15) });
        assert_eq!(c.plan(25).kernels(), vec![51, 15]);
    }

    #[test]
    fn quality_median_pass_changes_the_background() {
        let frame = stripes(24, 16);
        let c = quality();
        let gaussian_only = c.blur_frame(&frame, BlurPlan::Quality { kernel: 43, median: None });
        let with_median = c.blur_frame(&frame, c.plan(21));
        assert_eq!(with_median.dimensions(), (24, 16));
        assert_eq!(
            with_median.as_bytes(),
            median_filter_u8(gaussian_only.as_bytes(), 24, 16, 3, 15).as_slice()
        );
    }

    #[test]
    fn quality_full_mask_keeps_frame_sharp() {
        let frame = stripes(24, 16);
        let mask = Mask::from_pixel(24, 16, Luma([255]));
        let out = quality().apply_background_blur(&frame, &mask, 22);
        assert_eq!(out.as_bytes(), frame.as_bytes());
    }

    #[test]
    fn tier_kernels_follow_formulas() {
        let c = compositor();
        // radius 9
        assert_eq!(c.plan(5), BlurPlan::Single { kernel: 11 });
        // radius 32: 0.6 * 32 + 1 = 20 -> 21, 0.8 * 32 + 1 = 26 -> 27
        assert_eq!(c.plan(18), BlurPlan::Cascade { first: 21, second: 27 });
        // radius 43: 0.4 * 43 + 1 = 18 -> 19, 0.3 * 43 + 1 = 13
        assert_eq!(c.plan(24), BlurPlan::Downsampled { kernel: 19, finish: 13 });
    }

    #[test]
    fn every_kernel_is_positive_and_odd() {
        let configs = [
            BlurConfig::default(),
            BlurConfig {
                intensity_multiplier: 1.0,
                low_tier_max: 4,
                mid_tier_max: 10,
                ..Default::default()
            },
            BlurConfig {
                intensity_multiplier: 3.3,
                low_tier_max: 0,
                mid_tier_max: 0,
                ..Default::default()
            },
            BlurConfig {
                algorithm: BlurAlgorithm::Quality,
                ..Default::default()
            },
        ];
        for config in configs {
            let c = Compositor::new(config);
            for intensity in MIN_BLUR_INTENSITY..=MAX_BLUR_INTENSITY {
                for k in c.plan(intensity).kernels() {
                    assert!(k > 0 && k % 2 == 1, "kernel {k} at intensity {intensity}");
                }
            }
        }
    }

    #[test]
    fn intensity_is_clamped() {
        let c = compositor();
        assert_eq!(c.plan(0), c.plan(1));
        assert_eq!(c.plan(200), c.plan(25));
    }

    #[test]
    fn full_mask_keeps_frame_sharp() {
        let frame = stripes(24, 16);
        let mask = Mask::from_pixel(24, 16, Luma([255]));
        let out = compositor().apply_background_blur(&frame, &mask, 25);
        assert_eq!(out.as_bytes(), frame.as_bytes());
    }

    #[test]
    fn empty_mask_gives_blurred_background() {
        let frame = stripes(24, 16);
        let mask = Mask::from_pixel(24, 16, Luma([0]));
        let c = compositor();
        for intensity in [5, 18, 24] {
            let out = c.apply_background_blur(&frame, &mask, intensity);
            let blurred = c.blur_frame(&frame, c.plan(intensity));
            assert_eq!(out.as_bytes(), blurred.as_bytes());
            assert_ne!(out.as_bytes(), frame.as_bytes());
        }
    }

    #[test]
    fn high_tier_keeps_frame_size() {
        let frame = stripes(33, 17);
        let c = compositor();
        let out = c.blur_frame(&frame, c.plan(25));
        assert_eq!(out.dimensions(), (33, 17));
    }

    #[test]
    fn half_mask_blends_between_layers() {
        let frame = Frame::filled(8, 8, [200, 200, 200]);
        let mask = Mask::from_pixel(8, 8, Luma([128]));
        let out = compositor().apply_background_blur(&frame, &mask, 10);
        // Flat frame: blurred background equals the frame.
        assert!(out.as_bytes().iter().all(|&v| v == 200));
    }

    #[test]
    fn noise_reduction_disabled_is_identity() {
        let frame = stripes(10, 10);
        let out = compositor().apply_noise_reduction(frame.clone(), false);
        assert_eq!(out.as_bytes(), frame.as_bytes());
    }

    #[test]
    fn noise_reduction_keeps_size() {
        let frame = stripes(10, 6);
        let out = compositor().apply_noise_reduction(frame, true);
        assert_eq!(out.dimensions(), (10, 6));
    }
}
