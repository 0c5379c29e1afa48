use std::collections::VecDeque;

use crate::config::RefineConfig;
use crate::filters::{gaussian_blur_u8, morphological_close, odd_kernel};
use crate::frame::Mask;

const EDGE_BLUR_KERNEL: u32 = 3;
const EDGE_BLUR_SIGMA: f32 = 0.5;

/// The most recent refined masks, newest last
pub(crate) struct TemporalMaskHistory {
    masks: VecDeque<Mask>,
    capacity: usize,
}

impl TemporalMaskHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            masks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, mask: Mask) {
        if self.masks.len() == self.capacity {
            self.masks.pop_front();
        }
        self.masks.push_back(mask);
    }

    /// The entry before the newest one
    pub fn previous(&self) -> Option<&Mask> {
        self.masks.len().checked_sub(2).and_then(|i| self.masks.get(i))
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn clear(&mut self) {
        self.masks.clear();
    }
}

/// Stabilises masks across space (closing + light blur) and time (two-tap blend)
///
/// Owned by the processing thread; never shared.
pub struct MaskRefiner {
    edge_smoothing: bool,
    temporal_smoothing: bool,
    edge_kernel_size: u32,
    /// Weight of the current mask; the previous one gets the rest
    temporal_weight: f32,
    history: TemporalMaskHistory,
}

impl MaskRefiner {
    pub fn new(config: &RefineConfig, edge_smoothing: bool, temporal_smoothing: bool) -> Self {
        Self {
            edge_smoothing,
            temporal_smoothing,
            edge_kernel_size: odd_kernel(config.edge_kernel_size),
            temporal_weight: config.temporal_weight.clamp(0.0, 1.0),
            history: TemporalMaskHistory::new(config.temporal_history),
        }
    }

    pub fn set_edge_smoothing(&mut self, enabled: bool) {
        self.edge_smoothing = enabled;
    }

    /// Disabling also forgets the history so re-enabling never blends stale masks
    pub fn set_temporal_smoothing(&mut self, enabled: bool) {
        self.temporal_smoothing = enabled;
        if !enabled {
            self.history.clear();
        }
    }

    pub fn edge_smoothing(&self) -> bool {
        self.edge_smoothing
    }

    pub fn temporal_smoothing(&self) -> bool {
        self.temporal_smoothing
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Edge smoothing, then temporal smoothing
    pub fn refine(&mut self, mask: Mask) -> Mask {
        let mask = self.apply_edge_smoothing(mask);
        self.apply_temporal_smoothing(mask)
    }

    pub fn apply_edge_smoothing(&self, mask: Mask) -> Mask {
        if !self.edge_smoothing {
            return mask;
        }
        let _span = tracing::debug_span!("edge_smoothing").entered();

        let (width, height) = mask.dimensions();
        let closed = morphological_close(mask.as_raw(), width, height, self.edge_kernel_size);
        let smoothed = gaussian_blur_u8(&closed, width, height, 1, EDGE_BLUR_KERNEL, EDGE_BLUR_SIGMA);
        Mask::from_raw(width, height, smoothed).unwrap_or(mask)
    }

    pub fn apply_temporal_smoothing(&mut self, mask: Mask) -> Mask {
        if !self.temporal_smoothing {
            self.history.clear();
            return mask;
        }

        self.history.push(mask.clone());
        let Some(previous) = self.history.previous() else {
            return mask;
        };
        // A resized camera stream makes the old mask meaningless.
        if previous.dimensions() != mask.dimensions() {
            self.history.clear();
            self.history.push(mask.clone());
            return mask;
        }

        let current_weight = self.temporal_weight;
        let previous_weight = 1.0 - current_weight;
        let blended: Vec<u8> = mask
            .as_raw()
            .iter()
            .zip(previous.as_raw())
            .map(|(&c, &p)| {
                (current_weight * c as f32 + previous_weight * p as f32)
                    .round()
                    .clamp(0.0, 255.0) as u8
            })
            .collect();
        let (width, height) = mask.dimensions();
        Mask::from_raw(width, height, blended).unwrap_or(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn refiner(edge: bool, temporal: bool) -> MaskRefiner {
        MaskRefiner::new(&RefineConfig::default(), edge, temporal)
    }

    fn gradient(width: u32, height: u32, seed: u32) -> Mask {
        Mask::from_fn(width, height, |x, y| Luma([((x * 37 + y * 11 + seed * 53) % 256) as u8]))
    }

    #[test]
    fn disabled_edge_smoothing_is_identity() {
        let mask = gradient(17, 9, 1);
        let out = refiner(false, false).apply_edge_smoothing(mask.clone());
        assert_eq!(out.as_raw(), mask.as_raw());
    }

    #[test]
    fn disabled_temporal_smoothing_is_identity() {
        let mut refiner = refiner(false, false);
        for seed in 0..4 {
            let mask = gradient(12, 7, seed);
            let out = refiner.apply_temporal_smoothing(mask.clone());
            assert_eq!(out.as_raw(), mask.as_raw());
        }
        assert_eq!(refiner.history_len(), 0);
    }

    #[test]
    fn edge_smoothing_fills_holes() {
        let mut mask = Mask::from_pixel(9, 9, Luma([255]));
        mask.put_pixel(4, 4, Luma([0]));
        let out = refiner(true, false).apply_edge_smoothing(mask);
        assert_eq!(out.get_pixel(4, 4)[0], 255);
    }

    #[test]
    fn first_mask_passes_through() {
        let mut refiner = refiner(false, true);
        let mask = gradient(8, 8, 3);
        let out = refiner.apply_temporal_smoothing(mask.clone());
        assert_eq!(out.as_raw(), mask.as_raw());
        assert_eq!(refiner.history_len(), 1);
    }

    #[test]
    fn temporal_blend_is_seventy_thirty() {
        let mut refiner = refiner(false, true);
        let a = gradient(10, 6, 0);
        let b = gradient(10, 6, 7);
        refiner.apply_temporal_smoothing(a.clone());
        let out = refiner.apply_temporal_smoothing(b.clone());
        for ((o, a), b) in out.as_raw().iter().zip(a.as_raw()).zip(b.as_raw()) {
            let expected = (0.7 * *b as f32 + 0.3 * *a as f32).round().clamp(0.0, 255.0) as u8;
            assert_eq!(*o, expected);
        }
    }

    #[test]
    fn blend_uses_raw_previous_mask_not_blended_output() {
        let mut refiner = refiner(false, true);
        refiner.apply_temporal_smoothing(Mask::from_pixel(1, 1, Luma([0])));
        refiner.apply_temporal_smoothing(Mask::from_pixel(1, 1, Luma([100])));
        let out = refiner.apply_temporal_smoothing(Mask::from_pixel(1, 1, Luma([200])));
        // 0.7 * 200 + 0.3 * 100
        assert_eq!(out.get_pixel(0, 0)[0], 170);
    }

    #[test]
    fn repeated_blending_stays_in_range() {
        let mut refiner = refiner(true, true);
        for i in 0..20u8 {
            let value = if i % 2 == 0 { 255 } else { 0 };
            let out = refiner.refine(Mask::from_pixel(5, 5, Luma([value])));
            assert_eq!(out.dimensions(), (5, 5));
        }
        let out = refiner.refine(Mask::from_pixel(5, 5, Luma([255])));
        // 0.7 * 255 + 0.3 * 0, give or take float rounding
        assert!(out.pixels().all(|p| (178..=179).contains(&p[0])));
    }

    #[test]
    fn history_is_bounded() {
        let config = RefineConfig {
            temporal_history: 3,
            ..Default::default()
        };
        let mut refiner = MaskRefiner::new(&config, false, true);
        for seed in 0..10 {
            refiner.apply_temporal_smoothing(gradient(4, 4, seed));
        }
        assert_eq!(refiner.history_len(), 3);
    }

    #[test]
    fn disabling_temporal_smoothing_clears_history() {
        let mut refiner = refiner(false, true);
        refiner.apply_temporal_smoothing(gradient(4, 4, 0));
        refiner.apply_temporal_smoothing(gradient(4, 4, 1));
        assert_eq!(refiner.history_len(), 2);
        refiner.set_temporal_smoothing(false);
        assert_eq!(refiner.history_len(), 0);
        refiner.set_temporal_smoothing(true);
        let mask = gradient(4, 4, 2);
        let out = refiner.apply_temporal_smoothing(mask.clone());
        assert_eq!(out.as_raw(), mask.as_raw());
    }

    #[test]
    fn size_change_restarts_history() {
        let mut refiner = refiner(false, true);
        refiner.apply_temporal_smoothing(gradient(4, 4, 0));
        let mask = gradient(6, 3, 1);
        let out = refiner.apply_temporal_smoothing(mask.clone());
        assert_eq!(out.as_raw(), mask.as_raw());
        assert_eq!(refiner.history_len(), 1);
    }
}
