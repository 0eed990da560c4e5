use crate::config::YRange;
use crate::motion::compare::{is_ignored, Comparison};

/// Weight of the newest observation in the per-region shadow frequency
const SHADOW_FREQ_ALPHA: f64 = 0.3;

/// Grid-based motion voter.
///
/// Divides the frame into g x g regions and votes on the comparison masks:
/// regions that historically flag as shadow lose their say, and edge regions
/// with heavy shadow ratios are discounted as sun-angle artifacts.
pub struct RegionAnalyzer {
    grid: u32,
    min_active_regions: u32,
    shadow_freq: Vec<f64>,
}

/// Outcome of one regional vote
#[derive(Debug, Clone, Copy)]
pub struct RegionVerdict {
    pub motion: bool,
    pub confidence: f64,
    pub active_regions: u32,
    pub shadow_regions: u32,
    pub weighted_motion: f64,
}

impl RegionAnalyzer {
    pub fn new(grid: u32, min_active_regions: u32) -> Self {
        let grid = grid.max(1);
        Self {
            grid,
            min_active_regions: min_active_regions.max(1),
            shadow_freq: vec![0.0; (grid * grid) as usize],
        }
    }

    /// Vote on one comparison. Requires the comparison to carry masks.
    pub fn analyze(
        &mut self,
        comparison: &Comparison,
        width: u32,
        height: u32,
        ignored: &[YRange],
        threshold: f64,
    ) -> RegionVerdict {
        let (Some(changed_mask), Some(shadow_mask)) =
            (&comparison.changed_mask, &comparison.shadow_mask)
        else {
            return RegionVerdict {
                motion: false,
                confidence: 0.0,
                active_regions: 0,
                shadow_regions: 0,
                weighted_motion: 0.0,
            };
        };

        let g = self.grid;
        let mut active = 0u32;
        let mut non_shadow_active = 0u32;
        let mut shadow_active = 0u32;
        let mut weighted = 0.0;

        for row in 0..g {
            let y0 = row * height / g;
            let y1 = (row + 1) * height / g;
            for col in 0..g {
                let x0 = col * width / g;
                let x1 = (col + 1) * width / g;
                let region = (row * g + col) as usize;

                let mut effective = 0u32;
                let mut changed = 0u32;
                let mut shadow = 0u32;
                for y in y0..y1 {
                    if is_ignored(y, ignored) {
                        continue;
                    }
                    for x in x0..x1 {
                        let index = (y * width + x) as usize;
                        effective += 1;
                        if changed_mask[index] {
                            changed += 1;
                        }
                        if shadow_mask[index] {
                            shadow += 1;
                        }
                    }
                }

                if effective == 0 {
                    continue;
                }
                let change_ratio = changed as f64 / effective as f64;
                let shadow_ratio = shadow as f64 / effective as f64;
                let history = self.shadow_freq[region];

                let edge = row == 0 || col == 0 || row == g - 1 || col == g - 1;
                let has_motion = change_ratio > threshold;
                let is_shadow = history > 0.5
                    || (edge && shadow_ratio > 0.6 && change_ratio > 0.03);

                weighted += change_ratio * (1.0 - history);

                if has_motion {
                    active += 1;
                    if is_shadow {
                        shadow_active += 1;
                    } else {
                        non_shadow_active += 1;
                    }
                }

                // Exponential moving average of this region's shadow behavior
                let observed = if shadow_ratio > 0.5 { 1.0 } else { 0.0 };
                self.shadow_freq[region] =
                    (1.0 - SHADOW_FREQ_ALPHA) * history + SHADOW_FREQ_ALPHA * observed;
            }
        }

        let region_count = (g * g) as f64;
        let weighted_motion = weighted / region_count;

        let motion = non_shadow_active >= self.min_active_regions
            || (weighted_motion > threshold && shadow_active < active);

        let confidence = (non_shadow_active as f64 / self.min_active_regions as f64).min(1.0)
            * (1.0 - shadow_active as f64 / active.max(1) as f64);

        RegionVerdict {
            motion,
            confidence,
            active_regions: active,
            shadow_regions: shadow_active,
            weighted_motion,
        }
    }

    /// Forget all learned shadow history
    pub fn reset(&mut self) {
        self.shadow_freq.iter_mut().for_each(|f| *f = 0.0);
    }
}
