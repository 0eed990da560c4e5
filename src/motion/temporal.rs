use crate::motion::process::ProcessedPixels;
use std::collections::VecDeque;

/// Frames of history the detector keeps
pub const HISTORY_CAPACITY: usize = 5;

/// Luminance drift below this is treated as sensor noise
const NOISE_DELTA: f64 = 8.0;

/// Per-step tolerance when testing for monotonic drift
const STEP_TOLERANCE: f64 = 2.0;

/// A single step larger than this is abrupt, not an illumination drift
const MAX_GRADUAL_STEP: f64 = 25.0;

/// Cap on sampled positions per frame
const MAX_SAMPLES: usize = 1024;

/// Detects illumination changes that creep across frames.
///
/// Moving shadows and passing clouds change pixel intensity gradually and
/// monotonically; an animal entering the frame does not. The detector samples
/// a pixel grid across its history and reports how many drifting samples
/// follow a gradual monotonic trend.
pub struct TemporalShadowDetector {
    history: VecDeque<ProcessedPixels>,
}

/// Outcome of one history analysis
#[derive(Debug, Clone, Copy)]
pub struct TemporalShadowReport {
    pub detected: bool,
    /// Fraction of drifting samples that trend like a shadow (0.0 - 1.0)
    pub confidence: f64,
}

impl TemporalShadowDetector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Append a frame, evicting the oldest beyond capacity.
    ///
    /// A layout change (resize, color switch) invalidates the history.
    pub fn push(&mut self, pixels: &ProcessedPixels) {
        if let Some(last) = self.history.back() {
            if !last.matches(pixels) {
                self.history.clear();
            }
        }
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(pixels.clone());
    }

    /// Analyze the current history window
    pub fn analyze(&self) -> TemporalShadowReport {
        if self.history.len() < 3 {
            return TemporalShadowReport {
                detected: false,
                confidence: 0.0,
            };
        }

        let pixel_count = self.history[0].pixel_count();
        let stride = (pixel_count / MAX_SAMPLES).max(1);

        let mut drifting = 0u32;
        let mut trending = 0u32;

        for index in (0..pixel_count).step_by(stride) {
            let series: Vec<f64> = self.history.iter().map(|px| px.luma(index)).collect();
            let total = (series[series.len() - 1] - series[0]).abs();
            if total <= NOISE_DELTA {
                continue;
            }
            drifting += 1;

            let mut increasing = true;
            let mut decreasing = true;
            let mut max_step = 0.0f64;
            for pair in series.windows(2) {
                let step = pair[1] - pair[0];
                if step < -STEP_TOLERANCE {
                    increasing = false;
                }
                if step > STEP_TOLERANCE {
                    decreasing = false;
                }
                max_step = max_step.max(step.abs());
            }

            if (increasing || decreasing) && max_step <= MAX_GRADUAL_STEP {
                trending += 1;
            }
        }

        let confidence = if drifting == 0 {
            0.0
        } else {
            trending as f64 / drifting as f64
        };

        TemporalShadowReport {
            detected: drifting > 0 && confidence >= 0.25,
            confidence,
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

impl Default for TemporalShadowDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(fill: u8) -> ProcessedPixels {
        ProcessedPixels {
            data: vec![fill; 64],
            width: 8,
            height: 8,
            color: false,
        }
    }

    #[test]
    fn test_too_little_history_reports_nothing() {
        let mut detector = TemporalShadowDetector::new();
        detector.push(&gray(100));
        detector.push(&gray(80));

        let report = detector.analyze();
        assert!(!report.detected);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_gradual_dimming_is_a_shadow_trend() {
        let mut detector = TemporalShadowDetector::new();
        for value in [120, 110, 100, 90, 80] {
            detector.push(&gray(value));
        }

        let report = detector.analyze();
        assert!(report.detected);
        assert!(report.confidence > 0.99);
    }

    #[test]
    fn test_abrupt_change_is_not_a_shadow() {
        let mut detector = TemporalShadowDetector::new();
        for value in [100, 100, 220, 100, 100] {
            detector.push(&gray(value));
        }

        let report = detector.analyze();
        assert!(report.confidence < 0.25);
        assert!(!report.detected);
    }

    #[test]
    fn test_static_scene_has_no_drift() {
        let mut detector = TemporalShadowDetector::new();
        for _ in 0..5 {
            detector.push(&gray(100));
        }

        let report = detector.analyze();
        assert!(!report.detected);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut detector = TemporalShadowDetector::new();
        for value in 0..10u8 {
            detector.push(&gray(value * 20));
        }
        assert_eq!(detector.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_layout_change_clears_history() {
        let mut detector = TemporalShadowDetector::new();
        detector.push(&gray(100));
        detector.push(&gray(90));

        let other = ProcessedPixels {
            data: vec![100; 16],
            width: 4,
            height: 4,
            color: false,
        };
        detector.push(&other);
        assert_eq!(detector.len(), 1);
    }
}
