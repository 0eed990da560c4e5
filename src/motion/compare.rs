use crate::config::YRange;
use crate::motion::process::ProcessedPixels;
use chrono::Timelike;

/// Pixel delta used by the plain comparison when no schedule applies
pub const DEFAULT_PIXEL_DELTA: f64 = 25.0;

/// Inputs shared by all comparison branches
pub struct CompareOptions<'a> {
    /// Inclusive y-bands excluded from both the changed count and the
    /// normalization denominator
    pub ignored: &'a [YRange],
    pub base_threshold: f64,
    pub shadow_threshold: f64,
    /// Per-channel delta for the color branch
    pub color_threshold: f64,
    /// Record per-pixel masks for the regional voter
    pub collect_masks: bool,
}

/// Result of comparing one frame pair
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    pub changed_pixels: u64,
    pub shadow_pixels: u64,
    /// Pixels actually compared: image size minus ignored bands
    pub effective_pixels: u64,
    pub normalized_difference: f64,
    pub shadow_ratio: f64,
    pub changed_mask: Option<Vec<bool>>,
    pub shadow_mask: Option<Vec<bool>>,
}

pub fn is_ignored(y: u32, ranges: &[YRange]) -> bool {
    ranges.iter().any(|r| r.contains(y))
}

/// Plain pixel-pair comparison: changed when the luminance delta exceeds the
/// base threshold.
pub fn compare_raw(
    current: &ProcessedPixels,
    previous: &ProcessedPixels,
    opts: &CompareOptions<'_>,
) -> Comparison {
    debug_assert!(current.matches(previous));
    let mut out = masks_for(current, opts);

    for_each_pixel(current, opts.ignored, |index, _x, _y| {
        let diff = (current.luma(index) - previous.luma(index)).abs();
        out.effective_pixels += 1;
        if diff > opts.base_threshold {
            out.changed_pixels += 1;
            if let Some(mask) = out.changed_mask.as_mut() {
                mask[index] = true;
            }
        }
    });

    finish(out)
}

/// Shadow-aware grayscale comparison.
///
/// A brightness-ratio heuristic classifies each pixel pair as shadow-like
/// and applies the higher shadow threshold there; both thresholds scale with
/// overall scene brightness.
pub fn compare_shadow_gray(
    current: &ProcessedPixels,
    previous: &ProcessedPixels,
    opts: &CompareOptions<'_>,
) -> Comparison {
    debug_assert!(current.matches(previous));
    let mut out = masks_for(current, opts);

    let scale = brightness_scale(current, previous, opts.ignored);

    for_each_pixel(current, opts.ignored, |index, _x, _y| {
        let v1 = previous.luma(index);
        let v2 = current.luma(index);
        let ratio = v2 / (v1 + 10.0);
        let diff = (v1 - v2).abs();

        out.effective_pixels += 1;
        let shadow_like = ratio > 0.3 && ratio < 0.8;
        if shadow_like {
            out.shadow_pixels += 1;
            if let Some(mask) = out.shadow_mask.as_mut() {
                mask[index] = true;
            }
        }

        let threshold = if shadow_like {
            opts.shadow_threshold * scale
        } else {
            opts.base_threshold * scale
        };
        if diff > threshold {
            out.changed_pixels += 1;
            if let Some(mask) = out.changed_mask.as_mut() {
                mask[index] = true;
            }
        }
    });

    finish(out)
}

/// Shadow-aware RGB comparison.
///
/// A pixel pair whose luminance dropped but whose hue held steady is an
/// illumination change, not movement.
pub fn compare_shadow_color(
    current: &ProcessedPixels,
    previous: &ProcessedPixels,
    opts: &CompareOptions<'_>,
) -> Comparison {
    debug_assert!(current.matches(previous));
    let mut out = masks_for(current, opts);

    for_each_pixel(current, opts.ignored, |index, _x, _y| {
        let (r1, g1, b1) = previous.rgb(index);
        let (r2, g2, b2) = current.rgb(index);

        let lum1 = 0.299 * r1 as f64 + 0.587 * g1 as f64 + 0.114 * b1 as f64;
        let lum2 = 0.299 * r2 as f64 + 0.587 * g2 as f64 + 0.114 * b2 as f64;
        let lum_diff = (lum1 - lum2).abs();

        let max_channel_diff = (r1 as f64 - r2 as f64)
            .abs()
            .max((g1 as f64 - g2 as f64).abs())
            .max((b1 as f64 - b2 as f64).abs());

        let hue_change = hue_distance(hue_degrees(r1, g1, b1), hue_degrees(r2, g2, b2));
        let lum_ratio = lum1.min(lum2) / (lum1.max(lum2) + 1.0);

        out.effective_pixels += 1;
        let is_shadow = lum_diff > opts.shadow_threshold && hue_change < 20.0 && lum_ratio > 0.5;
        if is_shadow {
            out.shadow_pixels += 1;
            if let Some(mask) = out.shadow_mask.as_mut() {
                mask[index] = true;
            }
        } else if max_channel_diff > opts.color_threshold || lum_diff > opts.base_threshold {
            out.changed_pixels += 1;
            if let Some(mask) = out.changed_mask.as_mut() {
                mask[index] = true;
            }
        }
    });

    finish(out)
}

/// The (base, shadow) pixel thresholds for a local hour of day.
///
/// Daylight transitions get looser thresholds; midday and night are the
/// extremes of the schedule.
pub fn thresholds_for_hour(hour: u32) -> (f64, f64) {
    match hour {
        5..=7 => (30.0, 50.0),
        8..=10 => (25.0, 40.0),
        11..=13 => (20.0, 35.0),
        14..=16 => (25.0, 40.0),
        17..=19 => (30.0, 50.0),
        _ => (35.0, 55.0),
    }
}

/// Schedule lookup for the current local hour
pub fn local_thresholds() -> (f64, f64) {
    thresholds_for_hour(chrono::Local::now().hour())
}

/// Hue of an RGB triple in degrees (0 - 360)
pub fn hue_degrees(r: u8, g: u8, b: u8) -> f64 {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if delta < f64::EPSILON {
        return 0.0;
    }

    let hue = if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    if hue < 0.0 {
        hue + 360.0
    } else {
        hue
    }
}

/// Saturation and value of an RGB triple, each 0.0 - 1.0
pub fn rgb_to_hsv_sv(r: u8, g: u8, b: u8) -> (f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let saturation = if max <= f64::EPSILON {
        0.0
    } else {
        (max - min) / max
    };
    (saturation, max)
}

/// Shortest circular distance between two hues in degrees
pub fn hue_distance(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 360.0;
    diff.min(360.0 - diff)
}

fn masks_for(px: &ProcessedPixels, opts: &CompareOptions<'_>) -> Comparison {
    let mut out = Comparison::default();
    if opts.collect_masks {
        out.changed_mask = Some(vec![false; px.pixel_count()]);
        out.shadow_mask = Some(vec![false; px.pixel_count()]);
    }
    out
}

fn for_each_pixel<F: FnMut(usize, u32, u32)>(
    px: &ProcessedPixels,
    ignored: &[YRange],
    mut visit: F,
) {
    for y in 0..px.height {
        if is_ignored(y, ignored) {
            continue;
        }
        let row = (y * px.width) as usize;
        for x in 0..px.width {
            visit(row + x as usize, x, y);
        }
    }
}

/// Mean luminance of both frames over non-ignored pixels, mapped to the
/// 0.5 - 1.5 threshold scale around a mid-gray scene
fn brightness_scale(
    current: &ProcessedPixels,
    previous: &ProcessedPixels,
    ignored: &[YRange],
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0u64;
    for_each_pixel(current, ignored, |index, _x, _y| {
        sum += current.luma(index) + previous.luma(index);
        count += 2;
    });
    if count == 0 {
        return 1.0;
    }
    let scene_brightness = sum / count as f64;
    (scene_brightness / 128.0).clamp(0.5, 1.5)
}

fn finish(mut out: Comparison) -> Comparison {
    if out.effective_pixels > 0 {
        out.normalized_difference = out.changed_pixels as f64 / out.effective_pixels as f64;
        out.shadow_ratio = out.shadow_pixels as f64 / out.effective_pixels as f64;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32, fill: u8) -> ProcessedPixels {
        ProcessedPixels {
            data: vec![fill; (width * height) as usize],
            width,
            height,
            color: false,
        }
    }

    fn rgb(width: u32, height: u32, fill: [u8; 3]) -> ProcessedPixels {
        ProcessedPixels {
            data: fill
                .iter()
                .cycle()
                .take((width * height * 3) as usize)
                .copied()
                .collect(),
            width,
            height,
            color: true,
        }
    }

    fn opts(ignored: &[YRange]) -> CompareOptions<'_> {
        CompareOptions {
            ignored,
            base_threshold: 25.0,
            shadow_threshold: 40.0,
            color_threshold: 30.0,
            collect_masks: false,
        }
    }

    #[test]
    fn test_identical_frames_have_zero_difference() {
        let a = gray(8, 8, 100);
        let b = gray(8, 8, 100);
        let cmp = compare_raw(&a, &b, &opts(&[]));

        assert_eq!(cmp.changed_pixels, 0);
        assert_eq!(cmp.normalized_difference, 0.0);
        assert_eq!(cmp.effective_pixels, 64);
    }

    #[test]
    fn test_ignored_band_neutrality() {
        // Frames differ only inside the ignored band: zero difference
        let prev = gray(8, 8, 10);
        let mut cur = gray(8, 8, 10);
        for y in 2..=4u32 {
            for x in 0..8u32 {
                cur.data[(y * 8 + x) as usize] = 250;
            }
        }
        let ignored = [YRange { start: 2, end: 4 }];
        let cmp = compare_raw(&cur, &prev, &opts(&ignored));

        assert_eq!(cmp.normalized_difference, 0.0);
        assert_eq!(cmp.effective_pixels, 40);

        // One extra differing pixel outside the band: exactly one effective
        // count
        cur.data[0] = 250;
        let cmp = compare_raw(&cur, &prev, &opts(&ignored));
        assert_eq!(cmp.changed_pixels, 1);
        assert!((cmp.normalized_difference - 1.0 / 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_raw_compare_counts_changes() {
        let prev = gray(4, 4, 10);
        let mut cur = gray(4, 4, 10);
        cur.data[0] = 200;
        cur.data[5] = 200;

        let cmp = compare_raw(&cur, &prev, &opts(&[]));
        assert_eq!(cmp.changed_pixels, 2);
        assert!((cmp.normalized_difference - 2.0 / 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_shadow_gray_uses_higher_threshold_for_shadow_pixels() {
        // Darkening to ~65% of previous is shadow-like (ratio 0.3 - 0.8)
        let prev = gray(4, 4, 100);
        let cur = gray(4, 4, 65);

        let options = CompareOptions {
            ignored: &[],
            base_threshold: 25.0,
            shadow_threshold: 60.0,
            color_threshold: 30.0,
            collect_masks: false,
        };
        let cmp = compare_shadow_gray(&cur, &prev, &options);

        // All pixels are shadow-like; delta 35 stays under the scaled shadow
        // threshold
        assert_eq!(cmp.shadow_pixels, 16);
        assert_eq!(cmp.changed_pixels, 0);
        assert!(cmp.shadow_ratio > 0.99);
    }

    #[test]
    fn test_shadow_gray_still_flags_hard_changes() {
        let prev = gray(4, 4, 20);
        let cur = gray(4, 4, 250); // ratio 250/30 is far above shadow range

        let cmp = compare_shadow_gray(&cur, &prev, &opts(&[]));
        assert_eq!(cmp.changed_pixels, 16);
        assert_eq!(cmp.shadow_pixels, 0);
    }

    #[test]
    fn test_color_compare_treats_dimming_as_shadow() {
        // Same hue, luminance dropped ~35%: shadow, not motion
        let prev = rgb(4, 4, [200, 120, 80]);
        let cur = rgb(4, 4, [130, 78, 52]);

        let cmp = compare_shadow_color(&cur, &prev, &opts(&[]));
        assert_eq!(cmp.changed_pixels, 0);
        assert_eq!(cmp.shadow_pixels, 16);
    }

    #[test]
    fn test_color_compare_flags_hue_shift() {
        // Similar luminance, different hue: genuine change
        let prev = rgb(4, 4, [200, 40, 40]);
        let cur = rgb(4, 4, [40, 200, 40]);

        let cmp = compare_shadow_color(&cur, &prev, &opts(&[]));
        assert_eq!(cmp.changed_pixels, 16);
        assert_eq!(cmp.shadow_pixels, 0);
    }

    #[test]
    fn test_threshold_schedule() {
        assert_eq!(thresholds_for_hour(6), (30.0, 50.0));
        assert_eq!(thresholds_for_hour(9), (25.0, 40.0));
        assert_eq!(thresholds_for_hour(12), (20.0, 35.0));
        assert_eq!(thresholds_for_hour(15), (25.0, 40.0));
        assert_eq!(thresholds_for_hour(18), (30.0, 50.0));
        assert_eq!(thresholds_for_hour(22), (35.0, 55.0));
        assert_eq!(thresholds_for_hour(3), (35.0, 55.0));
    }

    #[test]
    fn test_hue_math() {
        assert!((hue_degrees(255, 0, 0) - 0.0).abs() < 1e-9);
        assert!((hue_degrees(0, 255, 0) - 120.0).abs() < 1e-9);
        assert!((hue_degrees(0, 0, 255) - 240.0).abs() < 1e-9);

        assert!((hue_distance(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((hue_distance(0.0, 180.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_masks_mark_changed_positions() {
        let prev = gray(4, 2, 10);
        let mut cur = gray(4, 2, 10);
        cur.data[3] = 200;

        let options = CompareOptions {
            collect_masks: true,
            ..opts(&[])
        };
        let cmp = compare_raw(&cur, &prev, &options);

        let mask = cmp.changed_mask.unwrap();
        assert!(mask[3]);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 1);
    }
}
