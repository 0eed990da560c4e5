use crate::error::WorkerError;
use image::{GrayImage, RgbImage};
use imageproc::filter::median_filter;

/// Normalization settings handed to a worker with each frame
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub width: u32,
    pub height: u32,
    /// Keep RGB channels instead of collapsing to grayscale
    pub color: bool,
    pub shadow_enabled: bool,
    /// Strength of illumination normalization (0.0 - 1.0)
    pub shadow_intensity: f64,
}

/// Downscaled, normalized pixels produced by a worker
#[derive(Debug, Clone)]
pub struct ProcessedPixels {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub color: bool,
}

impl ProcessedPixels {
    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn channels(&self) -> usize {
        if self.color {
            3
        } else {
            1
        }
    }

    /// Luminance of pixel `index` (row-major), 0.0 - 255.0
    pub fn luma(&self, index: usize) -> f64 {
        if self.color {
            let i = index * 3;
            0.299 * self.data[i] as f64
                + 0.587 * self.data[i + 1] as f64
                + 0.114 * self.data[i + 2] as f64
        } else {
            self.data[index] as f64
        }
    }

    /// RGB channels of pixel `index`; grayscale pixels replicate their value
    pub fn rgb(&self, index: usize) -> (u8, u8, u8) {
        if self.color {
            let i = index * 3;
            (self.data[i], self.data[i + 1], self.data[i + 2])
        } else {
            let v = self.data[index];
            (v, v, v)
        }
    }

    /// Layout compatibility with another buffer (same dims and channels)
    pub fn matches(&self, other: &ProcessedPixels) -> bool {
        self.width == other.width && self.height == other.height && self.color == other.color
    }
}

/// Decode, downscale, and normalize one JPEG frame.
///
/// This is the CPU-heavy kernel the worker pool runs off the I/O path:
/// JPEG decode, nearest-neighbor resize, optional grayscale collapse, and
/// optional illumination normalization (percentile clip, contrast stretch
/// proportional to intensity, 3x3 median).
pub fn process_frame(jpeg: &[u8], cfg: &ProcessConfig) -> Result<ProcessedPixels, WorkerError> {
    let decoded = image::load_from_memory(jpeg).map_err(|e| WorkerError::Decode {
        details: e.to_string(),
    })?;
    let rgb = decoded.to_rgb8();
    let resized = resize_nearest(&rgb, cfg.width, cfg.height);

    if cfg.color {
        let mut img = resized;
        if cfg.shadow_enabled {
            normalize_illumination_rgb(&mut img, cfg.shadow_intensity);
            img = median_filter(&img, 1, 1);
        }
        Ok(ProcessedPixels {
            data: img.into_raw(),
            width: cfg.width,
            height: cfg.height,
            color: true,
        })
    } else {
        let mut gray = rgb_to_gray(&resized);
        if cfg.shadow_enabled {
            normalize_illumination_gray(&mut gray, cfg.shadow_intensity);
            gray = median_filter(&gray, 1, 1);
        }
        Ok(ProcessedPixels {
            data: gray.into_raw(),
            width: cfg.width,
            height: cfg.height,
            color: false,
        })
    }
}

/// Cheap nearest-neighbor downscale
fn resize_nearest(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (sw, sh) = src.dimensions();
    let mut out = RgbImage::new(width, height);
    for y in 0..height {
        let sy = ((y as u64 * sh as u64) / height as u64).min(sh as u64 - 1) as u32;
        for x in 0..width {
            let sx = ((x as u64 * sw as u64) / width as u64).min(sw as u64 - 1) as u32;
            out.put_pixel(x, y, *src.get_pixel(sx, sy));
        }
    }
    out
}

fn rgb_to_gray(src: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(src.width(), src.height());
    for (x, y, px) in src.enumerate_pixels() {
        let value =
            (0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64).round() as u8;
        gray.put_pixel(x, y, image::Luma([value]));
    }
    gray
}

/// Values at the 2nd and 98th percentile of a 256-bin histogram
fn percentile_bounds(hist: &[u32; 256], total: u32) -> (u8, u8) {
    if total == 0 {
        return (0, 255);
    }
    let lo_target = (total as f64 * 0.02) as u32;
    let hi_target = (total as f64 * 0.98) as u32;

    let mut acc = 0u32;
    let mut lo = 0u8;
    let mut hi = 255u8;
    let mut lo_found = false;
    for (value, &count) in hist.iter().enumerate() {
        acc += count;
        if !lo_found && acc > lo_target {
            lo = value as u8;
            lo_found = true;
        }
        if acc >= hi_target {
            hi = value as u8;
            break;
        }
    }
    (lo, hi.max(lo))
}

fn normalize_illumination_gray(img: &mut GrayImage, intensity: f64) {
    let mut hist = [0u32; 256];
    for px in img.pixels() {
        hist[px[0] as usize] += 1;
    }
    let total = img.width() * img.height();
    let (lo, hi) = percentile_bounds(&hist, total);
    let span = (hi - lo).max(1) as f64;

    for px in img.pixels_mut() {
        px[0] = stretch(px[0], lo, span, intensity);
    }
}

fn normalize_illumination_rgb(img: &mut RgbImage, intensity: f64) {
    let mut hist = [0u32; 256];
    for px in img.pixels() {
        let lum = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
        hist[(lum.round() as usize).min(255)] += 1;
    }
    let total = img.width() * img.height();
    let (lo, hi) = percentile_bounds(&hist, total);
    let span = (hi - lo).max(1) as f64;

    for px in img.pixels_mut() {
        for channel in px.0.iter_mut() {
            *channel = stretch(*channel, lo, span, intensity);
        }
    }
}

/// Blend a pixel toward its contrast-stretched value by `intensity`
fn stretch(value: u8, lo: u8, span: f64, intensity: f64) -> u8 {
    let v = value as f64;
    let stretched = ((v - lo as f64) * 255.0 / span).clamp(0.0, 255.0);
    (v + intensity * (stretched - v)).round().clamp(0.0, 255.0) as u8
}
