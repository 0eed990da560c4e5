use crate::config::ColorFirstConfig;
use crate::motion::compare::{hue_degrees, rgb_to_hsv_sv};
use crate::motion::process::ProcessedPixels;
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::trace;

/// An HSV band; a hue range with min > max wraps through 0 degrees
#[derive(Debug, Clone, Copy)]
pub struct HsvRange {
    pub name: &'static str,
    pub hue: (f64, f64),
    pub saturation: (f64, f64),
    pub value: (f64, f64),
}

impl HsvRange {
    pub fn contains(&self, h: f64, s: f64, v: f64) -> bool {
        let hue_ok = if self.hue.0 <= self.hue.1 {
            h >= self.hue.0 && h <= self.hue.1
        } else {
            h >= self.hue.0 || h <= self.hue.1
        };
        hue_ok
            && s >= self.saturation.0
            && s <= self.saturation.1
            && v >= self.value.0
            && v <= self.value.1
    }
}

/// Plumage color profiles for the flock: white, brown, orange, and red birds
pub const CHICKEN_PROFILES: [HsvRange; 4] = [
    HsvRange {
        name: "white",
        hue: (0.0, 360.0),
        saturation: (0.0, 0.25),
        value: (0.65, 1.0),
    },
    HsvRange {
        name: "brown",
        hue: (15.0, 45.0),
        saturation: (0.25, 0.85),
        value: (0.15, 0.75),
    },
    HsvRange {
        name: "orange",
        hue: (15.0, 40.0),
        saturation: (0.45, 1.0),
        value: (0.45, 1.0),
    },
    HsvRange {
        name: "red",
        hue: (348.0, 12.0),
        saturation: (0.5, 1.0),
        value: (0.3, 1.0),
    },
];

/// A connected component of chicken-colored pixels
#[derive(Debug, Clone, Copy)]
pub struct Blob {
    pub area: u32,
    pub centroid: (f64, f64),
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl Blob {
    /// Bounding-box width over height
    pub fn aspect_ratio(&self) -> f64 {
        let w = (self.max_x - self.min_x + 1) as f64;
        let h = (self.max_y - self.min_y + 1) as f64;
        w / h
    }
}

/// Binary mask of pixels matching any chicken color profile
pub fn chicken_mask(pixels: &ProcessedPixels) -> GrayImage {
    let mut mask = GrayImage::new(pixels.width, pixels.height);
    for index in 0..pixels.pixel_count() {
        let (r, g, b) = pixels.rgb(index);
        let h = hue_degrees(r, g, b);
        let (s, v) = rgb_to_hsv_sv(r, g, b);
        if CHICKEN_PROFILES.iter().any(|p| p.contains(h, s, v)) {
            let x = index as u32 % pixels.width;
            let y = index as u32 / pixels.width;
            mask.put_pixel(x, y, Luma([255u8]));
        }
    }
    mask
}

/// 8-connected blobs of chicken-colored pixels, smallest discarded
pub fn detect_blobs(pixels: &ProcessedPixels, min_blob_size: u32) -> Vec<Blob> {
    let mask = chicken_mask(pixels);
    let labeled = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let mut stats: std::collections::HashMap<u32, BlobAccumulator> =
        std::collections::HashMap::new();
    for (x, y, label) in labeled.enumerate_pixels() {
        if label[0] == 0 {
            continue;
        }
        stats
            .entry(label[0])
            .or_insert_with(BlobAccumulator::new)
            .add(x, y);
    }

    let mut blobs: Vec<Blob> = stats
        .into_values()
        .map(|acc| acc.finish())
        .filter(|b| b.area >= min_blob_size)
        .collect();
    blobs.sort_by(|a, b| b.area.cmp(&a.area));
    blobs
}

/// Does the frame contain at least one plausible chicken-shaped blob?
///
/// Plausible: big enough, aspect ratio between 0.3 and 3.0, and covering
/// between 0.1% and 50% of the frame.
pub fn validate_blobs(pixels: &ProcessedPixels, min_blob_size: u32) -> bool {
    let frame_pixels = pixels.pixel_count() as f64;
    detect_blobs(pixels, min_blob_size).iter().any(|blob| {
        let aspect = blob.aspect_ratio();
        let coverage = blob.area as f64 / frame_pixels;
        (0.3..=3.0).contains(&aspect) && (0.001..=0.5).contains(&coverage)
    })
}

struct BlobAccumulator {
    area: u32,
    sum_x: u64,
    sum_y: u64,
    min_x: u32,
    max_x: u32,
    min_y: u32,
    max_y: u32,
}

impl BlobAccumulator {
    fn new() -> Self {
        Self {
            area: 0,
            sum_x: 0,
            sum_y: 0,
            min_x: u32::MAX,
            max_x: 0,
            min_y: u32::MAX,
            max_y: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.sum_x += x as u64;
        self.sum_y += y as u64;
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
    }

    fn finish(self) -> Blob {
        Blob {
            area: self.area,
            centroid: (
                self.sum_x as f64 / self.area as f64,
                self.sum_y as f64 / self.area as f64,
            ),
            min_x: self.min_x,
            max_x: self.max_x,
            min_y: self.min_y,
            max_y: self.max_y,
        }
    }
}

/// A blob followed across frames
#[derive(Debug, Clone, Copy)]
struct TrackedBlob {
    centroid: (f64, f64),
    /// Matched frames; new blobs start at 1 and only matches increment it
    lifetime: u32,
    missed: u32,
}

/// Frames a tracked blob may go unmatched before it is dropped
const MAX_MISSED_FRAMES: u32 = 2;

/// Result of one tracker update
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerUpdate {
    pub motion: bool,
    pub blob_count: usize,
    pub tracked_count: usize,
    /// Total area of blobs that moved this frame
    pub moved_area: u32,
}

/// Nearest-centroid blob tracker driving color_first mode.
///
/// A blob reports movement only once it has been matched across enough
/// frames; a blob's first appearance can never trigger motion by itself.
pub struct ColorBlobTracker {
    config: ColorFirstConfig,
    tracked: Vec<TrackedBlob>,
}

impl ColorBlobTracker {
    pub fn new(config: ColorFirstConfig) -> Self {
        Self {
            config,
            tracked: Vec::new(),
        }
    }

    /// Ingest one frame and report whether any tracked blob moved
    pub fn update(&mut self, pixels: &ProcessedPixels) -> TrackerUpdate {
        let blobs = detect_blobs(pixels, self.config.min_blob_size);

        let mut next: Vec<TrackedBlob> = Vec::with_capacity(blobs.len());
        let mut claimed = vec![false; self.tracked.len()];
        let mut moved_area = 0u32;
        let mut motion = false;

        for blob in &blobs {
            let nearest = self
                .tracked
                .iter()
                .enumerate()
                .filter(|(i, _)| !claimed[*i])
                .map(|(i, t)| (i, distance(t.centroid, blob.centroid)))
                .filter(|(_, d)| *d <= self.config.max_match_distance)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((index, displacement)) => {
                    claimed[index] = true;
                    let lifetime = self.tracked[index].lifetime + 1;
                    if displacement >= self.config.min_blob_movement
                        && lifetime >= self.config.min_blob_lifetime
                    {
                        motion = true;
                        moved_area += blob.area;
                    }
                    next.push(TrackedBlob {
                        centroid: blob.centroid,
                        lifetime,
                        missed: 0,
                    });
                }
                None => {
                    next.push(TrackedBlob {
                        centroid: blob.centroid,
                        lifetime: 1,
                        missed: 0,
                    });
                }
            }
        }

        // Unmatched tracked blobs linger briefly; the flock occludes itself
        for (index, tracked) in self.tracked.iter().enumerate() {
            if !claimed[index] && tracked.missed < MAX_MISSED_FRAMES {
                next.push(TrackedBlob {
                    missed: tracked.missed + 1,
                    ..*tracked
                });
            }
        }

        trace!(
            "Blob tracker: {} blobs, {} tracked, motion={}",
            blobs.len(),
            next.len(),
            motion
        );

        self.tracked = next;
        TrackerUpdate {
            motion,
            blob_count: blobs.len(),
            tracked_count: self.tracked.len(),
            moved_area,
        }
    }

    pub fn reset(&mut self) {
        self.tracked.clear();
    }
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}
