//! Motion detection: the worker pool doing per-frame pixel work, the
//! comparison branches, the shadow/region/color sub-detectors, and the
//! per-source engine that ties them together.

pub mod color;
pub mod compare;
pub mod process;
pub mod region;
pub mod temporal;
pub mod worker;

pub use process::{ProcessConfig, ProcessedPixels};
pub use worker::{WorkerPool, WorkerPoolStatsSnapshot};

use crate::config::{DetectionMode, MotionConfig};
use crate::error::WorkerError;
use crate::events::{MotionBus, MotionEvent};
use crate::frame::Frame;
use color::ColorBlobTracker;
use compare::{CompareOptions, Comparison, DEFAULT_PIXEL_DELTA};
use parking_lot::Mutex;
use region::RegionAnalyzer;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use temporal::TemporalShadowDetector;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Per-source detector state
pub struct SourceState {
    previous: Option<ProcessedPixels>,
    last_sample: Option<Instant>,
    last_motion: Option<Instant>,
    paused: bool,
    frames_seen: u64,
    temporal: TemporalShadowDetector,
    region: Option<RegionAnalyzer>,
    tracker: ColorBlobTracker,
}

impl SourceState {
    fn new(config: &MotionConfig) -> Self {
        let region = config.shadow_removal.regional_enabled.then(|| {
            RegionAnalyzer::new(
                config.shadow_removal.grid_size,
                config.shadow_removal.min_active_regions,
            )
        });
        Self {
            previous: None,
            last_sample: None,
            last_motion: None,
            paused: false,
            frames_seen: 0,
            temporal: TemporalShadowDetector::new(),
            region,
            tracker: ColorBlobTracker::new(config.color_first.clone()),
        }
    }
}

/// Weakly-consistent engine counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorStatsSnapshot {
    pub samples_received: u64,
    pub samples_dropped: u64,
    pub comparisons: u64,
    pub motion_events: u64,
    pub color_rejected: u64,
    pub cooldown_suppressed: u64,
}

#[derive(Default)]
struct DetectorCounters {
    samples_received: AtomicU64,
    samples_dropped: AtomicU64,
    comparisons: AtomicU64,
    motion_events: AtomicU64,
    color_rejected: AtomicU64,
    cooldown_suppressed: AtomicU64,
}

/// The motion detection engine.
///
/// One engine serves all sources; each attached source gets its own state
/// and its own task draining the proxy's sampling tap. Confirmed, debounced
/// motion goes out on the motion bus.
pub struct MotionEngine {
    config: MotionConfig,
    workers: Arc<WorkerPool>,
    bus: MotionBus,
    process_config: ProcessConfig,
    min_sample_interval: Duration,
    cooldown: Duration,
    states: Mutex<HashMap<String, Arc<AsyncMutex<SourceState>>>>,
    counters: DetectorCounters,
}

impl MotionEngine {
    pub fn new(config: MotionConfig, workers: Arc<WorkerPool>, bus: MotionBus) -> Self {
        let needs_color = matches!(
            config.detection_mode,
            DetectionMode::ColorFilter | DetectionMode::ColorFirst
        ) || config.color_detection.enabled;

        let process_config = ProcessConfig {
            width: config.width,
            height: config.height,
            color: needs_color,
            shadow_enabled: config.shadow_removal.enabled,
            shadow_intensity: config.shadow_removal.intensity,
        };

        Self {
            min_sample_interval: Duration::from_millis(1_000 / config.fps.max(1) as u64),
            cooldown: Duration::from_millis(config.cooldown_ms),
            process_config,
            workers,
            bus,
            states: Mutex::new(HashMap::new()),
            counters: DetectorCounters::default(),
            config,
        }
    }

    /// Attach a source's sampling tap; spawns the per-source detector task
    pub fn attach(
        self: &Arc<Self>,
        source_id: String,
        mut samples: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) {
        let state = Arc::new(AsyncMutex::new(SourceState::new(&self.config)));
        self.states
            .lock()
            .insert(source_id.clone(), Arc::clone(&state));

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(source = %source_id, "Motion detector attached");
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = samples.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let mut state = state.lock().await;
                engine.handle_sample(&mut state, frame).await;
            }
            debug!(source = %source_id, "Motion detector task stopped");
        });
    }

    /// Suspend motion handling for one source
    pub async fn pause(&self, source_id: &str) {
        if let Some(state) = self.state_of(source_id) {
            state.lock().await.paused = true;
            info!(source = %source_id, "Motion detection paused");
        }
    }

    /// Resume a source; the next comparison is skipped so a long gap cannot
    /// fire spuriously
    pub async fn resume(&self, source_id: &str) {
        if let Some(state) = self.state_of(source_id) {
            let mut state = state.lock().await;
            state.paused = false;
            state.previous = None;
            info!(source = %source_id, "Motion detection resumed");
        }
    }

    pub fn stats(&self) -> DetectorStatsSnapshot {
        DetectorStatsSnapshot {
            samples_received: self.counters.samples_received.load(Ordering::Relaxed),
            samples_dropped: self.counters.samples_dropped.load(Ordering::Relaxed),
            comparisons: self.counters.comparisons.load(Ordering::Relaxed),
            motion_events: self.counters.motion_events.load(Ordering::Relaxed),
            color_rejected: self.counters.color_rejected.load(Ordering::Relaxed),
            cooldown_suppressed: self.counters.cooldown_suppressed.load(Ordering::Relaxed),
        }
    }

    fn state_of(&self, source_id: &str) -> Option<Arc<AsyncMutex<SourceState>>> {
        self.states.lock().get(source_id).cloned()
    }

    async fn handle_sample(&self, state: &mut SourceState, frame: Frame) {
        self.counters.samples_received.fetch_add(1, Ordering::Relaxed);
        let now = frame.mono_time();

        if state.paused {
            self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(last) = state.last_sample {
            if now.duration_since(last) < self.min_sample_interval {
                self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        state.last_sample = Some(now);

        let source_id = frame.source_id().to_string();
        let current = match self
            .workers
            .process(frame, self.process_config.clone())
            .await
        {
            Ok(pixels) => pixels,
            Err(WorkerError::QueueFull) => {
                self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(source = %source_id, "Sample processing failed: {}", e);
                return;
            }
        };
        state.frames_seen += 1;

        let Some(previous) = state.previous.take() else {
            state.previous = Some(current);
            return;
        };
        if !previous.matches(&current) {
            state.previous = Some(current);
            return;
        }

        self.counters.comparisons.fetch_add(1, Ordering::Relaxed);
        let decision = self.decide(state, &current, &previous);

        if decision.motion {
            let cooled = state
                .last_motion
                .map_or(true, |last| now.duration_since(last) >= self.cooldown);
            if cooled {
                state.last_motion = Some(now);
                self.counters.motion_events.fetch_add(1, Ordering::Relaxed);
                self.bus.publish(MotionEvent::new(
                    &source_id,
                    decision.normalized_difference,
                    self.config.threshold,
                    decision.metadata,
                ));
            } else {
                self.counters
                    .cooldown_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                trace!(source = %source_id, "Motion suppressed by cooldown");
            }
        }

        state.previous = Some(current);
    }

    /// Run the configured comparison branch plus the enabled sub-detectors
    fn decide(
        &self,
        state: &mut SourceState,
        current: &ProcessedPixels,
        previous: &ProcessedPixels,
    ) -> Decision {
        let mode = self.config.detection_mode;

        if mode == DetectionMode::ColorFirst {
            // Blob tracking replaces pixel comparison entirely
            let update = state.tracker.update(current);
            let normalized = update.moved_area as f64 / current.pixel_count() as f64;
            return Decision {
                motion: update.motion,
                normalized_difference: normalized,
                metadata: json!({
                    "mode": "color_first",
                    "blobs": update.blob_count,
                    "tracked": update.tracked_count,
                    "movedArea": update.moved_area,
                }),
            };
        }

        let shadow = self.config.shadow_removal.enabled;
        let (base_threshold, shadow_threshold) = if shadow {
            compare::local_thresholds()
        } else {
            (DEFAULT_PIXEL_DELTA, DEFAULT_PIXEL_DELTA)
        };
        let options = CompareOptions {
            ignored: &self.config.ignored_y_ranges,
            base_threshold,
            shadow_threshold,
            color_threshold: self.config.color_detection.color_threshold,
            collect_masks: state.region.is_some(),
        };

        let comparison: Comparison = match (mode, shadow) {
            (DetectionMode::ColorFilter, true) => {
                compare::compare_shadow_color(current, previous, &options)
            }
            (_, true) => compare::compare_shadow_gray(current, previous, &options),
            _ => compare::compare_raw(current, previous, &options),
        };

        let mut normalized = comparison.normalized_difference;
        let mut temporal_confidence = 0.0;
        if self.config.shadow_removal.temporal_enabled {
            state.temporal.push(current);
            let report = state.temporal.analyze();
            if report.detected && report.confidence > 0.7 {
                normalized *= 1.0 - report.confidence * 0.5;
                temporal_confidence = report.confidence;
            }
        }

        let mut region_confidence = None;
        let mut motion = if let Some(region) = state.region.as_mut() {
            let verdict = region.analyze(
                &comparison,
                current.width,
                current.height,
                &self.config.ignored_y_ranges,
                self.config.threshold,
            );
            region_confidence = Some(verdict.confidence);
            verdict.motion
        } else {
            normalized > self.config.threshold
        };

        if motion && self.config.color_detection.enabled {
            if !color::validate_blobs(current, self.config.color_detection.min_blob_size) {
                self.counters.color_rejected.fetch_add(1, Ordering::Relaxed);
                motion = false;
            }
        }

        Decision {
            motion,
            normalized_difference: normalized,
            metadata: json!({
                "mode": mode_name(mode),
                "changedPixels": comparison.changed_pixels,
                "shadowRatio": comparison.shadow_ratio,
                "temporalConfidence": temporal_confidence,
                "regionConfidence": region_confidence,
            }),
        }
    }
}

struct Decision {
    motion: bool,
    normalized_difference: f64,
    metadata: serde_json::Value,
}

fn mode_name(mode: DetectionMode) -> &'static str {
    match mode {
        DetectionMode::Traditional => "traditional",
        DetectionMode::ColorFilter => "color_filter",
        DetectionMode::ColorFirst => "color_first",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerPoolConfig;
    use crate::motion::process::test_support::synthetic_jpeg;
    use crate::pool::FrameBufferPool;

    fn engine(config: MotionConfig) -> Arc<MotionEngine> {
        let workers = Arc::new(WorkerPool::new(&WorkerPoolConfig {
            pool_size: Some(2),
            max_queue_size: 16,
            task_timeout_ms: 5_000,
        }));
        Arc::new(MotionEngine::new(config, workers, MotionBus::new(16)))
    }

    fn motion_config() -> MotionConfig {
        MotionConfig {
            fps: 1_000,
            threshold: 0.02,
            cooldown_ms: 5_000,
            width: 32,
            height: 24,
            ..MotionConfig::default()
        }
    }

    fn frame(buffers: &FrameBufferPool, sequence: u64, jpeg: &[u8]) -> Frame {
        Frame::new(
            std::sync::Arc::from("coop"),
            sequence,
            buffers.acquire_from(jpeg),
        )
    }

    fn quiet_jpeg() -> Vec<u8> {
        synthetic_jpeg(64, 48, [60, 60, 60], None)
    }

    fn busy_jpeg() -> Vec<u8> {
        synthetic_jpeg(64, 48, [60, 60, 60], Some((8, 8, 32, [250, 250, 250])))
    }

    async fn feed(engine: &Arc<MotionEngine>, state: &mut SourceState, jpeg: &[u8], seq: u64) {
        let buffers = FrameBufferPool::with_capacity(4, 128 * 1024);
        engine
            .handle_sample(state, frame(&buffers, seq, jpeg))
            .await;
        // Defeat the sampling interval gate between calls
        state.last_sample = None;
    }

    #[tokio::test]
    async fn test_first_frame_only_populates_previous() {
        let engine = engine(motion_config());
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        feed(&engine, &mut state, &busy_jpeg(), 1).await;

        assert!(state.previous.is_some());
        assert!(bus_rx.try_recv().is_err());
        assert_eq!(engine.stats().comparisons, 0);
    }

    #[tokio::test]
    async fn test_large_change_emits_motion() {
        let engine = engine(motion_config());
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        feed(&engine, &mut state, &quiet_jpeg(), 1).await;
        feed(&engine, &mut state, &busy_jpeg(), 2).await;

        let event = bus_rx.try_recv().unwrap();
        assert_eq!(event.source_id, "coop");
        assert!(event.normalized_difference > 0.02);
        assert_eq!(engine.stats().motion_events, 1);
    }

    #[tokio::test]
    async fn test_static_scene_stays_quiet() {
        let engine = engine(motion_config());
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        for seq in 1..=4 {
            feed(&engine, &mut state, &quiet_jpeg(), seq).await;
        }

        assert!(bus_rx.try_recv().is_err());
        assert_eq!(engine.stats().motion_events, 0);
    }

    #[tokio::test]
    async fn test_cooldown_limits_events() {
        let engine = engine(motion_config());
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        // Two motion-worthy transitions inside one cooldown window
        feed(&engine, &mut state, &quiet_jpeg(), 1).await;
        feed(&engine, &mut state, &busy_jpeg(), 2).await;
        feed(&engine, &mut state, &quiet_jpeg(), 3).await;
        feed(&engine, &mut state, &busy_jpeg(), 4).await;

        assert!(bus_rx.try_recv().is_ok());
        assert!(bus_rx.try_recv().is_err());
        assert_eq!(engine.stats().motion_events, 1);
        assert!(engine.stats().cooldown_suppressed >= 1);
    }

    #[tokio::test]
    async fn test_no_events_while_paused_and_first_comparison_skipped_after_resume() {
        let engine = engine(motion_config());
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        feed(&engine, &mut state, &quiet_jpeg(), 1).await;

        state.paused = true;
        feed(&engine, &mut state, &busy_jpeg(), 2).await;
        feed(&engine, &mut state, &quiet_jpeg(), 3).await;
        assert!(bus_rx.try_recv().is_err());

        // Resume clears previous: the next frame only repopulates it
        state.paused = false;
        state.previous = None;
        let comparisons_before = engine.stats().comparisons;
        feed(&engine, &mut state, &busy_jpeg(), 4).await;
        assert!(bus_rx.try_recv().is_err());
        assert_eq!(engine.stats().comparisons, comparisons_before);

        // The following frame compares normally again
        feed(&engine, &mut state, &quiet_jpeg(), 5).await;
        assert!(bus_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_color_validation_rejects_uncolored_motion() {
        let mut config = motion_config();
        config.color_detection.enabled = true;
        config.color_detection.min_blob_size = 10;
        let engine = engine(config);
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        // A large dark-to-dark change with no chicken-colored pixels
        let a = synthetic_jpeg(64, 48, [30, 30, 30], None);
        let b = synthetic_jpeg(64, 48, [30, 30, 30], Some((8, 8, 32, [90, 30, 120])));
        feed(&engine, &mut state, &a, 1).await;
        feed(&engine, &mut state, &b, 2).await;

        assert!(bus_rx.try_recv().is_err());
        assert_eq!(engine.stats().color_rejected, 1);

        // The same change with a white (chicken-colored) blob passes
        let c = synthetic_jpeg(64, 48, [30, 30, 30], Some((8, 8, 32, [250, 250, 250])));
        feed(&engine, &mut state, &c, 3).await;
        assert!(bus_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_color_first_requires_tracked_lifetime() {
        let mut config = motion_config();
        config.detection_mode = DetectionMode::ColorFirst;
        config.color_first.min_blob_size = 9;
        config.color_first.min_blob_movement = 2.0;
        let engine = engine(config);
        let mut bus_rx = engine.bus.subscribe();
        let mut state = SourceState::new(&engine.config);

        let at = |x: u32| synthetic_jpeg(64, 48, [20, 60, 20], Some((x, 8, 16, [250, 250, 250])));

        // Frame 1 populates previous; frame 2 first shows the blob to the
        // tracker (lifetime 1, no motion possible)
        feed(&engine, &mut state, &at(4), 1).await;
        feed(&engine, &mut state, &at(4), 2).await;
        assert!(bus_rx.try_recv().is_err());

        // Frame 3 matches and moves the blob: lifetime 2, motion
        feed(&engine, &mut state, &at(24), 3).await;
        let event = bus_rx.try_recv().unwrap();
        assert_eq!(event.source_id, "coop");
    }

    #[tokio::test]
    async fn test_attach_drives_samples_from_channel() {
        let engine = engine(motion_config());
        let mut bus_rx = engine.bus.subscribe();
        let buffers = FrameBufferPool::with_capacity(8, 128 * 1024);
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        engine.attach("coop".to_string(), rx, cancel.clone());

        tx.send(frame(&buffers, 1, &quiet_jpeg())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Clear the interval gate the same way a real sampling cadence would
        if let Some(state) = engine.state_of("coop") {
            state.lock().await.last_sample = None;
        }
        tx.send(frame(&buffers, 2, &busy_jpeg())).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), bus_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.source_id, "coop");
        cancel.cancel();
    }
}
