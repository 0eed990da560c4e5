//! Motion-triggered clip recording: pre-buffer capture, post-motion
//! extension, encode job submission, and retention sweeping.

pub mod encoder;
pub mod history;

pub use encoder::{ClipEncoder, FfmpegEncoder};
pub use history::{HistoryPage, HistoryStats, MotionHistory};

use crate::config::RecordingConfig;
use crate::events::{MotionBus, MotionEvent};
use crate::frame::Frame;
use crate::prebuffer::PreBuffer;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Finalize an overdue recording this long after its deadline even when no
/// frame arrives to trip it
const FINALIZE_GRACE: Duration = Duration::from_secs(1);

/// Poll cadence for the finalize deadline when the frame tap is quiet
const IDLE_TICK: Duration = Duration::from_millis(500);

/// Lifecycle of one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Active,
    Finalizing,
    Encoding,
    Done,
    Failed,
}

/// A clip currently capturing frames
pub struct ActiveRecording {
    pub id: String,
    pub source_id: String,
    pub state: RecordingState,
    pub start_wall: SystemTime,
    pub start_mono: Instant,
    /// Grows while motion keeps arriving
    pub end_mono: Instant,
    pub frames: Vec<Frame>,
    pub trigger_intensity: f64,
    last_sequence: u64,
}

#[derive(Default)]
struct SourceRecState {
    active: Option<ActiveRecording>,
    cooldown_until: Option<Instant>,
}

#[derive(Default)]
struct RecordingCounters {
    started: AtomicU64,
    extended: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cooldown_ignored: AtomicU64,
    frames_captured: AtomicU64,
}

/// Weakly-consistent controller counters
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatsSnapshot {
    pub started: u64,
    pub extended: u64,
    pub completed: u64,
    pub failed: u64,
    pub cooldown_ignored: u64,
    pub frames_captured: u64,
    pub active_recordings: usize,
    pub encodes_in_flight: usize,
}

/// Per-source recording state machine.
///
/// A motion event opens a clip seeded from the pre-motion buffer; further
/// motion extends it; the first frame past the deadline (or an idle tick)
/// finalizes it and hands the ordered frames to the encoder. Encoding
/// back-pressures through a semaphore; capture never waits on it.
pub struct RecordingController {
    config: RecordingConfig,
    encoder: Arc<dyn ClipEncoder>,
    encode_slots: Arc<Semaphore>,
    states: Mutex<HashMap<String, SourceRecState>>,
    pre_buffers: Mutex<HashMap<String, Arc<PreBuffer>>>,
    counters: RecordingCounters,
}

impl RecordingController {
    pub fn new(config: RecordingConfig, encoder: Arc<dyn ClipEncoder>) -> Self {
        Self {
            encode_slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            encoder,
            states: Mutex::new(HashMap::new()),
            pre_buffers: Mutex::new(HashMap::new()),
            counters: RecordingCounters::default(),
        }
    }

    /// Attach one source's full-rate frame tap and pre-motion buffer
    pub fn attach(
        self: &Arc<Self>,
        source_id: String,
        mut frames: broadcast::Receiver<Frame>,
        pre_buffer: Arc<PreBuffer>,
        cancel: CancellationToken,
    ) {
        self.pre_buffers
            .lock()
            .insert(source_id.clone(), pre_buffer);

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            debug!(source = %source_id, "Recorder attached");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = tokio::time::timeout(IDLE_TICK, frames.recv()) => match received {
                        Ok(Ok(frame)) => controller.ingest_frame(&source_id, frame),
                        Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                            warn!(source = %source_id, "Recorder lagged, missed {} frames", missed);
                        }
                        Ok(Err(broadcast::error::RecvError::Closed)) => break,
                        Err(_) => controller.check_deadline(&source_id),
                    },
                }
            }
            debug!(source = %source_id, "Recorder task stopped");
        });
    }

    /// Consume motion-bus events until cancelled
    pub fn run(self: &Arc<Self>, bus: MotionBus, cancel: CancellationToken) {
        let mut events = bus.subscribe();
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => controller.on_motion(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Recorder missed {} motion events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// React to one motion event: start a recording or extend the active one
    pub fn on_motion(self: &Arc<Self>, event: &MotionEvent) {
        if !self.config.enabled {
            return;
        }
        let now = event.mono_time;
        let post = Duration::from_secs(self.config.post_motion_seconds as u64);

        let mut states = self.states.lock();
        let state = states.entry(event.source_id.clone()).or_default();

        if let Some(until) = state.cooldown_until {
            if now < until {
                self.counters.cooldown_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(source = %event.source_id, "Motion ignored during recording cooldown");
                return;
            }
        }

        if let Some(active) = state.active.as_mut() {
            // Motion during a recording just lengthens it
            active.end_mono = now + post;
            self.counters.extended.fetch_add(1, Ordering::Relaxed);
            debug!(
                source = %event.source_id,
                recording = %active.id,
                "Recording extended"
            );
            return;
        }

        let pre = Duration::from_secs(self.config.pre_buffer_seconds as u64);
        let start_mono = now.checked_sub(pre).unwrap_or(now);
        let frames = self
            .pre_buffers
            .lock()
            .get(&event.source_id)
            .map(|buffer| buffer.snapshot_since(start_mono))
            .unwrap_or_default();
        let last_sequence = frames.last().map(|f| f.sequence()).unwrap_or(0);
        self.counters
            .frames_captured
            .fetch_add(frames.len() as u64, Ordering::Relaxed);

        let recording = ActiveRecording {
            id: format!("rec-{}", event.id),
            source_id: event.source_id.clone(),
            state: RecordingState::Active,
            start_wall: event
                .wall_time
                .checked_sub(pre)
                .unwrap_or(event.wall_time),
            start_mono,
            end_mono: now + post,
            frames,
            trigger_intensity: event.intensity_pct,
            last_sequence,
        };
        info!(
            source = %event.source_id,
            recording = %recording.id,
            prebuffered = recording.frames.len(),
            "Recording started"
        );
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        state.active = Some(recording);
    }

    /// Append one frame to the active recording, or finalize past deadline
    fn ingest_frame(self: &Arc<Self>, source_id: &str, frame: Frame) {
        let finished = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(source_id) else {
                return;
            };
            let Some(active) = state.active.as_mut() else {
                return;
            };

            if frame.mono_time() <= active.end_mono {
                if frame.sequence() > active.last_sequence {
                    active.last_sequence = frame.sequence();
                    active.frames.push(frame);
                    self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
            self.detach_active(state)
        };
        self.submit_encode(finished);
    }

    /// Finalize an overdue recording when no frames are arriving to trip it
    fn check_deadline(self: &Arc<Self>, source_id: &str) {
        let finished = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(source_id) else {
                return;
            };
            let overdue = state
                .active
                .as_ref()
                .is_some_and(|a| Instant::now() > a.end_mono + FINALIZE_GRACE);
            if !overdue {
                return;
            }
            self.detach_active(state)
        };
        self.submit_encode(finished);
    }

    /// Detach the active recording and start the per-source cooldown.
    /// Caller holds the state lock.
    fn detach_active(&self, state: &mut SourceRecState) -> Option<ActiveRecording> {
        let mut recording = state.active.take()?;
        recording.state = RecordingState::Finalizing;
        state.cooldown_until =
            Some(Instant::now() + Duration::from_secs(self.config.cooldown_seconds as u64));
        Some(recording)
    }

    /// Queue a finalized recording for encoding.
    ///
    /// The semaphore bounds concurrent encodes; capture has already finished,
    /// so saturation delays encoding only.
    fn submit_encode(self: &Arc<Self>, recording: Option<ActiveRecording>) {
        let Some(recording) = recording else { return };
        info!(
            source = %recording.source_id,
            recording = %recording.id,
            frames = recording.frames.len(),
            "Recording finalizing"
        );

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.encode_recording(recording).await;
        });
    }

    async fn encode_recording(&self, mut recording: ActiveRecording) {
        if recording.frames.is_empty() {
            warn!(recording = %recording.id, "Recording has no frames, skipping encode");
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Ok(_permit) = self.encode_slots.acquire().await else {
            return;
        };
        recording.state = RecordingState::Encoding;

        let output = self.output_path(recording.start_wall);
        match self
            .encoder
            .encode(
                &recording.frames,
                &output,
                self.config.fps,
                self.config.video_quality,
            )
            .await
        {
            Ok(path) => {
                recording.state = RecordingState::Done;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if self.config.save_metadata {
                    if let Err(e) = self.write_sidecar(&recording, &path).await {
                        warn!(recording = %recording.id, "Sidecar write failed: {}", e);
                    }
                }
                info!(
                    recording = %recording.id,
                    clip = %path.display(),
                    "Recording done"
                );
            }
            Err(e) => {
                // No retry: frame refs release here and the next motion
                // starts a fresh recording
                recording.state = RecordingState::Failed;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(recording = %recording.id, "Encode failed: {}", e);
            }
        }
    }

    /// `<outputDir>/<YYYY-MM-DD>/motion_<timestamp>_<hex>.mp4` in local time
    fn output_path(&self, start: SystemTime) -> PathBuf {
        let local = chrono::DateTime::<chrono::Local>::from(start);
        let day = local.format("%Y-%m-%d").to_string();
        let stamp = local.format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
        let suffix = &Uuid::new_v4().simple().to_string()[..8];

        PathBuf::from(&self.config.output_dir)
            .join(day)
            .join(format!("motion_{}_{}.mp4", stamp, suffix))
    }

    async fn write_sidecar(
        &self,
        recording: &ActiveRecording,
        clip_path: &std::path::Path,
    ) -> Result<(), std::io::Error> {
        let start = chrono::DateTime::<chrono::Utc>::from(recording.start_wall).to_rfc3339();
        let end = recording
            .frames
            .last()
            .map(|f| chrono::DateTime::<chrono::Utc>::from(f.wall_time()).to_rfc3339())
            .unwrap_or_else(|| start.clone());

        let metadata = json!({
            "id": recording.id,
            "sourceId": recording.source_id,
            "startTime": start,
            "endTime": end,
            "frameCount": recording.frames.len(),
            "motion": { "intensity": recording.trigger_intensity },
        });

        let sidecar = clip_path.with_extension("json");
        tokio::fs::write(&sidecar, serde_json::to_vec_pretty(&metadata)?).await
    }

    /// Periodically delete day-directories older than the retention window
    pub fn spawn_retention_sweep(self: &Arc<Self>, cancel: CancellationToken) {
        if self.config.retention_days == 0 {
            return;
        }
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                controller.sweep_expired_days().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(6 * 3_600)) => {}
                }
            }
        });
    }

    async fn sweep_expired_days(&self) {
        let cutoff = chrono::Local::now().date_naive()
            - chrono::Duration::days(self.config.retention_days as i64);

        let Ok(mut entries) = tokio::fs::read_dir(&self.config.output_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(day) = chrono::NaiveDate::parse_from_str(name, "%Y-%m-%d") else {
                continue;
            };
            if day < cutoff {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => info!("Swept expired recordings: {}", name),
                    Err(e) => warn!("Retention sweep failed for {}: {}", name, e),
                }
            }
        }
    }

    pub fn active_recording_count(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|s| s.active.is_some())
            .count()
    }

    pub fn stats(&self) -> RecordingStatsSnapshot {
        RecordingStatsSnapshot {
            started: self.counters.started.load(Ordering::Relaxed),
            extended: self.counters.extended.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cooldown_ignored: self.counters.cooldown_ignored.load(Ordering::Relaxed),
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            active_recordings: self.active_recording_count(),
            encodes_in_flight: self
                .config
                .max_concurrent
                .saturating_sub(self.encode_slots.available_permits()),
        }
    }
}
