use crate::config::SourceConfig;
use crate::error::ProxyError;
use crate::events::UpstreamEvent;
use crate::frame::Frame;
use crate::mjpeg::viewer::{OfferOutcome, ViewerConn, ViewerHandle, ViewerSummary};
use crate::pool::FrameBufferPool;
use crate::prebuffer::PreBuffer;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the recording frame tap
const FRAME_TAP_CAPACITY: usize = 64;

/// Per-source pause state
#[derive(Debug, Clone, Copy, Default)]
pub struct PauseState {
    pub paused: bool,
    pub until: Option<Instant>,
}

/// Wire-facing pause status
#[derive(Debug, Clone, Copy)]
pub struct PauseStatus {
    pub paused: bool,
    pub remaining: Option<Duration>,
}

/// Weakly-consistent proxy counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatsSnapshot {
    pub is_connected: bool,
    pub source_url: String,
    pub client_count: usize,
    pub frame_count: u64,
    pub last_frame_age_ms: Option<u64>,
    pub is_paused: bool,
    pub parser_overflows: u64,
    pub viewer_frames_dropped: u64,
    pub viewers_closed: u64,
}

/// Per-source MJPEG proxy.
///
/// Exclusively owns its upstream connection, parser state, viewer set,
/// pre-motion buffer, and sampling tap. One upstream task feeds
/// `handle_frame`; all mutations of the viewer set and pause state go
/// through the shared state's internal locks.
pub struct MjpegProxy {
    shared: Arc<ProxyShared>,
    cancel: CancellationToken,
    started: AtomicBool,
}

pub(crate) struct ProxyShared {
    pub(crate) source: SourceConfig,
    pub(crate) source_id: Arc<str>,
    pool: Arc<FrameBufferPool>,
    pre_buffer: Arc<PreBuffer>,
    viewers: Mutex<HashMap<Uuid, ViewerHandle>>,
    pause: Mutex<PauseState>,
    frames: broadcast::Sender<Frame>,
    samples: mpsc::Sender<Frame>,
    status: broadcast::Sender<UpstreamEvent>,
    sequence: AtomicU64,
    pub(crate) connected: AtomicBool,
    frame_count: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
    sample_interval: Duration,
    last_sample: Mutex<Option<Instant>>,
    pub(crate) parser_overflows: AtomicU64,
    viewer_drops: AtomicU64,
    viewers_closed: AtomicU64,
}

impl MjpegProxy {
    /// Create a proxy plus the receiver for its motion sampling tap.
    ///
    /// The sample channel holds a single frame: a sample is skipped when the
    /// previous one has not been drained yet.
    pub fn new(
        source: SourceConfig,
        pool: Arc<FrameBufferPool>,
        motion_fps: u32,
        pre_buffer_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (frames, _) = broadcast::channel(FRAME_TAP_CAPACITY);
        let (status, _) = broadcast::channel(16);
        let (samples, sample_rx) = mpsc::channel(1);
        let source_id: Arc<str> = Arc::from(source.id.as_str());
        let sample_interval = Duration::from_millis(1_000 / motion_fps.max(1) as u64);

        let shared = Arc::new(ProxyShared {
            source_id,
            pool,
            pre_buffer: Arc::new(PreBuffer::new(pre_buffer_capacity.max(1))),
            viewers: Mutex::new(HashMap::new()),
            pause: Mutex::new(PauseState::default()),
            frames,
            samples,
            status,
            sequence: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            last_frame: Mutex::new(None),
            sample_interval,
            last_sample: Mutex::new(None),
            parser_overflows: AtomicU64::new(0),
            viewer_drops: AtomicU64::new(0),
            viewers_closed: AtomicU64::new(0),
            source,
        });

        (
            Self {
                shared,
                cancel,
                started: AtomicBool::new(false),
            },
            sample_rx,
        )
    }

    /// Start the upstream connection task. Idempotent.
    ///
    /// The proxy is persistent: the upstream is maintained (with reconnects)
    /// even with zero viewers, until `disconnect`.
    pub fn connect(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            source = %self.shared.source.id,
            url = %self.shared.source.url,
            "Connecting MJPEG proxy upstream"
        );
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            super::upstream::run(shared, cancel).await;
        });
    }

    /// Stop the upstream task and drop all viewers
    pub fn disconnect(&self) {
        self.cancel.cancel();
        self.shared.connected.store(false, Ordering::SeqCst);
        let mut viewers = self.shared.viewers.lock();
        let dropped = viewers.len();
        viewers.clear();
        if dropped > 0 {
            debug!(
                source = %self.shared.source.id,
                "Dropped {} viewers on disconnect",
                dropped
            );
        }
    }

    /// Register a downstream viewer and return its receiving half
    pub fn add_viewer(&self) -> ViewerConn {
        let (handle, conn) = ViewerHandle::connect();
        let id = handle.id();
        self.shared.viewers.lock().insert(id, handle);
        info!(
            source = %self.shared.source.id,
            viewer = %id,
            "Viewer connected"
        );
        conn
    }

    /// Remove a viewer; missing ids are ignored
    pub fn remove_viewer(&self, id: Uuid) {
        if self.shared.viewers.lock().remove(&id).is_some() {
            info!(
                source = %self.shared.source.id,
                viewer = %id,
                "Viewer disconnected"
            );
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.shared.viewers.lock().len()
    }

    /// Summaries of every connected viewer
    pub fn clients(&self) -> Vec<ViewerSummary> {
        self.shared
            .viewers
            .lock()
            .values()
            .map(|v| v.summary())
            .collect()
    }

    /// Pause broadcast and motion sampling for `duration`.
    ///
    /// The upstream connection continues. Always overwrites the expiry, so a
    /// later call may extend or shorten an existing pause. Returns the
    /// wall-clock expiry.
    pub fn pause(&self, duration: Duration) -> SystemTime {
        let mut pause = self.shared.pause.lock();
        pause.paused = true;
        pause.until = Some(Instant::now() + duration);
        info!(
            source = %self.shared.source.id,
            "Stream paused for {:?}",
            duration
        );
        SystemTime::now() + duration
    }

    /// Clear any pause immediately
    pub fn resume(&self) {
        let mut pause = self.shared.pause.lock();
        if pause.paused {
            info!(source = %self.shared.source.id, "Stream resumed");
        }
        pause.paused = false;
        pause.until = None;
    }

    pub fn pause_status(&self) -> PauseStatus {
        let pause = self.shared.pause.lock();
        if !pause.paused {
            return PauseStatus {
                paused: false,
                remaining: None,
            };
        }
        let remaining = pause.until.map(|u| u.saturating_duration_since(Instant::now()));
        match remaining {
            Some(r) if r.is_zero() => PauseStatus {
                paused: false,
                remaining: None,
            },
            _ => PauseStatus {
                paused: true,
                remaining,
            },
        }
    }

    /// Subscribe to the full-rate frame tap (used by the recorder)
    pub fn frame_events(&self) -> broadcast::Receiver<Frame> {
        self.shared.frames.subscribe()
    }

    /// Subscribe to upstream connectivity transitions
    pub fn status_events(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.shared.status.subscribe()
    }

    /// The rolling pre-motion window owned by this proxy
    pub fn pre_buffer(&self) -> Arc<PreBuffer> {
        Arc::clone(&self.shared.pre_buffer)
    }

    pub fn source(&self) -> &SourceConfig {
        &self.shared.source
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ProxyStatsSnapshot {
        let last_frame_age_ms = self
            .shared
            .last_frame
            .lock()
            .map(|t| t.elapsed().as_millis() as u64);

        ProxyStatsSnapshot {
            is_connected: self.is_connected(),
            source_url: self.shared.source.url.clone(),
            client_count: self.viewer_count(),
            frame_count: self.shared.frame_count.load(Ordering::Relaxed),
            last_frame_age_ms,
            is_paused: self.pause_status().paused,
            parser_overflows: self.shared.parser_overflows.load(Ordering::Relaxed),
            viewer_frames_dropped: self.shared.viewer_drops.load(Ordering::Relaxed),
            viewers_closed: self.shared.viewers_closed.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_frame(&self, jpeg: &[u8]) {
        self.shared.handle_frame(jpeg);
    }
}

impl ProxyShared {
    /// Ingest one complete JPEG from the parser.
    ///
    /// Called from the upstream task only. Never blocks: viewer and sample
    /// dispatch use non-blocking sends, dropping on backpressure.
    pub(crate) fn handle_frame(&self, jpeg: &[u8]) {
        let buffer = self.pool.acquire_from(jpeg);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame::new(Arc::clone(&self.source_id), sequence, buffer);

        self.frame_count.fetch_add(1, Ordering::Relaxed);
        *self.last_frame.lock() = Some(frame.mono_time());

        self.pre_buffer.push(frame.clone());

        // The recording tap keeps flowing while paused so an active clip
        // still extends
        let _ = self.frames.send(frame.clone());

        if self.effectively_paused() {
            return;
        }

        self.fan_out(&frame);
        self.maybe_sample(&frame);
    }

    fn fan_out(&self, frame: &Frame) {
        let mut closed = Vec::new();
        {
            let mut viewers = self.viewers.lock();
            for (id, viewer) in viewers.iter_mut() {
                match viewer.offer(frame) {
                    OfferOutcome::Sent => {}
                    OfferOutcome::Dropped => {
                        self.viewer_drops.fetch_add(1, Ordering::Relaxed);
                    }
                    OfferOutcome::Closed => closed.push(*id),
                }
            }
            for id in &closed {
                viewers.remove(id);
            }
        }
        for id in closed {
            self.viewers_closed.fetch_add(1, Ordering::Relaxed);
            warn!(
                source = %self.source.id,
                viewer = %id,
                "Viewer closed by backpressure"
            );
        }
    }

    fn maybe_sample(&self, frame: &Frame) {
        let now = frame.mono_time();
        let mut last = self.last_sample.lock();
        let due = last.map_or(true, |t| now.duration_since(t) >= self.sample_interval);
        if !due {
            return;
        }
        // A full channel means the detector has not drained the previous
        // sample; skip this one
        if self.samples.try_send(frame.clone()).is_ok() {
            *last = Some(now);
        }
    }

    /// Check the pause flag, auto-expiring a lapsed pause
    fn effectively_paused(&self) -> bool {
        let mut pause = self.pause.lock();
        if !pause.paused {
            return false;
        }
        match pause.until {
            Some(until) if Instant::now() >= until => {
                pause.paused = false;
                pause.until = None;
                info!(source = %self.source.id, "Pause expired, stream resumed");
                false
            }
            _ => true,
        }
    }

    pub(crate) fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(source = %self.source.id, "Upstream connected");
            let _ = self.status.send(UpstreamEvent::Up {
                source_id: self.source.id.clone(),
            });
        }
    }

    pub(crate) fn mark_disconnected(&self, reason: &ProxyError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(source = %self.source.id, %reason, "Upstream down");
            let _ = self.status.send(UpstreamEvent::Down {
                source_id: self.source.id.clone(),
                reason: reason.to_string(),
            });
        } else {
            debug!(source = %self.source.id, %reason, "Upstream connect attempt failed");
        }
    }
}
