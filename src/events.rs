use serde_json::json;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// A confirmed motion detection. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    /// Globally unique id: epoch-millisecond prefix plus a random suffix
    pub id: String,
    pub source_id: String,
    pub wall_time: SystemTime,
    pub mono_time: Instant,
    pub normalized_difference: f64,
    pub threshold: f64,
    pub intensity_pct: f64,
    /// Classifier details (mode, voter confidence, blob counts)
    pub metadata: serde_json::Value,
}

impl MotionEvent {
    pub fn new(
        source_id: &str,
        normalized_difference: f64,
        threshold: f64,
        metadata: serde_json::Value,
    ) -> Self {
        let wall_time = SystemTime::now();
        let millis = wall_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix = Uuid::new_v4().simple().to_string();

        Self {
            id: format!("{}-{}", millis, &suffix[..8]),
            source_id: source_id.to_string(),
            wall_time,
            mono_time: Instant::now(),
            normalized_difference,
            threshold,
            intensity_pct: normalized_difference * 100.0,
            metadata,
        }
    }

    /// Wall-clock timestamp as milliseconds since the Unix epoch
    pub fn epoch_ms(&self) -> u64 {
        self.wall_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// The wire representation used by the SSE channel and history endpoint
    pub fn to_json(&self) -> serde_json::Value {
        let timestamp = chrono::DateTime::<chrono::Utc>::from(self.wall_time).to_rfc3339();
        json!({
            "type": "motion",
            "id": self.id,
            "sourceId": self.source_id,
            "timestamp": timestamp,
            "timestampMs": self.epoch_ms(),
            "intensity": self.intensity_pct,
            "threshold": self.threshold,
            "metadata": self.metadata,
        })
    }
}

/// Bounded multi-subscriber channel for motion events.
///
/// One channel carries one event kind; slow subscribers lag and observe a
/// `RecvError::Lagged` rather than stalling the detector.
#[derive(Clone)]
pub struct MotionBus {
    sender: broadcast::Sender<MotionEvent>,
}

impl MotionBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of subscribers that received it
    pub fn publish(&self, event: MotionEvent) -> usize {
        info!(
            source = %event.source_id,
            intensity = format_args!("{:.1}%", event.intensity_pct),
            "Motion detected"
        );
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("Motion event published with no subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Upstream connectivity transitions for one source
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Up {
        source_id: String,
    },
    Down {
        source_id: String,
        reason: String,
    },
}
