use crate::events::{MotionBus, MotionEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events a subscriber may have queued before it is evicted
pub const SUBSCRIBER_BUFFER: usize = 16;

/// Minimum keepalive cadence so intermediate proxies do not idle-close
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide server-sent-events broadcaster for motion notifications.
///
/// Each subscriber owns a small bounded channel; publishing never blocks.
/// A subscriber that stops draining overflows its channel and is closed and
/// removed, never slowing the other subscribers.
pub struct SseBroadcaster {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<String>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
}

/// Weakly-consistent broadcaster counters
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SseStatsSnapshot {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub evicted: u64,
}

impl SseBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; the receiver yields pre-serialized event JSON
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().insert(id, tx);
        info!(subscriber = %id, "SSE subscriber connected");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.lock().remove(&id).is_some() {
            info!(subscriber = %id, "SSE subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publish a motion event to every subscriber without blocking
    pub fn publish_motion(&self, event: &MotionEvent) {
        self.publish_line(event.to_json().to_string());
    }

    fn publish_line(&self, line: String) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut overflowed = Vec::new();
        {
            let subscribers = self.subscribers.lock();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(line.clone()) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_))
                    | Err(mpsc::error::TrySendError::Closed(_)) => {
                        overflowed.push(*id);
                    }
                }
            }
        }

        for id in overflowed {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = %id, "SSE subscriber overflowed, removing");
            self.subscribers.lock().remove(&id);
        }
    }

    pub fn stats(&self) -> SseStatsSnapshot {
        SseStatsSnapshot {
            subscribers: self.subscriber_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Forward motion-bus events into the broadcaster until cancelled
    pub fn run(self: Arc<Self>, bus: MotionBus, cancel: CancellationToken) {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => self.publish_motion(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("SSE forwarder lagged, skipped {} events", missed);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("SSE forwarder stopped");
        });
    }
}

impl Default for SseBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> MotionEvent {
        MotionEvent::new("coop", 0.2, 0.02, serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let sse = SseBroadcaster::new();
        let (_id_a, mut rx_a) = sse.subscribe();
        let (_id_b, mut rx_b) = sse.subscribe();

        sse.publish_motion(&event());

        let line_a = rx_a.recv().await.unwrap();
        let line_b = rx_b.recv().await.unwrap();
        assert_eq!(line_a, line_b);

        let json: serde_json::Value = serde_json::from_str(&line_a).unwrap();
        assert_eq!(json["type"], "motion");
        assert_eq!(json["sourceId"], "coop");
    }

    #[tokio::test]
    async fn test_overflowing_subscriber_is_evicted_others_continue() {
        let sse = SseBroadcaster::new();
        let (_stuck_id, stuck_rx) = sse.subscribe();
        let (_live_id, mut live_rx) = sse.subscribe();

        // The stuck subscriber never reads; overflow its 16-slot channel
        for _ in 0..(SUBSCRIBER_BUFFER + 1) {
            sse.publish_motion(&event());
        }

        assert_eq!(sse.subscriber_count(), 1);
        assert_eq!(sse.stats().evicted, 1);

        // The live subscriber drains and keeps receiving
        while live_rx.try_recv().is_ok() {}
        sse.publish_motion(&event());
        assert!(live_rx.try_recv().is_ok());

        drop(stuck_rx);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed_on_next_publish() {
        let sse = SseBroadcaster::new();
        let (_id, rx) = sse.subscribe();
        drop(rx);

        sse.publish_motion(&event());
        assert_eq!(sse.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let sse = SseBroadcaster::new();
        let (id, _rx) = sse.subscribe();

        sse.unsubscribe(id);
        sse.unsubscribe(id);
        assert_eq!(sse.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_forwarder_bridges_bus_to_subscribers() {
        let sse = Arc::new(SseBroadcaster::new());
        let bus = MotionBus::new(8);
        let cancel = CancellationToken::new();
        sse.clone().run(bus.clone(), cancel.clone());

        let (_id, mut rx) = sse.subscribe();
        bus.publish(event());

        let line = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(line.contains("\"type\":\"motion\""));
        cancel.cancel();
    }
}
