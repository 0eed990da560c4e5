use crate::frame::Frame;
use serde::Serialize;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frames a viewer may have queued before new ones are dropped
pub const DEFAULT_VIEWER_BACKLOG: usize = 2;

/// Consecutive dropped frames after which a viewer is closed
pub const MAX_CONSECUTIVE_DROPS: u32 = 30;

/// Outcome of offering one frame to a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Frame queued for delivery
    Sent,
    /// Backlog full; frame dropped for this viewer only
    Dropped,
    /// Viewer gone (disconnected or drop limit reached); remove it
    Closed,
}

/// Proxy-side handle for one downstream MJPEG viewer.
///
/// The receiving half lives in the HTTP handler task; writes to one viewer
/// never block another.
pub struct ViewerHandle {
    id: Uuid,
    connected_at: SystemTime,
    tx: mpsc::Sender<Frame>,
    frames_sent: u64,
    total_drops: u64,
    consecutive_drops: u32,
    last_send: Option<Instant>,
    closed: bool,
}

/// Receiver half handed to the HTTP response body
pub struct ViewerConn {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Frame>,
}

/// Wire-facing summary of one connected viewer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSummary {
    pub id: String,
    pub connected_at_ms: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

impl ViewerHandle {
    /// Create a connected handle/receiver pair with the default backlog
    pub fn connect() -> (Self, ViewerConn) {
        Self::with_backlog(DEFAULT_VIEWER_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> (Self, ViewerConn) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(backlog.max(1));
        (
            Self {
                id,
                connected_at: SystemTime::now(),
                tx,
                frames_sent: 0,
                total_drops: 0,
                consecutive_drops: 0,
                last_send: None,
                closed: false,
            },
            ViewerConn { id, rx },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Offer a frame without blocking.
    ///
    /// A full backlog drops this frame; too many consecutive drops close the
    /// viewer so one stuck client cannot pin frames indefinitely.
    pub fn offer(&mut self, frame: &Frame) -> OfferOutcome {
        if self.closed {
            return OfferOutcome::Closed;
        }

        match self.tx.try_send(frame.clone()) {
            Ok(()) => {
                self.frames_sent += 1;
                self.consecutive_drops = 0;
                self.last_send = Some(Instant::now());
                OfferOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.total_drops += 1;
                self.consecutive_drops += 1;
                if self.consecutive_drops >= MAX_CONSECUTIVE_DROPS {
                    self.closed = true;
                    OfferOutcome::Closed
                } else {
                    OfferOutcome::Dropped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed = true;
                OfferOutcome::Closed
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn total_drops(&self) -> u64 {
        self.total_drops
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn summary(&self) -> ViewerSummary {
        ViewerSummary {
            id: self.id.to_string(),
            connected_at_ms: self
                .connected_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            frames_sent: self.frames_sent,
            frames_dropped: self.total_drops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameBufferPool;
    use std::sync::Arc;

    fn frame(pool: &FrameBufferPool, sequence: u64) -> Frame {
        Frame::new(Arc::from("coop"), sequence, pool.acquire_from(b"jpeg"))
    }

    #[test]
    fn test_offer_queues_up_to_backlog() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let (mut handle, _conn) = ViewerHandle::connect();

        assert_eq!(handle.offer(&frame(&pool, 1)), OfferOutcome::Sent);
        assert_eq!(handle.offer(&frame(&pool, 2)), OfferOutcome::Sent);
        assert_eq!(handle.offer(&frame(&pool, 3)), OfferOutcome::Dropped);
        assert_eq!(handle.frames_sent(), 2);
        assert_eq!(handle.total_drops(), 1);
    }

    #[tokio::test]
    async fn test_received_sequences_increase_with_holes_only() {
        let pool = FrameBufferPool::with_capacity(64, 64);
        let (mut handle, mut conn) = ViewerHandle::connect();

        let mut received = Vec::new();
        for seq in 1..=20 {
            handle.offer(&frame(&pool, seq));
            if seq % 3 == 0 {
                // Drain intermittently, as a slow reader would
                while let Ok(f) = conn.rx.try_recv() {
                    received.push(f.sequence());
                }
            }
        }
        while let Ok(f) = conn.rx.try_recv() {
            received.push(f.sequence());
        }

        assert!(!received.is_empty());
        for pair in received.windows(2) {
            assert!(pair[0] < pair[1], "reordered: {:?}", received);
        }
    }

    #[test]
    fn test_persistent_backpressure_closes_viewer() {
        let pool = FrameBufferPool::with_capacity(64, 64);
        let (mut handle, _conn) = ViewerHandle::connect();

        // Fill the backlog, then drop until the limit trips
        let mut outcome = OfferOutcome::Sent;
        for seq in 0..(DEFAULT_VIEWER_BACKLOG as u64 + MAX_CONSECUTIVE_DROPS as u64) {
            outcome = handle.offer(&frame(&pool, seq + 1));
        }

        assert_eq!(outcome, OfferOutcome::Closed);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_disconnected_receiver_closes_viewer() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let (mut handle, conn) = ViewerHandle::connect();
        drop(conn);

        assert_eq!(handle.offer(&frame(&pool, 1)), OfferOutcome::Closed);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_successful_send_resets_consecutive_drops() {
        let pool = FrameBufferPool::with_capacity(64, 64);
        let (mut handle, mut conn) = ViewerHandle::connect();

        handle.offer(&frame(&pool, 1));
        handle.offer(&frame(&pool, 2));
        handle.offer(&frame(&pool, 3));
        assert_eq!(handle.consecutive_drops, 1);

        conn.rx.try_recv().unwrap();
        handle.offer(&frame(&pool, 4));
        assert_eq!(handle.consecutive_drops, 0);
    }
}
