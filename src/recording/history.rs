use crate::events::{MotionBus, MotionEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Events kept in memory for the history endpoint
pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

/// Bounded in-memory ring of recent motion events.
///
/// Backs the motion history endpoint; the all-time counter keeps counting
/// after old events fall out of the ring.
pub struct MotionHistory {
    capacity: usize,
    events: Mutex<VecDeque<MotionEvent>>,
    total_recorded: AtomicU64,
}

/// One page of history query results
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub events: Vec<MotionEvent>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Aggregate history statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_recorded: u64,
    pub buffered: usize,
    pub first_event_ms: Option<u64>,
    pub last_event_ms: Option<u64>,
}

impl MotionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            total_recorded: AtomicU64::new(0),
        }
    }

    /// Record one event, evicting the oldest past capacity
    pub fn record(&self, event: MotionEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Query events newest-first.
    ///
    /// `since_ms` is an epoch-millisecond cutoff applied before paging;
    /// `total` counts everything matching the cutoff.
    pub fn query(&self, limit: usize, offset: usize, since_ms: Option<u64>) -> HistoryPage {
        let events = self.events.lock();
        let matching: Vec<&MotionEvent> = events
            .iter()
            .rev()
            .filter(|e| since_ms.map_or(true, |cutoff| e.epoch_ms() >= cutoff))
            .collect();

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        HistoryPage {
            events: page,
            total,
            offset,
            limit,
        }
    }

    pub fn stats(&self) -> HistoryStats {
        let events = self.events.lock();
        HistoryStats {
            total_recorded: self.total_recorded.load(Ordering::Relaxed),
            buffered: events.len(),
            first_event_ms: events.front().map(|e| e.epoch_ms()),
            last_event_ms: events.back().map(|e| e.epoch_ms()),
        }
    }

    /// Record motion-bus events until cancelled
    pub fn run(self: Arc<Self>, bus: MotionBus, cancel: CancellationToken) {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => self.record(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("History recorder lagged, skipped {} events", missed);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: &str) -> MotionEvent {
        MotionEvent::new(source, 0.1, 0.02, serde_json::Value::Null)
    }

    #[test]
    fn test_ring_is_bounded() {
        let history = MotionHistory::new(3);
        for _ in 0..10 {
            history.record(event("coop"));
        }

        let stats = history.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.total_recorded, 10);
    }

    #[test]
    fn test_query_is_newest_first() {
        let history = MotionHistory::new(10);
        let first = event("coop");
        let second = event("run");
        history.record(first.clone());
        history.record(second.clone());

        let page = history.query(10, 0, None);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].id, second.id);
        assert_eq!(page.events[1].id, first.id);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn test_query_paging() {
        let history = MotionHistory::new(10);
        for _ in 0..5 {
            history.record(event("coop"));
        }

        let page = history.query(2, 1, None);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.offset, 1);
        assert_eq!(page.limit, 2);
    }

    #[test]
    fn test_since_cutoff_filters_old_events() {
        let history = MotionHistory::new(10);
        let old = event("coop");
        history.record(old.clone());

        let cutoff = old.epoch_ms() + 1;
        let newer = event("coop");
        // Same millisecond is possible; only assert the cutoff logic
        let page = history.query(10, 0, Some(cutoff));
        let all = history.query(10, 0, None);
        assert_eq!(all.total, 1);
        assert!(page.total <= all.total);

        history.record(newer);
        let page = history.query(10, 0, Some(0));
        assert_eq!(page.total, 2);
    }
}
