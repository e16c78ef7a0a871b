//! Structured query events.
//!
//! Every event is logged under the `queries` target and published on a
//! broadcast channel. Publishing never blocks; slow subscribers lag and
//! lose the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use sluice_common::models::{QueryCategory, StoreKind, TargetStore};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueryEvent {
    Classified {
        query_id: String,
        category: QueryCategory,
        target: TargetStore,
        confidence: f64,
        reason: String,
    },
    Optimized {
        query_id: String,
        strategies: Vec<String>,
        improvement_pct: f64,
    },
    CacheHit {
        query_id: String,
        key: String,
    },
    CacheMiss {
        query_id: String,
        key: String,
    },
    Fallback {
        query_id: String,
        from: StoreKind,
        to: StoreKind,
        reason: String,
    },
    Completed {
        query_id: String,
        store: StoreKind,
        duration_ms: u64,
        rows: usize,
        cache_hit: bool,
    },
    Failed {
        query_id: String,
        code: String,
        message: String,
    },
    TimedOut {
        query_id: String,
        duration_ms: u64,
    },
    Cancelled {
        query_id: String,
    },
}

impl QueryEvent {
    pub fn query_id(&self) -> &str {
        match self {
            QueryEvent::Classified { query_id, .. }
            | QueryEvent::Optimized { query_id, .. }
            | QueryEvent::CacheHit { query_id, .. }
            | QueryEvent::CacheMiss { query_id, .. }
            | QueryEvent::Fallback { query_id, .. }
            | QueryEvent::Completed { query_id, .. }
            | QueryEvent::Failed { query_id, .. }
            | QueryEvent::TimedOut { query_id, .. }
            | QueryEvent::Cancelled { query_id } => query_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueryEvent) {
        log_event(&event);
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

fn log_event(event: &QueryEvent) {
    match event {
        QueryEvent::Classified {
            query_id,
            category,
            target,
            confidence,
            reason,
        } => debug!(
            target: "queries",
            query_id = %query_id,
            category = %category,
            target_store = ?target,
            confidence,
            reason = %reason,
            "Query classified"
        ),
        QueryEvent::Optimized {
            query_id,
            strategies,
            improvement_pct,
        } => debug!(
            target: "queries",
            query_id = %query_id,
            strategies = ?strategies,
            improvement_pct,
            "Query optimized"
        ),
        QueryEvent::CacheHit { query_id, key } => {
            debug!(target: "queries", query_id = %query_id, key = %key, "Cache hit")
        }
        QueryEvent::CacheMiss { query_id, key } => {
            debug!(target: "queries", query_id = %query_id, key = %key, "Cache miss")
        }
        QueryEvent::Fallback {
            query_id,
            from,
            to,
            reason,
        } => warn!(
            target: "queries",
            query_id = %query_id,
            from = %from,
            to = %to,
            reason = %reason,
            "Store fallback"
        ),
        QueryEvent::Completed {
            query_id,
            store,
            duration_ms,
            rows,
            cache_hit,
        } => info!(
            target: "queries",
            query_id = %query_id,
            store = %store,
            duration_ms,
            rows,
            cache_hit,
            "Query completed"
        ),
        QueryEvent::Failed {
            query_id,
            code,
            message,
        } => warn!(
            target: "queries",
            query_id = %query_id,
            code = %code,
            message = %message,
            "Query failed"
        ),
        QueryEvent::TimedOut {
            query_id,
            duration_ms,
        } => warn!(target: "queries", query_id = %query_id, duration_ms, "Query timed out"),
        QueryEvent::Cancelled { query_id } => {
            info!(target: "queries", query_id = %query_id, "Query cancelled")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(QueryEvent::Cancelled {
            query_id: "q1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.query_id(), "q1");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cancelled");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(QueryEvent::CacheMiss {
            query_id: "q2".into(),
            key: "k".into(),
        });
    }
}
