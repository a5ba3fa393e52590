//! In-process publish/subscribe for book and metrics events.
//!
//! Bounded broadcast fan-out: a slow subscriber lags and drops the oldest
//! events instead of back-pressuring the stream reader.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::metrics::LiquiditySnapshot;
use crate::models::PairKey;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A diff was merged into the pair's replica.
    ReplicaUpdated { key: PairKey },
    /// The metrics engine finished a computation for the pair.
    MetricsComputed {
        key: PairKey,
        snapshot: Arc<LiquiditySnapshot>,
    },
    /// A subscription hit a failure worth surfacing.
    SubscriberError { key: PairKey, reason: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire an event. A bus with no live subscribers swallows it.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
