//! # Bus Statistics
//!
//! Lifecycle counters for one bus instance. Updated lock-free on the
//! publish and dispatch paths; read as a consistent-enough snapshot for
//! health endpoints and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic lifecycle counters.
#[derive(Debug, Default)]
pub struct BusStatistics {
    published: AtomicU64,
    publishes_dropped: AtomicU64,
    deliveries: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped_no_handler: AtomicU64,
    dropped_malformed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events accepted by the broker.
    pub published: u64,
    /// Publishes dropped (disconnected, or retries exhausted).
    pub publishes_dropped: u64,
    /// Messages handed to the dispatch loop.
    pub deliveries: u64,
    /// Messages acknowledged after successful dispatch.
    pub acked: u64,
    /// Messages negatively acknowledged and requeued.
    pub requeued: u64,
    /// Messages acknowledged-and-dropped for lack of a subscription.
    pub dropped_no_handler: u64,
    /// Messages acknowledged-and-dropped as undecodable.
    pub dropped_malformed: u64,
}

impl BusStatistics {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_dropped(&self) {
        self.publishes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_no_handler(&self) {
        self.dropped_no_handler.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publishes_dropped: self.publishes_dropped.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped_no_handler: self.dropped_no_handler.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
        }
    }
}
