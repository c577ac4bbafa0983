//! Node metrics.
//!
//! Counters are shared between the controller actor (which updates them)
//! and the embedding process (which reads them for reporting). All fields
//! are atomic for lock-free concurrent access; metrics are emitted with
//! the `mn_` prefix.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Aggregated counters for one media node.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    /// Publishers currently registered (connections and external inputs).
    active_publishers: AtomicUsize,
    /// Subscribers currently registered, summed over all publishers.
    active_subscribers: AtomicUsize,
    /// Clients with at least one live transport connection.
    active_clients: AtomicUsize,
    /// Negotiations that ended in the failed state.
    negotiations_failed: AtomicU64,
    /// Stats reports delivered to the stats sink.
    stats_reports_published: AtomicU64,
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMetricsSnapshot {
    pub publishers: usize,
    pub subscribers: usize,
    pub clients: usize,
    pub negotiations_failed: u64,
    pub stats_reports_published: u64,
}

impl NodeMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publisher_created(&self) {
        self.active_publishers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publisher_removed(&self) {
        self.active_publishers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscriber_created(&self) {
        self.active_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the subscriber count by `count` at once. Batch removals
    /// drop several subscribers in one registry pass.
    pub fn subscribers_removed(&self, count: usize) {
        self.active_subscribers.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn client_created(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_removed(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_negotiation_failed(&self) {
        self.negotiations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stats_report(&self) {
        self.stats_reports_published.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn publisher_count(&self) -> usize {
        self.active_publishers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.active_subscribers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Take a snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            publishers: self.active_publishers.load(Ordering::Relaxed),
            subscribers: self.active_subscribers.load(Ordering::Relaxed),
            clients: self.active_clients.load(Ordering::Relaxed),
            negotiations_failed: self.negotiations_failed.load(Ordering::Relaxed),
            stats_reports_published: self.stats_reports_published.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_rise_and_fall() {
        let metrics = NodeMetrics::new();

        metrics.publisher_created();
        metrics.publisher_created();
        metrics.subscriber_created();
        metrics.subscriber_created();
        metrics.subscriber_created();
        metrics.client_created();

        assert_eq!(metrics.publisher_count(), 2);
        assert_eq!(metrics.subscriber_count(), 3);
        assert_eq!(metrics.client_count(), 1);

        metrics.publisher_removed();
        metrics.subscribers_removed(2);
        metrics.client_removed();

        assert_eq!(metrics.publisher_count(), 1);
        assert_eq!(metrics.subscriber_count(), 1);
        assert_eq!(metrics.client_count(), 0);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = NodeMetrics::new();

        metrics.publisher_created();
        metrics.record_negotiation_failed();
        metrics.record_stats_report();
        metrics.record_stats_report();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.publishers, 1);
        assert_eq!(snapshot.subscribers, 0);
        assert_eq!(snapshot.negotiations_failed, 1);
        assert_eq!(snapshot.stats_reports_published, 2);
    }
}
