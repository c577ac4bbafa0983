//! Periodic stats subscriptions.
//!
//! A subscription collects one stream's stats on a fixed interval and
//! publishes each report to the node's stats sink until a timeout ends
//! it. Subscriptions are bounded: requested intervals and timeouts are
//! clamped to configured limits, and the number of concurrent
//! subscriptions is capped. Renewing an active subscription replaces
//! its collection task and restarts the timeout.
//!
//! The scheduler itself lives inside the controller actor; collection
//! runs on detached tasks that fetch reports through the controller
//! mailbox, so a tick observes the same registry state as any other
//! operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use signaling_protocol::StatsSink;

use crate::actors::messages::ControllerMessage;
use crate::config::Config;
use crate::errors::MediaNodeError;
use crate::metrics::NodeMetrics;

/// What `subscribe` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// A new collection task was started.
    Scheduled,
    /// An active subscription was replaced and its timeout restarted.
    Renewed,
    /// The concurrent subscription cap is reached; nothing was started.
    QuotaExhausted,
    /// Stats subscriptions are disabled on this node.
    Disabled,
}

struct StatsEntry {
    token: CancellationToken,
    generation: u64,
}

/// Bookkeeping for the node's active stats subscriptions.
pub struct StatsScheduler {
    max_subscriptions: usize,
    max_timeout: Duration,
    min_interval: Duration,
    sink: Arc<dyn StatsSink>,
    controller: mpsc::Sender<ControllerMessage>,
    metrics: Arc<NodeMetrics>,
    entries: HashMap<String, StatsEntry>,
    next_generation: u64,
}

impl StatsScheduler {
    #[must_use]
    pub fn new(
        config: &Config,
        sink: Arc<dyn StatsSink>,
        controller: mpsc::Sender<ControllerMessage>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            max_subscriptions: config.stats_max_subscriptions,
            max_timeout: config.stats_max_timeout(),
            min_interval: config.stats_min_interval(),
            sink,
            controller,
            metrics,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Start or renew the subscription for a stream. The requested
    /// timeout is capped and the interval floored before scheduling.
    pub fn subscribe(
        &mut self,
        stream_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> SubscriptionOutcome {
        if self.max_subscriptions == 0 {
            debug!(
                target: "mn.stats",
                stream_id,
                "Stats subscriptions disabled"
            );
            return SubscriptionOutcome::Disabled;
        }

        let timeout = timeout.min(self.max_timeout);
        let interval = interval.max(self.min_interval);

        let renewal = self.entries.contains_key(stream_id);
        if !renewal && self.entries.len() >= self.max_subscriptions {
            debug!(
                target: "mn.stats",
                stream_id,
                active = self.entries.len(),
                "Stats subscription quota exhausted"
            );
            return SubscriptionOutcome::QuotaExhausted;
        }

        if let Some(previous) = self.entries.remove(stream_id) {
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(
            stream_id.to_string(),
            StatsEntry {
                token: token.clone(),
                generation,
            },
        );

        debug!(
            target: "mn.stats",
            stream_id,
            timeout_secs = timeout.as_secs(),
            interval_secs = interval.as_secs(),
            renewal,
            "Scheduling stats subscription"
        );

        tokio::spawn(
            CollectionTask {
                stream_id: stream_id.to_string(),
                timeout,
                interval,
                token,
                generation,
                controller: self.controller.clone(),
                sink: Arc::clone(&self.sink),
                metrics: Arc::clone(&self.metrics),
            }
            .run(),
        );

        if renewal {
            SubscriptionOutcome::Renewed
        } else {
            SubscriptionOutcome::Scheduled
        }
    }

    /// Drop the entry for a subscription whose task ended. A stale
    /// generation means the subscription was renewed in the meantime and
    /// the entry stays.
    pub fn finished(&mut self, stream_id: &str, generation: u64) {
        if self
            .entries
            .get(stream_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.entries.remove(stream_id);
        }
    }

    /// Cancel every collection task.
    pub fn shutdown(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.token.cancel();
        }
    }
}

/// One subscription's collection loop.
struct CollectionTask {
    stream_id: String,
    timeout: Duration,
    interval: Duration,
    token: CancellationToken,
    generation: u64,
    controller: mpsc::Sender<ControllerMessage>,
    sink: Arc<dyn StatsSink>,
    metrics: Arc<NodeMetrics>,
}

impl CollectionTask {
    async fn run(self) {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    debug!(
                        target: "mn.stats",
                        stream_id = %self.stream_id,
                        "Stats subscription superseded"
                    );
                    return;
                }

                () = &mut deadline => {
                    debug!(
                        target: "mn.stats",
                        stream_id = %self.stream_id,
                        "Stats subscription reached its timeout"
                    );
                    break;
                }

                _ = ticker.tick() => {
                    if !self.collect_once().await {
                        break;
                    }
                }
            }
        }

        let _ = self
            .controller
            .send(ControllerMessage::StatsSubscriptionExpired {
                stream_id: self.stream_id.clone(),
                generation: self.generation,
            })
            .await;
    }

    /// One collection tick. Returns false when the subscription should
    /// end.
    async fn collect_once(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let request = ControllerMessage::GetStreamStats {
            stream_id: self.stream_id.clone(),
            respond_to: tx,
        };
        if self.controller.send(request).await.is_err() {
            return false;
        }

        match rx.await {
            Ok(Ok(report)) => {
                self.metrics.record_stats_report();
                self.sink.publish(report).await;
                true
            }
            Ok(Err(MediaNodeError::PublisherNotFound(_))) => {
                debug!(
                    target: "mn.stats",
                    stream_id = %self.stream_id,
                    "Stream gone, ending stats subscription"
                );
                false
            }
            Ok(Err(error)) => {
                warn!(
                    target: "mn.stats",
                    stream_id = %self.stream_id,
                    %error,
                    "Stats collection failed"
                );
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use chrono::Utc;

    use signaling_protocol::mock::CollectingStatsSink;
    use signaling_protocol::StreamStatsReport;

    fn test_config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_vars(&vars).unwrap()
    }

    fn canned_report(stream_id: &str) -> StreamStatsReport {
        StreamStatsReport {
            stream_id: stream_id.to_string(),
            publisher: serde_json::json!({ "bitrate": 300 }),
            subscribers: HashMap::new(),
            collected_at: Utc::now(),
        }
    }

    /// Answers stats requests like the controller actor would and
    /// forwards expiry notices to the test.
    fn fake_controller(
        missing: bool,
    ) -> (
        mpsc::Sender<ControllerMessage>,
        mpsc::Receiver<(String, u64)>,
    ) {
        let (tx, mut rx) = mpsc::channel::<ControllerMessage>(32);
        let (expired_tx, expired_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ControllerMessage::GetStreamStats {
                        stream_id,
                        respond_to,
                    } => {
                        let response = if missing {
                            Err(MediaNodeError::PublisherNotFound(stream_id))
                        } else {
                            Ok(canned_report(&stream_id))
                        };
                        let _ = respond_to.send(response);
                    }
                    ControllerMessage::StatsSubscriptionExpired {
                        stream_id,
                        generation,
                    } => {
                        let _ = expired_tx.send((stream_id, generation)).await;
                    }
                    _ => {}
                }
            }
        });
        (tx, expired_rx)
    }

    fn scheduler(
        config: &Config,
        sink: &Arc<CollectingStatsSink>,
        controller: mpsc::Sender<ControllerMessage>,
    ) -> StatsScheduler {
        StatsScheduler::new(
            config,
            Arc::clone(sink) as Arc<dyn StatsSink>,
            controller,
            NodeMetrics::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_publishes_until_the_timeout() {
        let config = test_config(&[]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, mut expired) = fake_controller(false);
        let mut stats = scheduler(&config, &sink, controller);

        let outcome = stats.subscribe(
            "stream-1",
            Duration::from_millis(3500),
            Duration::from_secs(1),
        );
        assert_eq!(outcome, SubscriptionOutcome::Scheduled);
        assert_eq!(stats.active_count(), 1);

        let (stream_id, generation) = expired.recv().await.unwrap();
        assert_eq!(stream_id, "stream-1");

        let reports = sink.reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.stream_id == "stream-1"));

        stats.finished(&stream_id, generation);
        assert_eq!(stats.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_limits_are_clamped() {
        let config = test_config(&[
            ("MN_STATS_MAX_TIMEOUT_SECONDS", "5"),
            ("MN_STATS_MIN_INTERVAL_SECONDS", "2"),
        ]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, mut expired) = fake_controller(false);
        let mut stats = scheduler(&config, &sink, controller);

        stats.subscribe(
            "stream-1",
            Duration::from_secs(30),
            Duration::from_millis(100),
        );

        let _ = expired.recv().await.unwrap();
        // Effective timeout 5s with a 2s interval: ticks at 2s and 4s.
        assert_eq!(sink.reports().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_replaces_the_collection_task() {
        let config = test_config(&[]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, mut expired) = fake_controller(false);
        let mut stats = scheduler(&config, &sink, controller);

        stats.subscribe(
            "stream-1",
            Duration::from_millis(2500),
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(sink.reports().len(), 1);

        let outcome = stats.subscribe(
            "stream-1",
            Duration::from_millis(2500),
            Duration::from_secs(1),
        );
        assert_eq!(outcome, SubscriptionOutcome::Renewed);
        assert_eq!(stats.active_count(), 1);

        // Only the renewed task reports expiry; the superseded one went
        // quietly.
        let (stream_id, generation) = expired.recv().await.unwrap();
        stats.finished(&stream_id, generation);
        assert_eq!(stats.active_count(), 0);
        assert!(expired.try_recv().is_err());

        // One report before renewal, two after.
        assert_eq!(sink.reports().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_rejects_new_streams_but_not_renewals() {
        let config = test_config(&[("MN_STATS_MAX_SUBSCRIPTIONS", "2")]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, _expired) = fake_controller(false);
        let mut stats = scheduler(&config, &sink, controller);

        let timeout = Duration::from_secs(30);
        let interval = Duration::from_secs(1);
        assert_eq!(
            stats.subscribe("stream-1", timeout, interval),
            SubscriptionOutcome::Scheduled
        );
        assert_eq!(
            stats.subscribe("stream-2", timeout, interval),
            SubscriptionOutcome::Scheduled
        );
        assert_eq!(
            stats.subscribe("stream-3", timeout, interval),
            SubscriptionOutcome::QuotaExhausted
        );
        assert_eq!(
            stats.subscribe("stream-1", timeout, interval),
            SubscriptionOutcome::Renewed
        );
        assert_eq!(stats.active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_quota_disables_subscriptions() {
        let config = test_config(&[("MN_STATS_MAX_SUBSCRIPTIONS", "0")]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, _expired) = fake_controller(false);
        let mut stats = scheduler(&config, &sink, controller);

        assert_eq!(
            stats.subscribe("stream-1", Duration::from_secs(5), Duration::from_secs(1)),
            SubscriptionOutcome::Disabled
        );
        assert_eq!(stats.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sink.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_the_stream_ends_the_subscription_early() {
        let config = test_config(&[]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, mut expired) = fake_controller(true);
        let mut stats = scheduler(&config, &sink, controller);

        stats.subscribe("stream-1", Duration::from_secs(30), Duration::from_secs(1));

        let (stream_id, generation) = expired.recv().await.unwrap();
        assert_eq!(stream_id, "stream-1");
        assert!(sink.reports().is_empty());

        stats.finished(&stream_id, generation);
        assert_eq!(stats.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_does_not_remove_a_renewed_entry() {
        let config = test_config(&[]);
        let sink = Arc::new(CollectingStatsSink::new());
        let (controller, _expired) = fake_controller(false);
        let mut stats = scheduler(&config, &sink, controller);

        stats.subscribe("stream-1", Duration::from_secs(30), Duration::from_secs(1));
        let first_generation = stats.entries.get("stream-1").unwrap().generation;

        stats.subscribe("stream-1", Duration::from_secs(30), Duration::from_secs(1));

        stats.finished("stream-1", first_generation);
        assert_eq!(stats.active_count(), 1);

        let current = stats.entries.get("stream-1").unwrap().generation;
        stats.finished("stream-1", current);
        assert_eq!(stats.active_count(), 0);
    }
}
