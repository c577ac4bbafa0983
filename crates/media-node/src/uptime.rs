//! Uptime watchdog.
//!
//! Long-lived media nodes are recycled rather than patched in place.
//! The watchdog requests node shutdown once the node is both old
//! (absolute uptime past its ceiling) and idle (no registry-changing
//! operation within the idle ceiling). Requiring both keeps an old but
//! busy node serving and lets a young idle node live out its lease.
//!
//! Monitoring starts lazily with the first recorded operation, so a
//! node that never hosted a stream is left to its supervisor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::lifecycle::{NodeLifecycle, ShutdownReason};

/// Watches the node's age and idle time against configured ceilings.
pub struct UptimeWatchdog {
    active_uptime_limit: Duration,
    max_idle: Duration,
    check_interval: Duration,
    lifecycle: NodeLifecycle,
    last_operation: Arc<Mutex<Instant>>,
    monitor_started: bool,
}

impl UptimeWatchdog {
    #[must_use]
    pub fn new(config: &Config, lifecycle: NodeLifecycle) -> Self {
        Self {
            active_uptime_limit: config.active_uptime_limit(),
            max_idle: config.max_time_since_last_operation(),
            check_interval: config.check_uptime_interval(),
            lifecycle,
            last_operation: Arc::new(Mutex::new(Instant::now())),
            monitor_started: false,
        }
    }

    /// Mark a registry-changing operation, starting the monitor on the
    /// first call.
    pub fn record_operation(&mut self) {
        let now = Instant::now();
        match self.last_operation.lock() {
            Ok(mut last) => *last = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }

        if !self.monitor_started {
            self.monitor_started = true;
            self.start_monitor(now);
        }
    }

    fn start_monitor(&self, started_at: Instant) {
        debug!(
            target: "mn.uptime",
            uptime_limit_secs = self.active_uptime_limit.as_secs(),
            idle_limit_secs = self.max_idle.as_secs(),
            check_interval_secs = self.check_interval.as_secs(),
            "Starting uptime monitor"
        );

        let active_uptime_limit = self.active_uptime_limit;
        let max_idle = self.max_idle;
        let check_interval = self.check_interval;
        let last_operation = Arc::clone(&self.last_operation);
        let lifecycle = self.lifecycle.clone();
        let cancel = lifecycle.child_token();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(started_at + check_interval, check_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,

                    _ = ticker.tick() => {
                        let last = match last_operation.lock() {
                            Ok(last) => *last,
                            Err(poisoned) => *poisoned.into_inner(),
                        };
                        let now = Instant::now();
                        let uptime = now.duration_since(started_at);
                        let idle = now.duration_since(last);

                        if uptime > active_uptime_limit && idle > max_idle {
                            warn!(
                                target: "mn.uptime",
                                uptime_secs = uptime.as_secs(),
                                idle_secs = idle.as_secs(),
                                "Uptime and idle ceilings exceeded, requesting shutdown"
                            );
                            lifecycle.request_shutdown(ShutdownReason::WatchdogExpired);
                            return;
                        }
                    }
                }
            }
        });
    }
}
