//! Node-wide lifecycle handle.
//!
//! The controller, its connection actors, and the background tasks all
//! derive their cancellation tokens from one root. Termination requests
//! (watchdog expiry, last publisher removed) cancel the root; the
//! embedding process awaits [`NodeLifecycle::terminated`] and exits.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Why the node asked to be shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Both watchdog ceilings were exceeded.
    WatchdogExpired,
    /// The last publisher was removed and the node is idle.
    PublishersDrained,
}

/// Clonable handle over the node's root cancellation token.
#[derive(Clone)]
pub struct NodeLifecycle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// A child token cancelled when the node terminates.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Request node termination. The first reason wins; later requests
    /// are no-ops.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let recorded = {
            let mut slot = match self.reason.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        if recorded {
            info!(target: "mn.lifecycle", reason = ?reason, "Node shutdown requested");
            self.token.cancel();
        }
    }

    /// Resolves once termination was requested.
    pub async fn terminated(&self) {
        self.token.cancelled().await;
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        match self.reason.lock() {
            Ok(slot) => *slot,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
