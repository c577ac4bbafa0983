//! The RPC seam between the signaling tier and a media node.
//!
//! [`MediaNodeControl`] is implemented directly by the media-node
//! controller handle for in-process deployments and by transport clients
//! for remote ones. Operations with asynchronous negotiation phases take
//! an `updates` channel and report progress as [`NegotiationEvent`]s; the
//! returned `Result` only covers failures known before negotiation
//! starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::{NegotiationEvent, NegotiationMessage, StreamStatsReport, UnreachableScope};
use crate::options::{ExternalOutputOptions, PublishOptions, SubscribeOptions};

/// Errors surfaced synchronously by control operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ControlError {
    /// The referenced stream has no publisher on this node.
    #[error("no publisher for stream {0}")]
    StreamNotFound(String),

    /// A create operation collided with an existing record.
    #[error("stream {0} already has a publisher")]
    Conflict(String),

    /// The RPC transport timed out before the media tier answered.
    #[error("media tier unreachable ({scope:?})")]
    Unreachable { scope: UnreachableScope },

    /// The media node is shutting down or its mailbox is gone.
    #[error("media node control channel closed")]
    ChannelClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Target of a `process_signaling` call: one stream, or every stream of
/// a multiplexed subscription batch sharing a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamAddress {
    Single(String),
    Batch(Vec<String>),
}

impl StreamAddress {
    /// The stream ids in addressing order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        match self {
            StreamAddress::Single(id) => std::slice::from_ref(id),
            StreamAddress::Batch(ids) => ids,
        }
    }
}

/// Control operations a media node exposes to the signaling tier.
#[async_trait::async_trait]
pub trait MediaNodeControl: Send + Sync {
    /// Create a publisher fed by a transport connection. Negotiation
    /// progress arrives on `updates`.
    async fn add_publisher(
        &self,
        client_id: &str,
        stream_id: &str,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError>;

    /// Create a publisher fed by a URL-addressed external input.
    async fn add_external_input(
        &self,
        client_id: &str,
        stream_id: &str,
        url: &str,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError>;

    /// Attach an external output (recorder) to a publisher's fan-out.
    async fn add_external_output(
        &self,
        stream_id: &str,
        url: &str,
        options: ExternalOutputOptions,
    ) -> Result<(), ControlError>;

    /// Detach and close an external output. Success on miss.
    async fn remove_external_output(&self, stream_id: &str, url: &str)
        -> Result<(), ControlError>;

    /// Subscribe `client_id` to a published stream.
    async fn add_subscriber(
        &self,
        client_id: &str,
        stream_id: &str,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError>;

    /// Subscribe `client_id` to several streams on one shared connection,
    /// answering with a single combined offer.
    async fn add_multiple_subscribers(
        &self,
        client_id: &str,
        stream_ids: &[String],
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError>;

    /// Remove several subscriptions of `client_id`, emitting one
    /// renegotiated offer reflecting the removals.
    async fn remove_multiple_subscribers(
        &self,
        client_id: &str,
        stream_ids: &[String],
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError>;

    /// Tear down a publisher, its subscribers, and its external outputs.
    /// Resolves after the fan-out point has closed.
    async fn remove_publisher(&self, client_id: &str, stream_id: &str) -> Result<(), ControlError>;

    /// Remove one subscription. Success on miss.
    async fn remove_subscriber(&self, client_id: &str, stream_id: &str)
        -> Result<(), ControlError>;

    /// Remove every subscription owned by `client_id` across all
    /// publishers. Used on client disconnect.
    async fn remove_subscriptions(&self, client_id: &str) -> Result<(), ControlError>;

    /// Route an in-negotiation message to the addressed record.
    async fn process_signaling(
        &self,
        client_id: &str,
        address: StreamAddress,
        message: NegotiationMessage,
    ) -> Result<(), ControlError>;

    /// Collect current stats for a stream and all its subscribers.
    async fn get_stream_stats(&self, stream_id: &str) -> Result<StreamStatsReport, ControlError>;

    /// Start periodic stats collection for a stream, clamped by the
    /// node's quota configuration.
    async fn subscribe_to_stats(
        &self,
        stream_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), ControlError>;
}

/// Destination for periodic stats reports produced by stats
/// subscriptions. Transport bindings broadcast these to interested
/// observers; tests collect them.
#[async_trait::async_trait]
pub trait StatsSink: Send + Sync {
    async fn publish(&self, report: StreamStatsReport);
}

/// Mock implementations for tests on both sides of the seam.
pub mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// One recorded control call, for assertions on call order and
    /// arguments.
    #[derive(Debug, Clone, PartialEq)]
    pub enum ControlCall {
        AddPublisher { client_id: String, stream_id: String },
        AddExternalInput { client_id: String, stream_id: String, url: String },
        AddExternalOutput { stream_id: String, url: String },
        RemoveExternalOutput { stream_id: String, url: String },
        AddSubscriber { client_id: String, stream_id: String },
        AddMultipleSubscribers { client_id: String, stream_ids: Vec<String> },
        RemoveMultipleSubscribers { client_id: String, stream_ids: Vec<String> },
        RemovePublisher { client_id: String, stream_id: String },
        RemoveSubscriber { client_id: String, stream_id: String },
        RemoveSubscriptions { client_id: String },
        ProcessSignaling { client_id: String, address: StreamAddress },
        GetStreamStats { stream_id: String },
        SubscribeToStats { stream_id: String },
    }

    /// Mock media node for signaling-tier tests. Records every call,
    /// captures the update senders so tests can drive negotiation
    /// events, and optionally fails every operation.
    #[derive(Default)]
    pub struct MockMediaNodeControl {
        calls: Mutex<Vec<ControlCall>>,
        call_count: AtomicUsize,
        fail_all: bool,
        publish_updates: Mutex<HashMap<String, mpsc::Sender<NegotiationEvent>>>,
        subscribe_updates: Mutex<HashMap<(String, String), mpsc::Sender<NegotiationEvent>>>,
        batch_updates: Mutex<HashMap<String, mpsc::Sender<NegotiationEvent>>>,
        stream_stats: Mutex<HashMap<String, StreamStatsReport>>,
    }

    impl MockMediaNodeControl {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A mock whose every operation fails with `ChannelClosed`.
        #[must_use]
        pub fn failing() -> Self {
            Self {
                fail_all: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<ControlCall> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// The update sender captured by the last publish (or external
        /// input) call for `stream_id`.
        pub fn publish_sender(&self, stream_id: &str) -> Option<mpsc::Sender<NegotiationEvent>> {
            self.publish_updates
                .lock()
                .ok()
                .and_then(|m| m.get(stream_id).cloned())
        }

        /// The update sender captured by the last subscribe call for
        /// `(client_id, stream_id)`.
        pub fn subscribe_sender(
            &self,
            client_id: &str,
            stream_id: &str,
        ) -> Option<mpsc::Sender<NegotiationEvent>> {
            self.subscribe_updates
                .lock()
                .ok()
                .and_then(|m| m.get(&(client_id.to_string(), stream_id.to_string())).cloned())
        }

        /// The update sender captured by the last batch call for
        /// `client_id`.
        pub fn batch_sender(&self, client_id: &str) -> Option<mpsc::Sender<NegotiationEvent>> {
            self.batch_updates
                .lock()
                .ok()
                .and_then(|m| m.get(client_id).cloned())
        }

        /// Script the report returned by `get_stream_stats`.
        pub fn set_stream_stats(&self, stream_id: &str, report: StreamStatsReport) {
            if let Ok(mut stats) = self.stream_stats.lock() {
                stats.insert(stream_id.to_string(), report);
            }
        }

        fn record(&self, call: ControlCall) -> Result<(), ControlError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
            if self.fail_all {
                return Err(ControlError::ChannelClosed);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MediaNodeControl for MockMediaNodeControl {
        async fn add_publisher(
            &self,
            client_id: &str,
            stream_id: &str,
            _options: PublishOptions,
            updates: mpsc::Sender<NegotiationEvent>,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::AddPublisher {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
            })?;
            if let Ok(mut senders) = self.publish_updates.lock() {
                senders.insert(stream_id.to_string(), updates);
            }
            Ok(())
        }

        async fn add_external_input(
            &self,
            client_id: &str,
            stream_id: &str,
            url: &str,
            _options: PublishOptions,
            updates: mpsc::Sender<NegotiationEvent>,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::AddExternalInput {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                url: url.to_string(),
            })?;
            if let Ok(mut senders) = self.publish_updates.lock() {
                senders.insert(stream_id.to_string(), updates);
            }
            Ok(())
        }

        async fn add_external_output(
            &self,
            stream_id: &str,
            url: &str,
            _options: ExternalOutputOptions,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::AddExternalOutput {
                stream_id: stream_id.to_string(),
                url: url.to_string(),
            })
        }

        async fn remove_external_output(
            &self,
            stream_id: &str,
            url: &str,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::RemoveExternalOutput {
                stream_id: stream_id.to_string(),
                url: url.to_string(),
            })
        }

        async fn add_subscriber(
            &self,
            client_id: &str,
            stream_id: &str,
            _options: SubscribeOptions,
            updates: mpsc::Sender<NegotiationEvent>,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::AddSubscriber {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
            })?;
            if let Ok(mut senders) = self.subscribe_updates.lock() {
                senders.insert((client_id.to_string(), stream_id.to_string()), updates);
            }
            Ok(())
        }

        async fn add_multiple_subscribers(
            &self,
            client_id: &str,
            stream_ids: &[String],
            _options: SubscribeOptions,
            updates: mpsc::Sender<NegotiationEvent>,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::AddMultipleSubscribers {
                client_id: client_id.to_string(),
                stream_ids: stream_ids.to_vec(),
            })?;
            if let Ok(mut senders) = self.batch_updates.lock() {
                senders.insert(client_id.to_string(), updates);
            }
            Ok(())
        }

        async fn remove_multiple_subscribers(
            &self,
            client_id: &str,
            stream_ids: &[String],
            updates: mpsc::Sender<NegotiationEvent>,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::RemoveMultipleSubscribers {
                client_id: client_id.to_string(),
                stream_ids: stream_ids.to_vec(),
            })?;
            if let Ok(mut senders) = self.batch_updates.lock() {
                senders.insert(client_id.to_string(), updates);
            }
            Ok(())
        }

        async fn remove_publisher(
            &self,
            client_id: &str,
            stream_id: &str,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::RemovePublisher {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
            })
        }

        async fn remove_subscriber(
            &self,
            client_id: &str,
            stream_id: &str,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::RemoveSubscriber {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
            })
        }

        async fn remove_subscriptions(&self, client_id: &str) -> Result<(), ControlError> {
            self.record(ControlCall::RemoveSubscriptions {
                client_id: client_id.to_string(),
            })
        }

        async fn process_signaling(
            &self,
            client_id: &str,
            address: StreamAddress,
            _message: NegotiationMessage,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::ProcessSignaling {
                client_id: client_id.to_string(),
                address,
            })
        }

        async fn get_stream_stats(
            &self,
            stream_id: &str,
        ) -> Result<StreamStatsReport, ControlError> {
            self.record(ControlCall::GetStreamStats {
                stream_id: stream_id.to_string(),
            })?;
            self.stream_stats
                .lock()
                .ok()
                .and_then(|stats| stats.get(stream_id).cloned())
                .ok_or_else(|| ControlError::StreamNotFound(stream_id.to_string()))
        }

        async fn subscribe_to_stats(
            &self,
            stream_id: &str,
            _timeout: Duration,
            _interval: Duration,
        ) -> Result<(), ControlError> {
            self.record(ControlCall::SubscribeToStats {
                stream_id: stream_id.to_string(),
            })
        }
    }

    /// Stats sink collecting every published report.
    #[derive(Default)]
    pub struct CollectingStatsSink {
        reports: Mutex<Vec<StreamStatsReport>>,
    }

    impl CollectingStatsSink {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reports(&self) -> Vec<StreamStatsReport> {
            self.reports.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl StatsSink for CollectingStatsSink {
        async fn publish(&self, report: StreamStatsReport) {
            if let Ok(mut reports) = self.reports.lock() {
                reports.push(report);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::mock::{ControlCall, MockMediaNodeControl};
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls_and_captures_update_senders() {
        let control = MockMediaNodeControl::new();
        let (tx, mut rx) = mpsc::channel(8);

        control
            .add_publisher("client-1", "stream-1", PublishOptions::default(), tx)
            .await
            .unwrap();

        assert_eq!(control.call_count(), 1);
        assert_eq!(
            control.calls(),
            vec![ControlCall::AddPublisher {
                client_id: "client-1".to_string(),
                stream_id: "stream-1".to_string(),
            }]
        );

        let sender = control.publish_sender("stream-1").unwrap();
        sender.send(NegotiationEvent::Ready).await.unwrap();
        assert_eq!(rx.recv().await, Some(NegotiationEvent::Ready));
    }

    #[tokio::test]
    async fn test_failing_mock_rejects_every_operation() {
        let control = MockMediaNodeControl::failing();

        let result = control.remove_subscriptions("client-1").await;
        assert_eq!(result, Err(ControlError::ChannelClosed));
    }

    #[test]
    fn test_stream_address_exposes_ids_uniformly() {
        let single = StreamAddress::Single("a".to_string());
        assert_eq!(single.ids(), ["a".to_string()]);

        let batch = StreamAddress::Batch(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(batch.ids().len(), 2);
    }
}
