//! Client notification channel.
//!
//! Sessions push [`ClientNotification`]s through a [`SignalingChannel`].
//! The trait is the seam to the actual transport (websocket, long-poll,
//! in-process for tests); the session never sees transport details.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use signaling_protocol::NegotiationEvent;

use crate::stream::StreamInfo;

/// Whether a failed connection was carrying a publish or a subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionContext {
    Publish,
    Subscribe,
}

/// Messages a session pushes to its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientNotification {
    /// A stream in the room became ready.
    StreamAdded { stream: StreamInfo },
    /// A stream left the room.
    StreamRemoved { stream_id: String },
    /// Negotiation progress for streams this client publishes or
    /// subscribes to. Batched offers carry every stream in the batch.
    NegotiationUpdate {
        stream_ids: Vec<String>,
        event: NegotiationEvent,
    },
    /// A connection failed past the point of negotiation retries. The
    /// client is expected to tear down and reconnect.
    ConnectionFailed {
        context: ConnectionContext,
        stream_ids: Vec<String>,
        message: String,
    },
    /// A data-channel payload relayed from a publisher.
    Data { stream_id: String, payload: Value },
    /// A publisher replaced its stream attributes.
    AttributeUpdate { stream_id: String, attributes: Value },
    /// The media node flagged a bandwidth problem on a subscription.
    BandwidthAlert {
        stream_id: String,
        message: String,
        bandwidth: u64,
    },
}

/// Transport seam between a session and its client.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver a notification. Delivery is best-effort; a dead transport
    /// must not fail the session operation that produced the message.
    async fn notify(&self, notification: ClientNotification);

    /// Tell the transport the session is gone.
    async fn disconnect(&self);
}

pub mod mock {
    //! In-process channel for tests.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ClientNotification, SignalingChannel};

    /// Records every notification and exposes them both as a log and as
    /// an mpsc stream tests can await on.
    pub struct MockChannel {
        sender: mpsc::UnboundedSender<ClientNotification>,
        log: Mutex<Vec<ClientNotification>>,
        disconnected: AtomicBool,
    }

    impl MockChannel {
        #[must_use]
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientNotification>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let channel = Arc::new(Self {
                sender,
                log: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            });
            (channel, receiver)
        }

        #[must_use]
        pub fn notifications(&self) -> Vec<ClientNotification> {
            match self.log.lock() {
                Ok(log) => log.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }

        #[must_use]
        pub fn is_disconnected(&self) -> bool {
            self.disconnected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SignalingChannel for MockChannel {
        async fn notify(&self, notification: ClientNotification) {
            match self.log.lock() {
                Ok(mut log) => log.push(notification.clone()),
                Err(poisoned) => poisoned.into_inner().push(notification.clone()),
            }
            // Receiver may be dropped; delivery is best-effort.
            let _ = self.sender.send(notification);
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_notifications_serialize_with_a_type_tag() {
        let notification = ClientNotification::StreamRemoved {
            stream_id: "111111111111111111".to_string(),
        };

        let wire = serde_json::to_value(&notification).unwrap();
        assert_eq!(
            wire,
            json!({ "type": "streamRemoved", "streamId": "111111111111111111" })
        );
    }

    #[test]
    fn test_connection_failed_round_trips() {
        let notification = ClientNotification::ConnectionFailed {
            context: ConnectionContext::Subscribe,
            stream_ids: vec!["1".to_string(), "2".to_string()],
            message: "the media node is not reachable".to_string(),
        };

        let wire = serde_json::to_string(&notification).unwrap();
        let parsed: ClientNotification = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed, notification);
    }

    #[tokio::test]
    async fn test_mock_channel_logs_and_forwards() {
        let (channel, mut receiver) = mock::MockChannel::new();

        channel
            .notify(ClientNotification::Data {
                stream_id: "1".to_string(),
                payload: json!({ "k": "v" }),
            })
            .await;

        assert_eq!(channel.notifications().len(), 1);
        assert!(matches!(
            receiver.recv().await,
            Some(ClientNotification::Data { .. })
        ));

        assert!(!channel.is_disconnected());
        channel.disconnect().await;
        assert!(channel.is_disconnected());
    }
}
