//! Message types for media-node actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply operations carry a `respond_to`
//! oneshot; operations whose engine work outlives the handler carry an
//! optional `completed` oneshot resolved when that work settles.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use signaling_protocol::{
    BatchContext, ExternalOutputOptions, IceCandidate, NegotiationEvent, NegotiationMessage,
    OfferConstraints, PublishOptions, StreamAddress, StreamStatsReport, SubscribeOptions,
};

use crate::engine::MediaStreamConfig;
use crate::errors::MediaNodeError;

/// Completion channel for engine work driven after the handler returns.
pub type CompletionSender = oneshot::Sender<Result<(), MediaNodeError>>;

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Start transport negotiation. The first call wins; later calls
    /// report `false` without re-initializing.
    Init {
        /// Stream the engine should negotiate first.
        first_stream_id: String,
        /// When set, the connection sends the initial offer itself.
        create_offer: Option<OfferConstraints>,
        /// Resolved once the requested offer has been created.
        offer_completed: Option<CompletionSender>,
        /// Response channel: `true` if this call initialized the
        /// connection, `false` if it was already initialized.
        respond_to: oneshot::Sender<Result<bool, MediaNodeError>>,
    },

    /// Add a media stream to the underlying transport session.
    AttachStream {
        stream_id: String,
        config: MediaStreamConfig,
        /// Where negotiation events for this stream are delivered.
        sink: mpsc::Sender<NegotiationEvent>,
        /// Resolved once the engine has added the stream.
        completed: Option<CompletionSender>,
    },

    /// Remove a media stream, wait for the local description to drop its
    /// label, and optionally emit the renegotiated offer.
    DetachStream {
        media_stream_id: String,
        /// Emit an offer reflecting the removal. Batch removals skip the
        /// per-stream emission and send one combined offer afterwards.
        emit_after: bool,
        /// Resolved once the removal has settled (or the label never
        /// cleared and the renegotiation was abandoned).
        completed: Option<CompletionSender>,
    },

    /// Apply a remote offer to the addressed media streams.
    ProcessOffer {
        sdp: String,
        media_stream_ids: Vec<String>,
    },

    /// Apply a remote answer to the addressed media streams.
    ProcessAnswer {
        sdp: String,
        media_stream_ids: Vec<String>,
    },

    /// Feed a remote ICE candidate to the transport.
    AddRemoteCandidate { candidate: IceCandidate },

    /// Register a listener resolved when candidate gathering completes.
    /// The receiver errors out if the connection fails or closes first.
    AwaitGathered {
        respond_to: oneshot::Sender<oneshot::Receiver<()>>,
    },

    /// Render and emit a combined offer for a subscription batch,
    /// stamped with the batch context and its stream ids.
    EmitOffer {
        stream_ids: Vec<String>,
        context: BatchContext,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Collect transport stats for one media stream.
    StreamStats {
        media_stream_id: String,
        respond_to: oneshot::Sender<Result<Value, MediaNodeError>>,
    },

    /// Close the transport session and stop the actor.
    Close { respond_to: oneshot::Sender<()> },
}

/// Messages sent to the `MediaNodeControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Create a publisher fed by a transport connection.
    AddPublisher {
        client_id: String,
        stream_id: String,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Create a publisher fed by a URL-addressed external input.
    AddExternalInput {
        client_id: String,
        stream_id: String,
        url: String,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Attach an external output to a publisher's fan-out.
    AddExternalOutput {
        stream_id: String,
        url: String,
        options: ExternalOutputOptions,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Detach and close an external output. Success on miss.
    RemoveExternalOutput {
        stream_id: String,
        url: String,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Subscribe a client to a published stream.
    AddSubscriber {
        client_id: String,
        stream_id: String,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Subscribe a client to several streams on one shared connection,
    /// answering with a single combined offer.
    AddMultipleSubscribers {
        client_id: String,
        stream_ids: Vec<String>,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Remove several subscriptions of a client, emitting one combined
    /// offer reflecting the removals.
    RemoveMultipleSubscribers {
        client_id: String,
        stream_ids: Vec<String>,
        updates: mpsc::Sender<NegotiationEvent>,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Tear down a publisher, its subscribers, and its external outputs.
    /// Responds after the fan-out point has closed.
    RemovePublisher {
        client_id: String,
        stream_id: String,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Remove one subscription. Success on miss.
    RemoveSubscriber {
        client_id: String,
        stream_id: String,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Remove every subscription owned by a client across all publishers.
    RemoveSubscriptions {
        client_id: String,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Route an in-negotiation message to the addressed record(s).
    ProcessSignaling {
        client_id: String,
        address: StreamAddress,
        message: NegotiationMessage,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Collect current stats for a stream and all its subscribers.
    GetStreamStats {
        stream_id: String,
        respond_to: oneshot::Sender<Result<StreamStatsReport, MediaNodeError>>,
    },

    /// Start or renew a periodic stats subscription for a stream.
    SubscribeToStats {
        stream_id: String,
        timeout: Duration,
        interval: Duration,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    },

    /// Internal: a publisher teardown continuation finished. Triggers the
    /// drained-node shutdown check.
    PublisherTeardownFinished { stream_id: String },

    /// Internal: a stats subscription hit its timeout or lost its stream.
    /// The generation guards against a renewal racing the expiry.
    StatsSubscriptionExpired { stream_id: String, generation: u64 },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_messages_are_debuggable() {
        let (tx, _rx) = oneshot::channel();
        let msg = ConnectionMessage::Close { respond_to: tx };
        assert!(format!("{msg:?}").contains("Close"));
    }

    #[test]
    fn test_controller_messages_carry_their_addressing() {
        let (tx, _rx) = oneshot::channel();
        let msg = ControllerMessage::RemoveSubscriptions {
            client_id: "client-1".to_string(),
            respond_to: tx,
        };
        assert!(matches!(
            msg,
            ControllerMessage::RemoveSubscriptions { ref client_id, .. } if client_id == "client-1"
        ));
    }
}
