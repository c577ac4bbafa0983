//! Negotiation messages and events exchanged across the RPC seam.
//!
//! Inbound messages ([`NegotiationMessage`]) travel browser → signaling →
//! media node and carry remote SDP and ICE state. Outbound events
//! ([`NegotiationEvent`]) travel media node → signaling and report the
//! progress of a publish or subscribe negotiation. Both are closed enums:
//! every result a media node can produce has a named variant with typed
//! payload fields.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An in-negotiation message from the remote peer, routed by
/// `process_signaling` to the owning publisher or subscriber record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NegotiationMessage {
    /// A remote SDP offer; the media node will answer.
    Offer { sdp: String },
    /// A remote SDP answer to a locally generated offer.
    Answer { sdp: String },
    /// A trickled remote ICE candidate.
    Candidate { candidate: IceCandidate },
}

/// One ICE candidate in the shape browsers produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
    pub candidate: String,
}

/// Whether an emitted session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Marks a combined offer as belonging to an automatic subscription or
/// unsubscription batch, so the client can distinguish it from offers it
/// requested itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchContext {
    AutoStreamsSubscription,
    AutoStreamsUnsubscription,
}

/// Which tier failed to respond when an RPC timed out. The signaling tier
/// picks a different user-facing message per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnreachableScope {
    /// The media node itself did not answer.
    MediaNode,
    /// The node agent supervising media nodes did not answer.
    NodeAgent,
    /// The timeout could not be attributed to either tier.
    Undetermined,
}

/// Why a negotiation operation was rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorReason {
    /// A batch subscribe/unsubscribe resolved to zero usable publishers.
    NoMatchingStreams,
    /// The engine rejected the media stream or connection setup.
    InitializationFailed,
}

/// Progress events for a publish or subscribe negotiation, delivered on
/// the reply channel passed to the controller operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NegotiationEvent {
    /// The record was created and negotiation is starting.
    Initializing { connection_id: String },
    /// A batch of subscriber records was created on one shared
    /// connection; a single combined offer will follow.
    #[serde(rename = "multiple-initializing")]
    MultipleInitializing {
        stream_ids: Vec<String>,
        context: BatchContext,
    },
    /// The transport session reported its initial state.
    Started,
    /// A local session description to forward to the remote peer.
    Sdp {
        kind: SdpKind,
        description: String,
        /// Strictly increasing per connection; consumers drop stale
        /// descriptions with a lower version.
        session_version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_ids: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<BatchContext>,
    },
    /// A local ICE candidate to trickle to the remote peer.
    Candidate { candidate: IceCandidate },
    /// The connection reached the established state.
    Ready,
    /// The connection failed ICE or DTLS negotiation.
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// The engine detected the subscriber's bandwidth dropping below the
    /// minimum configured for the stream.
    BandwidthAlert { message: String, bandwidth: u64 },
    /// The operation was rejected before any negotiation began.
    Error { reason: ErrorReason },
    /// The RPC transport timed out contacting the media tier.
    Unreachable { scope: UnreachableScope },
}

/// Stats for one published stream: the publisher's own stats plus one
/// entry per subscriber, keyed by subscriber client id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatsReport {
    pub stream_id: String,
    pub publisher: serde_json::Value,
    pub subscribers: HashMap<String, serde_json::Value>,
    pub collected_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_message_matches_browser_shape() {
        let json = r#"{
            "type": "candidate",
            "candidate": {
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "candidate": "candidate:1 1 UDP 2122252543 192.168.1.7 50923 typ host"
            }
        }"#;

        let msg: NegotiationMessage = serde_json::from_str(json).unwrap();
        match msg {
            NegotiationMessage::Candidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_sdp_event_serializes_with_type_tag() {
        let event = NegotiationEvent::Sdp {
            kind: SdpKind::Answer,
            description: "v=0...".to_string(),
            session_version: 3,
            stream_ids: None,
            context: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "sdp");
        assert_eq!(value["kind"], "answer");
        assert_eq!(value["sessionVersion"], 3);
        assert!(value.get("streamIds").is_none());
    }

    #[test]
    fn test_batch_context_uses_kebab_case_markers() {
        let value = serde_json::to_value(BatchContext::AutoStreamsSubscription).unwrap();
        assert_eq!(value, "auto-streams-subscription");
    }
}
