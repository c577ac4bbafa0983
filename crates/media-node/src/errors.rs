//! Error types for the media-node control plane.

use thiserror::Error;

use signaling_protocol::ControlError;

use crate::engine::EngineError;

/// Errors produced by controller and connection operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaNodeError {
    /// No publisher registered for the stream.
    #[error("no publisher for stream {0}")]
    PublisherNotFound(String),

    /// No subscriber record for the (stream, client) pair.
    #[error("no subscriber {client_id} for stream {stream_id}")]
    SubscriberNotFound {
        stream_id: String,
        client_id: String,
    },

    /// No client session for the client id.
    #[error("no client session for {0}")]
    ClientNotFound(String),

    /// A publisher already exists for the stream.
    #[error("stream {0} already has a publisher")]
    PublisherExists(String),

    /// An external output with this URL is already attached.
    #[error("output {url} already attached to stream {stream_id}")]
    OutputExists { stream_id: String, url: String },

    /// The engine reported a negotiation failure.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A removed stream kept appearing in the local description after
    /// every retry.
    #[error("renegotiation raced with removal of {label} on connection {connection_id}")]
    RenegotiationRace {
        connection_id: String,
        label: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An internal mailbox or reply channel was dropped.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The node is draining after a termination request.
    #[error("media node is shutting down")]
    ShuttingDown,
}

impl MediaNodeError {
    /// Stable numeric code for logs and wire mappings.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            MediaNodeError::PublisherNotFound(_)
            | MediaNodeError::SubscriberNotFound { .. }
            | MediaNodeError::ClientNotFound(_) => 404,
            MediaNodeError::PublisherExists(_) | MediaNodeError::OutputExists { .. } => 409,
            MediaNodeError::NegotiationFailed(_) => 502,
            MediaNodeError::RenegotiationRace { .. }
            | MediaNodeError::ChannelClosed(_)
            | MediaNodeError::ShuttingDown => 503,
            MediaNodeError::Engine(_) => 500,
        }
    }

    /// Message safe to surface to end users. Engine and channel details
    /// stay in the logs.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            MediaNodeError::PublisherNotFound(_) => "stream not found",
            MediaNodeError::SubscriberNotFound { .. } => "subscription not found",
            MediaNodeError::ClientNotFound(_) => "client not found",
            MediaNodeError::PublisherExists(_) => "stream is already published",
            MediaNodeError::OutputExists { .. } => "output is already attached",
            MediaNodeError::NegotiationFailed(_) => "media negotiation failed",
            MediaNodeError::RenegotiationRace { .. } => "renegotiation failed, please retry",
            MediaNodeError::Engine(_)
            | MediaNodeError::ChannelClosed(_)
            | MediaNodeError::ShuttingDown => "media node unavailable",
        }
    }
}

impl From<MediaNodeError> for ControlError {
    fn from(err: MediaNodeError) -> Self {
        match err {
            MediaNodeError::PublisherNotFound(stream_id)
            | MediaNodeError::ClientNotFound(stream_id) => {
                ControlError::StreamNotFound(stream_id)
            }
            MediaNodeError::SubscriberNotFound { stream_id, .. } => {
                ControlError::StreamNotFound(stream_id)
            }
            MediaNodeError::PublisherExists(stream_id) => ControlError::Conflict(stream_id),
            MediaNodeError::OutputExists { stream_id, .. } => ControlError::Conflict(stream_id),
            MediaNodeError::ChannelClosed(_) | MediaNodeError::ShuttingDown => {
                ControlError::ChannelClosed
            }
            other => ControlError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_group_by_failure_class() {
        assert_eq!(
            MediaNodeError::PublisherNotFound("s1".to_string()).error_code(),
            404
        );
        assert_eq!(
            MediaNodeError::PublisherExists("s1".to_string()).error_code(),
            409
        );
        assert_eq!(
            MediaNodeError::NegotiationFailed("dtls".to_string()).error_code(),
            502
        );
        assert_eq!(MediaNodeError::ShuttingDown.error_code(), 503);
    }

    #[test]
    fn test_client_messages_do_not_leak_internals() {
        let err = MediaNodeError::Engine(EngineError::Rejected(
            "srtp key derivation failed at offset 12".to_string(),
        ));
        assert_eq!(err.client_message(), "media node unavailable");

        let err = MediaNodeError::ChannelClosed("controller mailbox".to_string());
        assert_eq!(err.client_message(), "media node unavailable");
    }

    #[test]
    fn test_control_error_conversion_keeps_the_taxonomy() {
        let err: ControlError = MediaNodeError::PublisherNotFound("s1".to_string()).into();
        assert_eq!(err, ControlError::StreamNotFound("s1".to_string()));

        let err: ControlError = MediaNodeError::PublisherExists("s1".to_string()).into();
        assert_eq!(err, ControlError::Conflict("s1".to_string()));

        let err: ControlError = MediaNodeError::ShuttingDown.into();
        assert_eq!(err, ControlError::ChannelClosed);
    }
}
