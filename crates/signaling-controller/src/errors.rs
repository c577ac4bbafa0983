//! Error types for the signaling tier.

use thiserror::Error;

use signaling_protocol::{ControlError, UnreachableScope};

use crate::permissions::Action;

/// User-facing message for an RPC timeout, picked per failing tier so
/// operators can tell a dead node from a dead agent from the client logs.
#[must_use]
pub fn unreachable_message(scope: UnreachableScope) -> &'static str {
    match scope {
        UnreachableScope::MediaNode => "the media node is not reachable",
        UnreachableScope::NodeAgent => "the node agent is not reachable",
        UnreachableScope::Undetermined => "the node agent or media node is not reachable",
    }
}

/// Errors produced by session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// The session's role does not grant the action, or a conditional
    /// grant forbids one of the requested capabilities.
    #[error("session is not authorized to {action}")]
    Unauthorized { action: Action },

    /// No stream with this id in the room directory.
    #[error("no stream {0} in the room")]
    StreamNotFound(String),

    /// The stream exists but belongs to another session.
    #[error("stream {0} is owned by another session")]
    NotOwner(String),

    /// Recording was requested for a stream without audio or video.
    #[error("stream {0} has no recordable media")]
    NotRecordable(String),

    /// The media tier rejected or failed the operation.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// An internal channel was dropped.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl SignalingError {
    /// Stable numeric code for logs and wire mappings.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SignalingError::Unauthorized { .. } => 403,
            SignalingError::StreamNotFound(_) => 404,
            SignalingError::NotOwner(_) => 403,
            SignalingError::NotRecordable(_) => 422,
            SignalingError::Control(ControlError::StreamNotFound(_)) => 404,
            SignalingError::Control(ControlError::Conflict(_)) => 409,
            SignalingError::Control(_) | SignalingError::ChannelClosed(_) => 503,
        }
    }

    /// Message safe to surface to end users.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            SignalingError::Unauthorized { .. } | SignalingError::NotOwner(_) => "unauthorized",
            SignalingError::StreamNotFound(_) => "stream not found",
            SignalingError::NotRecordable(_) => "stream cannot be recorded",
            SignalingError::Control(ControlError::StreamNotFound(_)) => "stream not found",
            SignalingError::Control(ControlError::Conflict(_)) => "stream is already published",
            SignalingError::Control(ControlError::Unreachable { scope }) => {
                unreachable_message(*scope)
            }
            SignalingError::Control(_) | SignalingError::ChannelClosed(_) => {
                "media tier unavailable"
            }
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
            SignalingError::Unauthorized {
                action: Action::Publish
            }
            .error_code(),
            403
        );
        assert_eq!(
            SignalingError::StreamNotFound("s1".to_string()).error_code(),
            404
        );
        assert_eq!(
            SignalingError::Control(ControlError::Conflict("s1".to_string())).error_code(),
            409
        );
        assert_eq!(
            SignalingError::Control(ControlError::ChannelClosed).error_code(),
            503
        );
    }

    #[test]
    fn test_unreachable_scopes_map_to_distinct_messages() {
        let node = unreachable_message(UnreachableScope::MediaNode);
        let agent = unreachable_message(UnreachableScope::NodeAgent);
        let either = unreachable_message(UnreachableScope::Undetermined);

        assert_ne!(node, agent);
        assert_ne!(agent, either);
        assert_ne!(node, either);

        let err = SignalingError::Control(ControlError::Unreachable {
            scope: UnreachableScope::NodeAgent,
        });
        assert_eq!(err.client_message(), agent);
    }
}
