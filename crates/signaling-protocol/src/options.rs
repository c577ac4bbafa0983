//! Option structs carried by publish/subscribe operations.

use serde::{Deserialize, Serialize};

/// Which kinds of media a stream carries. Also used by subscribe options
/// to restrict which of the publisher's tracks the subscriber wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCapabilities {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub screen: bool,
    #[serde(default)]
    pub data: bool,
}

impl StreamCapabilities {
    /// True when the stream carries anything that needs a transport
    /// connection. Data-only streams are relayed on the signaling tier
    /// without touching a media node.
    #[must_use]
    pub fn has_media(&self) -> bool {
        self.audio || self.video || self.screen
    }
}

/// Constraints for a media-node generated offer, for publishers that ask
/// the node to open the negotiation instead of sending an offer first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferConstraints {
    pub audio: bool,
    pub video: bool,
    pub bundle: bool,
}

/// Options for creating a publisher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub capabilities: StreamCapabilities,
    /// Free-form attributes attached by the publisher; the selector
    /// matching for auto-subscription evaluates against these.
    #[serde(default)]
    pub attributes: serde_json::Value,
    /// Multiplex all of this client's streams onto one connection.
    #[serde(default)]
    pub single_pc: bool,
    /// Emit candidates as they gather instead of waiting for completion.
    #[serde(default)]
    pub trickle_ice: bool,
    /// Named codec/bandwidth profile understood by the media engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_configuration: Option<String>,
    /// When set, the media node generates the opening offer rather than
    /// answering one from the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_offer: Option<OfferConstraints>,
}

/// Options for creating a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    #[serde(flatten)]
    pub capabilities: StreamCapabilities,
    /// Carried for wire compatibility only; the media node always
    /// negotiates under the publisher's label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub single_pc: bool,
    #[serde(default)]
    pub trickle_ice: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_configuration: Option<String>,
}

/// Options for attaching an external output (recorder) to a publisher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalOutputOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_configuration: Option<String>,
}
