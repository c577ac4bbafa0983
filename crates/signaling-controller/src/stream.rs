//! Stream directory entries.
//!
//! The room keeps one [`StreamEntry`] per published stream. Entries hold
//! everything the signaling tier needs without asking the media node:
//! capabilities, publisher-set attributes, the data-subscriber set, and
//! whether negotiation has reached ready. Auto-subscription selectors
//! match against these entries.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use signaling_protocol::{PublishOptions, StreamCapabilities};

/// Prefix stripped from selector paths that descend into the
/// publisher-set attributes document.
const ATTRIBUTES_SELECTOR_PREFIX: &str = "/attributes";

/// Where the stream is in its negotiation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Registered, negotiation not yet ready. Not announced to the room.
    Pending,
    /// Media is flowing (or the stream is data-only). Announced.
    Ready,
}

/// One entry in the room's stream directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    /// Session that published the stream.
    pub client_id: String,
    pub label: String,
    pub capabilities: StreamCapabilities,
    /// Free-form JSON document set by the publisher.
    pub attributes: Value,
    pub status: StreamStatus,
    data_subscribers: HashSet<String>,
}

impl StreamEntry {
    #[must_use]
    pub fn new(id: &str, client_id: &str, options: &PublishOptions) -> Self {
        Self {
            id: id.to_string(),
            client_id: client_id.to_string(),
            label: options.label.clone(),
            capabilities: options.capabilities,
            attributes: options.attributes.clone(),
            status: StreamStatus::Pending,
            data_subscribers: HashSet::new(),
        }
    }

    #[must_use]
    pub fn has_media(&self) -> bool {
        self.capabilities.has_media()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.capabilities.data
    }

    /// Add a session to the data-subscriber set. Idempotent.
    pub fn add_data_subscriber(&mut self, client_id: &str) {
        self.data_subscribers.insert(client_id.to_string());
    }

    pub fn remove_data_subscriber(&mut self, client_id: &str) {
        self.data_subscribers.remove(client_id);
    }

    #[must_use]
    pub fn data_subscribers(&self) -> Vec<String> {
        self.data_subscribers.iter().cloned().collect()
    }

    #[must_use]
    pub fn has_data_subscriber(&self, client_id: &str) -> bool {
        self.data_subscribers.contains(client_id)
    }

    pub fn set_attributes(&mut self, attributes: Value) {
        self.attributes = attributes;
    }

    /// The value a selector path resolves to for this entry. Top-level
    /// paths name entry fields; `/attributes/...` descends into the
    /// publisher's attribute document as a JSON pointer.
    fn selector_value(&self, path: &str) -> Option<Value> {
        if let Some(pointer) = path.strip_prefix(ATTRIBUTES_SELECTOR_PREFIX) {
            if pointer.is_empty() {
                return Some(self.attributes.clone());
            }
            return self.attributes.pointer(pointer).cloned();
        }
        match path {
            "/id" => Some(Value::String(self.id.clone())),
            "/client" => Some(Value::String(self.client_id.clone())),
            "/label" => Some(Value::String(self.label.clone())),
            "/audio" => Some(Value::Bool(self.capabilities.audio)),
            "/video" => Some(Value::Bool(self.capabilities.video)),
            "/screen" => Some(Value::Bool(self.capabilities.screen)),
            "/data" => Some(Value::Bool(self.capabilities.data)),
            _ => None,
        }
    }

    /// True when any selector in the map matches. An empty map matches
    /// nothing.
    #[must_use]
    pub fn meets_any_selector(&self, selectors: &serde_json::Map<String, Value>) -> bool {
        selectors
            .iter()
            .any(|(path, expected)| self.selector_value(path).as_ref() == Some(expected))
    }

    /// Snapshot announced to clients.
    #[must_use]
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            audio: self.capabilities.audio,
            video: self.capabilities.video,
            screen: self.capabilities.screen,
            data: self.capabilities.data,
            label: self.label.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// The public view of a stream, sent in room announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
    pub data: bool,
    pub label: String,
    pub attributes: Value,
}

/// Positive and negative selector maps for auto-subscription. A stream
/// is selected when it meets any positive selector and no negative one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSet {
    #[serde(default)]
    pub selectors: serde_json::Map<String, Value>,
    #[serde(default)]
    pub negative_selectors: serde_json::Map<String, Value>,
}

impl SelectorSet {
    #[must_use]
    pub fn selects(&self, entry: &StreamEntry) -> bool {
        entry.meets_any_selector(&self.selectors)
            && !entry.meets_any_selector(&self.negative_selectors)
    }
}

/// Generate a stream or recording id: 18 decimal digits, no leading
/// zero, matching the ids clients already parse as numbers.
#[must_use]
pub fn generate_numeric_id() -> String {
    rand::thread_rng()
        .gen_range(100_000_000_000_000_000_u64..=999_999_999_999_999_999_u64)
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use serde_json::json;

    fn camera_entry() -> StreamEntry {
        let options = PublishOptions {
            label: "cam0".to_string(),
            capabilities: StreamCapabilities {
                audio: true,
                video: true,
                ..StreamCapabilities::default()
            },
            attributes: json!({ "type": "camera", "quality": { "tier": 2 } }),
            ..PublishOptions::default()
        };
        StreamEntry::new("111111111111111111", "alice", &options)
    }

    fn selector_map(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(path, value)| ((*path).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_selectors_match_entry_fields() {
        let entry = camera_entry();

        assert!(entry.meets_any_selector(&selector_map(&[("/id", json!("111111111111111111"))])));
        assert!(entry.meets_any_selector(&selector_map(&[("/client", json!("alice"))])));
        assert!(entry.meets_any_selector(&selector_map(&[("/video", json!(true))])));
        assert!(!entry.meets_any_selector(&selector_map(&[("/data", json!(true))])));
    }

    #[test]
    fn test_selectors_descend_into_attributes() {
        let entry = camera_entry();

        assert!(entry.meets_any_selector(&selector_map(&[(
            "/attributes/type",
            json!("camera")
        )])));
        assert!(entry.meets_any_selector(&selector_map(&[(
            "/attributes/quality/tier",
            json!(2)
        )])));
        assert!(!entry.meets_any_selector(&selector_map(&[(
            "/attributes/type",
            json!("screen")
        )])));
        assert!(!entry.meets_any_selector(&selector_map(&[(
            "/attributes/missing",
            json!("x")
        )])));
    }

    #[test]
    fn test_any_matching_selector_is_enough() {
        let entry = camera_entry();
        let selectors = selector_map(&[
            ("/attributes/type", json!("screen")),
            ("/client", json!("alice")),
        ]);

        assert!(entry.meets_any_selector(&selectors));
    }

    #[test]
    fn test_empty_selector_map_matches_nothing() {
        let entry = camera_entry();
        assert!(!entry.meets_any_selector(&serde_json::Map::new()));
    }

    #[test]
    fn test_negative_selectors_veto() {
        let entry = camera_entry();
        let set = SelectorSet {
            selectors: selector_map(&[("/attributes/type", json!("camera"))]),
            negative_selectors: selector_map(&[("/client", json!("alice"))]),
        };

        assert!(!set.selects(&entry));

        let set = SelectorSet {
            selectors: selector_map(&[("/attributes/type", json!("camera"))]),
            negative_selectors: selector_map(&[("/client", json!("bob"))]),
        };
        assert!(set.selects(&entry));
    }

    #[test]
    fn test_data_subscriber_set_is_idempotent() {
        let mut entry = camera_entry();

        entry.add_data_subscriber("bob");
        entry.add_data_subscriber("bob");
        assert_eq!(entry.data_subscribers(), vec!["bob".to_string()]);

        entry.remove_data_subscriber("bob");
        assert!(entry.data_subscribers().is_empty());
        entry.remove_data_subscriber("bob");
    }

    #[test]
    fn test_generated_ids_are_18_digits() {
        for _ in 0..32 {
            let id = generate_numeric_id();
            assert_eq!(id.len(), 18);
            assert!(id.chars().all(|c| c.is_ascii_digit()));
            assert!(!id.starts_with('0'));
        }
    }
}
