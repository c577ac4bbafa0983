//! Room state shared by its sessions.
//!
//! A room owns the stream directory, the member list, and the recording
//! ledger, all behind one std mutex that is never held across an await.
//! Sessions hold an `Arc<Room>`; the room holds members weakly so a
//! dropped session cannot leak through its room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use signaling_protocol::MediaNodeControl;

use crate::channel::ClientNotification;
use crate::session::SignalingSession;
use crate::stream::{StreamEntry, StreamInfo};

/// A recording in progress, kept so stop-by-id can recover the stream
/// and URL handed to the media node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEntry {
    pub stream_id: String,
    pub url: String,
}

struct RoomState {
    streams: HashMap<String, StreamEntry>,
    members: HashMap<String, Weak<SignalingSession>>,
    recordings: HashMap<String, RecordingEntry>,
}

/// One conference room.
pub struct Room {
    id: String,
    controller: Arc<dyn MediaNodeControl>,
    state: Mutex<RoomState>,
}

impl Room {
    #[must_use]
    pub fn new(id: &str, controller: Arc<dyn MediaNodeControl>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            controller,
            state: Mutex::new(RoomState {
                streams: HashMap::new(),
                members: HashMap::new(),
                recordings: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn controller(&self) -> Arc<dyn MediaNodeControl> {
        Arc::clone(&self.controller)
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- membership ---

    pub(crate) fn join(&self, session: &Arc<SignalingSession>) {
        let mut state = self.state();
        state
            .members
            .insert(session.id().to_string(), Arc::downgrade(session));
        debug!(
            target: "sc.room",
            room_id = %self.id,
            client_id = %session.id(),
            members = state.members.len(),
            "Session joined"
        );
    }

    pub(crate) fn leave(&self, client_id: &str) {
        let mut state = self.state();
        state.members.remove(client_id);
        debug!(
            target: "sc.room",
            room_id = %self.id,
            client_id,
            members = state.members.len(),
            "Session left"
        );
    }

    /// Live member sessions. Dead weak references are pruned on the way.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<SignalingSession>> {
        let mut state = self.state();
        state.members.retain(|_, weak| weak.strong_count() > 0);
        state.members.values().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn member(&self, client_id: &str) -> Option<Arc<SignalingSession>> {
        self.state().members.get(client_id).and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        let mut state = self.state();
        state.members.retain(|_, weak| weak.strong_count() > 0);
        state.members.len()
    }

    // --- stream directory ---

    pub fn insert_stream(&self, entry: StreamEntry) {
        let mut state = self.state();
        if state.streams.insert(entry.id.clone(), entry).is_some() {
            warn!(target: "sc.room", room_id = %self.id, "Replaced an existing stream entry");
        }
    }

    pub fn remove_stream(&self, stream_id: &str) -> Option<StreamEntry> {
        self.state().streams.remove(stream_id)
    }

    #[must_use]
    pub fn contains_stream(&self, stream_id: &str) -> bool {
        self.state().streams.contains_key(stream_id)
    }

    #[must_use]
    pub fn stream_info(&self, stream_id: &str) -> Option<StreamInfo> {
        self.state().streams.get(stream_id).map(StreamEntry::info)
    }

    /// Run a closure against one entry under the directory lock.
    pub fn with_stream<R>(
        &self,
        stream_id: &str,
        f: impl FnOnce(&mut StreamEntry) -> R,
    ) -> Option<R> {
        self.state().streams.get_mut(stream_id).map(f)
    }

    /// Snapshot of every stream not owned by `client_id`, for
    /// auto-subscription evaluation.
    #[must_use]
    pub fn streams_of_others(&self, client_id: &str) -> Vec<StreamEntry> {
        self.state()
            .streams
            .values()
            .filter(|entry| entry.client_id != client_id)
            .cloned()
            .collect()
    }

    /// Ids of every stream owned by `client_id`.
    #[must_use]
    pub fn streams_of(&self, client_id: &str) -> Vec<String> {
        self.state()
            .streams
            .values()
            .filter(|entry| entry.client_id == client_id)
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Drop `client_id` from every data-subscriber set.
    pub fn remove_data_subscriber_everywhere(&self, client_id: &str) {
        for entry in self.state().streams.values_mut() {
            entry.remove_data_subscriber(client_id);
        }
    }

    // --- recordings ---

    pub fn add_recording(&self, recording_id: &str, stream_id: &str, url: &str) {
        self.state().recordings.insert(
            recording_id.to_string(),
            RecordingEntry {
                stream_id: stream_id.to_string(),
                url: url.to_string(),
            },
        );
    }

    pub fn take_recording(&self, recording_id: &str) -> Option<RecordingEntry> {
        self.state().recordings.remove(recording_id)
    }

    // --- fan-out ---

    /// Deliver a notification to every member.
    pub async fn broadcast(&self, notification: ClientNotification) {
        let members = self.members();
        for member in members {
            member.channel().notify(notification.clone()).await;
        }
    }

    /// Deliver a notification to one member, if still connected.
    pub async fn notify_member(&self, client_id: &str, notification: ClientNotification) {
        if let Some(member) = self.member(client_id) {
            member.channel().notify(notification).await;
        }
    }

    /// Re-run every member's auto-subscription diff. Called when the set
    /// of ready streams or their attributes changed.
    pub async fn refresh_auto_subscriptions(&self) {
        for member in self.members() {
            member.refresh_auto_subscription().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use serde_json::json;

    use signaling_protocol::mock::MockMediaNodeControl;
    use signaling_protocol::{PublishOptions, StreamCapabilities};

    use crate::channel::mock::MockChannel;
    use crate::config::Config;
    use crate::stream::StreamStatus;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::from_vars(&HashMap::new()).unwrap())
    }

    fn media_entry(id: &str, owner: &str) -> StreamEntry {
        let options = PublishOptions {
            label: format!("label-{id}"),
            capabilities: StreamCapabilities {
                audio: true,
                video: true,
                ..StreamCapabilities::default()
            },
            attributes: json!({}),
            ..PublishOptions::default()
        };
        StreamEntry::new(id, owner, &options)
    }

    #[tokio::test]
    async fn test_directory_tracks_ownership() {
        let control = Arc::new(MockMediaNodeControl::new());
        let room = Room::new("room-1", control);

        room.insert_stream(media_entry("1", "alice"));
        room.insert_stream(media_entry("2", "alice"));
        room.insert_stream(media_entry("3", "bob"));

        let mut owned = room.streams_of("alice");
        owned.sort();
        assert_eq!(owned, vec!["1".to_string(), "2".to_string()]);

        let others = room.streams_of_others("alice");
        assert_eq!(others.len(), 1);
        assert!(others.iter().any(|e| e.id == "3"));

        assert!(room.remove_stream("1").is_some());
        assert!(room.remove_stream("1").is_none());
        assert!(!room.contains_stream("1"));
    }

    #[tokio::test]
    async fn test_with_stream_mutates_under_the_lock() {
        let control = Arc::new(MockMediaNodeControl::new());
        let room = Room::new("room-1", control);
        room.insert_stream(media_entry("1", "alice"));

        let updated = room.with_stream("1", |entry| {
            entry.status = StreamStatus::Ready;
            entry.add_data_subscriber("bob");
            entry.status
        });
        assert_eq!(updated, Some(StreamStatus::Ready));

        let subscribers = room
            .with_stream("1", |entry| entry.data_subscribers())
            .unwrap();
        assert_eq!(subscribers, vec!["bob".to_string()]);

        assert_eq!(room.with_stream("missing", |_| ()), None);
    }

    #[tokio::test]
    async fn test_remove_data_subscriber_everywhere() {
        let control = Arc::new(MockMediaNodeControl::new());
        let room = Room::new("room-1", control);
        room.insert_stream(media_entry("1", "alice"));
        room.insert_stream(media_entry("2", "bob"));
        room.with_stream("1", |e| e.add_data_subscriber("carol"));
        room.with_stream("2", |e| e.add_data_subscriber("carol"));

        room.remove_data_subscriber_everywhere("carol");

        assert!(room
            .with_stream("1", |e| e.data_subscribers().is_empty())
            .unwrap());
        assert!(room
            .with_stream("2", |e| e.data_subscribers().is_empty())
            .unwrap());
    }

    #[tokio::test]
    async fn test_recording_ledger_is_take_once() {
        let control = Arc::new(MockMediaNodeControl::new());
        let room = Room::new("room-1", control);

        room.add_recording("r1", "1", "/tmp/r1.mkv");

        let entry = room.take_recording("r1").unwrap();
        assert_eq!(entry.stream_id, "1");
        assert_eq!(entry.url, "/tmp/r1.mkv");
        assert!(room.take_recording("r1").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let control = Arc::new(MockMediaNodeControl::new());
        let room = Room::new("room-1", control);
        let config = test_config();

        let (alice_channel, _alice_rx) = MockChannel::new();
        let (bob_channel, _bob_rx) = MockChannel::new();
        let alice =
            SignalingSession::connect(Arc::clone(&room), alice_channel.clone(), "presenter", &config);
        let bob =
            SignalingSession::connect(Arc::clone(&room), bob_channel.clone(), "viewer", &config);

        room.broadcast(ClientNotification::StreamRemoved {
            stream_id: "1".to_string(),
        })
        .await;

        assert_eq!(alice_channel.notifications().len(), 1);
        assert_eq!(bob_channel.notifications().len(), 1);
        drop(alice);
        drop(bob);
    }

    #[tokio::test]
    async fn test_dropped_members_are_pruned() {
        let control = Arc::new(MockMediaNodeControl::new());
        let room = Room::new("room-1", control);
        let config = test_config();

        let (channel, _rx) = MockChannel::new();
        let session = SignalingSession::connect(Arc::clone(&room), channel, "viewer", &config);
        assert_eq!(room.member_count(), 1);
        assert!(room.member(session.id()).is_some());

        drop(session);
        assert_eq!(room.member_count(), 0);
    }
}
