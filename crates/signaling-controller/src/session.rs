//! One client's signaling session.
//!
//! A session owns the client-facing side of every operation: permission
//! checks, the stream directory entries it publishes, its subscriptions,
//! and the translation of media-node negotiation events into client
//! notifications. Sessions are `Arc`-shared; the room reaches them for
//! fan-out and auto-subscription refreshes through weak references.
//!
//! Registry mutations happen before the first await of an operation, so
//! a client that fires unpublish right after publish observes the entry
//! it just created.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use signaling_protocol::{
    ExternalOutputOptions, NegotiationEvent, NegotiationMessage, PublishOptions, StreamAddress,
    StreamCapabilities, StreamStatsReport, SubscribeOptions,
};

use crate::channel::{ClientNotification, ConnectionContext, SignalingChannel};
use crate::config::Config;
use crate::errors::{unreachable_message, SignalingError};
use crate::permissions::{Action, PermissionSet};
use crate::room::Room;
use crate::stream::{generate_numeric_id, SelectorSet, StreamEntry, StreamStatus};

/// Buffer for per-operation negotiation event channels.
const EVENT_CHANNEL_BUFFER: usize = 32;

/// Whether the session currently publishes anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// No ready publication; the session only consumes.
    Sleeping,
    /// At least one publication reached ready since the last drain.
    Active,
}

/// Where a published stream's media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishSource {
    /// A transport connection negotiated with the client.
    Transport,
    /// A URL-addressed external input pulled by the media node.
    ExternalInput { url: String },
    /// A previously written recording, replayed as an external input.
    Recording { recording_id: String },
}

/// The stored auto-subscription request, re-evaluated on every room
/// change.
#[derive(Debug, Clone)]
struct AutoSubscription {
    selection: SelectorSet,
    options: SubscribeOptions,
}

struct SessionState {
    phase: LifecyclePhase,
    /// Stream ids this session published, in publish order.
    published: Vec<String>,
    /// Media subscriptions, both direct and auto-subscribed.
    subscribed: HashSet<String>,
    auto: Option<AutoSubscription>,
}

/// One connected client.
pub struct SignalingSession {
    id: String,
    room: Arc<Room>,
    channel: Arc<dyn SignalingChannel>,
    permissions: PermissionSet,
    config: Arc<Config>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    weak: Weak<SignalingSession>,
}

fn capability_flags(capabilities: &StreamCapabilities) -> Value {
    serde_json::to_value(capabilities).unwrap_or(Value::Null)
}

impl SignalingSession {
    /// Create a session and join it to the room. The role resolves to a
    /// permission set from the configuration; unknown roles get an empty
    /// set and can do nothing.
    #[must_use]
    pub fn connect(
        room: Arc<Room>,
        channel: Arc<dyn SignalingChannel>,
        role: &str,
        config: &Arc<Config>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let permissions = config.roles.get(role).cloned().unwrap_or_default();
        if !config.roles.contains_key(role) {
            warn!(target: "sc.session", client_id = %id, role, "Unknown role, granting nothing");
        }

        let session = Arc::new_cyclic(|weak| Self {
            id: id.clone(),
            room: Arc::clone(&room),
            channel,
            permissions,
            config: Arc::clone(config),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                phase: LifecyclePhase::Sleeping,
                published: Vec::new(),
                subscribed: HashSet::new(),
                auto: None,
            }),
            weak: weak.clone(),
        });

        room.join(&session);
        info!(
            target: "sc.session",
            client_id = %session.id,
            room_id = %room.id(),
            role,
            "Session connected"
        );
        session
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn channel(&self) -> Arc<dyn SignalingChannel> {
        Arc::clone(&self.channel)
    }

    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        self.state().phase
    }

    /// Stream ids this session published, in publish order.
    #[must_use]
    pub fn published_streams(&self) -> Vec<String> {
        self.state().published.clone()
    }

    /// Media subscriptions, sorted for stable assertions.
    #[must_use]
    pub fn subscribed_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().subscribed.iter().cloned().collect();
        ids.sort();
        ids
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn authorize(&self, action: Action, requested: &Value) -> Result<(), SignalingError> {
        if self.permissions.allows_with(action, requested) {
            Ok(())
        } else {
            info!(
                target: "sc.session",
                client_id = %self.id,
                %action,
                "Unauthorized request rejected"
            );
            Err(SignalingError::Unauthorized { action })
        }
    }

    fn fill_publish_defaults(&self, options: &mut PublishOptions) {
        options.single_pc = options.single_pc || self.config.single_pc;
        options.trickle_ice = options.trickle_ice || self.config.trickle_ice;
        if options.media_configuration.is_none() {
            options.media_configuration = Some(self.config.default_media_configuration.clone());
        }
    }

    fn fill_subscribe_defaults(&self, options: &mut SubscribeOptions) {
        options.single_pc = options.single_pc || self.config.single_pc;
        options.trickle_ice = options.trickle_ice || self.config.trickle_ice;
        if options.media_configuration.is_none() {
            options.media_configuration = Some(self.config.default_media_configuration.clone());
        }
    }

    // --- publishing ---

    /// Publish a stream. Returns the generated stream id; negotiation
    /// progress flows to the client as notifications. Data-only streams
    /// skip the media tier and are announced immediately.
    pub async fn publish(
        &self,
        mut options: PublishOptions,
        source: PublishSource,
    ) -> Result<String, SignalingError> {
        self.authorize(Action::Publish, &capability_flags(&options.capabilities))?;
        self.fill_publish_defaults(&mut options);

        let stream_id = generate_numeric_id();
        let has_media = options.capabilities.has_media();
        self.room
            .insert_stream(StreamEntry::new(&stream_id, &self.id, &options));
        self.state().published.push(stream_id.clone());

        debug!(
            target: "sc.session",
            client_id = %self.id,
            stream_id = %stream_id,
            source = ?source,
            has_media,
            "Publishing stream"
        );

        if !has_media {
            self.mark_stream_ready(&stream_id).await;
            return Ok(stream_id);
        }

        let (updates, events) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let controller = self.room.controller();
        let result = match &source {
            PublishSource::Transport => {
                controller
                    .add_publisher(&self.id, &stream_id, options, updates)
                    .await
            }
            PublishSource::ExternalInput { url } => {
                controller
                    .add_external_input(&self.id, &stream_id, url, options, updates)
                    .await
            }
            PublishSource::Recording { recording_id } => {
                let url = self.config.recording_url(recording_id);
                controller
                    .add_external_input(&self.id, &stream_id, &url, options, updates)
                    .await
            }
        };

        if let Err(err) = result {
            self.forget_stream(&stream_id);
            return Err(err.into());
        }

        self.spawn_publish_forwarder(stream_id.clone(), events);
        Ok(stream_id)
    }

    /// Flip a pending stream to ready, announce it, and re-run every
    /// member's auto-subscription. Idempotent per stream.
    async fn mark_stream_ready(&self, stream_id: &str) {
        let became_ready = self
            .room
            .with_stream(stream_id, |entry| {
                if entry.status == StreamStatus::Ready {
                    false
                } else {
                    entry.status = StreamStatus::Ready;
                    true
                }
            })
            .unwrap_or(false);
        if !became_ready {
            return;
        }

        self.state().phase = LifecyclePhase::Active;
        info!(
            target: "sc.session",
            client_id = %self.id,
            stream_id,
            "Stream ready"
        );

        if let Some(stream) = self.room.stream_info(stream_id) {
            self.room
                .broadcast(ClientNotification::StreamAdded { stream })
                .await;
        }
        self.room.refresh_auto_subscriptions().await;
    }

    /// Drop a stream that never (or no longer) exists on the media tier.
    fn forget_stream(&self, stream_id: &str) {
        self.room.remove_stream(stream_id);
        let mut state = self.state();
        state.published.retain(|id| id != stream_id);
        if state.published.is_empty() {
            state.phase = LifecyclePhase::Sleeping;
        }
    }

    fn spawn_publish_forwarder(
        &self,
        stream_id: String,
        mut events: mpsc::Receiver<NegotiationEvent>,
    ) {
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        if session.on_publish_event(&stream_id, event).await {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Returns true when the negotiation is over and the forwarder
    /// should stop.
    async fn on_publish_event(&self, stream_id: &str, event: NegotiationEvent) -> bool {
        match event {
            NegotiationEvent::Ready => {
                self.mark_stream_ready(stream_id).await;
                self.channel
                    .notify(ClientNotification::NegotiationUpdate {
                        stream_ids: vec![stream_id.to_string()],
                        event: NegotiationEvent::Ready,
                    })
                    .await;
                false
            }
            NegotiationEvent::Failed { description } => {
                warn!(
                    target: "sc.session",
                    client_id = %self.id,
                    stream_id,
                    description = description.as_deref().unwrap_or(""),
                    "Publish connection failed"
                );
                self.channel
                    .notify(ClientNotification::ConnectionFailed {
                        context: ConnectionContext::Publish,
                        stream_ids: vec![stream_id.to_string()],
                        message: "media negotiation failed".to_string(),
                    })
                    .await;
                true
            }
            NegotiationEvent::Unreachable { scope } => {
                self.forget_stream(stream_id);
                self.channel
                    .notify(ClientNotification::ConnectionFailed {
                        context: ConnectionContext::Publish,
                        stream_ids: vec![stream_id.to_string()],
                        message: unreachable_message(scope).to_string(),
                    })
                    .await;
                true
            }
            NegotiationEvent::BandwidthAlert { message, bandwidth } => {
                self.channel
                    .notify(ClientNotification::BandwidthAlert {
                        stream_id: stream_id.to_string(),
                        message,
                        bandwidth,
                    })
                    .await;
                false
            }
            other => {
                self.channel
                    .notify(ClientNotification::NegotiationUpdate {
                        stream_ids: vec![stream_id.to_string()],
                        event: other,
                    })
                    .await;
                false
            }
        }
    }

    /// Withdraw one of this session's streams. Success when the stream
    /// is already gone.
    pub async fn unpublish(&self, stream_id: &str) -> Result<(), SignalingError> {
        self.authorize(Action::Publish, &Value::Null)?;

        let Some(owner) = self
            .room
            .with_stream(stream_id, |entry| entry.client_id.clone())
        else {
            return Ok(());
        };
        if owner != self.id {
            return Err(SignalingError::NotOwner(stream_id.to_string()));
        }

        let removed = self.room.remove_stream(stream_id);
        {
            let mut state = self.state();
            state.published.retain(|id| id != stream_id);
            if state.published.is_empty() {
                state.phase = LifecyclePhase::Sleeping;
            }
        }

        self.room
            .broadcast(ClientNotification::StreamRemoved {
                stream_id: stream_id.to_string(),
            })
            .await;

        if removed.as_ref().is_some_and(StreamEntry::has_media) {
            self.room
                .controller()
                .remove_publisher(&self.id, stream_id)
                .await?;
        }
        Ok(())
    }

    // --- subscribing ---

    /// Subscribe to a stream. Data channels are wired on the signaling
    /// tier; media goes through the media node with progress forwarded
    /// to the client.
    pub async fn subscribe(
        &self,
        stream_id: &str,
        mut options: SubscribeOptions,
    ) -> Result<(), SignalingError> {
        self.authorize(Action::Subscribe, &capability_flags(&options.capabilities))?;

        let Some((has_media, has_data)) = self
            .room
            .with_stream(stream_id, |entry| (entry.has_media(), entry.has_data()))
        else {
            return Err(SignalingError::StreamNotFound(stream_id.to_string()));
        };

        if has_data && options.capabilities.data {
            self.room
                .with_stream(stream_id, |entry| entry.add_data_subscriber(&self.id));
        }
        if !has_media {
            return Ok(());
        }

        self.fill_subscribe_defaults(&mut options);
        self.state().subscribed.insert(stream_id.to_string());

        let (updates, events) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        match self
            .room
            .controller()
            .add_subscriber(&self.id, stream_id, options, updates)
            .await
        {
            Ok(()) => {
                self.spawn_subscribe_forwarder(stream_id.to_string(), events);
                Ok(())
            }
            Err(err) => {
                self.state().subscribed.remove(stream_id);
                Err(err.into())
            }
        }
    }

    /// Drop a subscription. Success when none exists.
    pub async fn unsubscribe(&self, stream_id: &str) -> Result<(), SignalingError> {
        self.authorize(Action::Subscribe, &Value::Null)?;

        self.room
            .with_stream(stream_id, |entry| entry.remove_data_subscriber(&self.id));

        let had_media = self.state().subscribed.remove(stream_id);
        if had_media {
            self.room
                .controller()
                .remove_subscriber(&self.id, stream_id)
                .await?;
        }
        Ok(())
    }

    fn spawn_subscribe_forwarder(
        &self,
        stream_id: String,
        mut events: mpsc::Receiver<NegotiationEvent>,
    ) {
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        if session.on_subscribe_event(&stream_id, event).await {
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn on_subscribe_event(&self, stream_id: &str, event: NegotiationEvent) -> bool {
        match event {
            NegotiationEvent::Failed { description } => {
                warn!(
                    target: "sc.session",
                    client_id = %self.id,
                    stream_id,
                    description = description.as_deref().unwrap_or(""),
                    "Subscribe connection failed"
                );
                self.channel
                    .notify(ClientNotification::ConnectionFailed {
                        context: ConnectionContext::Subscribe,
                        stream_ids: vec![stream_id.to_string()],
                        message: "media negotiation failed".to_string(),
                    })
                    .await;
                true
            }
            NegotiationEvent::Unreachable { scope } => {
                self.state().subscribed.remove(stream_id);
                self.channel
                    .notify(ClientNotification::ConnectionFailed {
                        context: ConnectionContext::Subscribe,
                        stream_ids: vec![stream_id.to_string()],
                        message: unreachable_message(scope).to_string(),
                    })
                    .await;
                true
            }
            NegotiationEvent::BandwidthAlert { message, bandwidth } => {
                self.channel
                    .notify(ClientNotification::BandwidthAlert {
                        stream_id: stream_id.to_string(),
                        message,
                        bandwidth,
                    })
                    .await;
                false
            }
            other => {
                self.channel
                    .notify(ClientNotification::NegotiationUpdate {
                        stream_ids: vec![stream_id.to_string()],
                        event: other,
                    })
                    .await;
                false
            }
        }
    }

    // --- auto-subscription ---

    /// Store a selector-driven subscription request and reconcile it
    /// against the room immediately.
    pub async fn auto_subscribe(
        &self,
        selection: SelectorSet,
        options: SubscribeOptions,
    ) -> Result<(), SignalingError> {
        self.authorize(Action::Subscribe, &capability_flags(&options.capabilities))?;
        self.state().auto = Some(AutoSubscription { selection, options });
        self.refresh_auto_subscription().await;
        Ok(())
    }

    /// Reconcile the stored selectors against the room's streams: batch
    /// media subscriptions for newly selected streams, batch removals
    /// for deselected ones, and mutate data-subscriber sets directly.
    /// No-op without a stored auto-subscription.
    pub async fn refresh_auto_subscription(&self) {
        let Some(auto) = self.state().auto.clone() else {
            return;
        };

        let candidates = self.room.streams_of_others(&self.id);
        let mut data_additions = Vec::new();
        let mut data_removals = Vec::new();
        let mut to_subscribe = Vec::new();
        let mut to_unsubscribe = Vec::new();
        {
            let mut state = self.state();
            for entry in &candidates {
                let selected = auto.selection.selects(entry);
                if entry.has_data() {
                    if selected {
                        data_additions.push(entry.id.clone());
                    } else {
                        data_removals.push(entry.id.clone());
                    }
                }
                if !entry.has_media() {
                    continue;
                }
                if selected && !state.subscribed.contains(&entry.id) {
                    state.subscribed.insert(entry.id.clone());
                    to_subscribe.push(entry.id.clone());
                } else if !selected && state.subscribed.contains(&entry.id) {
                    state.subscribed.remove(&entry.id);
                    to_unsubscribe.push(entry.id.clone());
                }
            }
        }

        for stream_id in &data_additions {
            self.room
                .with_stream(stream_id, |entry| entry.add_data_subscriber(&self.id));
        }
        for stream_id in &data_removals {
            self.room
                .with_stream(stream_id, |entry| entry.remove_data_subscriber(&self.id));
        }

        if !to_subscribe.is_empty() {
            debug!(
                target: "sc.session",
                client_id = %self.id,
                streams = to_subscribe.len(),
                "Auto-subscribing to newly selected streams"
            );
            let mut options = auto.options.clone();
            self.fill_subscribe_defaults(&mut options);
            let (updates, events) = mpsc::channel(EVENT_CHANNEL_BUFFER);
            match self
                .room
                .controller()
                .add_multiple_subscribers(&self.id, &to_subscribe, options, updates)
                .await
            {
                Ok(()) => self.spawn_batch_forwarder(events),
                Err(err) => {
                    warn!(
                        target: "sc.session",
                        client_id = %self.id,
                        error = %err,
                        "Auto-subscription batch failed"
                    );
                    let mut state = self.state();
                    for stream_id in &to_subscribe {
                        state.subscribed.remove(stream_id);
                    }
                }
            }
        }

        if !to_unsubscribe.is_empty() {
            debug!(
                target: "sc.session",
                client_id = %self.id,
                streams = to_unsubscribe.len(),
                "Auto-unsubscribing from deselected streams"
            );
            let (updates, events) = mpsc::channel(EVENT_CHANNEL_BUFFER);
            match self
                .room
                .controller()
                .remove_multiple_subscribers(&self.id, &to_unsubscribe, updates)
                .await
            {
                Ok(()) => self.spawn_batch_forwarder(events),
                Err(err) => {
                    warn!(
                        target: "sc.session",
                        client_id = %self.id,
                        error = %err,
                        "Auto-unsubscription batch failed"
                    );
                }
            }
        }
    }

    fn spawn_batch_forwarder(&self, mut events: mpsc::Receiver<NegotiationEvent>) {
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        if session.on_batch_event(event).await {
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn on_batch_event(&self, event: NegotiationEvent) -> bool {
        let stream_ids = match &event {
            NegotiationEvent::MultipleInitializing { stream_ids, .. } => stream_ids.clone(),
            NegotiationEvent::Sdp {
                stream_ids: Some(ids),
                ..
            } => ids.clone(),
            _ => Vec::new(),
        };
        match event {
            NegotiationEvent::Error { reason } => {
                // NoMatchingStreams just means every candidate left
                // before the batch landed on the node.
                debug!(
                    target: "sc.session",
                    client_id = %self.id,
                    reason = ?reason,
                    "Batch subscription rejected"
                );
                true
            }
            NegotiationEvent::Failed { description } => {
                warn!(
                    target: "sc.session",
                    client_id = %self.id,
                    description = description.as_deref().unwrap_or(""),
                    "Batch connection failed"
                );
                self.channel
                    .notify(ClientNotification::ConnectionFailed {
                        context: ConnectionContext::Subscribe,
                        stream_ids,
                        message: "media negotiation failed".to_string(),
                    })
                    .await;
                true
            }
            NegotiationEvent::Unreachable { scope } => {
                self.channel
                    .notify(ClientNotification::ConnectionFailed {
                        context: ConnectionContext::Subscribe,
                        stream_ids,
                        message: unreachable_message(scope).to_string(),
                    })
                    .await;
                true
            }
            other => {
                self.channel
                    .notify(ClientNotification::NegotiationUpdate {
                        stream_ids,
                        event: other,
                    })
                    .await;
                false
            }
        }
    }

    // --- data and attributes ---

    /// Relay a data-channel payload to the stream's data subscribers.
    /// Unknown streams are dropped with a log line.
    pub async fn send_data(&self, stream_id: &str, payload: Value) {
        let Some(subscribers) = self
            .room
            .with_stream(stream_id, |entry| entry.data_subscribers())
        else {
            warn!(
                target: "sc.session",
                client_id = %self.id,
                stream_id,
                "Data for an unknown stream dropped"
            );
            return;
        };

        for client_id in subscribers {
            self.room
                .notify_member(
                    &client_id,
                    ClientNotification::Data {
                        stream_id: stream_id.to_string(),
                        payload: payload.clone(),
                    },
                )
                .await;
        }
    }

    /// Replace a stream's attribute document, notify its data
    /// subscribers, and re-run selector matching room-wide.
    pub async fn update_attributes(
        &self,
        stream_id: &str,
        attributes: Value,
    ) -> Result<(), SignalingError> {
        let Some(subscribers) = self.room.with_stream(stream_id, |entry| {
            entry.set_attributes(attributes.clone());
            entry.data_subscribers()
        }) else {
            return Err(SignalingError::StreamNotFound(stream_id.to_string()));
        };

        for client_id in subscribers {
            self.room
                .notify_member(
                    &client_id,
                    ClientNotification::AttributeUpdate {
                        stream_id: stream_id.to_string(),
                        attributes: attributes.clone(),
                    },
                )
                .await;
        }

        self.room.refresh_auto_subscriptions().await;
        Ok(())
    }

    // --- negotiation relay ---

    /// Forward an in-negotiation message from the client to the media
    /// node. Replies arrive on the update channels already wired.
    pub async fn process_signaling(
        &self,
        address: StreamAddress,
        message: NegotiationMessage,
    ) -> Result<(), SignalingError> {
        self.room
            .controller()
            .process_signaling(&self.id, address, message)
            .await?;
        Ok(())
    }

    // --- stats ---

    /// One-shot stats for a stream and its subscribers.
    pub async fn get_stream_stats(
        &self,
        stream_id: &str,
    ) -> Result<StreamStatsReport, SignalingError> {
        self.authorize(Action::Stats, &Value::Null)?;
        if !self.room.contains_stream(stream_id) {
            return Err(SignalingError::StreamNotFound(stream_id.to_string()));
        }
        let report = self.room.controller().get_stream_stats(stream_id).await?;
        Ok(report)
    }

    // --- recording ---

    /// Attach a recorder to a stream. Returns the recording id used to
    /// stop it; the URL is built from the configured path template.
    pub async fn start_recording(&self, stream_id: &str) -> Result<String, SignalingError> {
        self.authorize(Action::Record, &Value::Null)?;

        let Some(has_media) = self.room.with_stream(stream_id, |entry| entry.has_media()) else {
            return Err(SignalingError::StreamNotFound(stream_id.to_string()));
        };
        if !has_media {
            return Err(SignalingError::NotRecordable(stream_id.to_string()));
        }

        let recording_id = generate_numeric_id();
        let url = self.config.recording_url(&recording_id);
        let options = ExternalOutputOptions {
            media_configuration: Some(self.config.default_media_configuration.clone()),
        };
        self.room
            .controller()
            .add_external_output(stream_id, &url, options)
            .await?;
        self.room.add_recording(&recording_id, stream_id, &url);

        info!(
            target: "sc.session",
            client_id = %self.id,
            stream_id,
            recording_id = %recording_id,
            "Recording started"
        );
        Ok(recording_id)
    }

    /// Detach a recorder by recording id. Success when no such recording
    /// is active.
    pub async fn stop_recording(&self, recording_id: &str) -> Result<(), SignalingError> {
        self.authorize(Action::Record, &Value::Null)?;

        let Some(recording) = self.room.take_recording(recording_id) else {
            debug!(
                target: "sc.session",
                client_id = %self.id,
                recording_id,
                "Stop for an unknown recording ignored"
            );
            return Ok(());
        };

        self.room
            .controller()
            .remove_external_output(&recording.stream_id, &recording.url)
            .await?;
        Ok(())
    }

    // --- teardown ---

    /// Tear the session down: announce its streams' removal, drop its
    /// subscriptions and publishers on the media tier, and release the
    /// transport. Idempotent.
    pub async fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        info!(target: "sc.session", client_id = %self.id, "Session disconnecting");

        let owned = {
            let mut state = self.state();
            state.auto = None;
            state.subscribed.clear();
            state.phase = LifecyclePhase::Sleeping;
            std::mem::take(&mut state.published)
        };

        for stream_id in &owned {
            self.room
                .broadcast(ClientNotification::StreamRemoved {
                    stream_id: stream_id.clone(),
                })
                .await;
        }

        self.room.remove_data_subscriber_everywhere(&self.id);
        self.room.leave(&self.id);

        let controller = self.room.controller();
        if let Err(err) = controller.remove_subscriptions(&self.id).await {
            warn!(
                target: "sc.session",
                client_id = %self.id,
                error = %err,
                "Failed to drop subscriptions on disconnect"
            );
        }

        for stream_id in &owned {
            let removed = self.room.remove_stream(stream_id);
            if removed.as_ref().is_some_and(StreamEntry::has_media) {
                if let Err(err) = controller.remove_publisher(&self.id, stream_id).await {
                    warn!(
                        target: "sc.session",
                        client_id = %self.id,
                        stream_id = %stream_id,
                        error = %err,
                        "Failed to remove publisher on disconnect"
                    );
                }
            }
        }

        self.channel.disconnect().await;
    }
}
