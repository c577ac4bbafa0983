//! Connection actor owning one transport session.
//!
//! A `ConnectionActor` serializes all access to its engine session: the
//! attach/detach operations, remote description processing, and the
//! emission rules that decide when a local offer or answer leaves the
//! node. Multiple media streams can share one connection (single-PC
//! multiplexing); each attached stream registers a sink that receives
//! connection-level negotiation events plus its own stream-scoped ones.
//!
//! Emission follows two gates. Nothing is emitted while a sent offer is
//! still waiting for its answer (the negotiating flag), and nothing is
//! emitted before candidate gathering completes unless the connection
//! negotiates with trickle ICE. Removals bypass both gates but first
//! wait for the engine to drop the removed stream's label from the
//! local description, retrying on a fixed schedule and abandoning the
//! renegotiation when the label never clears.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use signaling_protocol::{
    BatchContext, IceCandidate, NegotiationEvent, OfferConstraints, SdpKind,
};

use crate::actors::messages::{CompletionSender, ConnectionMessage};
use crate::config::Config;
use crate::engine::{MediaStreamConfig, TransportEvent, TransportSession};
use crate::errors::MediaNodeError;
use crate::metrics::NodeMetrics;

/// Buffer size for the connection actor mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Buffer size for the engine event channel.
const ENGINE_EVENT_BUFFER: usize = 64;

/// Attempts to wait out a removed stream still present in the local
/// description before abandoning the renegotiation.
const REMOVAL_RENEGOTIATION_RETRIES: u32 = 10;

/// Delay between removal renegotiation attempts.
const REMOVAL_RENEGOTIATION_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Creation-time negotiation settings for a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionSettings {
    /// Emit offers instead of answers in engine-driven renegotiations.
    pub offer_mode: bool,
    /// Emit candidates incrementally instead of waiting for gathering.
    pub trickle_ice: bool,
}

/// Negotiation lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    Initial,
    Gathering,
    Gathered,
    Ready,
    Failed,
    Finished,
}

/// Sink registered by one attached media stream.
struct StreamSink {
    stream_id: String,
    label: String,
    sender: mpsc::Sender<NegotiationEvent>,
}

/// Handle for sending messages to a `ConnectionActor`.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    connection_id: String,
    client_id: String,
}

impl ConnectionHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Start transport negotiation. Returns `true` when this call
    /// initialized the connection, `false` when it already was.
    pub async fn init(
        &self,
        first_stream_id: &str,
        create_offer: Option<OfferConstraints>,
        offer_completed: Option<CompletionSender>,
    ) -> Result<bool, MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Init {
                first_stream_id: first_stream_id.to_string(),
                create_offer,
                offer_completed,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    /// Attach a media stream and register its event sink. Engine
    /// completion is reported through `completed` when provided.
    pub async fn attach_stream(
        &self,
        stream_id: &str,
        config: MediaStreamConfig,
        sink: mpsc::Sender<NegotiationEvent>,
        completed: Option<CompletionSender>,
    ) -> Result<(), MediaNodeError> {
        self.sender
            .send(ConnectionMessage::AttachStream {
                stream_id: stream_id.to_string(),
                config,
                sink,
                completed,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))
    }

    /// Detach a media stream. The removal result (including an
    /// abandoned renegotiation) is reported through `completed`.
    pub async fn detach_stream(
        &self,
        media_stream_id: &str,
        emit_after: bool,
        completed: Option<CompletionSender>,
    ) -> Result<(), MediaNodeError> {
        self.sender
            .send(ConnectionMessage::DetachStream {
                media_stream_id: media_stream_id.to_string(),
                emit_after,
                completed,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))
    }

    /// Apply a remote offer to the addressed media streams.
    pub async fn process_offer(
        &self,
        sdp: String,
        media_stream_ids: Vec<String>,
    ) -> Result<(), MediaNodeError> {
        self.sender
            .send(ConnectionMessage::ProcessOffer {
                sdp,
                media_stream_ids,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))
    }

    /// Apply a remote answer to the addressed media streams.
    pub async fn process_answer(
        &self,
        sdp: String,
        media_stream_ids: Vec<String>,
    ) -> Result<(), MediaNodeError> {
        self.sender
            .send(ConnectionMessage::ProcessAnswer {
                sdp,
                media_stream_ids,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))
    }

    /// Feed a trickled remote candidate to the transport.
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), MediaNodeError> {
        self.sender
            .send(ConnectionMessage::AddRemoteCandidate { candidate })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))
    }

    /// A receiver resolved once candidate gathering completes. The
    /// receiver errors out if the connection fails or closes first.
    pub async fn gathered_listener(&self) -> Result<oneshot::Receiver<()>, MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::AwaitGathered { respond_to: tx })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))
    }

    /// Render and emit one combined offer for a subscription batch.
    pub async fn emit_batch_offer(
        &self,
        stream_ids: Vec<String>,
        context: BatchContext,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::EmitOffer {
                stream_ids,
                context,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    /// Collect transport stats for one attached media stream.
    pub async fn stream_stats(
        &self,
        media_stream_id: &str,
    ) -> Result<serde_json::Value, MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::StreamStats {
                media_stream_id: media_stream_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    /// Close the transport session and stop the actor. Idempotent: a
    /// connection that already stopped counts as closed.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConnectionMessage::Close { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    /// Connection ID.
    connection_id: String,
    /// Owning client ID.
    client_id: String,
    /// Node configuration (address rewriting).
    config: Arc<Config>,
    /// Engine transport session, exclusively owned.
    session: Box<dyn TransportSession>,
    /// Negotiation lifecycle state.
    state: NegotiationState,
    /// Version stamped into the next emitted description.
    session_version: u64,
    /// Whether `init` already ran.
    initialized: bool,
    /// Creation-time settings.
    settings: ConnectionSettings,
    /// Whether init requested offer creation; forces offer kind on the
    /// gathering-complete emission.
    init_offer_requested: bool,
    /// Whether candidate gathering completed.
    gathered: bool,
    /// Whether an emitted offer is still waiting for its answer.
    negotiating: bool,
    /// Kind of the last remote description handed to the engine.
    last_remote_kind: Option<SdpKind>,
    /// Event sinks keyed by media stream id.
    sinks: HashMap<String, StreamSink>,
    /// Listeners resolved when gathering completes.
    gathered_waiters: Vec<oneshot::Sender<()>>,
    /// Message receiver.
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Engine event sender, handed to the session at init.
    events_tx: mpsc::Sender<TransportEvent>,
    /// Engine event receiver.
    events_rx: mpsc::Receiver<TransportEvent>,
    /// Cancellation token (child of the controller's token).
    cancel_token: CancellationToken,
    /// Shared metrics.
    metrics: Arc<NodeMetrics>,
}

impl ConnectionActor {
    /// Spawn a new connection actor around an engine session.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        client_id: String,
        session: Box<dyn TransportSession>,
        settings: ConnectionSettings,
        config: Arc<Config>,
        cancel_token: CancellationToken,
        metrics: Arc<NodeMetrics>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_BUFFER);

        let actor = Self {
            connection_id: connection_id.clone(),
            client_id: client_id.clone(),
            config,
            session,
            state: NegotiationState::Initial,
            session_version: 0,
            initialized: false,
            settings,
            init_offer_requested: false,
            gathered: false,
            negotiating: false,
            last_remote_kind: None,
            sinks: HashMap::new(),
            gathered_waiters: Vec::new(),
            receiver,
            events_tx,
            events_rx,
            cancel_token,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            sender,
            connection_id,
            client_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mn.actor.connection",
        fields(
            connection_id = %self.connection_id,
            client_id = %self.client_id
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            client_id = %self.client_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "mn.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close().await;
                    break;
                }

                message = self.receiver.recv() => {
                    match message {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "mn.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            self.graceful_close().await;
                            break;
                        }
                    }
                }

                event = self.events_rx.recv() => {
                    // The actor keeps an event sender clone, so this
                    // branch never observes a closed channel.
                    if let Some(event) = event {
                        self.handle_engine_event(event).await;
                    }
                }
            }
        }

        info!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            session_version = self.session_version,
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Init {
                first_stream_id,
                create_offer,
                offer_completed,
                respond_to,
            } => {
                let result = self
                    .handle_init(&first_stream_id, create_offer, offer_completed)
                    .await;
                let _ = respond_to.send(result);
                false
            }

            ConnectionMessage::AttachStream {
                stream_id,
                config,
                sink,
                completed,
            } => {
                self.handle_attach(stream_id, config, sink, completed);
                false
            }

            ConnectionMessage::DetachStream {
                media_stream_id,
                emit_after,
                completed,
            } => {
                let result = self.handle_detach(&media_stream_id, emit_after).await;
                if let Some(done) = completed {
                    let _ = done.send(result);
                }
                false
            }

            ConnectionMessage::ProcessOffer {
                sdp,
                media_stream_ids,
            } => {
                self.handle_remote_description(SdpKind::Offer, &sdp, &media_stream_ids);
                false
            }

            ConnectionMessage::ProcessAnswer {
                sdp,
                media_stream_ids,
            } => {
                // Receiving the answer settles the offer we emitted.
                self.negotiating = false;
                self.handle_remote_description(SdpKind::Answer, &sdp, &media_stream_ids);
                false
            }

            ConnectionMessage::AddRemoteCandidate { candidate } => {
                if let Err(error) = self.session.add_remote_candidate(&candidate) {
                    warn!(
                        target: "mn.connection",
                        connection_id = %self.connection_id,
                        %error,
                        "Engine rejected remote candidate"
                    );
                }
                false
            }

            ConnectionMessage::AwaitGathered { respond_to } => {
                let (tx, rx) = oneshot::channel();
                if self.gathered {
                    let _ = tx.send(());
                } else if self.state == NegotiationState::Failed {
                    // Dropping the sender makes the listener fail fast.
                    drop(tx);
                } else {
                    self.gathered_waiters.push(tx);
                }
                let _ = respond_to.send(rx);
                false
            }

            ConnectionMessage::EmitOffer {
                stream_ids,
                context,
                respond_to,
            } => {
                let result = self.handle_emit_offer(stream_ids, context).await;
                let _ = respond_to.send(result);
                false
            }

            ConnectionMessage::StreamStats {
                media_stream_id,
                respond_to,
            } => {
                let stats = self.session.stream_stats(&media_stream_id);
                tokio::spawn(async move {
                    let _ = respond_to.send(stats.await.map_err(MediaNodeError::from));
                });
                false
            }

            ConnectionMessage::Close { respond_to } => {
                self.graceful_close().await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    /// Initialize the transport session. Later calls report `false`
    /// without touching the engine again.
    async fn handle_init(
        &mut self,
        first_stream_id: &str,
        create_offer: Option<OfferConstraints>,
        offer_completed: Option<CompletionSender>,
    ) -> Result<bool, MediaNodeError> {
        if self.initialized {
            if let Some(done) = offer_completed {
                let _ = done.send(Ok(()));
            }
            return Ok(false);
        }
        self.initialized = true;

        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            first_stream_id,
            offer_mode = self.settings.offer_mode,
            trickle_ice = self.settings.trickle_ice,
            "Initializing transport session"
        );

        self.session.init(self.events_tx.clone())?;
        self.state = NegotiationState::Gathering;

        if let Some(constraints) = create_offer {
            self.init_offer_requested = true;
            debug!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                "Offer creation requested"
            );
            let offer = self.session.create_offer(constraints);
            let connection_id = self.connection_id.clone();
            tokio::spawn(async move {
                let result = offer.await.map_err(MediaNodeError::from);
                if let Err(ref error) = result {
                    warn!(
                        target: "mn.connection",
                        %connection_id,
                        %error,
                        "Offer creation failed"
                    );
                }
                if let Some(done) = offer_completed {
                    let _ = done.send(result);
                }
            });
        } else if let Some(done) = offer_completed {
            let _ = done.send(Ok(()));
        }

        self.broadcast(NegotiationEvent::Initializing {
            connection_id: self.connection_id.clone(),
        })
        .await;

        Ok(true)
    }

    /// Register the stream sink and hand the attach to the engine.
    fn handle_attach(
        &mut self,
        stream_id: String,
        config: MediaStreamConfig,
        sink: mpsc::Sender<NegotiationEvent>,
        completed: Option<CompletionSender>,
    ) {
        if self.sinks.contains_key(&config.media_stream_id) {
            debug!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                media_stream_id = %config.media_stream_id,
                "Media stream already attached"
            );
            if let Some(done) = completed {
                let _ = done.send(Ok(()));
            }
            return;
        }

        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            media_stream_id = %config.media_stream_id,
            label = %config.label,
            is_publisher = config.is_publisher,
            "Attaching media stream"
        );

        self.sinks.insert(
            config.media_stream_id.clone(),
            StreamSink {
                stream_id,
                label: config.label.clone(),
                sender: sink,
            },
        );

        let attach = self.session.add_stream(config);
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            let result = attach.await.map_err(MediaNodeError::from);
            if let Err(ref error) = result {
                warn!(
                    target: "mn.connection",
                    %connection_id,
                    %error,
                    "Attaching media stream failed"
                );
            }
            if let Some(done) = completed {
                let _ = done.send(result);
            }
        });
    }

    /// Remove a stream, wait for its label to leave the local
    /// description, and optionally emit the renegotiated offer.
    async fn handle_detach(
        &mut self,
        media_stream_id: &str,
        emit_after: bool,
    ) -> Result<(), MediaNodeError> {
        let Some(sink) = self.sinks.remove(media_stream_id) else {
            warn!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                media_stream_id,
                "Removing media stream not found"
            );
            return Ok(());
        };
        let label = sink.label;

        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            media_stream_id,
            stream_id = %sink.stream_id,
            %label,
            "Detaching media stream"
        );

        let removal = self.session.remove_stream(media_stream_id);
        {
            let connection_id = self.connection_id.clone();
            let media_stream_id = media_stream_id.to_string();
            tokio::spawn(async move {
                if let Err(error) = removal.await {
                    warn!(
                        target: "mn.connection",
                        %connection_id,
                        %media_stream_id,
                        %error,
                        "Engine stream removal failed"
                    );
                }
            });
        }

        for attempt in 1..=REMOVAL_RENEGOTIATION_RETRIES {
            let description = self.session.local_description()?;
            if !description.contains_label(&label) {
                if emit_after {
                    let session_version = self.session_version;
                    self.session_version += 1;
                    let sdp = self.rewrite_addresses(&description.sdp);
                    self.negotiating = true;
                    self.broadcast(NegotiationEvent::Sdp {
                        kind: SdpKind::Offer,
                        description: sdp,
                        session_version,
                        stream_ids: None,
                        context: None,
                    })
                    .await;
                }
                return Ok(());
            }
            debug!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                %label,
                attempt,
                "Local description still carries removed stream, retrying"
            );
            tokio::time::sleep(REMOVAL_RENEGOTIATION_RETRY_DELAY).await;
        }

        warn!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            %label,
            "Removed stream never left the local description, abandoning renegotiation"
        );
        self.metrics.record_negotiation_failed();
        Err(MediaNodeError::RenegotiationRace {
            connection_id: self.connection_id.clone(),
            label,
        })
    }

    /// Hand a remote description to the engine. Completion surfaces as
    /// an `SdpProcessed` engine event.
    fn handle_remote_description(&mut self, kind: SdpKind, sdp: &str, media_stream_ids: &[String]) {
        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            kind = ?kind,
            streams = media_stream_ids.len(),
            "Processing remote description"
        );
        self.last_remote_kind = Some(kind);
        let applied = self.session.set_remote_description(kind, sdp, media_stream_ids);
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            if let Err(error) = applied.await {
                warn!(
                    target: "mn.connection",
                    %connection_id,
                    %error,
                    "Applying remote description failed"
                );
            }
        });
    }

    /// Emit the combined offer for a subscription batch. Bypasses the
    /// emission gates: the caller already waited for gathering.
    async fn handle_emit_offer(
        &mut self,
        stream_ids: Vec<String>,
        context: BatchContext,
    ) -> Result<(), MediaNodeError> {
        let description = self.session.local_description()?;
        let session_version = self.session_version;
        self.session_version += 1;
        let sdp = self.rewrite_addresses(&description.sdp);
        self.negotiating = true;

        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            streams = stream_ids.len(),
            context = ?context,
            session_version,
            "Emitting combined offer"
        );

        self.broadcast(NegotiationEvent::Sdp {
            kind: SdpKind::Offer,
            description: sdp,
            session_version,
            stream_ids: Some(stream_ids),
            context: Some(context),
        })
        .await;
        Ok(())
    }

    /// React to one engine event.
    async fn handle_engine_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Started => {
                self.broadcast(NegotiationEvent::Started).await;
            }

            TransportEvent::DescriptionUpdated => {
                self.maybe_emit(false).await;
            }

            TransportEvent::SdpProcessed => {
                self.negotiating = false;
                // Answer the processed remote offer. A processed remote
                // answer completes the exchange, so nothing goes out.
                if self.last_remote_kind == Some(SdpKind::Offer) {
                    self.maybe_emit(false).await;
                }
            }

            TransportEvent::Gathered => {
                debug!(
                    target: "mn.connection",
                    connection_id = %self.connection_id,
                    "Candidate gathering completed"
                );
                self.gathered = true;
                if self.state == NegotiationState::Gathering {
                    self.state = NegotiationState::Gathered;
                }
                for waiter in self.gathered_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                self.maybe_emit(self.init_offer_requested).await;
            }

            TransportEvent::Candidate(mut candidate) => {
                candidate.candidate = self.rewrite_addresses(&candidate.candidate);
                self.broadcast(NegotiationEvent::Candidate { candidate }).await;
            }

            TransportEvent::Ready => {
                if self.state != NegotiationState::Ready {
                    debug!(
                        target: "mn.connection",
                        connection_id = %self.connection_id,
                        "Connection ready"
                    );
                    self.state = NegotiationState::Ready;
                    self.broadcast(NegotiationEvent::Ready).await;
                }
            }

            TransportEvent::Failed { message } => {
                warn!(
                    target: "mn.connection",
                    connection_id = %self.connection_id,
                    message = message.as_deref().unwrap_or(""),
                    "Transport negotiation failed"
                );
                self.state = NegotiationState::Failed;
                self.metrics.record_negotiation_failed();
                // Pending gathered listeners observe the failure as a
                // dropped sender.
                self.gathered_waiters.clear();
                self.broadcast(NegotiationEvent::Failed {
                    description: message,
                })
                .await;
            }

            TransportEvent::StreamEvent {
                media_stream_id,
                event,
            } => {
                self.handle_stream_event(&media_stream_id, event).await;
            }
        }
    }

    /// Route a stream-scoped engine event to the owning sink.
    async fn handle_stream_event(
        &mut self,
        media_stream_id: &str,
        event: crate::engine::MediaStreamEvent,
    ) {
        let Some(sink) = self.sinks.get(media_stream_id) else {
            debug!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                media_stream_id,
                "Dropping event for unknown media stream"
            );
            return;
        };
        match event {
            crate::engine::MediaStreamEvent::BandwidthAlert { message, bandwidth } => {
                let _ = sink
                    .sender
                    .send(NegotiationEvent::BandwidthAlert { message, bandwidth })
                    .await;
            }
        }
    }

    /// Emit the current local description when the gates allow it.
    async fn maybe_emit(&mut self, force_offer: bool) {
        if self.negotiating {
            return;
        }
        if !self.gathered && !self.settings.trickle_ice {
            return;
        }

        let kind = if self.settings.offer_mode || force_offer {
            SdpKind::Offer
        } else {
            SdpKind::Answer
        };

        let description = match self.session.local_description() {
            Ok(description) => description,
            Err(error) => {
                debug!(
                    target: "mn.connection",
                    connection_id = %self.connection_id,
                    %error,
                    "Local description unavailable, skipping emission"
                );
                return;
            }
        };

        let session_version = self.session_version;
        self.session_version += 1;
        let sdp = self.rewrite_addresses(&description.sdp);
        if kind == SdpKind::Offer {
            self.negotiating = true;
        }

        debug!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            kind = ?kind,
            session_version,
            "Emitting local description"
        );

        self.broadcast(NegotiationEvent::Sdp {
            kind,
            description: sdp,
            session_version,
            stream_ids: None,
            context: None,
        })
        .await;
    }

    /// Substitute the node's public address for private ones.
    fn rewrite_addresses(&self, text: &str) -> String {
        match &self.config.private_network_pattern {
            Some(pattern) => pattern
                .replace_all(text, self.config.public_ip.as_str())
                .into_owned(),
            None => text.to_string(),
        }
    }

    /// Deliver a connection-level event once per distinct sink channel.
    /// Streams attached by one batch share a reply channel and must not
    /// see the event multiplied.
    async fn broadcast(&self, event: NegotiationEvent) {
        let mut delivered: Vec<&mpsc::Sender<NegotiationEvent>> = Vec::new();
        for sink in self.sinks.values() {
            if delivered.iter().any(|s| s.same_channel(&sink.sender)) {
                continue;
            }
            let _ = sink.sender.send(event.clone()).await;
            delivered.push(&sink.sender);
        }
    }

    /// Detach the remaining streams and release the engine session.
    async fn graceful_close(&mut self) {
        if self.state == NegotiationState::Finished {
            return;
        }
        info!(
            target: "mn.connection",
            connection_id = %self.connection_id,
            remaining_streams = self.sinks.len(),
            "Closing connection"
        );
        self.state = NegotiationState::Finished;
        self.gathered_waiters.clear();

        for (media_stream_id, _sink) in self.sinks.drain() {
            debug!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                %media_stream_id,
                "Closing media stream"
            );
            let removal = self.session.remove_stream(&media_stream_id);
            tokio::spawn(async move {
                let _ = removal.await;
            });
        }

        if let Err(error) = self.session.close().await {
            debug!(
                target: "mn.connection",
                connection_id = %self.connection_id,
                %error,
                "Engine session close reported an error"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use std::collections::HashMap as StdHashMap;

    use tokio::time::{timeout, Duration as TokioDuration};

    use signaling_protocol::StreamCapabilities;

    use crate::engine::mock::{MockEngine, SessionCall};
    use crate::engine::{MediaEngine, TransportSessionConfig};

    fn test_config(vars: &[(&str, &str)]) -> Arc<Config> {
        let vars: StdHashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Arc::new(Config::from_vars(&vars).unwrap())
    }

    struct Harness {
        engine: MockEngine,
        handle: ConnectionHandle,
        task: JoinHandle<()>,
        metrics: Arc<NodeMetrics>,
        cancel: CancellationToken,
    }

    fn spawn_connection(engine: MockEngine, settings: ConnectionSettings) -> Harness {
        spawn_connection_with_config(engine, settings, test_config(&[]))
    }

    fn spawn_connection_with_config(
        engine: MockEngine,
        settings: ConnectionSettings,
        config: Arc<Config>,
    ) -> Harness {
        let session = engine
            .create_session(TransportSessionConfig {
                connection_id: "client-1_conn-1".to_string(),
                client_id: "client-1".to_string(),
                media_configuration: None,
                trickle_ice: settings.trickle_ice,
            })
            .unwrap();
        let metrics = NodeMetrics::new();
        let cancel = CancellationToken::new();
        let (handle, task) = ConnectionActor::spawn(
            "client-1_conn-1".to_string(),
            "client-1".to_string(),
            session,
            settings,
            config,
            cancel.clone(),
            Arc::clone(&metrics),
        );
        Harness {
            engine,
            handle,
            task,
            metrics,
            cancel,
        }
    }

    fn stream_config(media_stream_id: &str, label: &str) -> MediaStreamConfig {
        MediaStreamConfig {
            media_stream_id: media_stream_id.to_string(),
            label: label.to_string(),
            is_publisher: false,
            capabilities: StreamCapabilities::default(),
        }
    }

    async fn recv_event(rx: &mut mpsc::Receiver<NegotiationEvent>) -> NegotiationEvent {
        timeout(TokioDuration::from_secs(2), rx.recv())
            .await
            .expect("event wait timed out")
            .expect("event channel closed")
    }

    async fn assert_no_event(rx: &mut mpsc::Receiver<NegotiationEvent>) {
        // A closed channel means the sink was dropped; that also counts
        // as no event.
        match timeout(TokioDuration::from_millis(20), rx.recv()).await {
            Ok(Some(event)) => panic!("unexpected event: {event:?}"),
            Ok(None) | Err(_) => {}
        }
    }

    #[tokio::test]
    async fn test_init_runs_once_and_announces_itself() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, mut rx) = mpsc::channel(16);

        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1", "cam0"), tx, None)
            .await
            .unwrap();

        let first = harness.handle.init("stream-1", None, None).await.unwrap();
        assert!(first);
        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Initializing { ref connection_id } if connection_id == "client-1_conn-1"
        ));

        let second = harness.handle.init("stream-1", None, None).await.unwrap();
        assert!(!second);

        let recorder = harness.engine.last_session().unwrap();
        recorder.emit(TransportEvent::Started).await;
        assert_eq!(recv_event(&mut rx).await, NegotiationEvent::Started);

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reinit_resolves_the_offer_completion_immediately() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, _rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("stream-1", None, None).await.unwrap();

        let (offer_tx, offer_rx) = oneshot::channel();
        let initialized = harness
            .handle
            .init(
                "stream-1",
                Some(OfferConstraints {
                    audio: true,
                    video: true,
                    bundle: true,
                }),
                Some(offer_tx),
            )
            .await
            .unwrap();

        assert!(!initialized);
        assert!(offer_rx.await.unwrap().is_ok());

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_is_emitted_before_gathering_without_trickle() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("stream-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx).await; // initializing

        let recorder = harness.engine.last_session().unwrap();
        recorder.emit(TransportEvent::DescriptionUpdated).await;
        assert_no_event(&mut rx).await;

        recorder.emit(TransportEvent::Gathered).await;
        match recv_event(&mut rx).await {
            NegotiationEvent::Sdp {
                kind,
                session_version,
                ..
            } => {
                assert_eq!(kind, SdpKind::Answer);
                assert_eq!(session_version, 0);
            }
            other => panic!("expected sdp, got {other:?}"),
        }

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_mode_emits_early_and_forwards_candidates() {
        let harness = spawn_connection(
            MockEngine::new(),
            ConnectionSettings {
                offer_mode: false,
                trickle_ice: true,
            },
        );
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("stream-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx).await; // initializing

        let recorder = harness.engine.last_session().unwrap();
        recorder.emit(TransportEvent::DescriptionUpdated).await;
        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Sdp {
                session_version: 0,
                ..
            }
        ));

        recorder
            .emit(TransportEvent::Candidate(IceCandidate {
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                candidate: "candidate:1 1 udp 2122 10.0.0.7 40000 typ host".to_string(),
            }))
            .await;
        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Candidate { .. }
        ));

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offers_wait_for_their_answer_before_renegotiating() {
        let harness = spawn_connection(
            MockEngine::new(),
            ConnectionSettings {
                offer_mode: true,
                trickle_ice: true,
            },
        );
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("stream-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx).await; // initializing

        let recorder = harness.engine.last_session().unwrap();
        recorder.emit(TransportEvent::DescriptionUpdated).await;
        match recv_event(&mut rx).await {
            NegotiationEvent::Sdp {
                kind,
                session_version,
                ..
            } => {
                assert_eq!(kind, SdpKind::Offer);
                assert_eq!(session_version, 0);
            }
            other => panic!("expected offer, got {other:?}"),
        }

        // A second engine nudge while the offer is in flight stays quiet.
        recorder.emit(TransportEvent::DescriptionUpdated).await;
        assert_no_event(&mut rx).await;

        harness
            .handle
            .process_answer("v=0 answer".to_string(), vec!["stream-1".to_string()])
            .await
            .unwrap();
        recorder.emit(TransportEvent::SdpProcessed).await;
        assert_no_event(&mut rx).await;

        recorder.emit(TransportEvent::DescriptionUpdated).await;
        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Sdp {
                kind: SdpKind::Offer,
                session_version: 1,
                ..
            }
        ));

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_offers_are_answered_once_processed() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("stream-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx).await; // initializing

        let recorder = harness.engine.last_session().unwrap();
        recorder.emit(TransportEvent::Gathered).await;
        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Sdp {
                kind: SdpKind::Answer,
                session_version: 0,
                ..
            }
        ));

        harness
            .handle
            .process_offer("v=0 offer".to_string(), vec!["stream-1".to_string()])
            .await
            .unwrap();
        // process_offer is fire-and-forget; wait for the engine to see
        // the offer before confirming it was processed.
        while !recorder
            .calls()
            .contains(&SessionCall::SetRemoteDescription(SdpKind::Offer))
        {
            tokio::time::sleep(TokioDuration::from_millis(5)).await;
        }
        recorder.emit(TransportEvent::SdpProcessed).await;
        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Sdp {
                kind: SdpKind::Answer,
                session_version: 1,
                ..
            }
        ));

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_emits_an_offer_reflecting_the_removal() {
        let harness = spawn_connection(
            MockEngine::new(),
            ConnectionSettings {
                offer_mode: false,
                trickle_ice: true,
            },
        );
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("stream-1_client-1", "cam0"), tx1, None)
            .await
            .unwrap();
        harness
            .handle
            .attach_stream("stream-2", stream_config("stream-2_client-1", "cam1"), tx2, None)
            .await
            .unwrap();
        harness
            .handle
            .init("stream-1_client-1", None, None)
            .await
            .unwrap();
        let _ = recv_event(&mut rx1).await;
        let _ = recv_event(&mut rx2).await;

        let (done_tx, done_rx) = oneshot::channel();
        harness
            .handle
            .detach_stream("stream-1_client-1", true, Some(done_tx))
            .await
            .unwrap();
        done_rx.await.unwrap().unwrap();

        // The detached stream's sink is gone; the offer reaches the
        // remaining stream.
        match recv_event(&mut rx2).await {
            NegotiationEvent::Sdp { kind, .. } => assert_eq!(kind, SdpKind::Offer),
            other => panic!("expected offer, got {other:?}"),
        }
        assert_no_event(&mut rx1).await;

        let recorder = harness.engine.last_session().unwrap();
        assert!(recorder
            .calls()
            .contains(&SessionCall::RemoveStream("stream-1_client-1".to_string())));

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_waits_for_the_engine_before_emitting() {
        let (engine, gate) = MockEngine::gated();
        let harness = spawn_connection(
            engine,
            ConnectionSettings {
                offer_mode: false,
                trickle_ice: true,
            },
        );
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx.clone(), None)
            .await
            .unwrap();
        harness
            .handle
            .attach_stream("stream-2", stream_config("ms-2", "cam1"), tx, None)
            .await
            .unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        harness
            .handle
            .detach_stream("ms-1", true, Some(done_tx))
            .await
            .unwrap();

        // Release the engine while the actor is still retrying.
        tokio::time::sleep(TokioDuration::from_millis(120)).await;
        gate.send(true).unwrap();

        done_rx.await.unwrap().unwrap();
        match recv_event(&mut rx).await {
            NegotiationEvent::Sdp { kind, .. } => assert_eq!(kind, SdpKind::Offer),
            other => panic!("expected offer, got {other:?}"),
        }

        drop(gate);
        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_removal_abandons_the_renegotiation() {
        let (engine, gate) = MockEngine::gated();
        let harness = spawn_connection(engine, ConnectionSettings::default());
        let (tx, _rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx, None)
            .await
            .unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        harness
            .handle
            .detach_stream("ms-1", true, Some(done_tx))
            .await
            .unwrap();

        let result = done_rx.await.unwrap();
        assert!(matches!(
            result,
            Err(MediaNodeError::RenegotiationRace { ref label, .. }) if label == "cam0"
        ));
        assert_eq!(harness.metrics.snapshot().negotiations_failed, 1);

        // The sink is gone regardless; a second detach is a miss.
        let (again_tx, again_rx) = oneshot::channel();
        harness
            .handle
            .detach_stream("ms-1", true, Some(again_tx))
            .await
            .unwrap();
        assert!(again_rx.await.unwrap().is_ok());

        drop(gate);
        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_offers_carry_stream_ids_and_context() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx, None)
            .await
            .unwrap();

        harness
            .handle
            .emit_batch_offer(
                vec!["stream-1".to_string(), "stream-2".to_string()],
                BatchContext::AutoStreamsSubscription,
            )
            .await
            .unwrap();

        match recv_event(&mut rx).await {
            NegotiationEvent::Sdp {
                kind,
                session_version,
                stream_ids,
                context,
                ..
            } => {
                assert_eq!(kind, SdpKind::Offer);
                assert_eq!(session_version, 0);
                assert_eq!(
                    stream_ids,
                    Some(vec!["stream-1".to_string(), "stream-2".to_string()])
                );
                assert_eq!(context, Some(BatchContext::AutoStreamsSubscription));
            }
            other => panic!("expected combined offer, got {other:?}"),
        }

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_gathered_listeners_resolve_in_both_orders() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, _rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("ms-1", None, None).await.unwrap();

        let early = harness.handle.gathered_listener().await.unwrap();
        let recorder = harness.engine.last_session().unwrap();
        recorder.emit(TransportEvent::Gathered).await;
        early.await.unwrap();

        let late = harness.handle.gathered_listener().await.unwrap();
        late.await.unwrap();

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reports_and_drops_gathered_listeners() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("ms-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx).await; // initializing

        let listener = harness.handle.gathered_listener().await.unwrap();
        let recorder = harness.engine.last_session().unwrap();
        recorder
            .emit(TransportEvent::Failed {
                message: Some("ice failed".to_string()),
            })
            .await;

        assert!(matches!(
            recv_event(&mut rx).await,
            NegotiationEvent::Failed {
                description: Some(ref message)
            } if message == "ice failed"
        ));
        assert!(listener.await.is_err());
        assert_eq!(harness.metrics.snapshot().negotiations_failed, 1);

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bandwidth_alerts_reach_only_the_owning_stream() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx1, None)
            .await
            .unwrap();
        harness
            .handle
            .attach_stream("stream-2", stream_config("ms-2", "cam1"), tx2, None)
            .await
            .unwrap();
        harness.handle.init("ms-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx1).await;
        let _ = recv_event(&mut rx2).await;

        let recorder = harness.engine.last_session().unwrap();
        recorder
            .emit(TransportEvent::StreamEvent {
                media_stream_id: "ms-2".to_string(),
                event: crate::engine::MediaStreamEvent::BandwidthAlert {
                    message: "insufficient".to_string(),
                    bandwidth: 80_000,
                },
            })
            .await;

        assert!(matches!(
            recv_event(&mut rx2).await,
            NegotiationEvent::BandwidthAlert { bandwidth: 80_000, .. }
        ));
        assert_no_event(&mut rx1).await;

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_candidates_are_rewritten_to_the_public_address() {
        let config = test_config(&[
            ("MN_PUBLIC_IP", "198.51.100.4"),
            ("MN_PRIVATE_NET_PATTERN", r"10\.\d+\.\d+\.\d+"),
        ]);
        let harness = spawn_connection_with_config(
            MockEngine::new(),
            ConnectionSettings {
                offer_mode: false,
                trickle_ice: true,
            },
            config,
        );
        let (tx, mut rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx, None)
            .await
            .unwrap();
        harness.handle.init("ms-1", None, None).await.unwrap();
        let _ = recv_event(&mut rx).await; // initializing

        let recorder = harness.engine.last_session().unwrap();
        recorder
            .emit(TransportEvent::Candidate(IceCandidate {
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                candidate: "candidate:1 1 udp 2122 10.0.0.7 40000 typ host".to_string(),
            }))
            .await;

        match recv_event(&mut rx).await {
            NegotiationEvent::Candidate { candidate } => {
                assert!(candidate.candidate.contains("198.51.100.4"));
                assert!(!candidate.candidate.contains("10.0.0.7"));
            }
            other => panic!("expected candidate, got {other:?}"),
        }

        harness.handle.close().await;
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_the_session_and_is_idempotent() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        let (tx, _rx) = mpsc::channel(16);
        harness
            .handle
            .attach_stream("stream-1", stream_config("ms-1", "cam0"), tx, None)
            .await
            .unwrap();

        harness.handle.close().await;
        harness.task.await.unwrap();

        let recorder = harness.engine.last_session().unwrap();
        assert!(recorder.is_closed());
        assert!(recorder.calls().contains(&SessionCall::Close));

        // The actor is gone; a second close resolves without error.
        harness.handle.close().await;
    }

    #[tokio::test]
    async fn test_cancellation_closes_the_session() {
        let harness = spawn_connection(MockEngine::new(), ConnectionSettings::default());
        harness.cancel.cancel();
        harness.task.await.unwrap();

        let recorder = harness.engine.last_session().unwrap();
        assert!(recorder.is_closed());
    }
}
