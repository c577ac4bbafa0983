//! Traits over the native media-forwarding engine.
//!
//! The engine owns ICE/DTLS/SRTP and packet relay; this crate only
//! drives it. Completion-style operations return owned futures
//! (`BoxFuture<'static, _>`) resolved by the engine on its own threads,
//! so actor loops can hand them to continuation tasks and join several
//! of them without blocking their mailboxes. Status changes arrive on
//! the event channel wired at [`TransportSession::init`].

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use signaling_protocol::{
    ExternalOutputOptions, IceCandidate, OfferConstraints, SdpKind, StreamCapabilities,
};

/// Failures reported by the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine rejected the operation: {0}")]
    Rejected(String),

    #[error("engine session already closed")]
    SessionClosed,
}

/// Parameters for creating a transport session.
#[derive(Debug, Clone)]
pub struct TransportSessionConfig {
    pub connection_id: String,
    pub client_id: String,
    pub media_configuration: Option<String>,
    pub trickle_ice: bool,
}

/// Parameters for attaching one media stream to a transport session.
#[derive(Debug, Clone)]
pub struct MediaStreamConfig {
    pub media_stream_id: String,
    pub label: String,
    pub is_publisher: bool,
    pub capabilities: StreamCapabilities,
}

/// Snapshot of the session's current local description. The control
/// plane treats the SDP text as opaque but uses the label list to detect
/// removal races during renegotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalDescription {
    pub sdp: String,
    pub stream_labels: Vec<String>,
}

impl LocalDescription {
    #[must_use]
    pub fn contains_label(&self, label: &str) -> bool {
        self.stream_labels.iter().any(|l| l == label)
    }
}

/// Events a transport session pushes to its owning connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The session finished initializing.
    Started,
    /// The local description changed and may be (re)emitted.
    DescriptionUpdated,
    /// A previously applied remote description was fully processed.
    SdpProcessed,
    /// ICE candidate gathering completed.
    Gathered,
    /// One gathered local candidate (trickle mode).
    Candidate(IceCandidate),
    /// The connection is established end to end.
    Ready,
    /// ICE or DTLS failed.
    Failed { message: Option<String> },
    /// Event scoped to one attached media stream.
    StreamEvent {
        media_stream_id: String,
        event: MediaStreamEvent,
    },
}

/// Per-stream engine notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaStreamEvent {
    /// Subscriber bandwidth dropped below the stream's configured
    /// minimum.
    BandwidthAlert { message: String, bandwidth: u64 },
}

/// One negotiating transport context. Owned exclusively by a connection
/// actor; `&mut self` everywhere.
pub trait TransportSession: Send + Sync {
    /// Wire the event channel and start the session. Idempotent calls
    /// are an engine error.
    fn init(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), EngineError>;

    /// Ask the engine to produce a local offer.
    fn create_offer(
        &mut self,
        constraints: OfferConstraints,
    ) -> BoxFuture<'static, Result<(), EngineError>>;

    /// Attach a media stream. The future resolves when the engine has
    /// finished wiring it.
    fn add_stream(
        &mut self,
        config: MediaStreamConfig,
    ) -> BoxFuture<'static, Result<(), EngineError>>;

    /// Detach a media stream.
    fn remove_stream(
        &mut self,
        media_stream_id: &str,
    ) -> BoxFuture<'static, Result<(), EngineError>>;

    /// Snapshot the current local description.
    fn local_description(&self) -> Result<LocalDescription, EngineError>;

    /// Apply a remote offer or answer covering the given streams.
    fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: &str,
        media_stream_ids: &[String],
    ) -> BoxFuture<'static, Result<(), EngineError>>;

    /// Feed one trickled remote candidate.
    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError>;

    /// Collect stats for one attached stream.
    fn stream_stats(
        &self,
        media_stream_id: &str,
    ) -> BoxFuture<'static, Result<serde_json::Value, EngineError>>;

    /// Release the session. Idempotent.
    fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>>;
}

/// The fan-out point distributing one published stream to subscribers
/// and external outputs.
pub trait StreamFanout: Send {
    fn set_source(&mut self, media_stream_id: &str) -> Result<(), EngineError>;
    fn add_subscriber(
        &mut self,
        subscriber_client_id: &str,
        media_stream_id: &str,
    ) -> Result<(), EngineError>;
    fn remove_subscriber(&mut self, subscriber_client_id: &str) -> Result<(), EngineError>;
    fn add_output(&mut self, url: &str) -> Result<(), EngineError>;
    fn remove_output(&mut self, url: &str) -> Result<(), EngineError>;
    fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>>;
}

/// A URL-addressed media source standing in for a transport connection.
pub trait ExternalInput: Send {
    fn init(&mut self) -> BoxFuture<'static, Result<(), EngineError>>;
    fn stats(&self) -> BoxFuture<'static, Result<serde_json::Value, EngineError>>;
    fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>>;
}

/// A URL-addressed consumer attached to a fan-out point (recorder,
/// relay).
pub trait ExternalOutput: Send {
    fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>>;
}

/// Factory for engine-side objects.
pub trait MediaEngine: Send + Sync {
    fn create_session(
        &self,
        config: TransportSessionConfig,
    ) -> Result<Box<dyn TransportSession>, EngineError>;

    fn create_fanout(&self, stream_id: &str) -> Result<Box<dyn StreamFanout>, EngineError>;

    fn create_external_input(&self, url: &str) -> Result<Box<dyn ExternalInput>, EngineError>;

    fn create_external_output(
        &self,
        url: &str,
        options: &ExternalOutputOptions,
    ) -> Result<Box<dyn ExternalOutput>, EngineError>;
}

/// Scriptable in-memory engine for tests.
pub mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::sync::watch;

    use super::*;

    /// Calls observed on a mock session.
    #[derive(Debug, Clone, PartialEq)]
    pub enum SessionCall {
        Init,
        CreateOffer,
        AddStream(String),
        RemoveStream(String),
        SetRemoteDescription(SdpKind),
        AddRemoteCandidate(String),
        Close,
    }

    /// Calls observed on a mock fan-out.
    #[derive(Debug, Clone, PartialEq)]
    pub enum FanoutCall {
        SetSource(String),
        AddSubscriber(String),
        RemoveSubscriber(String),
        AddOutput(String),
        RemoveOutput(String),
        Close,
    }

    /// Shared recorder for one mock transport session; tests hold the
    /// `Arc` and drive events through it.
    pub struct SessionRecorder {
        pub connection_id: String,
        events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        calls: Mutex<Vec<SessionCall>>,
        description: Mutex<LocalDescription>,
        labels: Mutex<std::collections::HashMap<String, String>>,
        stats: Mutex<serde_json::Value>,
        closed: AtomicBool,
    }

    impl SessionRecorder {
        fn new(connection_id: String) -> Self {
            Self {
                connection_id,
                events: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                description: Mutex::new(LocalDescription {
                    sdp: "v=0 mock".to_string(),
                    stream_labels: Vec::new(),
                }),
                labels: Mutex::new(std::collections::HashMap::new()),
                stats: Mutex::new(serde_json::json!({ "bitrate": 0 })),
                closed: AtomicBool::new(false),
            }
        }

        /// Push an engine event into the owning connection actor.
        pub async fn emit(&self, event: TransportEvent) {
            let sender = self.events.lock().ok().and_then(|e| e.clone());
            if let Some(sender) = sender {
                let _ = sender.send(event).await;
            }
        }

        pub fn calls(&self) -> Vec<SessionCall> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        /// Label the stream was attached under, if it was attached.
        pub fn stream_label(&self, media_stream_id: &str) -> Option<String> {
            self.labels
                .lock()
                .ok()
                .and_then(|labels| labels.get(media_stream_id).cloned())
        }

        pub fn set_local_description(&self, description: LocalDescription) {
            if let Ok(mut current) = self.description.lock() {
                *current = description;
            }
        }

        pub fn set_stats(&self, stats: serde_json::Value) {
            if let Ok(mut current) = self.stats.lock() {
                *current = stats;
            }
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn record(&self, call: SessionCall) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    /// Shared recorder for one mock fan-out.
    pub struct FanoutRecorder {
        pub stream_id: String,
        calls: Mutex<Vec<FanoutCall>>,
        closed: AtomicBool,
    }

    impl FanoutRecorder {
        pub fn calls(&self) -> Vec<FanoutCall> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn subscriber_count(&self) -> usize {
            self.calls()
                .iter()
                .fold(0_usize, |count, call| match call {
                    FanoutCall::AddSubscriber(_) => count + 1,
                    FanoutCall::RemoveSubscriber(_) => count.saturating_sub(1),
                    _ => count,
                })
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn record(&self, call: FanoutCall) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    /// Recorder shared by mock external inputs and outputs.
    pub struct EndpointRecorder {
        pub url: String,
        closed: AtomicBool,
    }

    impl EndpointRecorder {
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct MockState {
        sessions: Mutex<Vec<Arc<SessionRecorder>>>,
        fanouts: Mutex<Vec<Arc<FanoutRecorder>>>,
        inputs: Mutex<Vec<Arc<EndpointRecorder>>>,
        outputs: Mutex<Vec<Arc<EndpointRecorder>>>,
        gate: Option<watch::Receiver<bool>>,
    }

    /// Mock engine. By default every completion future resolves
    /// immediately; [`MockEngine::gated`] holds them until the returned
    /// gate is opened, so tests can assert ordering around joins.
    pub struct MockEngine {
        state: Arc<MockState>,
    }

    impl Default for MockEngine {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEngine {
        #[must_use]
        pub fn new() -> Self {
            Self {
                state: Arc::new(MockState {
                    sessions: Mutex::new(Vec::new()),
                    fanouts: Mutex::new(Vec::new()),
                    inputs: Mutex::new(Vec::new()),
                    outputs: Mutex::new(Vec::new()),
                    gate: None,
                }),
            }
        }

        /// An engine whose completion futures wait until `true` is sent
        /// on the returned gate.
        #[must_use]
        pub fn gated() -> (Self, watch::Sender<bool>) {
            let (tx, rx) = watch::channel(false);
            let engine = Self {
                state: Arc::new(MockState {
                    sessions: Mutex::new(Vec::new()),
                    fanouts: Mutex::new(Vec::new()),
                    inputs: Mutex::new(Vec::new()),
                    outputs: Mutex::new(Vec::new()),
                    gate: Some(rx),
                }),
            };
            (engine, tx)
        }

        pub fn sessions(&self) -> Vec<Arc<SessionRecorder>> {
            self.state.sessions.lock().map(|s| s.clone()).unwrap_or_default()
        }

        pub fn fanouts(&self) -> Vec<Arc<FanoutRecorder>> {
            self.state.fanouts.lock().map(|f| f.clone()).unwrap_or_default()
        }

        pub fn inputs(&self) -> Vec<Arc<EndpointRecorder>> {
            self.state.inputs.lock().map(|i| i.clone()).unwrap_or_default()
        }

        pub fn outputs(&self) -> Vec<Arc<EndpointRecorder>> {
            self.state.outputs.lock().map(|o| o.clone()).unwrap_or_default()
        }

        /// The recorder for the most recently created session.
        pub fn last_session(&self) -> Option<Arc<SessionRecorder>> {
            self.sessions().last().cloned()
        }
    }

    fn gated_ok(gate: Option<watch::Receiver<bool>>) -> BoxFuture<'static, Result<(), EngineError>> {
        Box::pin(async move {
            if let Some(mut rx) = gate {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
            Ok(())
        })
    }

    struct MockSession {
        recorder: Arc<SessionRecorder>,
        gate: Option<watch::Receiver<bool>>,
    }

    impl TransportSession for MockSession {
        fn init(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), EngineError> {
            self.recorder.record(SessionCall::Init);
            if let Ok(mut slot) = self.recorder.events.lock() {
                *slot = Some(events);
            }
            Ok(())
        }

        fn create_offer(
            &mut self,
            _constraints: OfferConstraints,
        ) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.record(SessionCall::CreateOffer);
            gated_ok(self.gate.clone())
        }

        fn add_stream(
            &mut self,
            config: MediaStreamConfig,
        ) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.record(SessionCall::AddStream(config.media_stream_id.clone()));
            if let Ok(mut description) = self.recorder.description.lock() {
                description.stream_labels.push(config.label.clone());
            }
            if let Ok(mut labels) = self.recorder.labels.lock() {
                labels.insert(config.media_stream_id, config.label);
            }
            gated_ok(self.gate.clone())
        }

        fn remove_stream(
            &mut self,
            media_stream_id: &str,
        ) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.record(SessionCall::RemoveStream(media_stream_id.to_string()));
            let recorder = Arc::clone(&self.recorder);
            let media_stream_id = media_stream_id.to_string();
            let gate = self.gate.clone();
            // Labels leave the local description only once the engine has
            // finished the removal, so gated engines exercise the
            // renegotiation retry path.
            Box::pin(async move {
                if let Some(mut rx) = gate {
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
                let label = recorder
                    .labels
                    .lock()
                    .ok()
                    .and_then(|mut labels| labels.remove(&media_stream_id));
                if let (Some(label), Ok(mut description)) = (label, recorder.description.lock()) {
                    description.stream_labels.retain(|l| l != &label);
                }
                Ok(())
            })
        }

        fn local_description(&self) -> Result<LocalDescription, EngineError> {
            self.recorder
                .description
                .lock()
                .map(|d| d.clone())
                .map_err(|_| EngineError::SessionClosed)
        }

        fn set_remote_description(
            &mut self,
            kind: SdpKind,
            _sdp: &str,
            _media_stream_ids: &[String],
        ) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.record(SessionCall::SetRemoteDescription(kind));
            gated_ok(self.gate.clone())
        }

        fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError> {
            self.recorder
                .record(SessionCall::AddRemoteCandidate(candidate.candidate.clone()));
            Ok(())
        }

        fn stream_stats(
            &self,
            _media_stream_id: &str,
        ) -> BoxFuture<'static, Result<serde_json::Value, EngineError>> {
            let stats = self
                .recorder
                .stats
                .lock()
                .map(|s| s.clone())
                .unwrap_or(serde_json::Value::Null);
            Box::pin(async move { Ok(stats) })
        }

        fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.record(SessionCall::Close);
            self.recorder.closed.store(true, Ordering::SeqCst);
            gated_ok(self.gate.clone())
        }
    }

    struct MockFanout {
        recorder: Arc<FanoutRecorder>,
        gate: Option<watch::Receiver<bool>>,
    }

    impl StreamFanout for MockFanout {
        fn set_source(&mut self, media_stream_id: &str) -> Result<(), EngineError> {
            self.recorder.record(FanoutCall::SetSource(media_stream_id.to_string()));
            Ok(())
        }

        fn add_subscriber(
            &mut self,
            subscriber_client_id: &str,
            _media_stream_id: &str,
        ) -> Result<(), EngineError> {
            self.recorder
                .record(FanoutCall::AddSubscriber(subscriber_client_id.to_string()));
            Ok(())
        }

        fn remove_subscriber(&mut self, subscriber_client_id: &str) -> Result<(), EngineError> {
            self.recorder
                .record(FanoutCall::RemoveSubscriber(subscriber_client_id.to_string()));
            Ok(())
        }

        fn add_output(&mut self, url: &str) -> Result<(), EngineError> {
            self.recorder.record(FanoutCall::AddOutput(url.to_string()));
            Ok(())
        }

        fn remove_output(&mut self, url: &str) -> Result<(), EngineError> {
            self.recorder.record(FanoutCall::RemoveOutput(url.to_string()));
            Ok(())
        }

        fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.record(FanoutCall::Close);
            self.recorder.closed.store(true, Ordering::SeqCst);
            gated_ok(self.gate.clone())
        }
    }

    struct MockEndpoint {
        recorder: Arc<EndpointRecorder>,
        gate: Option<watch::Receiver<bool>>,
    }

    impl ExternalInput for MockEndpoint {
        fn init(&mut self) -> BoxFuture<'static, Result<(), EngineError>> {
            gated_ok(self.gate.clone())
        }

        fn stats(&self) -> BoxFuture<'static, Result<serde_json::Value, EngineError>> {
            Box::pin(async move { Ok(serde_json::json!({ "source": "external" })) })
        }

        fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.closed.store(true, Ordering::SeqCst);
            gated_ok(self.gate.clone())
        }
    }

    impl ExternalOutput for MockEndpoint {
        fn close(&mut self) -> BoxFuture<'static, Result<(), EngineError>> {
            self.recorder.closed.store(true, Ordering::SeqCst);
            gated_ok(self.gate.clone())
        }
    }

    impl MediaEngine for MockEngine {
        fn create_session(
            &self,
            config: TransportSessionConfig,
        ) -> Result<Box<dyn TransportSession>, EngineError> {
            let recorder = Arc::new(SessionRecorder::new(config.connection_id));
            if let Ok(mut sessions) = self.state.sessions.lock() {
                sessions.push(Arc::clone(&recorder));
            }
            Ok(Box::new(MockSession {
                recorder,
                gate: self.state.gate.clone(),
            }))
        }

        fn create_fanout(&self, stream_id: &str) -> Result<Box<dyn StreamFanout>, EngineError> {
            let recorder = Arc::new(FanoutRecorder {
                stream_id: stream_id.to_string(),
                calls: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            if let Ok(mut fanouts) = self.state.fanouts.lock() {
                fanouts.push(Arc::clone(&recorder));
            }
            Ok(Box::new(MockFanout {
                recorder,
                gate: self.state.gate.clone(),
            }))
        }

        fn create_external_input(&self, url: &str) -> Result<Box<dyn ExternalInput>, EngineError> {
            let recorder = Arc::new(EndpointRecorder {
                url: url.to_string(),
                closed: AtomicBool::new(false),
            });
            if let Ok(mut inputs) = self.state.inputs.lock() {
                inputs.push(Arc::clone(&recorder));
            }
            Ok(Box::new(MockEndpoint {
                recorder,
                gate: self.state.gate.clone(),
            }))
        }

        fn create_external_output(
            &self,
            url: &str,
            _options: &ExternalOutputOptions,
        ) -> Result<Box<dyn ExternalOutput>, EngineError> {
            let recorder = Arc::new(EndpointRecorder {
                url: url.to_string(),
                closed: AtomicBool::new(false),
            });
            if let Ok(mut outputs) = self.state.outputs.lock() {
                outputs.push(Arc::clone(&recorder));
            }
            Ok(Box::new(MockEndpoint {
                recorder,
                gate: self.state.gate.clone(),
            }))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::mock::{MockEngine, SessionCall};
    use super::*;

    #[tokio::test]
    async fn test_mock_session_delivers_events_after_init() {
        let engine = MockEngine::new();
        let mut session = engine
            .create_session(TransportSessionConfig {
                connection_id: "conn-1".to_string(),
                client_id: "client-1".to_string(),
                media_configuration: None,
                trickle_ice: false,
            })
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        session.init(tx).unwrap();

        let recorder = engine.last_session().unwrap();
        recorder.emit(TransportEvent::Started).await;

        assert_eq!(rx.recv().await, Some(TransportEvent::Started));
        assert_eq!(recorder.calls(), vec![SessionCall::Init]);
    }

    #[tokio::test]
    async fn test_gated_engine_holds_completions_until_released() {
        let (engine, gate) = MockEngine::gated();
        let mut session = engine
            .create_session(TransportSessionConfig {
                connection_id: "conn-1".to_string(),
                client_id: "client-1".to_string(),
                media_configuration: None,
                trickle_ice: false,
            })
            .unwrap();

        let mut completion = session.add_stream(MediaStreamConfig {
            media_stream_id: "ms-1".to_string(),
            label: "cam0".to_string(),
            is_publisher: true,
            capabilities: StreamCapabilities::default(),
        });

        assert!(futures::poll!(&mut completion).is_pending());

        gate.send(true).unwrap();
        assert_eq!(completion.await, Ok(()));
    }

    #[test]
    fn test_local_description_tracks_added_labels() {
        let engine = MockEngine::new();
        let mut session = engine
            .create_session(TransportSessionConfig {
                connection_id: "conn-1".to_string(),
                client_id: "client-1".to_string(),
                media_configuration: None,
                trickle_ice: false,
            })
            .unwrap();

        drop(session.add_stream(MediaStreamConfig {
            media_stream_id: "ms-1".to_string(),
            label: "cam0".to_string(),
            is_publisher: true,
            capabilities: StreamCapabilities::default(),
        }));

        let description = session.local_description().unwrap();
        assert!(description.contains_label("cam0"));
        assert!(!description.contains_label("cam1"));
    }
}
