//! Publisher/subscriber registry and the actor that owns it.
//!
//! The controller actor is the only writer of the publisher and client
//! maps. Handlers mutate the registries synchronously and push engine
//! work onto spawned continuation tasks so the mailbox stays responsive.
//! Detach messages are sent from inside the handler, which keeps them
//! ordered ahead of any later attach on the same connection mailbox;
//! continuation tasks only ever await completion receivers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use signaling_protocol::{
    BatchContext, ControlError, ErrorReason, ExternalOutputOptions, MediaNodeControl,
    NegotiationEvent, NegotiationMessage, OfferConstraints, PublishOptions, StatsSink,
    StreamAddress, StreamStatsReport, SubscribeOptions,
};

use crate::actors::connection::{ConnectionHandle, ConnectionSettings};
use crate::actors::messages::ControllerMessage;
use crate::client::ClientSession;
use crate::config::Config;
use crate::engine::{MediaEngine, MediaStreamConfig};
use crate::errors::MediaNodeError;
use crate::lifecycle::{NodeLifecycle, ShutdownReason};
use crate::metrics::NodeMetrics;
use crate::publisher::{PublisherRecord, PublisherSource, SubscriberRecord};
use crate::stats::StatsScheduler;
use crate::uptime::UptimeWatchdog;

const CONTROLLER_CHANNEL_BUFFER: usize = 500;

/// Clonable handle to the controller actor. Implements
/// [`MediaNodeControl`] for in-process deployments.
#[derive(Clone)]
pub struct MediaNodeControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
}

impl MediaNodeControllerHandle {
    pub async fn add_publisher(
        &self,
        client_id: &str,
        stream_id: &str,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::AddPublisher {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                options,
                updates,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn add_external_input(
        &self,
        client_id: &str,
        stream_id: &str,
        url: &str,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::AddExternalInput {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                url: url.to_string(),
                options,
                updates,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn add_external_output(
        &self,
        stream_id: &str,
        url: &str,
        options: ExternalOutputOptions,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::AddExternalOutput {
                stream_id: stream_id.to_string(),
                url: url.to_string(),
                options,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn remove_external_output(
        &self,
        stream_id: &str,
        url: &str,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemoveExternalOutput {
                stream_id: stream_id.to_string(),
                url: url.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn add_subscriber(
        &self,
        client_id: &str,
        stream_id: &str,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::AddSubscriber {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                options,
                updates,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn add_multiple_subscribers(
        &self,
        client_id: &str,
        stream_ids: &[String],
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::AddMultipleSubscribers {
                client_id: client_id.to_string(),
                stream_ids: stream_ids.to_vec(),
                options,
                updates,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn remove_multiple_subscribers(
        &self,
        client_id: &str,
        stream_ids: &[String],
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemoveMultipleSubscribers {
                client_id: client_id.to_string(),
                stream_ids: stream_ids.to_vec(),
                updates,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn remove_publisher(
        &self,
        client_id: &str,
        stream_id: &str,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemovePublisher {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn remove_subscriber(
        &self,
        client_id: &str,
        stream_id: &str,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemoveSubscriber {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn remove_subscriptions(&self, client_id: &str) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemoveSubscriptions {
                client_id: client_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn process_signaling(
        &self,
        client_id: &str,
        address: StreamAddress,
        message: NegotiationMessage,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::ProcessSignaling {
                client_id: client_id.to_string(),
                address,
                message,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn get_stream_stats(
        &self,
        stream_id: &str,
    ) -> Result<StreamStatsReport, MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStreamStats {
                stream_id: stream_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }

    pub async fn subscribe_to_stats(
        &self,
        stream_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), MediaNodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::SubscribeToStats {
                stream_id: stream_id.to_string(),
                timeout,
                interval,
                respond_to: tx,
            })
            .await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| MediaNodeError::ChannelClosed(format!("response receive failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl MediaNodeControl for MediaNodeControllerHandle {
    async fn add_publisher(
        &self,
        client_id: &str,
        stream_id: &str,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError> {
        Self::add_publisher(self, client_id, stream_id, options, updates)
            .await
            .map_err(ControlError::from)
    }

    async fn add_external_input(
        &self,
        client_id: &str,
        stream_id: &str,
        url: &str,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError> {
        Self::add_external_input(self, client_id, stream_id, url, options, updates)
            .await
            .map_err(ControlError::from)
    }

    async fn add_external_output(
        &self,
        stream_id: &str,
        url: &str,
        options: ExternalOutputOptions,
    ) -> Result<(), ControlError> {
        Self::add_external_output(self, stream_id, url, options)
            .await
            .map_err(ControlError::from)
    }

    async fn remove_external_output(
        &self,
        stream_id: &str,
        url: &str,
    ) -> Result<(), ControlError> {
        Self::remove_external_output(self, stream_id, url)
            .await
            .map_err(ControlError::from)
    }

    async fn add_subscriber(
        &self,
        client_id: &str,
        stream_id: &str,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError> {
        Self::add_subscriber(self, client_id, stream_id, options, updates)
            .await
            .map_err(ControlError::from)
    }

    async fn add_multiple_subscribers(
        &self,
        client_id: &str,
        stream_ids: &[String],
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError> {
        Self::add_multiple_subscribers(self, client_id, stream_ids, options, updates)
            .await
            .map_err(ControlError::from)
    }

    async fn remove_multiple_subscribers(
        &self,
        client_id: &str,
        stream_ids: &[String],
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), ControlError> {
        Self::remove_multiple_subscribers(self, client_id, stream_ids, updates)
            .await
            .map_err(ControlError::from)
    }

    async fn remove_publisher(&self, client_id: &str, stream_id: &str) -> Result<(), ControlError> {
        Self::remove_publisher(self, client_id, stream_id)
            .await
            .map_err(ControlError::from)
    }

    async fn remove_subscriber(
        &self,
        client_id: &str,
        stream_id: &str,
    ) -> Result<(), ControlError> {
        Self::remove_subscriber(self, client_id, stream_id)
            .await
            .map_err(ControlError::from)
    }

    async fn remove_subscriptions(&self, client_id: &str) -> Result<(), ControlError> {
        Self::remove_subscriptions(self, client_id)
            .await
            .map_err(ControlError::from)
    }

    async fn process_signaling(
        &self,
        client_id: &str,
        address: StreamAddress,
        message: NegotiationMessage,
    ) -> Result<(), ControlError> {
        Self::process_signaling(self, client_id, address, message)
            .await
            .map_err(ControlError::from)
    }

    async fn get_stream_stats(&self, stream_id: &str) -> Result<StreamStatsReport, ControlError> {
        Self::get_stream_stats(self, stream_id)
            .await
            .map_err(ControlError::from)
    }

    async fn subscribe_to_stats(
        &self,
        stream_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), ControlError> {
        Self::subscribe_to_stats(self, stream_id, timeout, interval)
            .await
            .map_err(ControlError::from)
    }
}

/// The actor owning this node's publishers, clients, and stats
/// subscriptions.
pub struct MediaNodeControllerActor {
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
    publishers: HashMap<String, PublisherRecord>,
    clients: HashMap<String, ClientSession>,
    stats: StatsScheduler,
    uptime: UptimeWatchdog,
    lifecycle: NodeLifecycle,
    metrics: Arc<NodeMetrics>,
    receiver: mpsc::Receiver<ControllerMessage>,
    self_sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl MediaNodeControllerActor {
    pub fn spawn(
        config: Arc<Config>,
        engine: Arc<dyn MediaEngine>,
        stats_sink: Arc<dyn StatsSink>,
        lifecycle: NodeLifecycle,
        metrics: Arc<NodeMetrics>,
    ) -> (MediaNodeControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let stats = StatsScheduler::new(&config, stats_sink, sender.clone(), Arc::clone(&metrics));
        let uptime = UptimeWatchdog::new(&config, lifecycle.clone());
        let cancel_token = lifecycle.child_token();

        let actor = Self {
            config,
            engine,
            publishers: HashMap::new(),
            clients: HashMap::new(),
            stats,
            uptime,
            lifecycle,
            metrics,
            receiver,
            self_sender: sender.clone(),
            cancel_token,
        };
        let task = tokio::spawn(actor.run());
        (MediaNodeControllerHandle { sender }, task)
    }

    #[instrument(skip_all, name = "mn.actor.controller", fields(node_id = %self.config.node_id))]
    async fn run(mut self) {
        debug!(target: "mn.controller", "Controller actor started");
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "mn.controller", "Controller actor cancelled");
                    break;
                }
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            debug!(target: "mn.controller", "Controller channel closed");
                            break;
                        }
                    }
                }
            }
        }
        self.graceful_shutdown().await;
        debug!(target: "mn.controller", "Controller actor stopped");
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::AddPublisher {
                client_id,
                stream_id,
                options,
                updates,
                respond_to,
            } => {
                let result = self
                    .handle_add_publisher(client_id, stream_id, options, updates)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::AddExternalInput {
                client_id,
                stream_id,
                url,
                options,
                updates,
                respond_to,
            } => {
                let result =
                    self.handle_add_external_input(client_id, stream_id, url, options, updates);
                let _ = respond_to.send(result);
            }
            ControllerMessage::AddExternalOutput {
                stream_id,
                url,
                options,
                respond_to,
            } => {
                let result = self.handle_add_external_output(stream_id, url, &options);
                let _ = respond_to.send(result);
            }
            ControllerMessage::RemoveExternalOutput {
                stream_id,
                url,
                respond_to,
            } => {
                let result = self.handle_remove_external_output(&stream_id, &url);
                let _ = respond_to.send(result);
            }
            ControllerMessage::AddSubscriber {
                client_id,
                stream_id,
                options,
                updates,
                respond_to,
            } => {
                let result = self
                    .handle_add_subscriber(client_id, stream_id, options, updates)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::AddMultipleSubscribers {
                client_id,
                stream_ids,
                options,
                updates,
                respond_to,
            } => {
                let result = self
                    .handle_add_multiple_subscribers(client_id, stream_ids, options, updates)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::RemoveMultipleSubscribers {
                client_id,
                stream_ids,
                updates,
                respond_to,
            } => {
                let result = self
                    .handle_remove_multiple_subscribers(client_id, stream_ids, updates)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::RemovePublisher {
                client_id,
                stream_id,
                respond_to,
            } => {
                self.handle_remove_publisher(client_id, stream_id, respond_to)
                    .await;
            }
            ControllerMessage::RemoveSubscriber {
                client_id,
                stream_id,
                respond_to,
            } => {
                let result = self.handle_remove_subscriber(&client_id, &stream_id).await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::RemoveSubscriptions {
                client_id,
                respond_to,
            } => {
                let result = self.handle_remove_subscriptions(&client_id).await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::ProcessSignaling {
                client_id,
                address,
                message,
                respond_to,
            } => {
                let result = self
                    .handle_process_signaling(client_id, address, message)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::GetStreamStats {
                stream_id,
                respond_to,
            } => self.handle_get_stream_stats(stream_id, respond_to),
            ControllerMessage::SubscribeToStats {
                stream_id,
                timeout,
                interval,
                respond_to,
            } => {
                let result = self.handle_subscribe_to_stats(&stream_id, timeout, interval);
                let _ = respond_to.send(result);
            }
            ControllerMessage::PublisherTeardownFinished { stream_id } => {
                self.handle_publisher_teardown_finished(&stream_id);
            }
            ControllerMessage::StatsSubscriptionExpired {
                stream_id,
                generation,
            } => self.stats.finished(&stream_id, generation),
        }
    }

    async fn handle_add_publisher(
        &mut self,
        client_id: String,
        stream_id: String,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        if self.publishers.contains_key(&stream_id) {
            warn!(
                target: "mn.controller",
                %stream_id,
                %client_id,
                "Stream already has a publisher, ignoring"
            );
            return Ok(());
        }

        info!(
            target: "mn.controller",
            %stream_id,
            %client_id,
            single_pc = options.single_pc,
            "Adding publisher"
        );

        let fanout = self.engine.create_fanout(&stream_id)?;

        let settings = ConnectionSettings {
            offer_mode: options.create_offer.is_some(),
            trickle_ice: options.trickle_ice,
        };
        let client = Self::get_or_create_client(
            &mut self.clients,
            &self.metrics,
            &client_id,
            options.single_pc,
        );
        let connection = match client.get_or_create_connection(
            &self.engine,
            settings,
            options.media_configuration.as_deref(),
            &self.config,
            &self.cancel_token,
            &self.metrics,
        ) {
            Ok(connection) => connection,
            Err(error) => {
                Self::drop_client_if_empty(&mut self.clients, &self.metrics, &client_id);
                return Err(error);
            }
        };
        client.stream_attached(connection.connection_id());
        let connection_id = connection.connection_id().to_string();

        connection
            .attach_stream(
                &stream_id,
                MediaStreamConfig {
                    media_stream_id: stream_id.clone(),
                    label: options.label.clone(),
                    is_publisher: true,
                    capabilities: options.capabilities,
                },
                updates.clone(),
                None,
            )
            .await?;

        let initialized_now = connection
            .init(&stream_id, options.create_offer, None)
            .await?;
        if !initialized_now {
            // The shared connection already announced itself; repeat the
            // announcement for this stream's listener.
            let _ = updates
                .send(NegotiationEvent::Initializing { connection_id })
                .await;
        }

        let record = match PublisherRecord::new(
            &stream_id,
            &client_id,
            &options.label,
            options.attributes,
            PublisherSource::Connection {
                handle: connection.clone(),
            },
            fanout,
        ) {
            Ok(record) => record,
            Err(error) => {
                self.detach_quietly(&connection, &stream_id, &client_id)
                    .await;
                return Err(error);
            }
        };
        self.publishers.insert(stream_id, record);
        self.metrics.publisher_created();
        Ok(())
    }

    fn handle_add_external_input(
        &mut self,
        client_id: String,
        stream_id: String,
        url: String,
        options: PublishOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        if self.publishers.contains_key(&stream_id) {
            warn!(
                target: "mn.controller",
                %stream_id,
                %client_id,
                "Stream already has a publisher, ignoring"
            );
            return Ok(());
        }

        info!(target: "mn.controller", %stream_id, %url, "Adding external input publisher");

        let mut input = self.engine.create_external_input(&url)?;
        let startup = input.init();
        let fanout = self.engine.create_fanout(&stream_id)?;
        let record = PublisherRecord::new(
            &stream_id,
            &client_id,
            &options.label,
            options.attributes,
            PublisherSource::ExternalInput { input },
            fanout,
        )?;
        self.publishers.insert(stream_id.clone(), record);
        self.metrics.publisher_created();

        tokio::spawn(async move {
            match startup.await {
                Ok(()) => {
                    let _ = updates.send(NegotiationEvent::Ready).await;
                }
                Err(error) => {
                    warn!(
                        target: "mn.controller",
                        %stream_id,
                        %error,
                        "External input failed to start"
                    );
                    let _ = updates
                        .send(NegotiationEvent::Failed {
                            description: Some(error.to_string()),
                        })
                        .await;
                }
            }
        });
        Ok(())
    }

    fn handle_add_external_output(
        &mut self,
        stream_id: String,
        url: String,
        options: &ExternalOutputOptions,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        match self.publishers.get(&stream_id) {
            None => return Err(MediaNodeError::PublisherNotFound(stream_id)),
            Some(publisher) if publisher.has_output(&url) => {
                warn!(target: "mn.controller", %stream_id, %url, "External output already attached");
                return Err(MediaNodeError::OutputExists { stream_id, url });
            }
            Some(_) => {}
        }

        let output = self.engine.create_external_output(&url, options)?;
        if let Some(publisher) = self.publishers.get_mut(&stream_id) {
            publisher.add_output(&url, output)?;
        }
        info!(target: "mn.controller", %stream_id, %url, "External output attached");
        Ok(())
    }

    fn handle_remove_external_output(
        &mut self,
        stream_id: &str,
        url: &str,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        match self
            .publishers
            .get_mut(stream_id)
            .and_then(|publisher| publisher.remove_output(url))
        {
            Some(mut output) => {
                info!(target: "mn.controller", stream_id, url, "External output detached");
                tokio::spawn(async move {
                    if let Err(error) = output.close().await {
                        warn!(target: "mn.controller", %error, "External output close failed");
                    }
                });
            }
            None => debug!(
                target: "mn.controller",
                stream_id,
                url,
                "External output not found, nothing to remove"
            ),
        }
        Ok(())
    }

    async fn handle_add_subscriber(
        &mut self,
        client_id: String,
        stream_id: String,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        let (publisher_label, already_subscribed) = match self.publishers.get(&stream_id) {
            Some(publisher) => (
                publisher.label().to_string(),
                publisher.has_subscriber(&client_id),
            ),
            None => {
                warn!(
                    target: "mn.controller",
                    %stream_id,
                    %client_id,
                    "Subscribe to an unknown stream ignored"
                );
                return Ok(());
            }
        };

        if already_subscribed {
            debug!(
                target: "mn.controller",
                %stream_id,
                %client_id,
                "Resubscription, tearing down the previous record first"
            );
            if let Some(completion) = self.teardown_subscriber(&stream_id, &client_id, true).await {
                tokio::spawn(async move {
                    if let Ok(Err(error)) = completion.await {
                        warn!(
                            target: "mn.controller",
                            %error,
                            "Previous subscription teardown reported an error"
                        );
                    }
                });
            }
        }

        debug!(target: "mn.controller", %stream_id, %client_id, "Adding subscriber");

        let settings = ConnectionSettings {
            offer_mode: false,
            trickle_ice: options.trickle_ice,
        };
        let client = Self::get_or_create_client(
            &mut self.clients,
            &self.metrics,
            &client_id,
            options.single_pc,
        );
        let connection = match client.get_or_create_connection(
            &self.engine,
            settings,
            options.media_configuration.as_deref(),
            &self.config,
            &self.cancel_token,
            &self.metrics,
        ) {
            Ok(connection) => connection,
            Err(error) => {
                Self::drop_client_if_empty(&mut self.clients, &self.metrics, &client_id);
                return Err(error);
            }
        };
        client.stream_attached(connection.connection_id());
        let connection_id = connection.connection_id().to_string();

        let record = SubscriberRecord::new(&client_id, &stream_id, connection.clone());
        let media_stream_id = record.media_stream_id.clone();
        // Subscribers always negotiate under the publisher's label so
        // the SDP on both legs names the same stream.
        let label = publisher_label;

        connection
            .attach_stream(
                &stream_id,
                MediaStreamConfig {
                    media_stream_id: media_stream_id.clone(),
                    label,
                    is_publisher: false,
                    capabilities: options.capabilities,
                },
                updates.clone(),
                None,
            )
            .await?;

        match self.publishers.get_mut(&stream_id) {
            Some(publisher) => {
                if let Err(error) = publisher.add_subscriber(record) {
                    self.detach_quietly(&connection, &media_stream_id, &client_id)
                        .await;
                    return Err(error);
                }
            }
            None => {
                self.detach_quietly(&connection, &media_stream_id, &client_id)
                    .await;
                return Err(MediaNodeError::PublisherNotFound(stream_id));
            }
        }
        self.metrics.subscriber_created();

        let initialized_now = connection.init(&media_stream_id, None, None).await?;
        if !initialized_now {
            let _ = updates
                .send(NegotiationEvent::Initializing { connection_id })
                .await;
        }
        Ok(())
    }

    async fn handle_add_multiple_subscribers(
        &mut self,
        client_id: String,
        stream_ids: Vec<String>,
        options: SubscribeOptions,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        let retained: Vec<String> = stream_ids
            .iter()
            .filter(|stream_id| {
                self.publishers
                    .get(stream_id.as_str())
                    .is_some_and(|publisher| !publisher.has_subscriber(&client_id))
            })
            .cloned()
            .collect();

        if retained.is_empty() {
            debug!(
                target: "mn.controller",
                %client_id,
                requested = stream_ids.len(),
                "Batch subscription matched no streams"
            );
            let _ = updates
                .send(NegotiationEvent::Error {
                    reason: ErrorReason::NoMatchingStreams,
                })
                .await;
            return Ok(());
        }

        if !options.single_pc {
            warn!(
                target: "mn.controller",
                %client_id,
                "Batch subscription without a shared connection, negotiating anyway"
            );
        }

        info!(
            target: "mn.controller",
            %client_id,
            streams = retained.len(),
            "Adding subscription batch"
        );

        let settings = ConnectionSettings {
            offer_mode: false,
            trickle_ice: options.trickle_ice,
        };
        let client = Self::get_or_create_client(
            &mut self.clients,
            &self.metrics,
            &client_id,
            options.single_pc,
        );
        let connection = match client.get_or_create_connection(
            &self.engine,
            settings,
            options.media_configuration.as_deref(),
            &self.config,
            &self.cancel_token,
            &self.metrics,
        ) {
            Ok(connection) => connection,
            Err(error) => {
                Self::drop_client_if_empty(&mut self.clients, &self.metrics, &client_id);
                return Err(error);
            }
        };
        let connection_id = connection.connection_id().to_string();

        let mut added = Vec::with_capacity(retained.len());
        let mut attach_completions = Vec::with_capacity(retained.len());
        for stream_id in &retained {
            let Some(publisher) = self.publishers.get_mut(stream_id) else {
                continue;
            };
            let record = SubscriberRecord::new(&client_id, stream_id, connection.clone());
            let media_stream_id = record.media_stream_id.clone();
            let label = publisher.label().to_string();
            if let Err(error) = publisher.add_subscriber(record) {
                warn!(
                    target: "mn.controller",
                    %stream_id,
                    %error,
                    "Fan-out rejected a batch subscriber, skipping the stream"
                );
                continue;
            }
            let (tx, rx) = oneshot::channel();
            connection
                .attach_stream(
                    stream_id,
                    MediaStreamConfig {
                        media_stream_id,
                        label,
                        is_publisher: false,
                        capabilities: options.capabilities,
                    },
                    updates.clone(),
                    Some(tx),
                )
                .await?;
            attach_completions.push(rx);
            self.metrics.subscriber_created();
            added.push(stream_id.clone());
        }

        if let Some(client) = self.clients.get_mut(&client_id) {
            for _ in 0..added.len() {
                client.stream_attached(&connection_id);
            }
        }

        let Some(first_added) = added.first() else {
            let _ = updates
                .send(NegotiationEvent::Error {
                    reason: ErrorReason::InitializationFailed,
                })
                .await;
            return Ok(());
        };
        let first_media_stream_id = format!("{first_added}_{client_id}");

        let (offer_tx, offer_rx) = oneshot::channel();
        let constraints = OfferConstraints {
            audio: true,
            video: true,
            bundle: true,
        };
        connection
            .init(&first_media_stream_id, Some(constraints), Some(offer_tx))
            .await?;
        let gathered = connection.gathered_listener().await?;

        let batch_connection = connection.clone();
        let batch_ids = added;
        tokio::spawn(async move {
            for result in join_all(attach_completions).await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(
                            target: "mn.controller",
                            %error,
                            "Batch media stream setup failed, abandoning the combined offer"
                        );
                        let _ = updates
                            .send(NegotiationEvent::Error {
                                reason: ErrorReason::InitializationFailed,
                            })
                            .await;
                        return;
                    }
                    Err(_) => return,
                }
            }
            match offer_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(target: "mn.controller", %error, "Batch offer creation failed");
                    let _ = updates
                        .send(NegotiationEvent::Error {
                            reason: ErrorReason::InitializationFailed,
                        })
                        .await;
                    return;
                }
                Err(_) => return,
            }
            if gathered.await.is_err() {
                debug!(
                    target: "mn.controller",
                    "Connection failed before gathering, dropping the batch offer"
                );
                return;
            }
            let _ = updates
                .send(NegotiationEvent::MultipleInitializing {
                    stream_ids: batch_ids.clone(),
                    context: BatchContext::AutoStreamsSubscription,
                })
                .await;
            if let Err(error) = batch_connection
                .emit_batch_offer(batch_ids, BatchContext::AutoStreamsSubscription)
                .await
            {
                warn!(target: "mn.controller", %error, "Combined offer emission failed");
            }
        });
        Ok(())
    }

    async fn handle_remove_multiple_subscribers(
        &mut self,
        client_id: String,
        stream_ids: Vec<String>,
        updates: mpsc::Sender<NegotiationEvent>,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        let mut removed = Vec::with_capacity(stream_ids.len());
        let mut completions = Vec::with_capacity(stream_ids.len());
        let mut batch_connection = None;
        for stream_id in &stream_ids {
            let connection = self
                .publishers
                .get(stream_id)
                .and_then(|publisher| publisher.subscriber(&client_id))
                .map(|subscriber| subscriber.connection.clone());
            let Some(connection) = connection else {
                continue;
            };
            if let Some(completion) = self.teardown_subscriber(stream_id, &client_id, false).await {
                completions.push(completion);
                removed.push(stream_id.clone());
                batch_connection = Some(connection);
            }
        }

        if removed.is_empty() {
            debug!(target: "mn.controller", %client_id, "Batch unsubscribe matched no streams");
            let _ = updates
                .send(NegotiationEvent::Error {
                    reason: ErrorReason::NoMatchingStreams,
                })
                .await;
            return Ok(());
        }

        info!(
            target: "mn.controller",
            %client_id,
            streams = removed.len(),
            "Removing subscription batch"
        );

        let Some(connection) = batch_connection else {
            return Ok(());
        };
        let gathered = match connection.gathered_listener().await {
            Ok(listener) => listener,
            Err(error) => {
                debug!(
                    target: "mn.controller",
                    %error,
                    "Connection closed before the removal offer"
                );
                return Ok(());
            }
        };
        tokio::spawn(async move {
            for result in join_all(completions).await {
                if let Ok(Err(error)) = result {
                    warn!(
                        target: "mn.controller",
                        %error,
                        "Batch unsubscribe teardown reported an error"
                    );
                }
            }
            if gathered.await.is_err() {
                debug!(
                    target: "mn.controller",
                    "Connection failed before gathering, dropping the removal offer"
                );
                return;
            }
            if let Err(error) = connection
                .emit_batch_offer(removed, BatchContext::AutoStreamsUnsubscription)
                .await
            {
                warn!(target: "mn.controller", %error, "Removal offer emission failed");
            }
        });
        Ok(())
    }

    async fn handle_remove_publisher(
        &mut self,
        client_id: String,
        stream_id: String,
        respond_to: oneshot::Sender<Result<(), MediaNodeError>>,
    ) {
        self.uptime.record_operation();

        let Some(mut record) = self.publishers.remove(&stream_id) else {
            debug!(target: "mn.controller", %stream_id, "Publisher not found, nothing to remove");
            let _ = respond_to.send(Ok(()));
            return;
        };

        info!(
            target: "mn.controller",
            %stream_id,
            %client_id,
            subscribers = record.subscriber_count(),
            "Removing publisher"
        );

        let mut subscriber_completions = Vec::with_capacity(record.subscriber_count());
        for subscriber in record.drain_subscribers() {
            let (tx, rx) = oneshot::channel();
            if subscriber
                .connection
                .detach_stream(&subscriber.media_stream_id, true, Some(tx))
                .await
                .is_err()
            {
                debug!(
                    target: "mn.controller",
                    client_id = %subscriber.client_id,
                    "Subscriber connection already gone"
                );
            }
            subscriber_completions.push(rx);
            self.metrics.subscribers_removed(1);
            if let Some(released) = Self::release_stream(
                &mut self.clients,
                &self.metrics,
                &subscriber.client_id,
                subscriber.connection.connection_id(),
            ) {
                tokio::spawn(async move {
                    released.close().await;
                });
            }
        }

        let mut source_completion = None;
        let mut source_release = None;
        if let Some(handle) = record.connection() {
            let (tx, rx) = oneshot::channel();
            if handle
                .detach_stream(&stream_id, true, Some(tx))
                .await
                .is_err()
            {
                debug!(target: "mn.controller", %stream_id, "Publisher connection already gone");
            }
            source_completion = Some(rx);
            source_release = Self::release_stream(
                &mut self.clients,
                &self.metrics,
                record.client_id(),
                handle.connection_id(),
            );
        }

        let outputs = record.drain_outputs();
        let engine_teardown = record.close();
        self.metrics.publisher_removed();

        let self_sender = self.self_sender.clone();
        tokio::spawn(async move {
            for result in join_all(subscriber_completions).await {
                if let Ok(Err(error)) = result {
                    warn!(
                        target: "mn.controller",
                        %error,
                        "Subscriber teardown reported an error"
                    );
                }
            }
            for (url, mut output) in outputs {
                if let Err(error) = output.close().await {
                    warn!(target: "mn.controller", %url, %error, "External output close failed");
                }
            }
            if let Some(completion) = source_completion {
                if let Ok(Err(error)) = completion.await {
                    warn!(
                        target: "mn.controller",
                        %error,
                        "Publisher teardown reported an error"
                    );
                }
            }
            if let Some(connection) = source_release {
                connection.close().await;
            }
            if let Err(error) = engine_teardown.await {
                warn!(target: "mn.controller", %error, "Engine teardown failed");
            }
            let _ = respond_to.send(Ok(()));
            let _ = self_sender
                .send(ControllerMessage::PublisherTeardownFinished { stream_id })
                .await;
        });
    }

    async fn handle_remove_subscriber(
        &mut self,
        client_id: &str,
        stream_id: &str,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        match self.teardown_subscriber(stream_id, client_id, true).await {
            Some(completion) => {
                debug!(target: "mn.controller", stream_id, client_id, "Removing subscriber");
                tokio::spawn(async move {
                    if let Ok(Err(error)) = completion.await {
                        warn!(
                            target: "mn.controller",
                            %error,
                            "Subscriber teardown reported an error"
                        );
                    }
                });
            }
            None => debug!(
                target: "mn.controller",
                stream_id,
                client_id,
                "Subscription not found, nothing to remove"
            ),
        }
        Ok(())
    }

    async fn handle_remove_subscriptions(
        &mut self,
        client_id: &str,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        let stream_ids: Vec<String> = self
            .publishers
            .iter()
            .filter(|(_, publisher)| publisher.has_subscriber(client_id))
            .map(|(stream_id, _)| stream_id.clone())
            .collect();

        debug!(
            target: "mn.controller",
            client_id,
            streams = stream_ids.len(),
            "Removing every subscription of the client"
        );

        for stream_id in stream_ids {
            if let Some(completion) = self.teardown_subscriber(&stream_id, client_id, false).await {
                tokio::spawn(async move {
                    if let Ok(Err(error)) = completion.await {
                        warn!(
                            target: "mn.controller",
                            %error,
                            "Subscription teardown reported an error"
                        );
                    }
                });
            }
        }
        Ok(())
    }

    async fn handle_process_signaling(
        &mut self,
        client_id: String,
        address: StreamAddress,
        message: NegotiationMessage,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        match address {
            StreamAddress::Single(stream_id) => {
                let Some(publisher) = self.publishers.get(&stream_id) else {
                    debug!(
                        target: "mn.controller",
                        %stream_id,
                        "Signaling for an unknown stream dropped"
                    );
                    return Ok(());
                };
                if publisher.client_id() == client_id {
                    let Some(connection) = publisher.connection() else {
                        debug!(
                            target: "mn.controller",
                            %stream_id,
                            "Signaling for an external input dropped"
                        );
                        return Ok(());
                    };
                    let connection = connection.clone();
                    return Self::forward_signaling(&connection, message, vec![stream_id]).await;
                }
                let Some(subscriber) = publisher.subscriber(&client_id) else {
                    debug!(
                        target: "mn.controller",
                        %stream_id,
                        %client_id,
                        "Signaling without a subscription dropped"
                    );
                    return Ok(());
                };
                let connection = subscriber.connection.clone();
                let media_stream_id = subscriber.media_stream_id.clone();
                Self::forward_signaling(&connection, message, vec![media_stream_id]).await
            }
            StreamAddress::Batch(stream_ids) => {
                let mut media_stream_ids = Vec::with_capacity(stream_ids.len());
                let mut connection = None;
                for stream_id in &stream_ids {
                    if let Some(subscriber) = self
                        .publishers
                        .get(stream_id)
                        .and_then(|publisher| publisher.subscriber(&client_id))
                    {
                        media_stream_ids.push(subscriber.media_stream_id.clone());
                        connection = Some(subscriber.connection.clone());
                    }
                }
                let Some(connection) = connection else {
                    debug!(
                        target: "mn.controller",
                        %client_id,
                        "Batch signaling matched no subscriptions"
                    );
                    return Ok(());
                };
                // One shared connection carries the whole batch; forward
                // the message once with every addressed media stream.
                Self::forward_signaling(&connection, message, media_stream_ids).await
            }
        }
    }

    fn handle_get_stream_stats(
        &mut self,
        stream_id: String,
        respond_to: oneshot::Sender<Result<StreamStatsReport, MediaNodeError>>,
    ) {
        self.uptime.record_operation();

        let Some(publisher) = self.publishers.get(&stream_id) else {
            let _ = respond_to.send(Err(MediaNodeError::PublisherNotFound(stream_id)));
            return;
        };

        let source_stats = publisher.source_stats();
        let mut subscriber_ids = Vec::with_capacity(publisher.subscriber_count());
        let mut subscriber_stats = Vec::with_capacity(publisher.subscriber_count());
        for subscriber in publisher.subscribers() {
            let connection = subscriber.connection.clone();
            let media_stream_id = subscriber.media_stream_id.clone();
            subscriber_ids.push(subscriber.client_id.clone());
            subscriber_stats.push(async move { connection.stream_stats(&media_stream_id).await });
        }

        tokio::spawn(async move {
            let publisher = match source_stats.await {
                Ok(stats) => stats,
                Err(error) => {
                    let _ = respond_to.send(Err(error));
                    return;
                }
            };
            let mut subscribers = HashMap::new();
            for (subscriber_client_id, result) in subscriber_ids
                .into_iter()
                .zip(join_all(subscriber_stats).await)
            {
                match result {
                    Ok(stats) => {
                        subscribers.insert(subscriber_client_id, stats);
                    }
                    Err(error) => debug!(
                        target: "mn.controller",
                        client_id = %subscriber_client_id,
                        %error,
                        "Subscriber stats unavailable, omitting"
                    ),
                }
            }
            let _ = respond_to.send(Ok(StreamStatsReport {
                stream_id,
                publisher,
                subscribers,
                collected_at: Utc::now(),
            }));
        });
    }

    fn handle_subscribe_to_stats(
        &mut self,
        stream_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), MediaNodeError> {
        self.uptime.record_operation();

        if !self.publishers.contains_key(stream_id) {
            return Err(MediaNodeError::PublisherNotFound(stream_id.to_string()));
        }
        let _ = self.stats.subscribe(stream_id, timeout, interval);
        Ok(())
    }

    fn handle_publisher_teardown_finished(&mut self, stream_id: &str) {
        debug!(target: "mn.controller", stream_id, "Publisher teardown finished");
        if self.publishers.is_empty() {
            info!(
                target: "mn.controller",
                "Last publisher removed, requesting node shutdown"
            );
            self.lifecycle
                .request_shutdown(ShutdownReason::PublishersDrained);
        }
    }

    fn get_or_create_client<'a>(
        clients: &'a mut HashMap<String, ClientSession>,
        metrics: &NodeMetrics,
        client_id: &str,
        single_pc: bool,
    ) -> &'a mut ClientSession {
        match clients.entry(client_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(target: "mn.controller", client_id, single_pc, "Creating client session");
                metrics.client_created();
                entry.insert(ClientSession::new(client_id, single_pc))
            }
        }
    }

    fn drop_client_if_empty(
        clients: &mut HashMap<String, ClientSession>,
        metrics: &NodeMetrics,
        client_id: &str,
    ) {
        if clients
            .get(client_id)
            .is_some_and(|client| client.connection_count() == 0)
        {
            clients.remove(client_id);
            metrics.client_removed();
        }
    }

    /// Record one stream leaving its connection and drop the client
    /// record once its last connection is gone. Returns the handle of a
    /// dedicated connection that should now close.
    fn release_stream(
        clients: &mut HashMap<String, ClientSession>,
        metrics: &NodeMetrics,
        client_id: &str,
        connection_id: &str,
    ) -> Option<ConnectionHandle> {
        let client = clients.get_mut(client_id)?;
        let released = client.stream_detached(connection_id);
        if client.connection_count() == 0 {
            debug!(target: "mn.controller", client_id, "Client session emptied, removing");
            clients.remove(client_id);
            metrics.client_removed();
        }
        released
    }

    /// Remove the subscription record, send its detach, and release the
    /// connection bookkeeping. Returns the detach completion receiver,
    /// or `None` when no such subscription exists.
    async fn teardown_subscriber(
        &mut self,
        stream_id: &str,
        client_id: &str,
        emit_after: bool,
    ) -> Option<oneshot::Receiver<Result<(), MediaNodeError>>> {
        let record = self
            .publishers
            .get_mut(stream_id)?
            .remove_subscriber(client_id)?;
        self.metrics.subscribers_removed(1);

        let (tx, rx) = oneshot::channel();
        if record
            .connection
            .detach_stream(&record.media_stream_id, emit_after, Some(tx))
            .await
            .is_err()
        {
            debug!(
                target: "mn.controller",
                stream_id,
                client_id,
                "Connection already gone during unsubscribe"
            );
        }
        if let Some(released) = Self::release_stream(
            &mut self.clients,
            &self.metrics,
            client_id,
            record.connection.connection_id(),
        ) {
            tokio::spawn(async move {
                released.close().await;
            });
        }
        Some(rx)
    }

    /// Undo a half-finished stream setup without renegotiating.
    async fn detach_quietly(
        &mut self,
        connection: &ConnectionHandle,
        media_stream_id: &str,
        client_id: &str,
    ) {
        let (tx, _rx) = oneshot::channel();
        let _ = connection
            .detach_stream(media_stream_id, false, Some(tx))
            .await;
        if let Some(released) = Self::release_stream(
            &mut self.clients,
            &self.metrics,
            client_id,
            connection.connection_id(),
        ) {
            tokio::spawn(async move {
                released.close().await;
            });
        }
    }

    async fn forward_signaling(
        connection: &ConnectionHandle,
        message: NegotiationMessage,
        media_stream_ids: Vec<String>,
    ) -> Result<(), MediaNodeError> {
        match message {
            NegotiationMessage::Offer { sdp } => {
                connection.process_offer(sdp, media_stream_ids).await
            }
            NegotiationMessage::Answer { sdp } => {
                connection.process_answer(sdp, media_stream_ids).await
            }
            NegotiationMessage::Candidate { candidate } => {
                connection.add_remote_candidate(candidate).await
            }
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mn.controller",
            publishers = self.publishers.len(),
            clients = self.clients.len(),
            "Controller shutting down"
        );
        self.stats.shutdown();

        for (_, mut record) in self.publishers.drain() {
            record.drain_subscribers();
            for (url, mut output) in record.drain_outputs() {
                if let Err(error) = output.close().await {
                    debug!(
                        target: "mn.controller",
                        %url,
                        %error,
                        "External output close during shutdown"
                    );
                }
            }
            if let Err(error) = record.close().await {
                debug!(target: "mn.controller", %error, "Engine teardown during shutdown");
            }
        }

        for (_, mut client) in self.clients.drain() {
            for connection in client.drain_connections() {
                connection.close().await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use signaling_protocol::control::mock::CollectingStatsSink;

    use crate::engine::mock::MockEngine;

    use super::*;

    fn test_config(vars: &[(&str, &str)]) -> Arc<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        Arc::new(Config::from_vars(&vars).unwrap())
    }

    struct Harness {
        handle: MediaNodeControllerHandle,
        engine: Arc<MockEngine>,
        lifecycle: NodeLifecycle,
        metrics: Arc<NodeMetrics>,
        _task: JoinHandle<()>,
    }

    fn spawn_controller() -> Harness {
        let config = test_config(&[]);
        let engine = Arc::new(MockEngine::new());
        let sink: Arc<dyn StatsSink> = Arc::new(CollectingStatsSink::new());
        let lifecycle = NodeLifecycle::new();
        let metrics = NodeMetrics::new();
        let (handle, task) = MediaNodeControllerActor::spawn(
            config,
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            sink,
            lifecycle.clone(),
            Arc::clone(&metrics),
        );
        Harness {
            handle,
            engine,
            lifecycle,
            metrics,
            _task: task,
        }
    }

    #[tokio::test]
    async fn test_duplicate_publishers_are_ignored() {
        let harness = spawn_controller();
        let (updates, mut events) = mpsc::channel(16);

        harness
            .handle
            .add_publisher(
                "client-1",
                "stream-1",
                PublishOptions::default(),
                updates.clone(),
            )
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(NegotiationEvent::Initializing { .. })
        ));

        harness
            .handle
            .add_publisher("client-2", "stream-1", PublishOptions::default(), updates)
            .await
            .unwrap();

        assert_eq!(harness.metrics.publisher_count(), 1);
        assert_eq!(harness.engine.fanouts().len(), 1);
        assert_eq!(harness.engine.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribing_to_an_unknown_stream_is_ignored() {
        let harness = spawn_controller();
        let (updates, mut events) = mpsc::channel(16);

        harness
            .handle
            .add_subscriber("client-1", "ghost", SubscribeOptions::default(), updates)
            .await
            .unwrap();

        assert!(harness.engine.sessions().is_empty());
        assert_eq!(harness.metrics.subscriber_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_negotiate_under_the_publisher_label() {
        let harness = spawn_controller();
        let (updates, _events) = mpsc::channel(16);

        harness
            .handle
            .add_publisher(
                "client-1",
                "stream-1",
                PublishOptions {
                    label: "cam-main".to_string(),
                    ..PublishOptions::default()
                },
                updates.clone(),
            )
            .await
            .unwrap();

        // A caller-supplied label must not override the publisher's.
        harness
            .handle
            .add_subscriber(
                "client-2",
                "stream-1",
                SubscribeOptions {
                    label: Some("viewer-side-name".to_string()),
                    ..SubscribeOptions::default()
                },
                updates,
            )
            .await
            .unwrap();

        let session = harness.engine.last_session().unwrap();
        let label = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(label) = session.stream_label("stream-1_client-2") {
                    return label;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(label, "cam-main");
    }

    #[tokio::test]
    async fn test_removing_the_last_publisher_shuts_the_node_down() {
        let harness = spawn_controller();
        let (updates, _events) = mpsc::channel(16);

        harness
            .handle
            .add_publisher("client-1", "stream-1", PublishOptions::default(), updates)
            .await
            .unwrap();
        harness
            .handle
            .remove_publisher("client-1", "stream-1")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), harness.lifecycle.terminated())
            .await
            .unwrap();
        assert_eq!(
            harness.lifecycle.shutdown_reason(),
            Some(ShutdownReason::PublishersDrained)
        );
        assert_eq!(harness.metrics.publisher_count(), 0);
    }

    #[tokio::test]
    async fn test_external_outputs_conflict_on_the_same_url() {
        let harness = spawn_controller();
        let (updates, _events) = mpsc::channel(16);

        harness
            .handle
            .add_publisher("client-1", "stream-1", PublishOptions::default(), updates)
            .await
            .unwrap();

        let missing = harness
            .handle
            .add_external_output("ghost", "rtmp://sink/x", ExternalOutputOptions::default())
            .await;
        assert!(matches!(missing, Err(MediaNodeError::PublisherNotFound(_))));

        harness
            .handle
            .add_external_output("stream-1", "rtmp://sink/x", ExternalOutputOptions::default())
            .await
            .unwrap();
        let duplicate = harness
            .handle
            .add_external_output("stream-1", "rtmp://sink/x", ExternalOutputOptions::default())
            .await;
        assert!(matches!(
            duplicate,
            Err(MediaNodeError::OutputExists { .. })
        ));
        assert_eq!(harness.engine.outputs().len(), 1);

        harness
            .handle
            .remove_external_output("stream-1", "rtmp://sink/x")
            .await
            .unwrap();
        harness
            .handle
            .remove_external_output("stream-1", "rtmp://sink/x")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_subscriptions_need_a_publisher() {
        let harness = spawn_controller();

        let result = harness
            .handle
            .subscribe_to_stats("ghost", Duration::from_secs(5), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(MediaNodeError::PublisherNotFound(_))));
    }

    #[tokio::test]
    async fn test_control_seam_maps_registry_misses_to_not_found() {
        let harness = spawn_controller();
        let control: &dyn MediaNodeControl = &harness.handle;

        let result = control.get_stream_stats("ghost").await;
        assert!(matches!(
            result,
            Err(ControlError::StreamNotFound(id)) if id == "ghost"
        ));
    }
}
