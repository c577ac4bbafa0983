//! Per-client connection bookkeeping.
//!
//! A client is one remote participant. Clients negotiating in single-PC
//! mode multiplex every media stream over one shared connection that
//! stays alive until the node shuts down; otherwise each stream gets a
//! dedicated connection that closes when its last stream detaches.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::actors::connection::{ConnectionActor, ConnectionHandle, ConnectionSettings};
use crate::config::Config;
use crate::engine::{MediaEngine, TransportSessionConfig};
use crate::errors::MediaNodeError;
use crate::metrics::NodeMetrics;

/// One connection owned by a client, with the number of media streams
/// currently attached to it.
struct ConnectionRef {
    handle: ConnectionHandle,
    attached_streams: usize,
}

/// Connection registry for one client.
pub struct ClientSession {
    id: String,
    single_pc: bool,
    connections: HashMap<String, ConnectionRef>,
}

impl ClientSession {
    #[must_use]
    pub fn new(id: &str, single_pc: bool) -> Self {
        Self {
            id: id.to_string(),
            single_pc,
            connections: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn single_pc(&self) -> bool {
        self.single_pc
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether the shared single-PC connection already exists, meaning a
    /// new stream joins an ongoing negotiation.
    #[must_use]
    pub fn reuses_connection(&self) -> bool {
        self.single_pc && !self.connections.is_empty()
    }

    /// The connection a new stream should ride on. Single-PC clients
    /// reuse their shared connection; everyone else gets a fresh one.
    pub fn get_or_create_connection(
        &mut self,
        engine: &Arc<dyn MediaEngine>,
        settings: ConnectionSettings,
        media_configuration: Option<&str>,
        config: &Arc<Config>,
        cancel_token: &CancellationToken,
        metrics: &Arc<NodeMetrics>,
    ) -> Result<ConnectionHandle, MediaNodeError> {
        if self.single_pc {
            if let Some(existing) = self.connections.values().next() {
                return Ok(existing.handle.clone());
            }
        }

        let connection_id = format!("{}_{}", self.id, uuid::Uuid::new_v4());
        let media_configuration = Some(
            media_configuration
                .map(str::to_string)
                .unwrap_or_else(|| config.default_media_configuration.clone()),
        );

        let session = engine.create_session(TransportSessionConfig {
            connection_id: connection_id.clone(),
            client_id: self.id.clone(),
            media_configuration,
            trickle_ice: settings.trickle_ice,
        })?;

        debug!(
            target: "mn.controller",
            client_id = %self.id,
            %connection_id,
            single_pc = self.single_pc,
            "Creating connection"
        );

        let (handle, _task) = ConnectionActor::spawn(
            connection_id.clone(),
            self.id.clone(),
            session,
            settings,
            Arc::clone(config),
            cancel_token.child_token(),
            Arc::clone(metrics),
        );

        self.connections.insert(
            connection_id,
            ConnectionRef {
                handle: handle.clone(),
                attached_streams: 0,
            },
        );

        Ok(handle)
    }

    /// Record one more stream riding on a connection.
    pub fn stream_attached(&mut self, connection_id: &str) {
        if let Some(connection) = self.connections.get_mut(connection_id) {
            connection.attached_streams += 1;
        }
    }

    /// Record one stream leaving a connection. Returns the handle when
    /// the connection should now close (dedicated connection, no streams
    /// left); single-PC connections persist regardless.
    pub fn stream_detached(&mut self, connection_id: &str) -> Option<ConnectionHandle> {
        let connection = self.connections.get_mut(connection_id)?;
        connection.attached_streams = connection.attached_streams.saturating_sub(1);
        if connection.attached_streams == 0 && !self.single_pc {
            debug!(
                target: "mn.controller",
                client_id = %self.id,
                %connection_id,
                "Last stream detached, releasing connection"
            );
            return self
                .connections
                .remove(connection_id)
                .map(|connection| connection.handle);
        }
        None
    }

    /// Drop every connection, handing back the handles for closing.
    pub fn drain_connections(&mut self) -> Vec<ConnectionHandle> {
        self.connections
            .drain()
            .map(|(_, connection)| connection.handle)
            .collect()
    }
}
