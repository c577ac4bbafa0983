//! Publisher and subscriber records.
//!
//! A publisher owns the engine fan-out point for its stream, the set of
//! subscriber records feeding from it, and any external outputs copying
//! the stream off-node. The record keeps the engine wiring and the
//! registry bookkeeping in one place so the controller can't get them
//! out of sync.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::actors::connection::ConnectionHandle;
use crate::engine::{ExternalInput, ExternalOutput, StreamFanout};
use crate::errors::MediaNodeError;

/// Where a published stream's media enters the node.
pub enum PublisherSource {
    /// A negotiated transport connection from a client.
    Connection { handle: ConnectionHandle },
    /// A URL-addressed external source (RTSP camera, file relay).
    ExternalInput { input: Box<dyn ExternalInput> },
}

/// One subscription of a client to a published stream.
pub struct SubscriberRecord {
    pub client_id: String,
    pub stream_id: String,
    /// Engine-side id of the subscriber's media stream, distinct from
    /// the publisher's.
    pub media_stream_id: String,
    pub connection: ConnectionHandle,
}

impl SubscriberRecord {
    #[must_use]
    pub fn new(client_id: &str, stream_id: &str, connection: ConnectionHandle) -> Self {
        Self {
            client_id: client_id.to_string(),
            stream_id: stream_id.to_string(),
            media_stream_id: format!("{stream_id}_{client_id}"),
            connection,
        }
    }
}

/// One published stream and everything hanging off it.
pub struct PublisherRecord {
    stream_id: String,
    client_id: String,
    label: String,
    attributes: Value,
    source: PublisherSource,
    fanout: Box<dyn StreamFanout>,
    subscribers: HashMap<String, SubscriberRecord>,
    outputs: HashMap<String, Box<dyn ExternalOutput>>,
}

impl PublisherRecord {
    /// Create the record and point the fan-out at the publisher's media
    /// stream.
    pub fn new(
        stream_id: &str,
        client_id: &str,
        label: &str,
        attributes: Value,
        source: PublisherSource,
        mut fanout: Box<dyn StreamFanout>,
    ) -> Result<Self, MediaNodeError> {
        fanout.set_source(stream_id)?;
        Ok(Self {
            stream_id: stream_id.to_string(),
            client_id: client_id.to_string(),
            label: label.to_string(),
            attributes,
            source,
            fanout,
            subscribers: HashMap::new(),
            outputs: HashMap::new(),
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn attributes(&self) -> &Value {
        &self.attributes
    }

    /// The publisher's own connection, if it negotiates one.
    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        match &self.source {
            PublisherSource::Connection { handle } => Some(handle),
            PublisherSource::ExternalInput { .. } => None,
        }
    }

    #[must_use]
    pub fn has_subscriber(&self, client_id: &str) -> bool {
        self.subscribers.contains_key(client_id)
    }

    #[must_use]
    pub fn subscriber(&self, client_id: &str) -> Option<&SubscriberRecord> {
        self.subscribers.get(client_id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriberRecord> {
        self.subscribers.values()
    }

    /// Register the subscription with the fan-out and record it.
    pub fn add_subscriber(&mut self, record: SubscriberRecord) -> Result<(), MediaNodeError> {
        self.fanout
            .add_subscriber(&record.client_id, &record.media_stream_id)?;
        self.subscribers.insert(record.client_id.clone(), record);
        Ok(())
    }

    /// Remove a subscription from the fan-out and hand the record back.
    pub fn remove_subscriber(&mut self, client_id: &str) -> Option<SubscriberRecord> {
        let record = self.subscribers.remove(client_id)?;
        if let Err(error) = self.fanout.remove_subscriber(client_id) {
            tracing::debug!(
                target: "mn.controller",
                stream_id = %self.stream_id,
                client_id,
                %error,
                "Fan-out already dropped the subscriber"
            );
        }
        Some(record)
    }

    /// Remove every subscription, handing the records back for
    /// connection teardown.
    pub fn drain_subscribers(&mut self) -> Vec<SubscriberRecord> {
        let client_ids: Vec<String> = self.subscribers.keys().cloned().collect();
        client_ids
            .into_iter()
            .filter_map(|client_id| self.remove_subscriber(&client_id))
            .collect()
    }

    #[must_use]
    pub fn has_output(&self, url: &str) -> bool {
        self.outputs.contains_key(url)
    }

    /// Attach an external output. A second output on the same URL is a
    /// conflict.
    pub fn add_output(
        &mut self,
        url: &str,
        output: Box<dyn ExternalOutput>,
    ) -> Result<(), MediaNodeError> {
        if self.outputs.contains_key(url) {
            return Err(MediaNodeError::OutputExists {
                stream_id: self.stream_id.clone(),
                url: url.to_string(),
            });
        }
        self.fanout.add_output(url)?;
        self.outputs.insert(url.to_string(), output);
        Ok(())
    }

    /// Detach an external output, handing it back for closing.
    pub fn remove_output(&mut self, url: &str) -> Option<Box<dyn ExternalOutput>> {
        let output = self.outputs.remove(url)?;
        if let Err(error) = self.fanout.remove_output(url) {
            tracing::debug!(
                target: "mn.controller",
                stream_id = %self.stream_id,
                url,
                %error,
                "Fan-out already dropped the output"
            );
        }
        Some(output)
    }

    /// Detach every external output, handing them back for closing.
    pub fn drain_outputs(&mut self) -> Vec<(String, Box<dyn ExternalOutput>)> {
        let urls: Vec<String> = self.outputs.keys().cloned().collect();
        urls.into_iter()
            .filter_map(|url| self.remove_output(&url).map(|output| (url, output)))
            .collect()
    }

    /// Stats for the publisher's own media path.
    #[must_use]
    pub fn source_stats(&self) -> BoxFuture<'static, Result<Value, MediaNodeError>> {
        match &self.source {
            PublisherSource::Connection { handle } => {
                let handle = handle.clone();
                let media_stream_id = self.stream_id.clone();
                Box::pin(async move { handle.stream_stats(&media_stream_id).await })
            }
            PublisherSource::ExternalInput { input } => {
                let stats = input.stats();
                Box::pin(async move { stats.await.map_err(MediaNodeError::from) })
            }
        }
    }

    /// Tear down the engine objects this record owns: the external
    /// source when there is one, then the fan-out. Subscribers and
    /// outputs must already be gone.
    #[must_use]
    pub fn close(mut self) -> BoxFuture<'static, Result<(), MediaNodeError>> {
        let input_close = match &mut self.source {
            PublisherSource::ExternalInput { input } => Some(input.close()),
            PublisherSource::Connection { .. } => None,
        };
        let fanout_close = self.fanout.close();
        Box::pin(async move {
            if let Some(close) = input_close {
                close.await?;
            }
            fanout_close.await?;
            Ok(())
        })
    }
}
