/*!
 * Message bus for pumpbench.
 *
 * Components exchange opaque JSON envelopes on named topics. The in-process
 * [`EventBus`] keeps one broadcast channel per topic; an external transport
 * (MQTT or similar) plugs in by implementing [`MessageBus`] or by bridging the
 * topics of an [`EventBus`].
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Maximum number of messages that can be buffered per topic
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A message travelling on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message was published on
    pub topic: String,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Publish time
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Create a message stamped with the current time
    pub fn new<S: AsRef<str>>(topic: S, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.as_ref().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed command or record
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Receiving side of a topic subscription
pub type BusReceiver = broadcast::Receiver<BusMessage>;

/// Publish/subscribe seam between the bench and its message transport
pub trait MessageBus: Send + Sync + Debug {
    /// Publish a payload on a topic, returning the number of receivers reached
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize>;

    /// Subscribe to a topic
    fn subscribe(&self, topic: &str) -> Result<BusReceiver>;
}

/// Topic-keyed broadcast bus
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific per-topic capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut channels = self.channels.lock();
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }

    /// Topics that have been published or subscribed so far
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.channels.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl MessageBus for EventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize> {
        let sender = self.sender(topic);
        if sender.receiver_count() == 0 {
            debug!(topic, "No receivers for message");
            return Ok(0);
        }

        match sender.send(BusMessage::new(topic, payload)) {
            Ok(n) => {
                trace!(topic, receivers = n, "Published message");
                Ok(n)
            }
            Err(e) => {
                warn!(topic, "Failed to publish message: {}", e);
                Err(Error::event(format!("Failed to publish on {}: {}", topic, e)))
            }
        }
    }

    fn subscribe(&self, topic: &str) -> Result<BusReceiver> {
        Ok(self.sender(topic).subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific per-topic capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Get a reference to the inner bus
    pub fn get(&self) -> &EventBus {
        &self.0
    }
}

impl MessageBus for SharedEventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize> {
        self.0.publish(topic, payload)
    }

    fn subscribe(&self, topic: &str) -> Result<BusReceiver> {
        self.0.subscribe(topic)
    }
}

/// Shared handle to any bus implementation
pub type DynBus = Arc<dyn MessageBus>;
