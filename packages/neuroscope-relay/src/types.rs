use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a downstream websocket connection
pub type ClientId = Uuid;

/// Delivery policy of a broadcast topic
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicPolicy {
    /// Skip slow clients instead of queueing more for them
    pub throughput: bool,
}

/// Mapping of one broker topic onto one websocket topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicRoute {
    pub broker_topic: String,
    pub ws_topic: String,
    pub throughput: bool,
    pub batchable: bool,
}

impl TopicRoute {
    pub fn new(broker_topic: &str, ws_topic: &str, throughput: bool, batchable: bool) -> Self {
        Self {
            broker_topic: broker_topic.to_string(),
            ws_topic: ws_topic.to_string(),
            throughput,
            batchable,
        }
    }

    pub fn policy(&self) -> TopicPolicy {
        TopicPolicy {
            throughput: self.throughput,
        }
    }
}

/// Topic table used when `RELAY_TOPICS` is not set
pub fn default_routes() -> Vec<TopicRoute> {
    vec![
        TopicRoute::new("neural_data_stream", "neural-data", true, false),
        TopicRoute::new("spike_events_stream", "spike-events", true, true),
        TopicRoute::new("telemetry_updates", "telemetry", true, true),
        TopicRoute::new("agent_status_updates", "agent-status", false, false),
        TopicRoute::new("notifications_stream", "notifications", false, false),
        TopicRoute::new("chat_messages", "chat", false, false),
    ]
}

/// Body of a message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerPayload {
    /// Serialized JSON
    Text(String),
    /// Raw binary sample frame
    Binary(Bytes),
}

/// One message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: BrokerPayload,
}

impl BrokerMessage {
    pub fn text(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: BrokerPayload::Text(text.into()),
        }
    }

    pub fn binary(topic: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: BrokerPayload::Binary(bytes.into()),
        }
    }
}

/// Outbound frame, cheap to clone across every client of a topic
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(Utf8Bytes::from(text.into()))
    }

    /// Size in bytes as counted against a client's buffered amount
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.as_str().len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        }
    }
}
