// Broker sources
//
// `WsBroker` speaks to a websocket pub/sub broker:
//
// - subscribe:  {"action":"subscribe","topics":["neural_data_stream", ...]}
// - text:       {"topic":"<name>","data":<json>}; a string `data` is taken as
//               already-serialized JSON, anything else is re-serialized
// - binary:     [topic_len: u8][topic utf8][payload]
//
// `ChannelBroker` is an in-process broker on a tokio broadcast channel with
// the same message model, used for embedding and tests.

use crate::error::{RelayError, RelayResult};
use crate::traits::BrokerSource;
use crate::types::{BrokerMessage, BrokerPayload};
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize)]
struct Envelope {
    topic: String,
    data: Value,
}

/// Parse a text envelope into a broker message
pub fn parse_envelope(text: &str) -> RelayResult<BrokerMessage> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let payload = match envelope.data {
        Value::String(serialized) => serialized,
        other => other.to_string(),
    };
    Ok(BrokerMessage::text(envelope.topic, payload))
}

/// Parse a `[topic_len][topic][payload]` binary message
pub fn parse_binary(bytes: Bytes) -> RelayResult<BrokerMessage> {
    let Some(&topic_len) = bytes.first() else {
        return Err(RelayError::MalformedFrame("empty binary message".to_string()));
    };
    let topic_end = 1 + topic_len as usize;
    if bytes.len() < topic_end {
        return Err(RelayError::MalformedFrame(format!(
            "topic length {} exceeds message of {} bytes",
            topic_len,
            bytes.len()
        )));
    }

    let topic = std::str::from_utf8(&bytes[1..topic_end])
        .map_err(|e| RelayError::MalformedFrame(format!("topic is not UTF-8: {}", e)))?
        .to_string();

    Ok(BrokerMessage::binary(topic, bytes.slice(topic_end..)))
}

/// Build a `[topic_len][topic][payload]` binary message
pub fn encode_binary(topic: &str, payload: &[u8]) -> RelayResult<Vec<u8>> {
    let topic_len = u8::try_from(topic.len())
        .map_err(|_| RelayError::MalformedFrame(format!("topic too long: {}", topic)))?;

    let mut out = Vec::with_capacity(1 + topic.len() + payload.len());
    out.push(topic_len);
    out.extend_from_slice(topic.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Websocket pub/sub broker connection
pub struct WsBroker {
    url: String,
    stream: Option<BrokerStream>,
}

impl WsBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BrokerSource for WsBroker {
    async fn subscribe(&mut self, topics: &[String]) -> RelayResult<()> {
        self.stream = None;

        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::Broker(format!("connect to {} failed: {}", self.url, e)))?;

        let request = json!({ "action": "subscribe", "topics": topics });
        stream.send(Message::Text(request.to_string().into())).await?;

        info!("Subscribed to {} broker topics at {}", topics.len(), self.url);
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_message(&mut self) -> RelayResult<Option<BrokerMessage>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match parse_envelope(text.as_str()) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => warn!("Discarding malformed broker envelope: {}", e),
                },
                Some(Ok(Message::Binary(bytes))) => match parse_binary(bytes) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => warn!("Discarding malformed binary broker message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("Broker closed the subscription: {:?}", frame);
                    self.stream = None;
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e.into());
                }
                None => {
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!("Error closing broker connection: {}", e);
            }
        }
    }
}

/// In-process broker
#[derive(Clone)]
pub struct ChannelBroker {
    sender: broadcast::Sender<BrokerMessage>,
}

impl ChannelBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a JSON value; returns the number of live subscriptions
    pub fn publish(&self, topic: &str, data: &Value) -> usize {
        self.publish_message(BrokerMessage::text(topic, data.to_string()))
    }

    /// Publish an already-serialized payload as-is
    pub fn publish_raw(&self, topic: &str, payload: BrokerPayload) -> usize {
        self.publish_message(BrokerMessage {
            topic: topic.to_string(),
            payload,
        })
    }

    fn publish_message(&self, message: BrokerMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// A source that can be handed to the relay
    pub fn source(&self) -> ChannelBrokerSource {
        ChannelBrokerSource {
            sender: self.sender.clone(),
            receiver: None,
            topics: HashSet::new(),
        }
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Subscription side of a [`ChannelBroker`]
pub struct ChannelBrokerSource {
    sender: broadcast::Sender<BrokerMessage>,
    receiver: Option<broadcast::Receiver<BrokerMessage>>,
    topics: HashSet<String>,
}

#[async_trait]
impl BrokerSource for ChannelBrokerSource {
    async fn subscribe(&mut self, topics: &[String]) -> RelayResult<()> {
        self.topics = topics.iter().cloned().collect();
        self.receiver = Some(self.sender.subscribe());
        Ok(())
    }

    async fn next_message(&mut self) -> RelayResult<Option<BrokerMessage>> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };

        loop {
            match receiver.recv().await {
                Ok(message) if self.topics.contains(&message.topic) => return Ok(Some(message)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("In-process broker subscription lagged, {} messages lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.receiver = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let message = parse_envelope(r#"{"topic":"telemetry_updates","data":{"fpgaTemp":36.5}}"#)
            .unwrap();
        assert_eq!(message.topic, "telemetry_updates");
        assert_eq!(
            message.payload,
            BrokerPayload::Text(r#"{"fpgaTemp":36.5}"#.to_string())
        );

        let stringified =
            parse_envelope(r#"{"topic":"chat_messages","data":"{\"msg\":\"hi\"}"}"#).unwrap();
        assert_eq!(
            stringified.payload,
            BrokerPayload::Text(r#"{"msg":"hi"}"#.to_string())
        );

        assert!(parse_envelope(r#"{"data":1}"#).is_err());
    }

    #[test]
    fn test_binary_message_round_trip() {
        let encoded = encode_binary("neural_data_stream", &[1, 2, 3]).unwrap();
        assert_eq!(encoded[0] as usize, "neural_data_stream".len());

        let message = parse_binary(Bytes::from(encoded)).unwrap();
        assert_eq!(message.topic, "neural_data_stream");
        assert_eq!(message.payload, BrokerPayload::Binary(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn test_parse_binary_rejects_garbage() {
        assert!(parse_binary(Bytes::new()).is_err());
        assert!(parse_binary(Bytes::from_static(&[10, b'a'])).is_err());
        assert!(parse_binary(Bytes::from_static(&[2, 0xff, 0xfe])).is_err());
        assert!(encode_binary(&"t".repeat(300), &[]).is_err());
    }

    #[tokio::test]
    async fn test_channel_broker_filters_topics() {
        let broker = ChannelBroker::new(16);
        let mut source = broker.source();
        assert_eq!(broker.subscriber_count(), 0);

        tokio_test::assert_ok!(source.subscribe(&["chat_messages".to_string()]).await);
        assert_eq!(broker.subscriber_count(), 1);

        broker.publish("unrelated", &json!({"x": 1}));
        broker.publish("chat_messages", &json!({"msg": "hi"}));

        let message = tokio_test::assert_ok!(source.next_message().await).unwrap();
        assert_eq!(message.topic, "chat_messages");

        source.close().await;
        assert!(source.next_message().await.unwrap().is_none());
    }
}
