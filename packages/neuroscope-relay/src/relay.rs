// Batching relay
//
// Broker topic -> websocket topic. Messages on batchable routes are validated
// and queued per websocket topic; the flush timer turns each non-empty queue
// into one frame: the message itself when only one is pending, otherwise a
// JSON array of all of them. Everything else goes out immediately. Binary
// sample frames are checked against their header and never batched.
//
// The pending queues are owned by the task running `run`, so no locking.

use crate::broadcast::BroadcastManager;
use crate::error::RelayResult;
use crate::traits::BrokerSource;
use crate::types::{BrokerMessage, BrokerPayload, Frame, TopicRoute};
use neuroscope_client::FrameHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Relay counters shared with the stats endpoint
#[derive(Debug, Default)]
pub struct RelayMetrics {
    received: AtomicU64,
    malformed: AtomicU64,
    unrouted: AtomicU64,
    immediate: AtomicU64,
    batched: AtomicU64,
    flushed_frames: AtomicU64,
    broker_reconnects: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMetricsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub unrouted: u64,
    pub immediate: u64,
    pub batched: u64,
    pub flushed_frames: u64,
    pub broker_reconnects: u64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            immediate: self.immediate.load(Ordering::Relaxed),
            batched: self.batched.load(Ordering::Relaxed),
            flushed_frames: self.flushed_frames.load(Ordering::Relaxed),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded exponential backoff for broker reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay after `failures` consecutive failures (0 after a clean disconnect)
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.initial.saturating_mul(1 << exponent).min(self.max)
    }
}

struct Route {
    ws_topic: String,
    batchable: bool,
}

enum PumpExit {
    Disconnected,
    Shutdown,
}

pub struct BatchingRelay {
    routes: HashMap<String, Route>,
    pending: HashMap<String, Vec<String>>,
    manager: BroadcastManager,
    metrics: Arc<RelayMetrics>,
    flush_interval: Duration,
    backoff: Backoff,
}

impl BatchingRelay {
    pub fn new(routes: &[TopicRoute], manager: BroadcastManager, flush_interval: Duration) -> Self {
        let mut pending = HashMap::new();
        for route in routes.iter().filter(|r| r.batchable) {
            pending.insert(route.ws_topic.clone(), Vec::new());
        }

        let routes = routes
            .iter()
            .map(|r| {
                (
                    r.broker_topic.clone(),
                    Route {
                        ws_topic: r.ws_topic.clone(),
                        batchable: r.batchable,
                    },
                )
            })
            .collect();

        Self {
            routes,
            pending,
            manager,
            metrics: Arc::new(RelayMetrics::default()),
            flush_interval,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Broker topics to subscribe to, sorted
    pub fn broker_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Messages waiting for the next flush on `ws_topic`
    pub fn pending_len(&self, ws_topic: &str) -> usize {
        self.pending.get(ws_topic).map(Vec::len).unwrap_or(0)
    }

    /// Route one broker message
    pub fn ingest(&mut self, message: BrokerMessage) {
        RelayMetrics::bump(&self.metrics.received);

        let Some(route) = self.routes.get(&message.topic) else {
            RelayMetrics::bump(&self.metrics.unrouted);
            debug!("No route for broker topic {}, discarding", message.topic);
            return;
        };

        match message.payload {
            BrokerPayload::Text(text) => {
                if let Err(e) = serde_json::from_str::<serde::de::IgnoredAny>(&text) {
                    RelayMetrics::bump(&self.metrics.malformed);
                    warn!("Discarding malformed message on {}: {}", message.topic, e);
                    return;
                }

                if route.batchable {
                    if let Some(pending) = self.pending.get_mut(&route.ws_topic) {
                        pending.push(text);
                        RelayMetrics::bump(&self.metrics.batched);
                    }
                } else {
                    self.manager.broadcast(&route.ws_topic, Frame::text(text));
                    RelayMetrics::bump(&self.metrics.immediate);
                }
            }
            BrokerPayload::Binary(bytes) => match FrameHeader::validate(&bytes) {
                Ok(header) => {
                    debug!(
                        "Sample frame on {}: {} channels x {} samples",
                        route.ws_topic, header.channel_count, header.samples_per_channel
                    );
                    self.manager.broadcast(&route.ws_topic, Frame::Binary(bytes));
                    RelayMetrics::bump(&self.metrics.immediate);
                }
                Err(e) => {
                    RelayMetrics::bump(&self.metrics.malformed);
                    warn!("Discarding malformed sample frame on {}: {}", message.topic, e);
                }
            },
        }
    }

    /// Send every non-empty pending queue as one frame; returns frames sent
    pub fn flush(&mut self) -> usize {
        let mut frames = 0;

        for (topic, pending) in self.pending.iter_mut() {
            let frame = match pending.len() {
                0 => continue,
                1 => Frame::text(std::mem::take(&mut pending[0])),
                _ => Frame::text(format!("[{}]", pending.join(","))),
            };
            pending.clear();

            self.manager.broadcast(topic, frame);
            RelayMetrics::bump(&self.metrics.flushed_frames);
            frames += 1;
        }

        frames
    }

    /// Subscribe, relay and flush until `shutdown` flips
    ///
    /// Broker failures are retried with backoff forever; downstream clients
    /// stay connected in the meantime.
    pub async fn run(
        &mut self,
        source: &mut dyn BrokerSource,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayResult<()> {
        let topics = self.broker_topics();
        let mut ticker = time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        info!(
            "Relay started: {} routes, flush every {:?}",
            topics.len(),
            self.flush_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match source.subscribe(&topics).await {
                Ok(()) => {
                    failures = 0;
                    match self.pump(source, &mut ticker, &mut shutdown).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Disconnected => {
                            RelayMetrics::bump(&self.metrics.broker_reconnects);
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("Broker unavailable (attempt {}): {}", failures, e);
                }
            }

            self.flush();
            let delay = self.backoff.delay(failures);
            info!("Reconnecting to broker in {:?}", delay);
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.flush();
        source.close().await;
        info!("Relay stopped");
        Ok(())
    }

    async fn pump(
        &mut self,
        source: &mut dyn BrokerSource,
        ticker: &mut Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                message = source.next_message() => match message {
                    Ok(Some(message)) => self.ingest(message),
                    Ok(None) => {
                        warn!("Broker subscription ended");
                        return PumpExit::Disconnected;
                    }
                    Err(e) => {
                        warn!("Broker connection failed: {}", e);
                        return PumpExit::Disconnected;
                    }
                },
                _ = ticker.tick() => {
                    self.flush();
                }
                _ = shutdown.changed() => return PumpExit::Shutdown,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::client::ClientHandle;
    use crate::error::RelayError;
    use crate::types::default_routes;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use neuroscope_client::SampleFrame;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Broker that replays a fixed sequence of results, then goes quiet
    struct ScriptedSource {
        subscribes: Arc<AtomicUsize>,
        script: VecDeque<RelayResult<Option<BrokerMessage>>>,
    }

    #[async_trait]
    impl BrokerSource for ScriptedSource {
        async fn subscribe(&mut self, _topics: &[String]) -> RelayResult<()> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn next_message(&mut self) -> RelayResult<Option<BrokerMessage>> {
            match self.script.pop_front() {
                Some(step) => step,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn setup() -> (BatchingRelay, BroadcastManager) {
        let routes = default_routes();
        let manager = BroadcastManager::from_routes(&routes, 1 << 20);
        let relay = BatchingRelay::new(&routes, manager.clone(), Duration::from_millis(10));
        (relay, manager)
    }

    fn subscribe(manager: &BroadcastManager, topic: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (client, rx) = ClientHandle::new();
        client.mark_open();
        manager.add_client(topic, client).unwrap();
        rx
    }

    fn text(frame: Frame) -> String {
        match frame {
            Frame::Text(text) => text.as_str().to_string(),
            Frame::Binary(_) => panic!("expected a text frame"),
        }
    }

    #[tokio::test]
    async fn test_single_pending_message_sent_as_is() {
        let (mut relay, manager) = setup();
        let mut rx = subscribe(&manager, "spike-events");

        relay.ingest(BrokerMessage::text("spike_events_stream", r#"{"seq":1}"#));
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.flush(), 1);

        assert_eq!(text(rx.try_recv().unwrap()), r#"{"seq":1}"#);
        assert_eq!(relay.pending_len("spike-events"), 0);
    }

    #[tokio::test]
    async fn test_many_pending_messages_become_envelope() {
        let (mut relay, manager) = setup();
        let mut rx = subscribe(&manager, "telemetry");

        for seq in 1..=3 {
            relay.ingest(BrokerMessage::text(
                "telemetry_updates",
                json!({"seq": seq}).to_string(),
            ));
        }
        assert_eq!(relay.flush(), 1);

        let envelope: Value = serde_json::from_str(&text(rx.try_recv().unwrap())).unwrap();
        assert_eq!(envelope, json!([{"seq": 1}, {"seq": 2}, {"seq": 3}]));

        // Nothing pending, nothing sent
        assert_eq!(relay.flush(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_batchable_sent_immediately() {
        let (mut relay, manager) = setup();
        let mut rx = subscribe(&manager, "agent-status");

        relay.ingest(BrokerMessage::text("agent_status_updates", r#"{"state":"idle"}"#));
        assert_eq!(text(rx.try_recv().unwrap()), r#"{"state":"idle"}"#);
        assert_eq!(relay.metrics().snapshot().immediate, 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unrouted_discarded() {
        let (mut relay, manager) = setup();
        let mut spikes = subscribe(&manager, "spike-events");
        let mut chat = subscribe(&manager, "chat");

        relay.ingest(BrokerMessage::text("spike_events_stream", "{not json"));
        relay.ingest(BrokerMessage::text("chat_messages", "plain text"));
        relay.ingest(BrokerMessage::text("somewhere_else", "{}"));
        relay.flush();

        assert!(spikes.try_recv().is_err());
        assert!(chat.try_recv().is_err());

        let metrics = relay.metrics().snapshot();
        assert_eq!(metrics.received, 3);
        assert_eq!(metrics.malformed, 2);
        assert_eq!(metrics.unrouted, 1);
    }

    #[tokio::test]
    async fn test_binary_frames_validated_and_unbatched() {
        let (mut relay, manager) = setup();
        let mut rx = subscribe(&manager, "neural-data");

        let frame = SampleFrame::encode(&[vec![1.0f32, 2.0], vec![3.0, 4.0]]).unwrap();
        relay.ingest(BrokerMessage::binary("neural_data_stream", frame.clone()));
        relay.ingest(BrokerMessage::binary("neural_data_stream", vec![1u8, 0, 0]));

        assert_eq!(rx.try_recv().unwrap(), Frame::Binary(Bytes::from(frame)));
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.metrics().snapshot().malformed, 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(4));
        assert_eq!(backoff.delay(100), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_run_flushes_on_timer_and_stops_on_shutdown() {
        let (mut relay, manager) = setup();
        let mut rx = subscribe(&manager, "spike-events");
        let broker = ChannelBroker::new(16);
        let mut source = broker.source();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { relay.run(&mut source, shutdown_rx).await });

        while broker.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        broker.publish("spike_events_stream", &json!({"seq": 1}));

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text(frame), r#"{"seq":1}"#);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_broker_disconnect() {
        let (relay, manager) = setup();
        let mut relay = relay.with_backoff(Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
        });
        let metrics = relay.metrics();
        let mut rx = subscribe(&manager, "agent-status");

        let subscribes = Arc::new(AtomicUsize::new(0));
        let status = |n: u64| -> RelayResult<Option<BrokerMessage>> {
            Ok(Some(BrokerMessage::text(
                "agent_status_updates",
                json!({"n": n}).to_string(),
            )))
        };
        let mut source = ScriptedSource {
            subscribes: Arc::clone(&subscribes),
            script: VecDeque::from(vec![
                status(1),
                Err(RelayError::Broker("connection reset".to_string())),
                status(2),
                Ok(None),
                status(3),
            ]),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { relay.run(&mut source, shutdown_rx).await });

        for n in 1..=3 {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(text(frame), json!({"n": n}).to_string());
        }

        assert_eq!(subscribes.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().broker_reconnects, 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
