// Client ingestion loop
//
// Connects to a relay topic and feeds decoded samples into the shared ring
// buffer. Frames come in three shapes:
//
// - binary sample frames (see `wire`), pushed straight into the buffer
// - a single JSON payload
// - a batch envelope: a JSON array of payloads
//
// JSON payloads carrying `seq`/`sequence` are checked for gaps; payloads of
// type "samples" carry `channels: [[...], ...]` and are pushed like binary
// frames. Every JSON payload is also forwarded to an optional event channel.
//
// Reconnection uses bounded exponential backoff. Decode errors are counted and
// logged but never end the loop.

use crate::buffer::ChannelRingBuffer;
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ClientError, ClientResult};
use crate::wire::{decode_text, SampleFrame};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payload types that open or continue a streamed operation
const STREAM_CHUNK_TYPES: &[&str] = &["chat.token", "stream.chunk"];

/// Payload types that terminate a streamed operation
const STREAM_END_TYPES: &[&str] = &["chat.end", "stream.end"];

/// Counters for one ingestion session, shared with whoever displays them
#[derive(Debug, Default)]
pub struct IngestStats {
    frames_received: AtomicU64,
    binary_frames: AtomicU64,
    json_payloads: AtomicU64,
    samples_pushed: AtomicU64,
    decode_errors: AtomicU64,
    sequence_gaps: AtomicU64,
    out_of_order: AtomicU64,
    reconnects: AtomicU64,
    watchdog_resets: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestStatsSnapshot {
    pub frames_received: u64,
    pub binary_frames: u64,
    pub json_payloads: u64,
    pub samples_pushed: u64,
    pub decode_errors: u64,
    /// Sequence numbers that never arrived
    pub sequence_gaps: u64,
    pub out_of_order: u64,
    pub reconnects: u64,
    pub watchdog_resets: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            binary_frames: self.binary_frames.load(Ordering::Relaxed),
            json_payloads: self.json_payloads.load(Ordering::Relaxed),
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            watchdog_resets: self.watchdog_resets.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Result of observing one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    InOrder,
    /// `n` sequence numbers were skipped
    Gap(u64),
    /// Duplicate or older than the last one seen
    Stale,
}

/// Tracks the last sequence number seen on a connection
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    pub fn observe(&mut self, seq: u64) -> SequenceEvent {
        let event = match self.last {
            None => SequenceEvent::InOrder,
            Some(last) if seq <= last => return SequenceEvent::Stale,
            Some(last) if seq == last + 1 => SequenceEvent::InOrder,
            Some(last) => SequenceEvent::Gap(seq - last - 1),
        };
        self.last = Some(seq);
        event
    }

    /// Forget history, e.g. after reconnecting to a fresh stream
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Safety net for streamed operations whose terminal message never arrives
#[derive(Debug)]
pub struct StreamWatchdog {
    timeout: Duration,
    in_flight_since: Option<Instant>,
}

impl StreamWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            in_flight_since: None,
        }
    }

    /// Feed the `type` of an incoming payload
    pub fn observe(&mut self, payload_type: &str, now: Instant) {
        if STREAM_CHUNK_TYPES.contains(&payload_type) {
            self.in_flight_since.get_or_insert(now);
        } else if STREAM_END_TYPES.contains(&payload_type) {
            self.in_flight_since = None;
        }
    }

    /// Reset the streaming state if it has been in flight too long
    ///
    /// Returns `true` when a reset happened.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.in_flight_since {
            Some(since) if now.saturating_duration_since(since) >= self.timeout => {
                self.in_flight_since = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }

    /// Drop any in-flight operation without counting it as a timeout
    pub fn reset(&mut self) {
        self.in_flight_since = None;
    }
}

enum PumpExit {
    Disconnected,
    Shutdown,
}

/// Receives relay frames and pushes decoded samples into a ring buffer
pub struct IngestLoop {
    url: String,
    buffer: Arc<RwLock<ChannelRingBuffer>>,
    stats: Arc<IngestStats>,
    policy: ReconnectPolicy,
    sequence: SequenceTracker,
    watchdog: StreamWatchdog,
    events: Option<mpsc::Sender<Value>>,
}

impl IngestLoop {
    pub fn new(
        url: impl Into<String>,
        buffer: Arc<RwLock<ChannelRingBuffer>>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            url: url.into(),
            buffer,
            stats: Arc::new(IngestStats::default()),
            policy: config.reconnect.clone(),
            sequence: SequenceTracker::default(),
            watchdog: StreamWatchdog::new(config.stream_timeout()),
            events: None,
        }
    }

    /// Forward every decoded JSON payload to `sender`
    ///
    /// Forwarding never blocks the receive path: a full channel drops the
    /// event.
    pub fn with_events(mut self, sender: mpsc::Sender<Value>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn buffer(&self) -> Arc<RwLock<ChannelRingBuffer>> {
        Arc::clone(&self.buffer)
    }

    pub fn watchdog(&self) -> &StreamWatchdog {
        &self.watchdog
    }

    /// Run until shutdown is signalled or reconnect attempts are exhausted
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ClientResult<()> {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect().await {
                Ok(stream) => {
                    failures = 0;

                    match self.pump(stream, &mut shutdown).await {
                        PumpExit::Shutdown => return Ok(()),
                        PumpExit::Disconnected => {
                            IngestStats::bump(&self.stats.reconnects, 1);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    log::warn!(
                        "Relay connection failed (attempt {}/{}): {}",
                        failures,
                        self.policy.max_attempts,
                        e
                    );
                    if failures >= self.policy.max_attempts {
                        return Err(ClientError::RetriesExhausted(failures));
                    }
                }
            }

            let delay = self.policy.delay_for(failures.max(1));
            log::info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Open a fresh connection; per-connection state starts over
    async fn connect(&mut self) -> ClientResult<RelayStream> {
        log::info!("Connecting to relay: {}", self.url);
        let (stream, _) = connect_async(self.url.as_str()).await?;
        log::info!("Relay connected");
        self.reset_connection_state();
        Ok(stream)
    }

    /// Forget sequence history and any streamed operation of the previous
    /// connection
    fn reset_connection_state(&mut self) {
        self.sequence.reset();
        self.watchdog.reset();
    }

    async fn pump(&mut self, stream: RelayStream, shutdown: &mut watch::Receiver<bool>) -> PumpExit {
        let (mut write, mut read) = stream.split();
        let mut watchdog_tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), Instant::now()),
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Relay closed the connection");
                        return PumpExit::Disconnected;
                    }
                    Some(Ok(_)) => {
                        // Pings are answered by tungstenite on the next poll
                    }
                    Some(Err(e)) => {
                        log::error!("Relay connection error: {}", e);
                        return PumpExit::Disconnected;
                    }
                },
                _ = watchdog_tick.tick() => self.poll_watchdog(Instant::now()),
                _ = shutdown.changed() => {
                    if let Err(e) = write.close().await {
                        log::debug!("Error closing relay connection: {}", e);
                    }
                    return PumpExit::Shutdown;
                }
            }
        }
    }

    /// Decode a binary sample frame and push it into the buffer
    pub fn handle_binary(&mut self, bytes: &[u8]) {
        IngestStats::bump(&self.stats.frames_received, 1);
        IngestStats::bump(&self.stats.binary_frames, 1);

        match SampleFrame::decode(bytes) {
            Ok(frame) => self.push_samples(&frame.channels),
            Err(e) => {
                IngestStats::bump(&self.stats.decode_errors, 1);
                log::warn!("Dropping malformed sample frame: {}", e);
            }
        }
    }

    /// Decode a text frame (single payload or batch envelope)
    pub fn handle_text(&mut self, text: &str, now: Instant) {
        IngestStats::bump(&self.stats.frames_received, 1);

        let payloads = match decode_text(text) {
            Ok(payloads) => payloads,
            Err(e) => {
                IngestStats::bump(&self.stats.decode_errors, 1);
                log::warn!("Dropping malformed text frame: {}", e);
                return;
            }
        };

        for payload in payloads {
            self.handle_payload(payload, now);
        }
    }

    /// Run the stream watchdog; counts a reset if one fires
    pub fn poll_watchdog(&mut self, now: Instant) {
        if self.watchdog.poll(now) {
            IngestStats::bump(&self.stats.watchdog_resets, 1);
            log::warn!("Streamed operation timed out, resetting local stream state");
        }
    }

    fn handle_payload(&mut self, payload: Value, now: Instant) {
        IngestStats::bump(&self.stats.json_payloads, 1);

        let seq = payload
            .get("seq")
            .or_else(|| payload.get("sequence"))
            .and_then(Value::as_u64);
        if let Some(seq) = seq {
            match self.sequence.observe(seq) {
                SequenceEvent::InOrder => {}
                SequenceEvent::Gap(missing) => {
                    IngestStats::bump(&self.stats.sequence_gaps, missing);
                    log::debug!("Sequence gap: {} frames missing before {}", missing, seq);
                }
                SequenceEvent::Stale => IngestStats::bump(&self.stats.out_of_order, 1),
            }
        }

        if let Some(kind) = payload.get("type").and_then(Value::as_str) {
            self.watchdog.observe(kind, now);
            if kind == "samples" {
                match parse_json_channels(&payload) {
                    Some(channels) => self.push_samples(&channels),
                    None => {
                        IngestStats::bump(&self.stats.decode_errors, 1);
                        log::warn!("Samples payload without a valid `channels` array");
                    }
                }
            }
        }

        if let Some(events) = &self.events {
            if events.try_send(payload).is_err() {
                log::debug!("Event receiver full or closed, dropping payload");
            }
        }
    }

    fn push_samples(&self, channels: &[Vec<f32>]) {
        let pushed: usize = channels.iter().map(Vec::len).sum();
        self.buffer.write().push(channels);
        IngestStats::bump(&self.stats.samples_pushed, pushed as u64);
    }
}

fn parse_json_channels(payload: &Value) -> Option<Vec<Vec<f32>>> {
    payload
        .get("channels")?
        .as_array()?
        .iter()
        .map(|channel| {
            channel
                .as_array()?
                .iter()
                .map(|v| v.as_f64().map(|v| v as f32))
                .collect::<Option<Vec<f32>>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingest(channels: usize, capacity: usize) -> IngestLoop {
        let buffer = Arc::new(RwLock::new(ChannelRingBuffer::new(channels, capacity).unwrap()));
        IngestLoop::new("ws://127.0.0.1:1/ws/neural-data", buffer, &ClientConfig::default())
    }

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::default();
        assert_eq!(tracker.observe(10), SequenceEvent::InOrder);
        assert_eq!(tracker.observe(11), SequenceEvent::InOrder);
        assert_eq!(tracker.observe(15), SequenceEvent::Gap(3));
        assert_eq!(tracker.observe(15), SequenceEvent::Stale);
        assert_eq!(tracker.observe(12), SequenceEvent::Stale);
        assert_eq!(tracker.observe(16), SequenceEvent::InOrder);

        tracker.reset();
        assert_eq!(tracker.observe(1), SequenceEvent::InOrder);
    }

    #[test]
    fn test_binary_frame_lands_in_buffer() {
        let mut ingest = ingest(2, 8);
        let frame = SampleFrame::encode(&[vec![1.0f32, 2.0, 3.0], vec![-1.0, -2.0, -3.0]]).unwrap();
        ingest.handle_binary(&frame);

        let buffer = ingest.buffer();
        assert_eq!(buffer.read().latest(0, 3), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.read().latest(1, 3), vec![-1.0, -2.0, -3.0]);

        let stats = ingest.stats().snapshot();
        assert_eq!(stats.binary_frames, 1);
        assert_eq!(stats.samples_pushed, 6);
    }

    #[test]
    fn test_malformed_frames_are_counted() {
        let mut ingest = ingest(1, 8);
        ingest.handle_binary(&[1, 2, 3]);
        ingest.handle_text("{oops", Instant::now());
        ingest.handle_text(r#"{"type":"samples","channels":"nope"}"#, Instant::now());

        let stats = ingest.stats().snapshot();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.decode_errors, 3);
        assert_eq!(stats.samples_pushed, 0);
    }

    #[test]
    fn test_batch_envelope_tracks_gaps_and_samples() {
        let mut ingest = ingest(2, 16);
        let batch = json!([
            {"type": "samples", "seq": 1, "channels": [[1.0, 2.0], [3.0, 4.0]]},
            {"type": "samples", "seq": 2, "channels": [[5.0], [6.0]]},
            {"type": "spike", "seq": 5, "channel": 1, "amplitude": -80.5}
        ]);
        ingest.handle_text(&batch.to_string(), Instant::now());

        let stats = ingest.stats().snapshot();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.json_payloads, 3);
        assert_eq!(stats.sequence_gaps, 2);
        assert_eq!(stats.samples_pushed, 6);
        assert_eq!(ingest.buffer().read().latest(0, 3), vec![1.0, 2.0, 5.0]);
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut ingest = ingest(1, 4).with_events(tx);
        ingest.handle_text(r#"{"type":"telemetry","fpgaTemp":36.5}"#, Instant::now());

        let event = rx.recv().await.unwrap();
        assert_eq!(event["fpgaTemp"], 36.5);
    }

    #[test]
    fn test_watchdog_resets_stale_stream() {
        let mut ingest = ingest(1, 4);
        let start = Instant::now();
        ingest.handle_text(r#"{"type":"chat.token","token":"he"}"#, start);
        assert!(ingest.watchdog().is_in_flight());

        ingest.poll_watchdog(start + Duration::from_secs(5));
        assert!(ingest.watchdog().is_in_flight());

        ingest.poll_watchdog(start + Duration::from_secs(31));
        assert!(!ingest.watchdog().is_in_flight());
        assert_eq!(ingest.stats().snapshot().watchdog_resets, 1);
    }

    #[test]
    fn test_watchdog_cleared_by_terminal_message() {
        let mut watchdog = StreamWatchdog::new(Duration::from_secs(1));
        let start = Instant::now();
        watchdog.observe("stream.chunk", start);
        watchdog.observe("stream.end", start);
        assert!(!watchdog.poll(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_new_connection_clears_stream_state() {
        let mut ingest = ingest(1, 4);
        let start = Instant::now();
        ingest.handle_text(r#"{"type":"chat.token","seq":7}"#, start);
        assert!(ingest.watchdog().is_in_flight());

        ingest.reset_connection_state();
        assert!(!ingest.watchdog().is_in_flight());

        // The old operation is gone, not timed out
        ingest.poll_watchdog(start + Duration::from_secs(60));
        assert_eq!(ingest.stats().snapshot().watchdog_resets, 0);

        // Sequence numbering starts over on the new connection
        ingest.handle_text(r#"{"type":"status","seq":1}"#, start);
        let stats = ingest.stats().snapshot();
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.sequence_gaps, 0);
    }

    #[tokio::test]
    async fn test_refused_connection_is_websocket_error() {
        let mut ingest = ingest(1, 4);
        let err = tokio_test::assert_err!(ingest.connect().await);
        assert!(matches!(err, ClientError::WebSocket(_)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let buffer = Arc::new(RwLock::new(ChannelRingBuffer::new(1, 4).unwrap()));
        let config = ClientConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
            },
            ..Default::default()
        };
        // Port 1 on loopback refuses connections
        let mut ingest = IngestLoop::new("ws://127.0.0.1:1/ws/neural-data", buffer, &config);
        let (_tx, rx) = watch::channel(false);

        let err = tokio_test::assert_err!(ingest.run(rx).await);
        assert!(matches!(err, ClientError::RetriesExhausted(2)));
    }
}
