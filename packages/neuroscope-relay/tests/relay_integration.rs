// End-to-end: in-process broker -> relay -> axum websocket -> tungstenite client

use axum::{
    extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use neuroscope_client::{decode_text, SampleFrame};
use neuroscope_relay::{
    build_router, default_routes, BatchingRelay, BroadcastManager, BrokerPayload, ChannelBroker,
    Frame, RelayResult, RelayState,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    broker: ChannelBroker,
    manager: BroadcastManager,
    shutdown: watch::Sender<bool>,
    relay: JoinHandle<RelayResult<()>>,
}

async fn start(flush: Duration, upstreams: HashMap<String, String>) -> Harness {
    start_with_heartbeat(flush, upstreams, Duration::from_secs(30)).await
}

async fn start_with_heartbeat(
    flush: Duration,
    upstreams: HashMap<String, String>,
    heartbeat: Duration,
) -> Harness {
    let routes = default_routes();
    let manager = BroadcastManager::from_routes(&routes, 1 << 20);
    let broker = ChannelBroker::new(256);
    let mut source = broker.source();

    let mut relay = BatchingRelay::new(&routes, manager.clone(), flush);
    let metrics = relay.metrics();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(async move { relay.run(&mut source, shutdown_rx).await });

    let state = RelayState::new(manager.clone(), metrics, upstreams, heartbeat);
    let app = build_router(state, &[]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let harness = Harness {
        addr,
        broker,
        manager,
        shutdown,
        relay,
    };
    let broker = harness.broker.clone();
    eventually(move || {
        let broker = broker.clone();
        async move { broker.subscriber_count() == 1 }
    })
    .await;
    harness
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connect(harness: &Harness, topic: &str) -> Client {
    let url = format!("ws://{}/ws/{}", harness.addr, topic);
    let (client, _) = connect_async(url).await.unwrap();

    let manager = harness.manager.clone();
    let topic = topic.to_string();
    eventually(move || {
        let ready = manager.client_count(&topic) == 1;
        async move { ready }
    })
    .await;
    client
}

async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no message in time")
            .expect("stream ended")
            .expect("websocket error");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

#[tokio::test]
async fn batched_topic_delivers_envelope() {
    let harness = start(Duration::from_millis(250), HashMap::new()).await;
    let mut client = connect(&harness, "spike-events").await;

    for seq in 1..=3 {
        harness
            .broker
            .publish("spike_events_stream", &json!({"seq": seq, "channel": 7}));
    }

    let text = next_message(&mut client).await.into_text().unwrap();
    let envelope: Value = serde_json::from_str(text.as_str()).unwrap();
    let items = envelope.as_array().expect("batch envelope");
    assert_eq!(items.len(), 3);
    assert_eq!(items[2]["seq"], 3);

    harness.shutdown.send(true).unwrap();
    harness.relay.await.unwrap().unwrap();
}

#[tokio::test]
async fn immediate_and_binary_topics() {
    let harness = start(Duration::from_millis(20), HashMap::new()).await;
    let mut status = connect(&harness, "agent-status").await;
    let mut neural = connect(&harness, "neural-data").await;

    harness
        .broker
        .publish("agent_status_updates", &json!({"state": "running"}));
    let text = next_message(&mut status).await.into_text().unwrap();
    assert_eq!(decode_text(text.as_str()).unwrap(), vec![json!({"state": "running"})]);

    let frame = SampleFrame::encode(&[vec![0.25f32, 0.5], vec![-0.25, -0.5]]).unwrap();
    harness.broker.publish_raw(
        "neural_data_stream",
        BrokerPayload::Binary(frame.clone().into()),
    );
    match next_message(&mut neural).await {
        Message::Binary(bytes) => {
            let decoded = SampleFrame::decode(&bytes).unwrap();
            assert_eq!(decoded.channels[1], vec![-0.25, -0.5]);
        }
        other => panic!("expected binary frame, got {:?}", other),
    }

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn invalid_client_json_gets_error_reply() {
    let harness = start(Duration::from_millis(20), HashMap::new()).await;
    let mut client = connect(&harness, "chat").await;

    client.send(Message::Text("not json".into())).await.unwrap();
    let text = next_message(&mut client).await.into_text().unwrap();
    let reply: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(reply, json!({"error": "Invalid JSON payload"}));

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn client_close_deregisters() {
    let harness = start(Duration::from_millis(20), HashMap::new()).await;
    let mut client = connect(&harness, "telemetry").await;

    client.close(None).await.unwrap();
    let manager = harness.manager.clone();
    eventually(move || {
        let gone = manager.client_count("telemetry") == 0;
        async move { gone }
    })
    .await;

    harness.shutdown.send(true).unwrap();
}

async fn echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            if let AxumMessage::Text(text) = message {
                let reply = json!({ "echo": serde_json::from_str::<Value>(text.as_str()).unwrap() });
                if socket.send(AxumMessage::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    })
}

#[tokio::test]
async fn paired_topic_round_trips_through_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(upstream, Router::new().route("/ws", get(echo)))
            .await
            .unwrap()
    });

    let mut upstreams = HashMap::new();
    upstreams.insert("chat".to_string(), format!("ws://{}/ws", upstream_addr));
    let harness = start(Duration::from_millis(20), upstreams).await;
    let mut client = connect(&harness, "chat").await;

    client
        .send(Message::Text(json!({"msg": "hello"}).to_string().into()))
        .await
        .unwrap();
    let text = next_message(&mut client).await.into_text().unwrap();
    let reply: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(reply, json!({"echo": {"msg": "hello"}}));

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let harness = start(Duration::from_millis(20), HashMap::new()).await;
    let mut client = connect(&harness, "notifications").await;

    harness.manager.shutdown();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    harness.shutdown.send(true).unwrap();
    harness.relay.await.unwrap().unwrap();
}

#[tokio::test]
async fn missed_pong_deregisters_client() {
    let harness = start_with_heartbeat(
        Duration::from_millis(20),
        HashMap::new(),
        Duration::from_millis(100),
    )
    .await;
    // Never polled, so the client never answers a ping
    let client = connect(&harness, "telemetry").await;

    let manager = harness.manager.clone();
    eventually(move || {
        let gone = manager.client_count("telemetry") == 0;
        async move { gone }
    })
    .await;

    drop(client);
    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn stalled_reader_is_terminated() {
    let harness = start_with_heartbeat(
        Duration::from_millis(20),
        HashMap::new(),
        Duration::from_millis(100),
    )
    .await;
    // Connected but never reads, so the socket buffer fills up
    let client = connect(&harness, "chat").await;

    let payload = format!("\"{}\"", "x".repeat(1 << 20));
    for _ in 0..64 {
        harness.manager.broadcast("chat", Frame::text(payload.clone()));
    }

    let manager = harness.manager.clone();
    eventually(move || {
        let gone = manager.client_count("chat") == 0;
        async move { gone }
    })
    .await;
    assert_eq!(harness.manager.total_clients(), 0);

    drop(client);
    harness.shutdown.send(true).unwrap();
}
