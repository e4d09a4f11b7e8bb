// Backpressure-aware broadcast manager
//
// Client sets live behind per-topic read/write locks. `broadcast` snapshots a
// topic's members under the read lock, sends without holding it, and removes
// clients whose send failed in a second pass, so a set is never mutated while
// it is being walked.
//
// On throughput topics a client whose buffered amount is over the threshold
// misses the frame and the topic's dropped counter goes up; the client itself
// stays connected. Other topics always send.

use crate::client::{ClientHandle, ClientState};
use crate::error::{RelayError, RelayResult};
use crate::types::{ClientId, Frame, TopicPolicy, TopicRoute};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default per-client buffered amount above which throughput frames are skipped
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 1024 * 1024;

/// What happened to one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// A registered client as reported by the stats endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub buffered_bytes: usize,
}

/// Per-topic counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSnapshot {
    pub topic: String,
    pub throughput: bool,
    pub client_count: usize,
    pub dropped_frames: u64,
    pub clients: Vec<ClientInfo>,
}

struct TopicState {
    policy: TopicPolicy,
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    dropped: AtomicU64,
}

struct ManagerInner {
    topics: HashMap<String, TopicState>,
    backpressure_threshold: usize,
    shutting_down: AtomicBool,
}

/// Registry of downstream clients per topic
#[derive(Clone)]
pub struct BroadcastManager {
    inner: Arc<ManagerInner>,
}

impl BroadcastManager {
    /// Create a manager for a fixed set of topics
    pub fn new<I, S>(topics: I, backpressure_threshold: usize) -> Self
    where
        I: IntoIterator<Item = (S, TopicPolicy)>,
        S: Into<String>,
    {
        let topics = topics
            .into_iter()
            .map(|(name, policy)| {
                (
                    name.into(),
                    TopicState {
                        policy,
                        clients: RwLock::new(HashMap::new()),
                        dropped: AtomicU64::new(0),
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(ManagerInner {
                topics,
                backpressure_threshold,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// One topic per route's websocket topic
    pub fn from_routes(routes: &[TopicRoute], backpressure_threshold: usize) -> Self {
        Self::new(
            routes.iter().map(|r| (r.ws_topic.clone(), r.policy())),
            backpressure_threshold,
        )
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.topics.contains_key(topic)
    }

    pub fn policy(&self, topic: &str) -> Option<TopicPolicy> {
        self.inner.topics.get(topic).map(|t| t.policy)
    }

    pub fn backpressure_threshold(&self) -> usize {
        self.inner.backpressure_threshold
    }

    /// Register a client and watch it for closure
    ///
    /// Fails for unknown topics and once `shutdown` has run; the client is
    /// terminated in both cases. Must be called inside a tokio runtime.
    pub fn add_client(&self, topic: &str, client: ClientHandle) -> RelayResult<()> {
        let Some(state) = self.inner.topics.get(topic) else {
            warn!("Ignoring client {} for unknown topic {}", client.id(), topic);
            client.terminate();
            return Err(RelayError::UnknownTopic(topic.to_string()));
        };
        if self.inner.shutting_down.load(Ordering::Acquire) {
            client.terminate();
            return Err(RelayError::ShuttingDown);
        }

        state.clients.write().insert(client.id(), client.clone());
        debug!("Client {} registered on {}", client.id(), topic);

        let manager = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            client.closed().await;
            manager.remove_client(&topic, client.id());
        });

        Ok(())
    }

    /// Remove a client and terminate it if still live; idempotent
    pub fn remove_client(&self, topic: &str, client_id: ClientId) -> bool {
        let Some(state) = self.inner.topics.get(topic) else {
            return false;
        };

        let removed = state.clients.write().remove(&client_id);
        match removed {
            Some(client) => {
                if client.state() != ClientState::Closed {
                    client.terminate();
                }
                debug!("Client {} removed from {}", client_id, topic);
                true
            }
            None => false,
        }
    }

    /// Send `frame` to every open client of `topic`
    pub fn broadcast(&self, topic: &str, frame: Frame) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let Some(state) = self.inner.topics.get(topic) else {
            debug!("Broadcast to unknown topic {}", topic);
            return outcome;
        };

        let clients: Vec<ClientHandle> = state.clients.read().values().cloned().collect();
        let mut dead = Vec::new();

        for client in &clients {
            if !client.is_open() {
                continue;
            }

            if state.policy.throughput
                && client.buffered_bytes() > self.inner.backpressure_threshold
            {
                state.dropped.fetch_add(1, Ordering::Relaxed);
                outcome.skipped += 1;
                continue;
            }

            match client.send(frame.clone()) {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    debug!("Send on {} failed: {}", topic, e);
                    dead.push(client.id());
                }
            }
        }

        for client_id in dead {
            if self.remove_client(topic, client_id) {
                outcome.removed += 1;
            }
        }

        outcome
    }

    pub fn client_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.clients.read().len())
            .unwrap_or(0)
    }

    pub fn total_clients(&self) -> usize {
        self.inner
            .topics
            .values()
            .map(|t| t.clients.read().len())
            .sum()
    }

    /// Frames skipped for slow clients on `topic` since startup
    pub fn dropped_frames(&self, topic: &str) -> u64 {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Known topic names, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn snapshot(&self) -> Vec<TopicSnapshot> {
        let mut snapshot: Vec<TopicSnapshot> = self
            .inner
            .topics
            .iter()
            .map(|(name, state)| {
                let clients: Vec<ClientInfo> = state
                    .clients
                    .read()
                    .values()
                    .map(|c| ClientInfo {
                        id: c.id(),
                        connected_at: c.connected_at(),
                        buffered_bytes: c.buffered_bytes(),
                    })
                    .collect();
                TopicSnapshot {
                    topic: name.clone(),
                    throughput: state.policy.throughput,
                    client_count: clients.len(),
                    dropped_frames: state.dropped.load(Ordering::Relaxed),
                    clients,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.topic.cmp(&b.topic));
        snapshot
    }

    /// Terminate every client, empty every set and refuse new registrations
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let mut terminated = 0;
        for state in self.inner.topics.values() {
            let clients = std::mem::take(&mut *state.clients.write());
            for client in clients.into_values() {
                client.terminate();
                terminated += 1;
            }
        }
        info!("Closed {} client connections", terminated);
    }
}
