// Downstream client handle
//
// The broadcast side never touches a socket. Each connection owns an unbounded
// outbound queue drained by its connection task; the handle counts bytes that
// were queued but not yet written (`buffered_bytes`), which is what the
// backpressure check reads.

use crate::error::{RelayError, RelayResult};
use crate::types::{ClientId, Frame};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Lifecycle of a downstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Connecting,
    Open,
    Closed,
}

/// Cloneable handle to one downstream connection
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    id: ClientId,
    connected_at: DateTime<Utc>,
    state: watch::Sender<ClientState>,
    outbound: mpsc::UnboundedSender<Frame>,
    buffered: AtomicUsize,
}

impl ClientHandle {
    /// Create a handle in `Connecting` state and the queue its task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ClientState::Connecting);
        let handle = Self {
            inner: Arc::new(ClientInner {
                id: Uuid::new_v4(),
                connected_at: Utc::now(),
                state,
                outbound,
                buffered: AtomicUsize::new(0),
            }),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ClientState::Open
    }

    /// Bytes queued for this client and not yet written to its socket
    pub fn buffered_bytes(&self) -> usize {
        self.inner.buffered.load(Ordering::Acquire)
    }

    /// Connecting -> Open; a closed handle stays closed
    pub fn mark_open(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ClientState::Connecting {
                *state = ClientState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Queue a frame for the connection task
    ///
    /// Fails when the handle is not open or its connection task is gone.
    pub fn send(&self, frame: Frame) -> RelayResult<()> {
        if !self.is_open() {
            return Err(RelayError::ClientGone(self.id()));
        }

        let len = frame.len();
        self.inner.buffered.fetch_add(len, Ordering::AcqRel);
        if self.inner.outbound.send(frame).is_err() {
            self.release(len);
            self.terminate();
            return Err(RelayError::ClientGone(self.id()));
        }
        Ok(())
    }

    /// Account for `len` bytes that left the queue
    pub fn release(&self, len: usize) {
        let _ = self
            .inner
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(len))
            });
    }

    /// Move to `Closed`; returns `true` if the handle was not closed yet
    pub fn terminate(&self) -> bool {
        self.inner.state.send_replace(ClientState::Closed) != ClientState::Closed
    }

    /// Resolves once the handle reaches `Closed`
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ClientState::Closed).await;
    }
}
