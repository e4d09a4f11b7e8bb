// Upstream pairing
//
// Some topics (chat, agent control) are bidirectional: a downstream client is
// paired with its own connection to an upstream service. Client text goes up,
// upstream frames come down through the client's outbound queue. Either side
// closing tears down the other.

use crate::client::ClientHandle;
use crate::error::{RelayError, RelayResult};
use crate::types::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// One client's connection to its upstream service
pub struct UpstreamLink {
    url: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl UpstreamLink {
    /// Connect to `url` and pump upstream frames into `client`
    pub async fn connect(url: &str, client: ClientHandle) -> RelayResult<Self> {
        let (stream, _) = connect_async(url).await?;
        let (mut write, mut read) = stream.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
        let client_id = client.id();

        info!("Client {} paired with upstream {}", client_id, url);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                warn!("Upstream send for client {} failed: {}", client_id, e);
                                break;
                            }
                        }
                        None => {
                            // Client side is gone
                            if let Err(e) = write.close().await {
                                debug!("Error closing upstream for client {}: {}", client_id, e);
                            }
                            break;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if client.send(Frame::text(text.as_str())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if client.send(Frame::Binary(bytes)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Upstream closed, terminating client {}", client_id);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Upstream error for client {}: {}", client_id, e);
                            break;
                        }
                    },
                }
            }

            client.terminate();
        });

        Ok(Self {
            url: url.to_string(),
            outbound,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward one client text payload upstream
    pub fn forward(&self, text: String) -> RelayResult<()> {
        self.outbound
            .send(text)
            .map_err(|_| RelayError::WebSocket(format!("upstream {} is closed", self.url)))
    }

    /// Close the upstream side
    pub fn close(self) {
        drop(self.outbound);
    }
}
