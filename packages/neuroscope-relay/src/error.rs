/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur in the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Client gone: {0}")]
    ClientGone(uuid::Uuid),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Relay is shutting down")]
    ShuttingDown,
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::WebSocket(e.to_string())
    }
}

impl From<neuroscope_client::ClientError> for RelayError {
    fn from(e: neuroscope_client::ClientError) -> Self {
        RelayError::MalformedFrame(e.to_string())
    }
}
