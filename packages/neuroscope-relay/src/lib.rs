pub mod broadcast;
pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod traits;
pub mod types;
pub mod websocket;

pub use broadcast::{BroadcastManager, BroadcastOutcome, TopicSnapshot};
pub use broker::{ChannelBroker, ChannelBrokerSource, WsBroker};
pub use client::{ClientHandle, ClientState};
pub use config::{ConfigError, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use relay::{Backoff, BatchingRelay, RelayMetrics, RelayMetricsSnapshot};
pub use server::build_router;
pub use traits::BrokerSource;
pub use types::*;
pub use websocket::{handle_websocket, RelayState};
