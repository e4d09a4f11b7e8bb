use crate::broadcast::DEFAULT_BACKPRESSURE_THRESHOLD;
use crate::relay::{Backoff, DEFAULT_FLUSH_INTERVAL};
use crate::types::{default_routes, TopicRoute};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Relay configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address (0.0.0.0 for LAN, 127.0.0.1 for localhost)
    pub bind_addr: String,
    /// Websocket URL of the pub/sub broker
    pub broker_url: String,
    /// Batch flush period
    pub flush_interval: Duration,
    /// Buffered bytes above which throughput topics skip a client
    pub backpressure_threshold: usize,
    /// Ping period; a ping unanswered by the next one fails the connection
    pub heartbeat_interval: Duration,
    /// Broker reconnect backoff
    pub broker_backoff: Backoff,
    /// Broker topic -> websocket topic table
    pub routes: Vec<TopicRoute>,
    /// Websocket topic -> upstream URL for paired topics
    pub upstreams: HashMap<String, String>,
    /// CORS allowed origins (comma-separated in env var); empty allows any
    pub cors_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            bind_addr: "0.0.0.0".to_string(),
            broker_url: "ws://127.0.0.1:6390/pubsub".to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            heartbeat_interval: Duration::from_secs(30),
            broker_backoff: Backoff::default(),
            routes: default_routes(),
            upstreams: HashMap::new(),
            cors_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("RELAY_PORT") {
            Some(port) => port.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let flush_ms = parse_number(&lookup, "FLUSH_INTERVAL_MS", 50)?;
        if flush_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "FLUSH_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let heartbeat_secs = parse_number(&lookup, "HEARTBEAT_INTERVAL_SECS", 30)?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "HEARTBEAT_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        let backoff_initial = parse_number(&lookup, "BROKER_BACKOFF_INITIAL_MS", 500)?;
        let backoff_max = parse_number(&lookup, "BROKER_BACKOFF_MAX_MS", 30_000)?;
        if backoff_initial == 0 || backoff_max < backoff_initial {
            return Err(ConfigError::InvalidValue(
                "broker backoff must satisfy 0 < initial <= max".to_string(),
            ));
        }

        let routes = match lookup("RELAY_TOPICS") {
            Some(spec) => parse_topic_specs(&spec)?,
            None => defaults.routes,
        };

        let upstreams = match lookup("UPSTREAM_ROUTES") {
            Some(spec) => parse_upstream_routes(&spec)?,
            None => HashMap::new(),
        };
        if let Some(topic) = upstreams
            .keys()
            .find(|topic| !routes.iter().any(|r| &r.ws_topic == *topic))
        {
            return Err(ConfigError::InvalidValue(format!(
                "UPSTREAM_ROUTES names unknown topic {}",
                topic
            )));
        }

        Ok(Self {
            port,
            bind_addr: lookup("RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            broker_url: lookup("BROKER_URL").unwrap_or(defaults.broker_url),
            flush_interval: Duration::from_millis(flush_ms),
            backpressure_threshold: parse_number(
                &lookup,
                "BACKPRESSURE_THRESHOLD_BYTES",
                DEFAULT_BACKPRESSURE_THRESHOLD as u64,
            )? as usize,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            broker_backoff: Backoff {
                initial: Duration::from_millis(backoff_initial),
                max: Duration::from_millis(backoff_max),
            },
            routes,
            upstreams,
            cors_origins: lookup("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Get the full bind address (addr:port)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_number<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, value))),
        None => Ok(default),
    }
}

/// Parse `broker_topic=ws_topic[:flag+flag],...` with flags `throughput`
/// and `batch`
pub fn parse_topic_specs(spec: &str) -> Result<Vec<TopicRoute>, ConfigError> {
    let mut routes: Vec<TopicRoute> = Vec::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || ConfigError::InvalidTopicSpec(entry.to_string());

        let (broker_topic, rest) = entry.split_once('=').ok_or_else(invalid)?;
        let (ws_topic, flags) = match rest.split_once(':') {
            Some((ws_topic, flags)) => (ws_topic, Some(flags)),
            None => (rest, None),
        };

        let (broker_topic, ws_topic) = (broker_topic.trim(), ws_topic.trim());
        if broker_topic.is_empty() || ws_topic.is_empty() {
            return Err(invalid());
        }

        let mut route = TopicRoute::new(broker_topic, ws_topic, false, false);
        for flag in flags.into_iter().flat_map(|f| f.split('+')).map(str::trim) {
            match flag {
                "throughput" => route.throughput = true,
                "batch" => route.batchable = true,
                "" => {}
                _ => return Err(invalid()),
            }
        }

        if routes.iter().any(|r| r.broker_topic == route.broker_topic) {
            return Err(ConfigError::InvalidTopicSpec(format!(
                "duplicate broker topic {}",
                route.broker_topic
            )));
        }
        if let Some(other) = routes.iter().find(|r| r.ws_topic == route.ws_topic) {
            if other.throughput != route.throughput || other.batchable != route.batchable {
                return Err(ConfigError::InvalidTopicSpec(format!(
                    "conflicting flags for websocket topic {}",
                    route.ws_topic
                )));
            }
        }
        routes.push(route);
    }

    if routes.is_empty() {
        return Err(ConfigError::InvalidTopicSpec(spec.to_string()));
    }
    Ok(routes)
}

/// Parse `ws_topic=ws://url,...`
pub fn parse_upstream_routes(spec: &str) -> Result<HashMap<String, String>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            let (topic, url) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue(format!("upstream route {}", entry)))?;
            let url = url.trim();
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidValue(format!(
                    "upstream URL must be ws:// or wss://: {}",
                    url
                )));
            }
            Ok((topic.trim().to_string(), url.to_string()))
        })
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Invalid topic spec: {0}")]
    InvalidTopicSpec(String),
}
