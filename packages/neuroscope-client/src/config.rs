// Client-side configuration
//
// Deserializable from JSON/TOML-style settings; every field has a default so a
// partial document is enough.

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for reconnecting to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed connects before giving up
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Geometry and behaviour of one viewing session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub channel_count: usize,
    /// Ring capacity per channel
    pub samples_per_channel: usize,
    pub max_lod_levels: u32,
    /// Reuse precomputed LOD levels between paints of an unchanged window
    pub lod_caching: bool,
    pub reconnect: ReconnectPolicy,
    /// Force-reset an in-flight streamed operation after this long
    pub stream_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_count: 256,
            samples_per_channel: 30_000, // one second at 30 kHz
            max_lod_levels: 10,
            lod_caching: true,
            reconnect: ReconnectPolicy::default(),
            stream_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> ClientResult<()> {
        if self.channel_count == 0 {
            return Err(ClientError::InvalidConfig(
                "channel_count must be greater than zero".to_string(),
            ));
        }
        if self.samples_per_channel == 0 {
            return Err(ClientError::InvalidConfig(
                "samples_per_channel must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ClientError::InvalidConfig(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }
}
