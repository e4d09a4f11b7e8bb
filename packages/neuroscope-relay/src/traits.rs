use crate::error::RelayResult;
use crate::types::BrokerMessage;
use async_trait::async_trait;

/// Upstream pub/sub broker the relay subscribes to
///
/// `next_message` must be cancel-safe: the relay polls it inside `select!`
/// alongside its flush timer.
#[async_trait]
pub trait BrokerSource: Send {
    /// (Re)connect and subscribe to `topics`
    async fn subscribe(&mut self, topics: &[String]) -> RelayResult<()>;

    /// Next message on any subscribed topic; `Ok(None)` once the
    /// subscription has ended
    async fn next_message(&mut self) -> RelayResult<Option<BrokerMessage>>;

    /// Drop the subscription
    async fn close(&mut self);
}
