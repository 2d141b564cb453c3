//! Pub/sub channels and ordered streams shared by the pipeline stages

pub mod memory;

use async_trait::async_trait;

use crate::types::error::Result;

pub use memory::InMemoryBroker;

/// One entry read from a stream through a consumer group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Receiving half of a channel subscription
pub type Subscription = flume::Receiver<String>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Fire-and-forget publish. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Drop every subscription of `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Append to an ordered stream, creating it if needed. Returns the entry id.
    async fn append(&self, stream: &str, payload: String) -> Result<String>;

    /// Create a consumer group (and the stream) if absent.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` entries past the group's cursor and advance it.
    async fn read_group(&self, stream: &str, group: &str, count: usize)
        -> Result<Vec<StreamEntry>>;

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<()>;

    async fn delete_stream(&self, stream: &str) -> Result<()>;

    async fn stream_len(&self, stream: &str) -> Result<usize>;
}

/// Serialize `value` and publish it on `channel`.
pub async fn publish_json<T: serde::Serialize + Sync>(
    broker: &dyn Broker,
    channel: &str,
    value: &T,
) -> Result<usize> {
    broker.publish(channel, serde_json::to_string(value)?).await
}

/// Serialize `value` and append it to `stream`.
pub async fn append_json<T: serde::Serialize + Sync>(
    broker: &dyn Broker,
    stream: &str,
    value: &T,
) -> Result<String> {
    broker.append(stream, serde_json::to_string(value)?).await
}
