//! # Message Bus Boundary
//!
//! The processor only needs two things from the bus: a stream of messages for a
//! set of topic/partitions, and a way to publish a bounded list of records to a
//! topic. Both are expressed through [`BusClient`] so the core never depends on
//! a concrete transport.
//!
//! - [`memory::InMemoryBus`]: per-topic broadcast channels, used by tests and
//!   local runs
//! - `kafka::KafkaBus` (feature `kafka`): rdkafka consumer and producer
//!
//! Delivery is at-least-once. Offset recovery (falling back to the oldest
//! available offset) belongs to the adapter, not the core.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

/// One inbound message as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: &str, key: Option<&str>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            value: value.into(),
        }
    }
}

/// One outbound record, optionally keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn keyed(key: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.to_string()),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartition {
    pub name: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(name: &str, partition: i32) -> Self {
        Self {
            name: name.to_string(),
            partition,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    pub group_id: String,
    pub auto_commit: bool,
    pub fetch_max_wait: Duration,
    pub fetch_max_bytes: usize,
}

impl From<&crate::config::BusConfig> for SubscribeOptions {
    fn from(config: &crate::config::BusConfig) -> Self {
        Self {
            group_id: config.group_id.clone(),
            auto_commit: config.auto_commit,
            fetch_max_wait: config.fetch_max_wait,
            fetch_max_bytes: config.fetch_max_bytes,
        }
    }
}

pub type MessageStream = BoxStream<'static, BusResult<BusMessage>>;

#[mockall::automock]
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Starts consuming the given topic/partitions. The returned stream ends
    /// when the underlying connection is closed.
    async fn subscribe(
        &self,
        topics: Vec<TopicPartition>,
        options: SubscribeOptions,
    ) -> BusResult<MessageStream>;

    /// Publishes all records in one call. Adapters may reject calls above their
    /// own ceiling; callers chunk through [`crate::publisher::OutboundPublisher`].
    async fn publish(&self, topic: &str, records: Vec<OutboundRecord>) -> BusResult<()>;
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Subscribe failed for {topic}: {message}")]
    SubscribeFailed { topic: String, message: String },

    #[error("Publish to {topic} failed: {message}")]
    SendFailed { topic: String, message: String },

    #[error("Receive failed: {message}")]
    ReceiveFailed { message: String },

    #[error("Consumer lagged: {count} messages skipped")]
    Lagged { count: u64 },
}

pub type BusResult<T> = Result<T, BusError>;
