//! In-process bus built on tokio broadcast channels, one channel per topic.
//!
//! Every subscriber of a topic sees every message published to it. Partitions
//! are accepted for interface parity but not modelled: each topic behaves as a
//! single partition. A subscriber that falls more than `capacity` messages
//! behind receives a [`BusError::Lagged`] item and resumes from the oldest
//! retained message.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, trace};

use super::{
    BusClient, BusError, BusMessage, BusResult, MessageStream, OutboundRecord, SubscribeOptions,
    TopicPartition,
};

struct TopicChannel {
    sender: broadcast::Sender<BusMessage>,
    // keeps the channel open while nobody is subscribed
    _internal_receiver: broadcast::Receiver<BusMessage>,
}

pub struct InMemoryBus {
    topics: DashMap<String, TopicChannel>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = broadcast::channel(self.capacity);
                TopicChannel {
                    sender,
                    _internal_receiver: receiver,
                }
            })
            .sender
            .clone()
    }

    /// Delivers a single message, bypassing record conversion. Handy for
    /// feeding raw payloads (including malformed ones) in tests.
    pub fn deliver(&self, message: BusMessage) -> BusResult<()> {
        trace!("Delivering on {}: {:?}", message.topic, message.key);
        let topic = message.topic.clone();
        self.sender(&topic)
            .send(message)
            .map_err(|e| BusError::SendFailed {
                topic,
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn subscribers_size(&self, topic: &str) -> usize {
        // minus the internal receiver
        self.topics
            .get(topic)
            .map(|channel| channel.sender.receiver_count().saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn subscribe(
        &self,
        topics: Vec<TopicPartition>,
        options: SubscribeOptions,
    ) -> BusResult<MessageStream> {
        debug!(
            "Subscribing group {} to {:?}",
            options.group_id,
            topics.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
        );
        let streams = topics.iter().map(|topic| {
            BroadcastStream::new(self.sender(&topic.name).subscribe())
                .map(|item| {
                    item.map_err(|BroadcastStreamRecvError::Lagged(count)| BusError::Lagged {
                        count,
                    })
                })
                .boxed()
        });
        Ok(futures::stream::select_all(streams).boxed())
    }

    async fn publish(&self, topic: &str, records: Vec<OutboundRecord>) -> BusResult<()> {
        let sender = self.sender(topic);
        trace!("Publishing {} records to {}", records.len(), topic);
        for record in records {
            sender
                .send(BusMessage {
                    topic: topic.to_string(),
                    key: record.key,
                    value: record.value,
                })
                .map_err(|e| BusError::SendFailed {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    fn options() -> SubscribeOptions {
        SubscribeOptions::from(&BusConfig::default())
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InMemoryBus::new(16);
        assert!(bus
            .publish("values", vec![OutboundRecord::new("[]")])
            .await
            .is_ok());
        assert_eq!(bus.subscribers_size("values"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_merges_topics() {
        let bus = InMemoryBus::new(16);
        let mut stream = bus
            .subscribe(
                vec![
                    TopicPartition::new("things", 0),
                    TopicPartition::new("values", 0),
                ],
                options(),
            )
            .await
            .unwrap();
        assert_eq!(bus.subscribers_size("things"), 1);

        bus.publish("things", vec![OutboundRecord::new(r#"{"id":"t1"}"#)])
            .await
            .unwrap();
        bus.publish("values", vec![OutboundRecord::keyed("p1", "[[1,2]]")])
            .await
            .unwrap();
        bus.publish("ignored", vec![OutboundRecord::new("{}")])
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let mut topics = vec![first.topic.clone(), second.topic.clone()];
        topics.sort();
        assert_eq!(topics, vec!["things".to_string(), "values".to_string()]);
        let keyed = if first.topic == "values" { first } else { second };
        assert_eq!(keyed.key.as_deref(), Some("p1"));
        assert_eq!(keyed.value, b"[[1,2]]".to_vec());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_reports_and_resumes() {
        let bus = InMemoryBus::new(2);
        let mut stream = bus
            .subscribe(vec![TopicPartition::new("values", 0)], options())
            .await
            .unwrap();

        for i in 0..4 {
            bus.deliver(BusMessage::new("values", None, format!("{}", i)))
                .unwrap();
        }

        match stream.next().await.unwrap() {
            Err(BusError::Lagged { count }) => assert_eq!(count, 2),
            other => panic!("expected lag, got {:?}", other),
        }
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.value, b"2".to_vec());
    }
}
