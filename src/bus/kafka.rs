//! Kafka adapter backed by rdkafka.
//!
//! The consumer is assigned explicit topic/partitions (no group rebalancing)
//! and resets to the earliest offset when its stored offset is out of range.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future::try_join_all, StreamExt};
use rdkafka::{
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    message::Message,
    producer::{FutureProducer, FutureRecord},
    TopicPartitionList,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use super::{
    BusClient, BusError, BusMessage, BusResult, MessageStream, OutboundRecord, SubscribeOptions,
    TopicPartition,
};
use crate::config::BusConfig;

const STREAM_BUFFER: usize = 1024;

pub struct KafkaBus {
    bootstrap_servers: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaBus {
    pub fn connect(config: &BusConfig) -> BusResult<Self> {
        let bootstrap_servers = config.bootstrap_servers();
        debug!("Connecting producer to {}", bootstrap_servers);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| BusError::ConnectionFailed {
                message: e.to_string(),
            })?;
        Ok(Self {
            bootstrap_servers,
            producer,
            send_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl BusClient for KafkaBus {
    async fn subscribe(
        &self,
        topics: Vec<TopicPartition>,
        options: SubscribeOptions,
    ) -> BusResult<MessageStream> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &options.group_id)
            .set("enable.auto.commit", options.auto_commit.to_string())
            .set("auto.offset.reset", "earliest")
            .set(
                "fetch.wait.max.ms",
                options.fetch_max_wait.as_millis().to_string(),
            )
            .set("fetch.max.bytes", options.fetch_max_bytes.to_string())
            .create()
            .map_err(|e| BusError::ConnectionFailed {
                message: e.to_string(),
            })?;

        let mut assignment = TopicPartitionList::new();
        for topic in &topics {
            assignment.add_partition(&topic.name, topic.partition);
        }
        consumer
            .assign(&assignment)
            .map_err(|e| BusError::SubscribeFailed {
                topic: topics
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                message: e.to_string(),
            })?;
        info!("Kafka consumer assigned to {} partitions", topics.len());

        let consumer = Arc::new(consumer);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                let item = match consumer.recv().await {
                    Ok(message) => Ok(BusMessage {
                        topic: message.topic().to_string(),
                        key: message
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned()),
                        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    }),
                    Err(e) => {
                        error!("Kafka receive error: {}", e);
                        Err(BusError::ReceiveFailed {
                            message: e.to_string(),
                        })
                    }
                };
                if tx.send(item).await.is_err() {
                    debug!("Message stream dropped, stopping consumer");
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn publish(&self, topic: &str, records: Vec<OutboundRecord>) -> BusResult<()> {
        let sends = records.iter().map(|record| {
            let mut future_record: FutureRecord<'_, str, [u8]> =
                FutureRecord::to(topic).payload(record.value.as_slice());
            if let Some(key) = record.key.as_deref() {
                future_record = future_record.key(key);
            }
            self.producer.send(future_record, self.send_timeout)
        });
        try_join_all(sends)
            .await
            .map_err(|(e, _)| BusError::SendFailed {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}
