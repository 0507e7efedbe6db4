//! # Outbound Publisher
//!
//! The bus enforces a per-call ceiling on message count, so every outbound
//! batch is split into chunks of at most `chunk_size` records, published
//! sequentially and in order. The first failing chunk aborts the call; chunks
//! already sent stay sent and the caller decides whether to retry the batch.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    bus::{BusClient, BusError, OutboundRecord},
    registry::RegistryError,
};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Chunk {chunk} of {chunks} failed: {source}")]
    Bus {
        chunk: usize,
        chunks: usize,
        #[source]
        source: BusError,
    },

    #[error("Update of {property_id} failed: {source}")]
    Registry {
        property_id: String,
        #[source]
        source: RegistryError,
    },

    #[error("Failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type PublishResult<T> = Result<T, PublishError>;

pub struct OutboundPublisher {
    bus: Arc<dyn BusClient>,
    chunk_size: usize,
}

impl OutboundPublisher {
    pub fn new(bus: Arc<dyn BusClient>) -> Self {
        Self::with_chunk_size(bus, DEFAULT_CHUNK_SIZE)
    }

    /// A `chunk_size` of zero is treated as one.
    pub fn with_chunk_size(bus: Arc<dyn BusClient>, chunk_size: usize) -> Self {
        Self {
            bus,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Publishes `records` to `topic` in order. When `key` is given it is
    /// applied to every record that does not carry its own.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        key: Option<&str>,
    ) -> PublishResult<()> {
        if records.is_empty() {
            trace!("Nothing to publish to {}", topic);
            return Ok(());
        }
        let chunks = records.len().div_ceil(self.chunk_size);
        debug!(
            "Publishing {} records to {} in {} chunks",
            records.len(),
            topic,
            chunks
        );

        let mut records = records.into_iter().map(|mut record| {
            if record.key.is_none() {
                record.key = key.map(str::to_string);
            }
            record
        });
        for chunk in 0..chunks {
            let batch: Vec<OutboundRecord> = records.by_ref().take(self.chunk_size).collect();
            self.bus
                .publish(topic, batch)
                .await
                .map_err(|source| PublishError::Bus {
                    chunk: chunk + 1,
                    chunks,
                    source,
                })?;
        }
        Ok(())
    }
}
