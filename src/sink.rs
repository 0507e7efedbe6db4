//! Delivery of evaluator output.
//!
//! The evaluator never waits on delivery: it hands each tick's updates to an
//! [`UpdateSink`] in a spawned task. Failures are logged by the caller and the
//! update is lost for that tick.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tracing::{trace, warn};

use crate::{
    bus::OutboundRecord,
    publisher::{OutboundPublisher, PublishError, PublishResult},
    registry::{DataPoint, Registry},
    PropertyId,
};

/// One single-point time-series write against a derived property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyUpdate {
    pub property_id: PropertyId,
    pub point: DataPoint,
}

impl PropertyUpdate {
    pub fn new(property_id: &str, timestamp: i64, value: i64) -> Self {
        Self {
            property_id: property_id.to_string(),
            point: DataPoint(timestamp, value),
        }
    }
}

#[mockall::automock]
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn deliver(&self, updates: Vec<PropertyUpdate>) -> PublishResult<()>;
}

/// Publishes `[[timestamp, value]]` records keyed by property id on the
/// values topic.
pub struct BusUpdateSink {
    publisher: OutboundPublisher,
    topic: String,
}

impl BusUpdateSink {
    pub fn new(publisher: OutboundPublisher, topic: &str) -> Self {
        Self {
            publisher,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl UpdateSink for BusUpdateSink {
    async fn deliver(&self, updates: Vec<PropertyUpdate>) -> PublishResult<()> {
        let records = updates
            .iter()
            .map(|update| -> PublishResult<OutboundRecord> {
                let body = serde_json::to_vec(&[update.point])?;
                Ok(OutboundRecord::keyed(&update.property_id, body))
            })
            .collect::<PublishResult<Vec<_>>>()?;
        self.publisher.publish_batch(&self.topic, records, None).await
    }
}

/// Upper bound on concurrent update calls per delivery.
pub const DEFAULT_REGISTRY_CONCURRENCY: usize = 32;

/// Writes every update through the registry, up to `concurrency` calls at a
/// time. Individual failures do not stop the remaining updates; the first one
/// in input order is returned.
pub struct RegistryUpdateSink {
    registry: Arc<dyn Registry>,
    concurrency: usize,
}

impl RegistryUpdateSink {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self::with_concurrency(registry, DEFAULT_REGISTRY_CONCURRENCY)
    }

    pub fn with_concurrency(registry: Arc<dyn Registry>, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl UpdateSink for RegistryUpdateSink {
    async fn deliver(&self, updates: Vec<PropertyUpdate>) -> PublishResult<()> {
        let results: Vec<PublishResult<()>> = stream::iter(updates)
            .map(|update| {
                let registry = self.registry.clone();
                async move {
                    trace!("Updating {} with {:?}", update.property_id, update.point);
                    let result = registry
                        .update_values(&update.property_id, vec![update.point])
                        .await;
                    match result {
                        Ok(()) => Ok(()),
                        Err(source) => {
                            warn!("Update of {} failed: {}", update.property_id, source);
                            Err(PublishError::Registry {
                                property_id: update.property_id,
                                source,
                            })
                        }
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }
}
