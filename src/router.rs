//! # Event Router
//!
//! Parses each bus message and dispatches it by topic:
//!
//! - things: provision the derived properties of the new entity
//! - properties: index the property, tracking its entity if unknown
//! - values: add the number of values to the owning record's counter
//!
//! Malformed payloads are reported and dropped; unknown topics are ignored.
//! Registry work is spawned so a slow registry never holds up the next
//! message. Value events for properties that are not indexed yet are dropped:
//! there is no buffering, so values arriving before their property-created
//! event is processed are lost for counting purposes.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    bus::{BusError, BusMessage, MessageStream},
    config::TopicNames,
    registrar::{PropertyEvent, Registrar},
    store::AggregationStore,
    EntityId, PropertyId,
};

/// Payload of a thing-created event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThingEvent {
    pub id: EntityId,
}

/// Payload of a values event: either the bare list of value rows, or a
/// property object carrying them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ValuesPayload {
    Rows(Vec<serde_json::Value>),
    Property {
        #[serde(default)]
        id: Option<PropertyId>,
        values: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Thing(ThingEvent),
    Property(PropertyEvent),
    Values { property_id: PropertyId, count: u64 },
    Ignored,
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Could not parse message from topic {topic}: {source}")]
    Parse {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Values message on {topic} does not name a property")]
    MissingPropertyId { topic: String },
}

pub type RouterResult<T> = Result<T, RouterError>;

pub struct EventRouter {
    registrar: Arc<Registrar>,
    store: Arc<AggregationStore>,
    topics: TopicNames,
}

impl EventRouter {
    pub fn new(registrar: Arc<Registrar>, topics: TopicNames) -> Self {
        let store = registrar.store().clone();
        Self {
            registrar,
            store,
            topics,
        }
    }

    pub fn parse(&self, message: &BusMessage) -> RouterResult<Route> {
        let topic = message.topic.as_str();
        let parse_error = |source| RouterError::Parse {
            topic: topic.to_string(),
            source,
        };
        if topic == self.topics.things {
            let thing = serde_json::from_slice(&message.value).map_err(parse_error)?;
            Ok(Route::Thing(thing))
        } else if topic == self.topics.properties {
            let property = serde_json::from_slice(&message.value).map_err(parse_error)?;
            Ok(Route::Property(property))
        } else if topic == self.topics.values {
            let payload: ValuesPayload =
                serde_json::from_slice(&message.value).map_err(parse_error)?;
            let (payload_id, values) = match payload {
                ValuesPayload::Rows(values) => (None, values),
                ValuesPayload::Property { id, values } => (id, values),
            };
            let property_id = message
                .key
                .clone()
                .filter(|key| !key.is_empty())
                .or(payload_id)
                .ok_or_else(|| RouterError::MissingPropertyId {
                    topic: topic.to_string(),
                })?;
            Ok(Route::Values {
                property_id,
                count: values.len() as u64,
            })
        } else {
            Ok(Route::Ignored)
        }
    }

    /// Handles one message without waiting on the registry. Counter and
    /// index updates happen before returning; provisioning runs in the
    /// returned task.
    pub fn dispatch(&self, message: &BusMessage) -> RouterResult<Option<JoinHandle<()>>> {
        match self.parse(message)? {
            Route::Thing(thing) => {
                let registrar = self.registrar.clone();
                Ok(Some(tokio::spawn(async move {
                    if let Err(e) = registrar.provision_for_entity(&thing.id).await {
                        error!("{}", e);
                    }
                })))
            }
            Route::Property(property) => {
                let Some(entity_id) = self.registrar.index_observed(&property) else {
                    return Ok(None);
                };
                let registrar = self.registrar.clone();
                Ok(Some(tokio::spawn(async move {
                    if let Err(e) = registrar.track_entity(&entity_id).await {
                        error!("{}", e);
                    }
                })))
            }
            Route::Values { property_id, count } => {
                self.store.record_arrival(&property_id, count);
                Ok(None)
            }
            Route::Ignored => {
                trace!("Ignoring message on {}", message.topic);
                Ok(None)
            }
        }
    }

    /// Consumes `stream` until it ends or a shutdown signal arrives. No single
    /// message or bus error stops the loop.
    pub async fn run(&self, mut stream: MessageStream, mut shutdown: broadcast::Receiver<()>) {
        info!("Event router started");
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        trace!("Received message on {}", message.topic);
                        if let Err(e) = self.dispatch(&message) {
                            error!("{}", e);
                        }
                    }
                    Some(Err(BusError::Lagged { count })) => {
                        warn!("Router lagged behind, {} messages skipped", count);
                    }
                    Some(Err(e)) => error!("Bus error: {}", e),
                    None => {
                        debug!("Message stream ended");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    debug!("Event router received shutdown signal");
                    break;
                }
            }
        }
        info!("Event router stopped");
    }
}
