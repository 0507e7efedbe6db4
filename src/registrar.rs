//! # Entity Registrar
//!
//! Makes sure every tracked entity owns its two derived properties ("Data
//! Count" and "Data Activity") before a record for it enters the store.
//!
//! Entities become tracked either eagerly, when a thing-created event arrives,
//! or lazily, when a property-created event names an entity the store does not
//! know yet. Both paths go through the store's provisioning claim, so at most
//! one attempt per entity is in flight and a tracked entity is never
//! provisioned twice. A failed attempt releases the claim and is retried by the
//! next event that references the entity.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    registry::{
        Entity, NewProperty, Registry, RegistryError, DATA_ACTIVITY_NAME, DATA_COUNT_NAME,
    },
    store::{AggregationRecord, AggregationStore},
    EntityId, PropertyId,
};

/// Payload of a property-created event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PropertyEvent {
    pub id: PropertyId,
    #[serde(rename = "entityId", default)]
    pub entity_id: Option<EntityId>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Both properties were created and the record inserted.
    Created,
    /// The record was rebuilt from properties that already existed upstream.
    Recovered,
    /// Nothing to do: tracked already, or another attempt is in flight.
    Skipped,
}

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Failed to create {name} property for {entity_id}: {source}")]
    CreateProperty {
        entity_id: EntityId,
        name: &'static str,
        #[source]
        source: RegistryError,
    },
}

pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

pub struct Registrar {
    registry: Arc<dyn Registry>,
    store: Arc<AggregationStore>,
}

impl Registrar {
    pub fn new(registry: Arc<dyn Registry>, store: Arc<AggregationStore>) -> Self {
        Self { registry, store }
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    /// Creates the derived properties for `entity_id` and starts tracking it.
    /// A no-op for entities that are tracked or being provisioned.
    pub async fn provision_for_entity(&self, entity_id: &str) -> ProvisioningResult<Provisioned> {
        if !self.store.try_claim(entity_id) {
            debug!("Entity {} already tracked, skipping provisioning", entity_id);
            return Ok(Provisioned::Skipped);
        }
        let result = self.create_properties(entity_id).await;
        self.store.release_claim(entity_id);
        result
    }

    /// Handles a property-created event end to end: indexes the property and,
    /// if its entity is unknown, tracks the entity.
    pub async fn on_property_observed(
        &self,
        property: &PropertyEvent,
    ) -> ProvisioningResult<Provisioned> {
        match self.index_observed(property) {
            Some(entity_id) => self.track_entity(&entity_id).await,
            None => Ok(Provisioned::Skipped),
        }
    }

    /// Synchronous half of [`Self::on_property_observed`]. Writes the
    /// property → entity index entry (once) and returns the entity id when
    /// the entity still has to be tracked.
    ///
    /// Derived properties are never indexed, so values the processor publishes
    /// itself do not count as arrivals.
    pub fn index_observed(&self, property: &PropertyEvent) -> Option<EntityId> {
        let entity_id = property.entity_id.as_ref()?;
        if self.store.is_indexed(&property.id) {
            return None;
        }
        if self.is_derived(property) {
            debug!("Ignoring derived property {} of {}", property.id, entity_id);
            return None;
        }
        let needs_tracking = !self.store.contains(entity_id);
        self.store.index_property(&property.id, entity_id);
        needs_tracking.then(|| entity_id.clone())
    }

    /// Rebuilds the record from the registry when the entity already owns its
    /// derived properties, otherwise provisions them.
    pub async fn track_entity(&self, entity_id: &str) -> ProvisioningResult<Provisioned> {
        if !self.store.try_claim(entity_id) {
            return Ok(Provisioned::Skipped);
        }
        let result = match self.registry.read_entity(entity_id).await {
            Ok(entity) => match Self::record_from_entity(&entity) {
                Some(record) => {
                    self.store.insert_record(record);
                    info!("Recovered derived properties of {}", entity_id);
                    Ok(Provisioned::Recovered)
                }
                None => {
                    debug!("Entity {} lacks derived properties", entity_id);
                    self.create_properties(entity_id).await
                }
            },
            Err(e) => {
                debug!("Failed to read entity {}: {}", entity_id, e);
                self.create_properties(entity_id).await
            }
        };
        self.store.release_claim(entity_id);
        result
    }

    fn is_derived(&self, property: &PropertyEvent) -> bool {
        matches!(
            property.name.as_deref(),
            Some(DATA_COUNT_NAME) | Some(DATA_ACTIVITY_NAME)
        ) || self.store.is_derived_property(&property.id)
    }

    fn record_from_entity(entity: &Entity) -> Option<AggregationRecord> {
        let count = entity.find_property_by_name(DATA_COUNT_NAME)?;
        let activity = entity.find_property_by_name(DATA_ACTIVITY_NAME)?;
        Some(AggregationRecord::new(&entity.id, &count.id, &activity.id))
    }

    // caller holds the provisioning claim
    async fn create_properties(&self, entity_id: &str) -> ProvisioningResult<Provisioned> {
        let count_property_id = self
            .registry
            .create_property(NewProperty::data_count(entity_id))
            .await
            .map_err(|source| ProvisioningError::CreateProperty {
                entity_id: entity_id.to_string(),
                name: DATA_COUNT_NAME,
                source,
            })?;
        let activity_property_id = self
            .registry
            .create_property(NewProperty::data_activity(entity_id))
            .await
            .map_err(|source| ProvisioningError::CreateProperty {
                entity_id: entity_id.to_string(),
                name: DATA_ACTIVITY_NAME,
                source,
            })?;

        let record = AggregationRecord::new(entity_id, &count_property_id, &activity_property_id);
        if !self.store.insert_record(record) {
            warn!("Entity {} was tracked while provisioning", entity_id);
            return Ok(Provisioned::Skipped);
        }
        info!(
            "Provisioned {} (count: {}, activity: {})",
            entity_id, count_property_id, activity_property_id
        );
        Ok(Provisioned::Created)
    }
}
