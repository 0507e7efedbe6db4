//! # Aggregation State Store
//!
//! Two owned maps behind per-shard locks:
//!
//! - `records`: entity id → [`AggregationRecord`]
//! - `property_index`: property id → owning entity id
//!
//! A record is only ever inserted fully initialized (both derived property ids
//! present). Index entries are written once and never removed.
//!
//! Mutation happens from two sides: the router increments
//! `period_value_count` on value arrival, and the evaluator reads, decides,
//! and resets under the same per-record lock, so an increment is never lost
//! between a read and a reset.

use dashmap::{DashMap, DashSet};
use tracing::trace;

use crate::{EntityId, PropertyId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString,
)]
pub enum ActivityState {
    #[default]
    Quiet,
    Busy,
}

impl ActivityState {
    /// Class index published on the activity property.
    pub fn as_value(self) -> i64 {
        match self {
            ActivityState::Quiet => 0,
            ActivityState::Busy => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRecord {
    pub entity_id: EntityId,
    pub count_property_id: PropertyId,
    pub activity_property_id: PropertyId,
    pub period_value_count: u64,
    pub activity_state: ActivityState,
}

impl AggregationRecord {
    pub fn new(entity_id: &str, count_property_id: &str, activity_property_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            count_property_id: count_property_id.to_string(),
            activity_property_id: activity_property_id.to_string(),
            period_value_count: 0,
            activity_state: ActivityState::Quiet,
        }
    }
}

#[derive(Default)]
pub struct AggregationStore {
    records: DashMap<EntityId, AggregationRecord>,
    property_index: DashMap<PropertyId, EntityId>,
    // count/activity property ids owned by tracked records
    derived_properties: DashSet<PropertyId>,
    // entities with a provisioning attempt in flight
    provisioning: DashSet<EntityId>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.records.contains_key(entity_id)
    }

    /// Inserts a fully initialized record. Returns `false` and leaves the
    /// existing record untouched if the entity is already tracked.
    pub fn insert_record(&self, record: AggregationRecord) -> bool {
        match self.records.entry(record.entity_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                self.derived_properties
                    .insert(record.count_property_id.clone());
                self.derived_properties
                    .insert(record.activity_property_id.clone());
                vacant.insert(record);
                true
            }
        }
    }

    /// Records `property_id → entity_id` unless the property is already
    /// indexed. Returns whether a new entry was written.
    pub fn index_property(&self, property_id: &str, entity_id: &str) -> bool {
        match self.property_index.entry(property_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entity_id.to_string());
                true
            }
        }
    }

    pub fn is_indexed(&self, property_id: &str) -> bool {
        self.property_index.contains_key(property_id)
    }

    pub fn entity_for_property(&self, property_id: &str) -> Option<EntityId> {
        self.property_index
            .get(property_id)
            .map(|entry| entry.value().clone())
    }

    pub fn is_derived_property(&self, property_id: &str) -> bool {
        self.derived_properties.contains(property_id)
    }

    /// Adds `count` to the owning record's period counter. Values for
    /// properties that are not indexed yet, or whose entity is not tracked
    /// yet, are dropped and `false` is returned.
    pub fn record_arrival(&self, property_id: &str, count: u64) -> bool {
        let Some(entity_id) = self.entity_for_property(property_id) else {
            trace!("Dropping {} values for unindexed property {}", count, property_id);
            return false;
        };
        match self.records.get_mut(&entity_id) {
            Some(mut record) => {
                record.period_value_count = record.period_value_count.saturating_add(count);
                true
            }
            None => {
                trace!("Dropping {} values for untracked entity {}", count, entity_id);
                false
            }
        }
    }

    /// Claims the right to provision `entity_id`. Fails if the entity is
    /// already tracked or another attempt holds the claim.
    pub fn try_claim(&self, entity_id: &str) -> bool {
        if self.contains(entity_id) || !self.provisioning.insert(entity_id.to_string()) {
            return false;
        }
        // a concurrent attempt may have completed between the two checks
        if self.contains(entity_id) {
            self.provisioning.remove(entity_id);
            return false;
        }
        true
    }

    pub fn release_claim(&self, entity_id: &str) {
        self.provisioning.remove(entity_id);
    }

    pub fn is_provisioning(&self, entity_id: &str) -> bool {
        self.provisioning.contains(entity_id)
    }

    /// Runs `f` on every record while holding that record's lock. `f` must not
    /// touch the store.
    pub fn for_each_mut<F>(&self, mut f: F)
    where
        F: FnMut(&mut AggregationRecord),
    {
        for mut entry in self.records.iter_mut() {
            f(entry.value_mut());
        }
    }

    pub fn snapshot(&self, entity_id: &str) -> Option<AggregationRecord> {
        self.records.get(entity_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
