//! Registry service boundary: the remote store of entities and their
//! properties. Calls may fail or be slow; callers never hold store locks
//! across them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EntityId, PropertyId};

pub mod http;

pub const DATA_COUNT_NAME: &str = "Data Count";
pub const DATA_ACTIVITY_NAME: &str = "Data Activity";
pub const ACTIVITY_CLASSES: [&str; 2] = ["Quiet", "Busy"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum PropertyKind {
    Count,
    Class,
}

/// Request body for property creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    #[serde(rename = "entityId")]
    pub entity_id: EntityId,
    #[serde(rename = "class", default, skip_serializing_if = "Vec::is_empty")]
    pub class_labels: Vec<String>,
}

impl NewProperty {
    pub fn data_count(entity_id: &str) -> Self {
        Self {
            name: DATA_COUNT_NAME.to_string(),
            kind: PropertyKind::Count,
            entity_id: entity_id.to_string(),
            class_labels: Vec::new(),
        }
    }

    pub fn data_activity(entity_id: &str) -> Self {
        Self {
            name: DATA_ACTIVITY_NAME.to_string(),
            kind: PropertyKind::Class,
            entity_id: entity_id.to_string(),
            class_labels: ACTIVITY_CLASSES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySummary {
    pub id: PropertyId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub properties: Vec<PropertySummary>,
}

impl Entity {
    pub fn find_property_by_name(&self, name: &str) -> Option<&PropertySummary> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// A single time-series point, serialized as `[timestamp_ms, value]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint(pub i64, pub i64);

impl DataPoint {
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    pub fn value(&self) -> i64 {
        self.1
    }
}

#[mockall::automock]
#[async_trait]
pub trait Registry: Send + Sync {
    async fn create_property(&self, property: NewProperty) -> RegistryResult<PropertyId>;

    async fn read_entity(&self, entity_id: &str) -> RegistryResult<Entity>;

    async fn update_values(
        &self,
        property_id: &str,
        values: Vec<DataPoint>,
    ) -> RegistryResult<()>;
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Registry request failed: {message}")]
    RequestFailed { message: String },

    #[error("Registry returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected registry response: {0}")]
    InvalidResponse(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
