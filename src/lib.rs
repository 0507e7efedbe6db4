//! # Activity Processor
//!
//! Consumes entity-lifecycle and measurement events from a publish/subscribe
//! bus, keeps per-entity aggregation state in memory, and periodically
//! republishes two derived signals per entity: a "Data Count" (values that
//! arrived during the last period) and a "Data Activity" classification
//! (Quiet/Busy).
//!
//! ```text
//! ┌─────────┐   ┌────────┐   ┌───────────┐        ┌──────────┐
//! │BusClient│──▶│ Router │──▶│ Registrar │───────▶│ Registry │
//! └─────────┘   └───┬────┘   └─────┬─────┘        └──────────┘
//!      ▲            │              │
//!      │            ▼              ▼
//!      │      ┌──────────────────────────┐
//!      │      │     AggregationStore     │
//!      │      └────────────┬─────────────┘
//!      │                   │ tick
//!      │            ┌──────▼──────┐   ┌──────────┐
//!      └────────────│  Evaluator  │──▶│UpdateSink│
//!     (publisher)   └─────────────┘   └──────────┘
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod processor;
pub mod publisher;
pub mod registrar;
pub mod registry;
pub mod router;
pub mod sink;
pub mod store;

pub use error::*;

/// Identifier of a tracked entity ("thing").
pub type EntityId = String;
/// Identifier of a property owned by an entity.
pub type PropertyId = String;
