//! Klaxon Types
//!
//! This crate defines the core types and data structures shared across the
//! Klaxon ecosystem (currently `klaxon-core`). It provides the event and
//! alert data model so that engine crates and embedders agree on one schema
//! without circular dependencies.

mod types;

pub use types::{
    format_labels, Alert, AlertStatus, Event, EventStatus, OperatorLogEntry, ACTIVE_ALERT_STATUSES,
};
