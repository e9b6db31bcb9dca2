//! Collaborator traits for the external stores the engine talks to.
//!
//! The engine is the caller of these seams: a relational event/alert store,
//! a TTL key-value state store and a templating system all live outside this
//! crate. Each trait is object-safe so embedders can hand in `Arc<dyn ...>`
//! implementations; `memory` provides in-process versions for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use klaxon_types::{Alert, Event, EventStatus, OperatorLogEntry};

use crate::rules::CorrelationRule;

/// Failure talking to an external store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Transient I/O problem; the owning rule invocation aborts (or degrades,
    /// for state tracking), other rules are unaffected.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness race on insert (another writer created the equivalent row
    /// first). Handled internally by the upsert's retry-as-merge path.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// A value failed to encode or decode.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True when the error is the insert-uniqueness race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Filter for candidate-event queries.
#[derive(Debug, Clone)]
pub struct EventFilter {
    /// Half-open received-at range `[start, end)`.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Statuses to include; empty means any.
    pub statuses: Vec<EventStatus>,
    /// Statuses to always exclude (applied after `statuses`).
    pub exclude_statuses: Vec<EventStatus>,
    /// Restrict to events whose source is (in)active.
    pub source_active: Option<bool>,
}

/// Read access to the event store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events matching the filter, ordered by `received_at`.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError>;

    /// Cheap count matching the filter.
    async fn count(&self, filter: &EventFilter) -> Result<u64, StoreError>;

    /// Resolve events by id; missing ids are silently absent from the result.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Event>, StoreError>;
}

/// Transactional access to the alert store.
///
/// Implementations must provide `SELECT ... FOR UPDATE`-equivalent semantics:
/// `find_active_for_update` takes the per-fingerprint row lock for the
/// duration of the enclosing upsert, and `insert` detects the uniqueness race
/// on (fingerprint, active-status) as `StoreError::Conflict`.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// The active alert for this fingerprint, locked for update, if any.
    async fn find_active_for_update(&self, fingerprint: &str) -> Result<Option<Alert>, StoreError>;

    /// Insert a new alert together with its event associations.
    async fn insert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Persist a merged alert and attach the new events (set union).
    async fn merge_update(&self, alert: &Alert, new_event_ids: &[String])
        -> Result<(), StoreError>;

    /// Append advisory audit entries in one batch.
    async fn append_operator_logs(&self, entries: &[OperatorLogEntry]) -> Result<(), StoreError>;
}

/// TTL key-value store used for cross-invocation window/session tracking.
///
/// A miss is `Ok(None)`, never an error; errors mean the store itself
/// misbehaved. Callers in `state_store` degrade explicitly on `Err`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value; `ttl == None` means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// External templating collaborator producing alert title and content from
/// one representative event plus rule context.
pub trait TemplateFormatter: Send + Sync {
    fn format_alert_message(&self, rule: &CorrelationRule, base_event: &Event) -> (String, String);
}

/// Minimal formatter used when no templating system is wired in.
#[derive(Debug, Clone, Default)]
pub struct DefaultTemplateFormatter;

impl TemplateFormatter for DefaultTemplateFormatter {
    fn format_alert_message(&self, rule: &CorrelationRule, base_event: &Event) -> (String, String) {
        let title = format!("[{}] {}", rule.name, base_event.title);
        let content = format!(
            "{} on {} ({}): {}",
            base_event.item, base_event.resource_name, base_event.resource_id,
            base_event.description
        );
        (title, content)
    }
}
