//! In-memory collaborator implementations.
//!
//! Used by the test suite and by embedders that want a self-contained
//! engine. `MemoryStateStore` is backed by `moka` for real per-entry TTL;
//! `MemoryAlertStore` serializes upserts through one async mutex and
//! enforces the active-uniqueness constraint the way a relational store's
//! unique index plus row lock would.

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use klaxon_types::{Alert, Event, OperatorLogEntry};

use crate::stores::{AlertStore, EventFilter, EventStore, StateStore, StoreError};

// ---------------------------------------------------------------------------
// Event store
// ---------------------------------------------------------------------------

/// Event store over a concurrent map, keyed by event id.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    events: Arc<DashMap<String, Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one event.
    pub async fn put(&self, event: Event) {
        self.events.insert(event.event_id.clone(), event);
    }

    /// Insert a batch of events.
    pub async fn put_all(&self, events: Vec<Event>) {
        for event in events {
            self.put(event).await;
        }
    }

    fn matches(filter: &EventFilter, event: &Event) -> bool {
        if event.received_at < filter.start || event.received_at >= filter.end {
            return false;
        }
        if !filter.statuses.is_empty() && !filter.statuses.contains(&event.status) {
            return false;
        }
        if filter.exclude_statuses.contains(&event.status) {
            return false;
        }
        if let Some(active) = filter.source_active {
            if event.source_active != active {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let mut result: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| Self::matches(filter, entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        result.sort_by_key(|e| e.received_at);
        Ok(result)
    }

    async fn count(&self, filter: &EventFilter) -> Result<u64, StoreError> {
        Ok(self.events.iter().filter(|entry| Self::matches(filter, entry.value())).count() as u64)
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Event>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.events.get(id).map(|entry| entry.value().clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Alert store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AlertTable {
    alerts: Vec<Alert>,
    operator_logs: Vec<OperatorLogEntry>,
}

/// Alert store with upsert-grade semantics: one mutex stands in for the
/// relational row lock, and `insert` rejects a second active alert for the
/// same fingerprint with `StoreError::Conflict`.
#[derive(Clone, Default)]
pub struct MemoryAlertStore {
    table: Arc<Mutex<AlertTable>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active alerts for a fingerprint (test helper).
    pub async fn active_alerts(&self, fingerprint: &str) -> Vec<Alert> {
        let table = self.table.lock().await;
        table
            .alerts
            .iter()
            .filter(|a| a.fingerprint == fingerprint && a.status.is_active())
            .cloned()
            .collect()
    }

    /// Every stored alert (test helper).
    pub async fn all_alerts(&self) -> Vec<Alert> {
        self.table.lock().await.alerts.clone()
    }

    /// Number of operator-log entries written (test helper).
    pub async fn operator_log_len(&self) -> usize {
        self.table.lock().await.operator_logs.len()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn find_active_for_update(&self, fingerprint: &str) -> Result<Option<Alert>, StoreError> {
        let table = self.table.lock().await;
        Ok(table
            .alerts
            .iter()
            .find(|a| a.fingerprint == fingerprint && a.status.is_active())
            .cloned())
    }

    async fn insert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let duplicate = table
            .alerts
            .iter()
            .any(|a| a.fingerprint == alert.fingerprint && a.status.is_active());
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "active alert already exists for fingerprint {}",
                alert.fingerprint
            )));
        }
        table.alerts.push(alert.clone());
        Ok(())
    }

    async fn merge_update(
        &self,
        alert: &Alert,
        _new_event_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        match table.alerts.iter_mut().find(|a| a.alert_id == alert.alert_id) {
            Some(stored) => {
                *stored = alert.clone();
                Ok(())
            }
            None => Err(StoreError::Unavailable(format!(
                "alert {} vanished during update",
                alert.alert_id
            ))),
        }
    }

    async fn append_operator_logs(&self, entries: &[OperatorLogEntry]) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        table.operator_logs.extend_from_slice(entries);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

/// TTL key-value store backed by `moka`.
///
/// `moka`'s cache-level TTL is fixed per cache, so per-entry TTLs are
/// enforced with an expiry timestamp checked on read; the cache-level bound
/// merely caps residency.
#[derive(Clone)]
pub struct MemoryStateStore {
    cache: Cache<String, (Vec<u8>, Option<std::time::Instant>)>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(7 * 24 * 3600))
                .build(),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.cache.get(key).await {
            Some((value, expires_at)) => {
                if expires_at.is_some_and(|at| std::time::Instant::now() >= at) {
                    self.cache.invalidate(key).await;
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.map(|d| std::time::Instant::now() + d);
        self.cache.insert(key.to_string(), (value, expires_at)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use klaxon_types::EventStatus;
    use std::collections::HashMap;

    fn event(id: &str, status: EventStatus, minutes_ago: i64) -> Event {
        Event {
            event_id: id.to_string(),
            received_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
            level: 3,
            resource_id: "host-1".to_string(),
            resource_type: "host".to_string(),
            resource_name: "host-1".to_string(),
            item: "cpu_usage".to_string(),
            source_id: "src-1".to_string(),
            source_name: "zabbix".to_string(),
            source_active: true,
            status,
            value: Some(50.0),
            title: "t".to_string(),
            description: "d".to_string(),
            labels: HashMap::new(),
            fingerprint: String::new(),
        }
    }

    #[tokio::test]
    async fn event_filter_honors_range_status_and_source() {
        let store = MemoryEventStore::new();
        store.put(event("keep", EventStatus::Received, 5)).await;
        store.put(event("shielded", EventStatus::Shield, 5)).await;
        store.put(event("stale", EventStatus::Received, 120)).await;
        let mut inactive = event("inactive", EventStatus::Received, 5);
        inactive.source_active = false;
        store.put(inactive).await;

        let filter = EventFilter {
            start: Utc::now() - ChronoDuration::hours(1),
            end: Utc::now(),
            statuses: vec![EventStatus::Received],
            exclude_statuses: vec![EventStatus::Shield],
            source_active: Some(true),
        };

        let result = store.query(&filter).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].event_id, "keep");
        assert_eq!(store.count(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn alert_store_rejects_second_active_insert() {
        let store = MemoryAlertStore::new();
        let mut alert = Alert {
            alert_id: "ALERT-1".to_string(),
            fingerprint: "fp".to_string(),
            level: 3,
            title: "t".to_string(),
            content: "c".to_string(),
            item: "cpu_usage".to_string(),
            resource_id: "host-1".to_string(),
            resource_name: "host-1".to_string(),
            resource_type: "host".to_string(),
            source_name: "zabbix".to_string(),
            status: klaxon_types::AlertStatus::Unassigned,
            first_event_time: Utc::now(),
            last_event_time: Utc::now(),
            rule_id: "r1".to_string(),
            event_ids: vec![],
        };
        store.insert(&alert).await.unwrap();

        alert.alert_id = "ALERT-2".to_string();
        let err = store.insert(&alert).await.unwrap_err();
        assert!(err.is_conflict());

        // a resolved alert frees the fingerprint for a fresh insert
        let mut resolved = store.find_active_for_update("fp").await.unwrap().unwrap();
        resolved.status = klaxon_types::AlertStatus::Resolved;
        store.merge_update(&resolved, &[]).await.unwrap();
        assert!(store.insert(&alert).await.is_ok());
    }

    #[tokio::test]
    async fn state_store_expires_entries_per_key() {
        let store = MemoryStateStore::new();
        store
            .set("short", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("long", b"v".to_vec(), None).await.unwrap();

        assert!(store.get("short").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.get("long").await.unwrap().is_some());
    }
}
