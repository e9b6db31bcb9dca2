//! Best-effort window tracking.
//!
//! Wraps the `StateStore` collaborator with the engine's key scheme and the
//! degrade-on-failure policy: state tracking is an optimization, so every
//! operation catches store errors, logs them, and returns a safe default.
//! Alert correctness never depends on this layer — it comes from the alert
//! upsert's active-uniqueness invariant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AggregationConfig;
use crate::stores::StateStore;

/// Processed-window marker payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessedMarker {
    processed_at: DateTime<Utc>,
    window_id: String,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

/// Window tracking facade over the external TTL key-value store.
#[derive(Clone)]
pub struct WindowStateStore {
    store: Arc<dyn StateStore>,
    prefix: String,
    enabled: bool,
    state_ttl: Duration,
    processed_ttl: Duration,
}

impl WindowStateStore {
    pub fn new(store: Arc<dyn StateStore>, config: &AggregationConfig) -> Self {
        Self {
            store,
            prefix: config.state_key_prefix.clone(),
            enabled: config.enable_window_tracking,
            state_ttl: Duration::from_secs(config.window_state_ttl_secs),
            processed_ttl: Duration::from_secs(config.processed_window_ttl_secs),
        }
    }

    fn state_key(&self, rule_id: &str, window_id: &str) -> String {
        format!("{}window_state:{rule_id}:{window_id}", self.prefix)
    }

    fn processed_key(&self, rule_id: &str, window_id: &str) -> String {
        format!("{}processed:{rule_id}:{window_id}", self.prefix)
    }

    fn last_exec_key(&self, rule_id: &str) -> String {
        format!("{}last_exec:{rule_id}", self.prefix)
    }

    /// Persist a state blob for a window. Returns whether the write happened.
    pub async fn save_window_state(
        &self,
        rule_id: &str,
        window_id: &str,
        data: Vec<u8>,
        ttl: Option<Duration>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let key = self.state_key(rule_id, window_id);
        match self.store.set(&key, data, Some(ttl.unwrap_or(self.state_ttl))).await {
            Ok(()) => {
                debug!(rule_id, window_id, "saved window state");
                true
            }
            Err(e) => {
                warn!(rule_id, window_id, error = %e, "failed to save window state");
                false
            }
        }
    }

    /// Fetch a window's state blob, `None` on miss, disabled tracking, or
    /// store failure.
    pub async fn get_window_state(&self, rule_id: &str, window_id: &str) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        let key = self.state_key(rule_id, window_id);
        match self.store.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(rule_id, window_id, error = %e, "failed to read window state");
                None
            }
        }
    }

    /// Remove a window's live state entry.
    pub async fn delete_window_state(&self, rule_id: &str, window_id: &str) -> bool {
        let key = self.state_key(rule_id, window_id);
        match self.store.delete(&key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(rule_id, window_id, error = %e, "failed to delete window state");
                false
            }
        }
    }

    /// Mark a window as processed so later invocations inside the lookback
    /// buffer skip it. The marker carries a long TTL rather than living
    /// forever.
    pub async fn mark_window_processed(
        &self,
        rule_id: &str,
        window_id: &str,
        metadata: BTreeMap<String, Value>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let marker = ProcessedMarker {
            processed_at: Utc::now(),
            window_id: window_id.to_string(),
            metadata,
        };
        let payload = match serde_json::to_vec(&marker) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(rule_id, window_id, error = %e, "failed to encode processed marker");
                return false;
            }
        };
        let key = self.processed_key(rule_id, window_id);
        match self.store.set(&key, payload, Some(self.processed_ttl)).await {
            Ok(()) => {
                debug!(rule_id, window_id, "marked window processed");
                true
            }
            Err(e) => {
                warn!(rule_id, window_id, error = %e, "failed to mark window processed");
                false
            }
        }
    }

    /// Whether a window was already processed. `false` on miss, disabled
    /// tracking, or store failure — reprocessing is safe, skipping fresh
    /// work is not.
    pub async fn is_window_processed(&self, rule_id: &str, window_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let key = self.processed_key(rule_id, window_id);
        match self.store.get(&key).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                warn!(rule_id, window_id, error = %e, "failed to check processed marker");
                false
            }
        }
    }

    /// Record when the rule last executed. Stored without expiry.
    pub async fn update_last_execution(&self, rule_id: &str, time: Option<DateTime<Utc>>) -> bool {
        let timestamp = time.unwrap_or_else(Utc::now).to_rfc3339();
        let key = self.last_exec_key(rule_id);
        match self.store.set(&key, timestamp.into_bytes(), None).await {
            Ok(()) => true,
            Err(e) => {
                warn!(rule_id, error = %e, "failed to update last execution time");
                false
            }
        }
    }

    /// The rule's last execution time, if recorded and readable.
    pub async fn get_last_execution(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        let key = self.last_exec_key(rule_id);
        match self.store.get(&key).await {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            Ok(None) => None,
            Err(e) => {
                warn!(rule_id, error = %e, "failed to read last execution time");
                None
            }
        }
    }
}
