//! Session window lifecycle tracking.
//!
//! Session windows can stay open across rule executions, so their
//! bookkeeping lives in the window state store: one JSON blob per
//! `(rule, fingerprint, session_id)`, mutated through `save_session` only.
//! Closing a session marks its window processed (long TTL) and deletes the
//! live entry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

use crate::config::AggregationConfig;
use crate::fingerprint;
use crate::state_store::WindowStateStore;

/// In-flight session bookkeeping for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWindow {
    /// Per-fingerprint sequence number.
    pub session_id: u64,
    pub fingerprint: String,
    pub start_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    pub event_count: u64,
    pub event_ids: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SessionWindow {
    /// Total session span so far.
    pub fn duration(&self) -> Duration {
        self.last_event_time - self.start_time
    }

    /// Whether the session outlived the configured maximum duration.
    pub fn is_expired(&self, config: &AggregationConfig) -> bool {
        self.duration() > Duration::seconds(config.session_max_duration_secs as i64)
    }

    /// Whether the session holds the configured maximum number of events.
    pub fn is_full(&self, config: &AggregationConfig) -> bool {
        self.event_count >= config.session_max_events
    }
}

/// Manager for open sessions, built on the window state store.
#[derive(Clone)]
pub struct SessionStateManager {
    cache: WindowStateStore,
    state_ttl: StdDuration,
}

impl SessionStateManager {
    pub fn new(cache: WindowStateStore, config: &AggregationConfig) -> Self {
        // keep session blobs around twice the maximum session lifetime
        Self { cache, state_ttl: StdDuration::from_secs(config.session_max_duration_secs * 2) }
    }

    fn window_id(rule_id: &str, fingerprint: &str, session_id: u64) -> String {
        format!("session:{rule_id}:{}", fingerprint::session_key(fingerprint, session_id))
    }

    fn open_pointer_id(rule_id: &str, fingerprint: &str) -> String {
        format!("session_open:{rule_id}:{fingerprint}")
    }

    /// Open a new session, optionally seeded with its first event.
    pub async fn create_session(
        &self,
        rule_id: &str,
        fingerprint: &str,
        session_id: u64,
        start_time: DateTime<Utc>,
        initial_event_id: Option<String>,
    ) -> SessionWindow {
        let session = SessionWindow {
            session_id,
            fingerprint: fingerprint.to_string(),
            start_time,
            last_event_time: start_time,
            event_count: initial_event_id.is_some() as u64,
            event_ids: initial_event_id.into_iter().collect(),
            metadata: BTreeMap::new(),
        };
        self.save_session(rule_id, &session).await;
        debug!(rule_id, fingerprint, session_id, "created session");
        session
    }

    /// Load a session if present and decodable.
    pub async fn get_session(
        &self,
        rule_id: &str,
        fingerprint: &str,
        session_id: u64,
    ) -> Option<SessionWindow> {
        let window_id = Self::window_id(rule_id, fingerprint, session_id);
        let bytes = self.cache.get_window_state(rule_id, &window_id).await?;
        match serde_json::from_slice(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(rule_id, fingerprint, session_id, error = %e, "undecodable session state");
                None
            }
        }
    }

    /// The currently open session for a fingerprint, if one is tracked.
    ///
    /// At most one session per fingerprint can be open at a time (sessions
    /// are sequential), so a single pointer entry suffices.
    pub async fn get_open_session(
        &self,
        rule_id: &str,
        fingerprint: &str,
    ) -> Option<SessionWindow> {
        let pointer_id = Self::open_pointer_id(rule_id, fingerprint);
        let bytes = self.cache.get_window_state(rule_id, &pointer_id).await?;
        let session_id: u64 = std::str::from_utf8(&bytes).ok()?.parse().ok()?;
        self.get_session(rule_id, fingerprint, session_id).await
    }

    /// Record which session is currently open for a fingerprint.
    pub async fn set_open_pointer(&self, rule_id: &str, fingerprint: &str, session_id: u64) -> bool {
        let pointer_id = Self::open_pointer_id(rule_id, fingerprint);
        self.cache
            .save_window_state(
                rule_id,
                &pointer_id,
                session_id.to_string().into_bytes(),
                Some(self.state_ttl),
            )
            .await
    }

    /// Persist a session snapshot. All mutations funnel through here.
    pub async fn save_session(&self, rule_id: &str, session: &SessionWindow) -> bool {
        let window_id = Self::window_id(rule_id, &session.fingerprint, session.session_id);
        let payload = match serde_json::to_vec(session) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(rule_id, session_id = session.session_id, error = %e, "failed to encode session");
                return false;
            }
        };
        self.cache
            .save_window_state(rule_id, &window_id, payload, Some(self.state_ttl))
            .await
    }

    /// Append one event to the session and persist the new snapshot.
    pub async fn add_event_to_session(
        &self,
        rule_id: &str,
        session: &mut SessionWindow,
        event_id: String,
        event_time: DateTime<Utc>,
    ) {
        session.event_ids.push(event_id);
        session.event_count += 1;
        session.last_event_time = event_time;
        self.save_session(rule_id, session).await;
    }

    /// A session closes when the gap since its last event exceeds the
    /// threshold, or it expired, or it is full.
    pub fn should_close_session(
        &self,
        session: &SessionWindow,
        gap_threshold: Duration,
        now: DateTime<Utc>,
        config: &AggregationConfig,
    ) -> bool {
        if now - session.last_event_time > gap_threshold {
            return true;
        }
        if session.is_expired(config) {
            debug!(session_id = session.session_id, "session exceeded max duration");
            return true;
        }
        if session.is_full(config) {
            debug!(session_id = session.session_id, "session reached max event count");
            return true;
        }
        false
    }

    /// Close a session: mark its window processed (so the lookback buffer
    /// does not resurrect it) and drop the live state entry.
    pub async fn close_session(&self, rule_id: &str, session: &SessionWindow) -> bool {
        let window_id = Self::window_id(rule_id, &session.fingerprint, session.session_id);

        let mut metadata = BTreeMap::new();
        metadata.insert("event_count".to_string(), Value::from(session.event_count));
        metadata.insert(
            "duration_seconds".to_string(),
            Value::from(session.duration().num_seconds()),
        );
        metadata.insert("start_time".to_string(), Value::from(session.start_time.to_rfc3339()));
        metadata
            .insert("end_time".to_string(), Value::from(session.last_event_time.to_rfc3339()));
        self.cache.mark_window_processed(rule_id, &window_id, metadata).await;

        let deleted = self.cache.delete_window_state(rule_id, &window_id).await;

        // drop the open pointer when it still points at this session
        let pointer_id = Self::open_pointer_id(rule_id, &session.fingerprint);
        if let Some(bytes) = self.cache.get_window_state(rule_id, &pointer_id).await {
            let points_here = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .is_some_and(|id| id == session.session_id);
            if points_here {
                self.cache.delete_window_state(rule_id, &pointer_id).await;
            }
        }
        debug!(
            rule_id,
            session_id = session.session_id,
            events = session.event_count,
            "closed session"
        );
        deleted
    }

    /// Whether this session's window was already processed by an earlier
    /// execution.
    pub async fn is_session_processed(
        &self,
        rule_id: &str,
        fingerprint: &str,
        session_id: u64,
    ) -> bool {
        let window_id = Self::window_id(rule_id, fingerprint, session_id);
        self.cache.is_window_processed(rule_id, &window_id).await
    }
}
