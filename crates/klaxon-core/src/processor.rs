//! Per-rule window processing pipeline.
//!
//! One `WindowProcessor` owns one rule's execution: query candidate events,
//! resolve parameters, run the aggregation, apply the window variant's
//! post-processing, and hand qualifying rows to the alert builder. Expected
//! conditions (no events, no qualifying rows) return an empty list; failures
//! other than configuration errors are logged and degrade to zero alerts so
//! one rule can never poison a scheduling cycle.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use klaxon_types::Alert;

use crate::alert_builder::AlertBuilder;
use crate::config::AggregationConfig;
use crate::engine::{AggregationEngine, AggregationResultRow, SessionRowMeta, SessionStatus};
use crate::error::KlaxonResult;
use crate::params;
use crate::query::EventQueryStrategy;
use crate::rules::{CorrelationRule, WindowConfig};
use crate::session_state::{SessionStateManager, SessionWindow};
use crate::state_store::WindowStateStore;
use crate::stores::{AlertStore, EventStore, StateStore, TemplateFormatter};

/// Orchestrates one rule's evaluation pipeline.
#[derive(Clone)]
pub struct WindowProcessor {
    rule: CorrelationRule,
    config: Arc<AggregationConfig>,
    query: EventQueryStrategy,
    engine: AggregationEngine,
    state: WindowStateStore,
    sessions: SessionStateManager,
    builder: AlertBuilder,
}

impl WindowProcessor {
    pub fn new(
        rule: CorrelationRule,
        config: Arc<AggregationConfig>,
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertStore>,
        state: Arc<dyn StateStore>,
        templates: Arc<dyn TemplateFormatter>,
    ) -> Self {
        let state_store = WindowStateStore::new(state, &config);
        Self {
            query: EventQueryStrategy::new(events.clone()),
            engine: AggregationEngine::new(),
            sessions: SessionStateManager::new(state_store.clone(), &config),
            builder: AlertBuilder::new(events, alerts, templates, config.clone()),
            state: state_store,
            rule,
            config,
        }
    }

    /// The rule this processor evaluates.
    pub fn rule(&self) -> &CorrelationRule {
        &self.rule
    }

    /// Query layer, exposed for scheduler idle probes.
    pub fn query(&self) -> &EventQueryStrategy {
        &self.query
    }

    /// Window tracking layer, exposed for scheduler idle probes.
    pub fn state(&self) -> &WindowStateStore {
        &self.state
    }

    /// Evaluate the rule once.
    ///
    /// Returns the alerts created or updated by this invocation. Raises only
    /// for configuration errors (the rule itself is unusable); every other
    /// failure is logged and yields an empty list.
    #[instrument(skip(self), fields(rule = %self.rule.name))]
    pub async fn process(&self, now: DateTime<Utc>) -> KlaxonResult<Vec<Alert>> {
        info!(
            rule_id = %self.rule.rule_id,
            window = self.rule.window.kind(),
            strategy = self.rule.strategy.kind(),
            "processing rule"
        );
        let started = std::time::Instant::now();

        // configuration problems surface to the caller, nothing else does
        let params = params::resolve(&self.rule, &self.config)?;

        let alerts = match self.run_pipeline(&params, now).await {
            Ok(alerts) => alerts,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                error!(
                    rule_id = %self.rule.rule_id,
                    window = self.rule.window.kind(),
                    category = e.category(),
                    error = %e,
                    "rule evaluation failed, producing zero alerts"
                );
                Vec::new()
            }
        };

        info!(
            rule_id = %self.rule.rule_id,
            alerts = alerts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rule processed"
        );

        Ok(alerts)
    }

    async fn run_pipeline(
        &self,
        params: &params::AggregationParams,
        now: DateTime<Utc>,
    ) -> KlaxonResult<Vec<Alert>> {
        let events = self
            .query
            .get_events_for_rule(
                &self.rule,
                now,
                self.config.fixed_window_buffer_multiplier,
                false,
            )
            .await?;
        if events.is_empty() {
            // nothing to do, and nothing to record: an idle invocation must
            // leave every store untouched
            return Ok(Vec::new());
        }

        let result = self.aggregate_and_build(params, &events, now).await;
        if result.is_ok() {
            self.state.update_last_execution(&self.rule.rule_id, Some(now)).await;
        }
        result
    }

    async fn aggregate_and_build(
        &self,
        params: &params::AggregationParams,
        events: &[klaxon_types::Event],
        now: DateTime<Utc>,
    ) -> KlaxonResult<Vec<Alert>> {
        let rows = self.engine.execute(params, events, now)?;
        if rows.is_empty() {
            debug!(rule = %self.rule.name, "no qualifying aggregation rows");
            return Ok(Vec::new());
        }

        let mut rows = match &self.rule.window {
            WindowConfig::Fixed { .. } => self.filter_processed_fixed(rows).await,
            WindowConfig::Sliding { .. } => dedupe_sliding_rows(rows),
            WindowConfig::Session { session_timeout, max_window_size } => {
                self.prepare_sessions(rows, *session_timeout, *max_window_size, now).await
            }
        };
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        if rows.len() > self.config.max_alerts_per_execution {
            warn!(
                rule = %self.rule.name,
                rows = rows.len(),
                cap = self.config.max_alerts_per_execution,
                "row count exceeds per-execution alert cap, truncating"
            );
            rows.truncate(self.config.max_alerts_per_execution);
        }

        let outcome = self.builder.build_from_aggregation_result(&rows, &self.rule).await?;
        self.finalize_windows(&rows, now).await;

        Ok(outcome.into_alerts())
    }

    /// Fixed windows inside the lookback buffer may have been handled by an
    /// earlier invocation; skip those.
    async fn filter_processed_fixed(
        &self,
        rows: Vec<AggregationResultRow>,
    ) -> Vec<AggregationResultRow> {
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            if self.state.is_window_processed(&self.rule.rule_id, &row.window_id).await {
                debug!(window_id = %row.window_id, "window already processed, skipping");
            } else {
                fresh.push(row);
            }
        }
        fresh
    }

    /// Session rows: splice each fingerprint's first batch session onto its
    /// stored open session (so spans survive the lookback horizon), enforce
    /// the maximum window span (a runaway session is dropped whole, not
    /// truncated, and closed so it stays gone), and skip sessions already
    /// closed and processed by an earlier invocation.
    async fn prepare_sessions(
        &self,
        mut rows: Vec<AggregationResultRow>,
        session_timeout: Duration,
        max_window_size: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Vec<AggregationResultRow> {
        let rule_id = self.rule.rule_id.clone();
        rows.sort_by(|a, b| {
            (a.fingerprint.as_str(), session_seq(a)).cmp(&(b.fingerprint.as_str(), session_seq(b)))
        });

        // one stored open session per fingerprint, at most
        let mut open_sessions: HashMap<String, SessionWindow> = HashMap::new();
        for row in &rows {
            if !open_sessions.contains_key(&row.fingerprint) {
                if let Some(open) =
                    self.sessions.get_open_session(&rule_id, &row.fingerprint).await
                {
                    open_sessions.insert(row.fingerprint.clone(), open);
                }
            }
        }

        let before = rows.len();
        let mut surviving = Vec::with_capacity(rows.len());
        // per fingerprint: the stored session's sequence base and whether the
        // batch's first session continues it (decided once, rows are sorted)
        let mut bases: HashMap<String, (u64, bool)> = HashMap::new();
        for mut row in rows {
            let Some(meta) = row.session.clone() else { continue };
            let stored = open_sessions.get(&row.fingerprint).cloned();

            let (base, first_continued) = match bases.get(&row.fingerprint) {
                Some(&decided) => decided,
                None => {
                    let base = stored.as_ref().map(|s| s.session_id).unwrap_or(0);
                    let continuing = meta.session_id == 1
                        && stored.as_ref().is_some_and(|s| {
                            row.first_event_time - s.last_event_time <= session_timeout
                        });
                    if !continuing {
                        // the stored session ended before this batch began
                        if let Some(stale) = stored.clone() {
                            self.sessions.close_session(&rule_id, &stale).await;
                        }
                    }
                    bases.insert(row.fingerprint.clone(), (base, continuing));
                    (base, continuing)
                }
            };

            let effective_id = if first_continued {
                base + meta.session_id - 1
            } else {
                base + meta.session_id
            };

            if first_continued && meta.session_id == 1 {
                let stored = stored.expect("continuation implies a stored session");
                if stored.start_time < row.first_event_time {
                    row.first_event_time = stored.start_time;
                }
                let mut ids = stored.event_ids;
                for id in &row.event_ids {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                row.event_count = ids.len() as u64;
                row.event_ids = ids;
                row.window_start = row.first_event_time;
            }

            let duration_secs =
                (row.last_event_time - row.first_event_time).num_milliseconds() as f64 / 1000.0;
            let status = if max_window_size
                .is_some_and(|max| duration_secs > max.num_seconds() as f64)
            {
                SessionStatus::Timeout
            } else if now - row.last_event_time > session_timeout {
                SessionStatus::Closed
            } else {
                SessionStatus::Active
            };
            row.session =
                Some(SessionRowMeta { session_id: effective_id, duration_secs, status });

            if status == SessionStatus::Timeout {
                // runaway session: discard the row and close the session so
                // its tail cannot keep re-alerting
                self.sessions
                    .close_session(&rule_id, &session_from_row(&row, effective_id))
                    .await;
                continue;
            }

            if self
                .sessions
                .is_session_processed(&rule_id, &row.fingerprint, effective_id)
                .await
            {
                debug!(
                    fingerprint = %row.fingerprint,
                    session_id = effective_id,
                    "session already processed, skipping"
                );
                continue;
            }

            surviving.push(row);
        }

        if surviving.len() < before {
            warn!(
                rule = %self.rule.name,
                before,
                after = surviving.len(),
                "session rows filtered by duration cap or processed markers"
            );
        }
        surviving
    }

    /// Record what this invocation consumed: fixed windows get processed
    /// markers; closed sessions are closed in the state manager, open ones
    /// have their state saved for the next execution.
    async fn finalize_windows(&self, rows: &[AggregationResultRow], now: DateTime<Utc>) {
        match &self.rule.window {
            WindowConfig::Fixed { .. } => {
                for row in rows {
                    let mut metadata = BTreeMap::new();
                    metadata.insert(
                        "event_count".to_string(),
                        serde_json::Value::from(row.event_count),
                    );
                    metadata.insert(
                        "window_start".to_string(),
                        serde_json::Value::from(row.window_start.to_rfc3339()),
                    );
                    self.state
                        .mark_window_processed(&self.rule.rule_id, &row.window_id, metadata)
                        .await;
                }
            }
            WindowConfig::Sliding { .. } => {}
            WindowConfig::Session { session_timeout, .. } => {
                for row in rows {
                    let Some(meta) = row.session.as_ref() else { continue };
                    let session = session_from_row(row, meta.session_id);
                    if self.sessions.should_close_session(
                        &session,
                        *session_timeout,
                        now,
                        &self.config,
                    ) {
                        self.sessions.close_session(&self.rule.rule_id, &session).await;
                    } else {
                        self.sessions.save_session(&self.rule.rule_id, &session).await;
                        self.sessions
                            .set_open_pointer(
                                &self.rule.rule_id,
                                &row.fingerprint,
                                meta.session_id,
                            )
                            .await;
                    }
                }
            }
        }
    }
}

fn session_seq(row: &AggregationResultRow) -> u64 {
    row.session.as_ref().map(|s| s.session_id).unwrap_or(0)
}

fn session_from_row(row: &AggregationResultRow, session_id: u64) -> SessionWindow {
    SessionWindow {
        session_id,
        fingerprint: row.fingerprint.clone(),
        start_time: row.first_event_time,
        last_event_time: row.last_event_time,
        event_count: row.event_count,
        event_ids: row.event_ids.clone(),
        metadata: BTreeMap::new(),
    }
}

/// Sliding windows overlapping one invocation can report the same
/// fingerprint more than once; keep only the row with the latest
/// `last_event_time` per fingerprint.
pub fn dedupe_sliding_rows(rows: Vec<AggregationResultRow>) -> Vec<AggregationResultRow> {
    let before = rows.len();
    let mut by_fingerprint: HashMap<String, AggregationResultRow> = HashMap::new();
    for row in rows {
        match by_fingerprint.get(&row.fingerprint) {
            Some(existing) if existing.last_event_time >= row.last_event_time => {}
            _ => {
                by_fingerprint.insert(row.fingerprint.clone(), row);
            }
        }
    }
    let deduped: Vec<AggregationResultRow> = by_fingerprint.into_values().collect();
    if deduped.len() < before {
        debug!(before, after = deduped.len(), "deduplicated sliding-window rows");
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SessionRowMeta, SessionStatus};
    use chrono::TimeZone;

    fn row(fingerprint: &str, last_event_offset_mins: i64) -> AggregationResultRow {
        let base = Utc.timestamp_opt(1_733_841_000, 0).single().unwrap();
        AggregationResultRow {
            window_id: format!("SW-{}-{fingerprint}", last_event_offset_mins),
            fingerprint: fingerprint.to_string(),
            group_values: BTreeMap::new(),
            event_count: 1,
            event_ids: vec!["e1".to_string()],
            first_event_time: base,
            last_event_time: base + Duration::minutes(last_event_offset_mins),
            max_level: Some(3),
            aggregates: BTreeMap::new(),
            window_start: base,
            window_end: base + Duration::minutes(10),
            session: None,
        }
    }

    #[test]
    fn sliding_dedup_keeps_the_latest_row_per_fingerprint() {
        // scenario: overlapping windows both report F1, at t+5 and t+8
        let rows = vec![row("F1", 5), row("F1", 8), row("F2", 3)];
        let deduped = dedupe_sliding_rows(rows);

        assert_eq!(deduped.len(), 2);
        let f1 = deduped.iter().find(|r| r.fingerprint == "F1").unwrap();
        assert_eq!(
            f1.last_event_time,
            Utc.timestamp_opt(1_733_841_000, 0).single().unwrap() + Duration::minutes(8)
        );
    }

    #[test]
    fn sliding_dedup_result_has_unique_fingerprints() {
        let rows = vec![row("F1", 1), row("F1", 2), row("F1", 2), row("F2", 1), row("F2", 9)];
        let deduped = dedupe_sliding_rows(rows);
        let mut fingerprints: Vec<&str> =
            deduped.iter().map(|r| r.fingerprint.as_str()).collect();
        fingerprints.sort();
        fingerprints.dedup();
        assert_eq!(fingerprints.len(), deduped.len());
    }

    #[tokio::test]
    async fn configuration_errors_surface_to_the_caller() {
        use crate::memory::{MemoryAlertStore, MemoryEventStore, MemoryStateStore};
        use crate::rules::{AggregateFunc, CompareOp, StrategyConfig, ThresholdSpec};
        use crate::stores::DefaultTemplateFormatter;

        // a hand-built rule referencing an unresolvable field skips document
        // validation; parameter resolution must still reject it loudly
        let rule = CorrelationRule {
            rule_id: "rule-bad".to_string(),
            name: "broken".to_string(),
            window: WindowConfig::Fixed { window_size: Duration::minutes(10) },
            strategy: StrategyConfig::Threshold(ThresholdSpec {
                aggregate: AggregateFunc::Avg,
                field: "bogus".to_string(),
                op: CompareOp::Ge,
                value: 1.0,
            }),
            grouping_keys: vec!["fingerprint".to_string()],
            filter: None,
            min_event_count: None,
        };
        let processor = WindowProcessor::new(
            rule,
            Arc::new(AggregationConfig::default()),
            Arc::new(MemoryEventStore::new()),
            Arc::new(MemoryAlertStore::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(DefaultTemplateFormatter),
        );

        let err = processor.process(Utc::now()).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn session_meta_survives_dedup_row_shape() {
        // guard against accidentally losing session metadata in row moves
        let mut with_session = row("F3", 2);
        with_session.session = Some(SessionRowMeta {
            session_id: 1,
            duration_secs: 120.0,
            status: SessionStatus::Closed,
        });
        let deduped = dedupe_sliding_rows(vec![with_session]);
        assert!(deduped[0].session.is_some());
    }
}
