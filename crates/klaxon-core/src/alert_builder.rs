//! Alert construction from aggregation rows.
//!
//! Turns qualifying result rows into alert create/update operations with
//! at-most-one-active-alert-per-fingerprint semantics. The store provides
//! row-level locking and uniqueness; this module owns the upsert protocol,
//! including the conflict retry-as-merge path, so a racing insert never
//! surfaces to the caller.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use klaxon_types::{Alert, AlertStatus, Event, OperatorLogEntry};

use crate::config::AggregationConfig;
use crate::engine::AggregationResultRow;
use crate::error::{KlaxonError, KlaxonResult};
use crate::rules::CorrelationRule;
use crate::stores::{AlertStore, EventStore, TemplateFormatter};

/// Alerts produced by one build pass, split by operation.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub created: Vec<Alert>,
    pub updated: Vec<Alert>,
}

impl BuildOutcome {
    /// All alerts regardless of operation.
    pub fn into_alerts(self) -> Vec<Alert> {
        let mut all = self.created;
        all.extend(self.updated);
        all
    }
}

/// Builder turning aggregation rows into persisted alerts.
#[derive(Clone)]
pub struct AlertBuilder {
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertStore>,
    templates: Arc<dyn TemplateFormatter>,
    config: Arc<AggregationConfig>,
}

impl AlertBuilder {
    pub fn new(
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertStore>,
        templates: Arc<dyn TemplateFormatter>,
        config: Arc<AggregationConfig>,
    ) -> Self {
        Self { events, alerts, templates, config }
    }

    /// Build alerts for every row. One bad row is logged and skipped, never
    /// aborting the batch; a created alert additionally gets one advisory
    /// operator-log entry, written in one batch at the end.
    pub async fn build_from_aggregation_result(
        &self,
        rows: &[AggregationResultRow],
        rule: &CorrelationRule,
    ) -> KlaxonResult<BuildOutcome> {
        if rows.is_empty() {
            return Ok(BuildOutcome::default());
        }

        info!(rule = %rule.name, rows = rows.len(), "building alerts from aggregation result");

        let mut outcome = BuildOutcome::default();
        for row in rows {
            match self.build_one(row, rule).await {
                Ok(Some((alert, created))) => {
                    if created {
                        outcome.created.push(alert);
                    } else {
                        outcome.updated.push(alert);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        rule = %rule.name,
                        window_id = %row.window_id,
                        error = %e,
                        "failed to build alert for row"
                    );
                }
            }
        }

        info!(
            rule = %rule.name,
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            "alert build finished"
        );

        if !outcome.created.is_empty() {
            let entries: Vec<OperatorLogEntry> = outcome
                .created
                .iter()
                .map(|a| OperatorLogEntry::alert_created(&a.alert_id, &rule.rule_id, &rule.name))
                .collect();
            if let Err(e) = self.alerts.append_operator_logs(&entries).await {
                warn!(rule = %rule.name, error = %e, "failed to append operator logs");
            }
        }

        Ok(outcome)
    }

    async fn build_one(
        &self,
        row: &AggregationResultRow,
        rule: &CorrelationRule,
    ) -> KlaxonResult<Option<(Alert, bool)>> {
        if row.event_ids.is_empty() {
            warn!(window_id = %row.window_id, "row has no event ids, skipping");
            return Ok(None);
        }

        let mut events = self.events.get_by_ids(&row.event_ids).await?;
        if events.is_empty() {
            warn!(
                window_id = %row.window_id,
                fingerprint = %row.fingerprint,
                "no events resolved for row, skipping"
            );
            return Ok(None);
        }
        events.sort_by_key(|e| e.received_at);

        let level = self.determine_alert_level(row, &events);
        let base_event = &events[0];
        let (title, content) = self.templates.format_alert_message(rule, base_event);

        let alert = Alert {
            alert_id: format!("ALERT-{}", Uuid::new_v4().simple().to_string().to_uppercase()),
            fingerprint: row.fingerprint.clone(),
            level,
            title,
            content,
            item: base_event.item.clone(),
            resource_id: base_event.resource_id.clone(),
            resource_name: base_event.resource_name.clone(),
            resource_type: base_event.resource_type.clone(),
            source_name: base_event.source_name.clone(),
            status: AlertStatus::Unassigned,
            first_event_time: row.first_event_time,
            last_event_time: row.last_event_time,
            rule_id: rule.rule_id.clone(),
            event_ids: events.iter().map(|e| e.event_id.clone()).collect(),
        };

        let result = self.create_or_update(alert, &events).await?;
        Ok(Some(result))
    }

    /// Alert level for a row: the row's `max_level` when present and valid,
    /// else the least-severe level among the contributing events, else the
    /// configured worst-case default.
    fn determine_alert_level(&self, row: &AggregationResultRow, events: &[Event]) -> i64 {
        if let Some(level) = row.max_level {
            if self.is_valid_level(level) {
                return level;
            }
        }
        let levels: Vec<i64> = events.iter().map(|e| e.level).collect();
        if levels.is_empty() {
            self.config.default_alert_level
        } else {
            self.least_severe_level(&levels)
        }
    }

    /// The most severe level seen: numerically smallest, by the domain's
    /// smaller-is-worse convention.
    pub fn most_severe_level(&self, levels: &[i64]) -> i64 {
        let level = levels.iter().copied().min().unwrap_or(self.config.default_alert_level);
        if self.is_valid_level(level) {
            level
        } else {
            self.config.default_alert_level
        }
    }

    /// The least severe level seen: numerically largest. Merging an alert
    /// uses this, so a merge only ever relaxes severity.
    pub fn least_severe_level(&self, levels: &[i64]) -> i64 {
        let level = levels.iter().copied().max().unwrap_or(self.config.default_alert_level);
        if self.is_valid_level(level) {
            level
        } else {
            self.config.default_alert_level
        }
    }

    fn is_valid_level(&self, level: i64) -> bool {
        (0..=self.config.default_alert_level).contains(&level)
    }

    /// The upsert: under the store's per-fingerprint lock, merge into the
    /// active alert when one exists, insert otherwise. A uniqueness race on
    /// insert re-queries once and falls into the merge path.
    async fn create_or_update(
        &self,
        alert: Alert,
        events: &[Event],
    ) -> KlaxonResult<(Alert, bool)> {
        let fingerprint = alert.fingerprint.clone();
        let existing = self.alerts.find_active_for_update(&fingerprint).await?;

        if let Some(existing) = existing {
            return Ok((self.merge_into(existing, &alert, events).await?, false));
        }

        match self.alerts.insert(&alert).await {
            Ok(()) => {
                info!(
                    alert_id = %alert.alert_id,
                    fingerprint = %fingerprint,
                    events = events.len(),
                    "created new alert"
                );
                Ok((alert, true))
            }
            Err(e) if e.is_conflict() => {
                warn!(fingerprint = %fingerprint, "alert insert conflict, retrying as merge");
                match self.alerts.find_active_for_update(&fingerprint).await? {
                    Some(existing) => {
                        Ok((self.merge_into(existing, &alert, events).await?, false))
                    }
                    None => Err(KlaxonError::internal(format!(
                        "insert conflict for {fingerprint} but no active alert found on retry"
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_into(
        &self,
        mut existing: Alert,
        incoming: &Alert,
        events: &[Event],
    ) -> KlaxonResult<Alert> {
        existing.level = self.least_severe_level(&[existing.level, incoming.level]);
        if incoming.last_event_time > existing.last_event_time {
            existing.last_event_time = incoming.last_event_time;
        }

        let new_event_ids: Vec<String> = events
            .iter()
            .map(|e| e.event_id.clone())
            .filter(|id| !existing.event_ids.contains(id))
            .collect();
        existing.event_ids.extend(new_event_ids.iter().cloned());

        self.alerts.merge_update(&existing, &new_event_ids).await?;

        debug!(
            alert_id = %existing.alert_id,
            fingerprint = %existing.fingerprint,
            new_events = new_event_ids.len(),
            level = existing.level,
            "merged into existing alert"
        );

        Ok(existing)
    }
}
