//! Grouped in-memory aggregation.
//!
//! Events are grouped per grouping key, assigned to window instances
//! (aligned buckets, a trailing sliding window, or gap-driven sessions),
//! aggregated, and filtered by the HAVING conditions. Operating on the
//! already-fetched batch keeps the engine free of any SQL dependency while
//! producing the same rows an analytic-SQL engine would.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};

use klaxon_types::Event;

use crate::error::{KlaxonError, KlaxonResult};
use crate::params::{AggregateCondition, AggregateExpr, AggregationParams, WindowParams};
use crate::rules::{FilterOp, FilterPredicate, FilterValue, LogicOp, ThresholdSpec};

/// Session row classification relative to the evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The gap to `now` has not yet exceeded the session timeout.
    Active,
    /// The gap to `now` exceeds the timeout; the session is over.
    Closed,
    /// The session outlived the configured maximum window size.
    Timeout,
}

/// Session-specific metadata attached to session-window rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRowMeta {
    /// Per-grouping-key session sequence number, starting at 1.
    pub session_id: u64,
    /// `last_event_time - first_event_time` in seconds.
    pub duration_secs: f64,
    pub status: SessionStatus,
}

/// One output row of the aggregation: a (grouping key, window instance)
/// pair that passed every HAVING condition.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResultRow {
    pub window_id: String,
    pub fingerprint: String,
    /// Values of the grouping columns, keyed by column name.
    pub group_values: BTreeMap<String, String>,
    pub event_count: u64,
    /// Contributing event ids, ordered by `received_at`.
    pub event_ids: Vec<String>,
    pub first_event_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    /// The most severe level present (numerically smallest, by the domain's
    /// smaller-is-worse convention).
    pub max_level: Option<i64>,
    /// Custom aggregate columns; undefined aggregates (no samples) are absent.
    pub aggregates: BTreeMap<String, f64>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub session: Option<SessionRowMeta>,
}

/// Stateless executor for resolved aggregation parameters.
#[derive(Debug, Clone, Default)]
pub struct AggregationEngine;

impl AggregationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Execute the aggregation over an event batch.
    ///
    /// Returns one row per qualifying (grouping key, window instance). An
    /// expression that cannot be evaluated against the event schema is an
    /// `AggregationExecutionError` naming the expression; no partial rows
    /// are returned in that case.
    #[instrument(skip(self, params, events), fields(window = params.window.kind()))]
    pub fn execute(
        &self,
        params: &AggregationParams,
        events: &[Event],
        now: DateTime<Utc>,
    ) -> KlaxonResult<Vec<AggregationResultRow>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let filtered: Vec<&Event> = match &params.filter {
            Some(predicate) => {
                events.iter().filter(|e| matches_filter(e, predicate)).collect()
            }
            None => events.iter().collect(),
        };

        let groups = group_events(&filtered, &params.grouping_keys)?;

        let mut rows = Vec::new();
        for (group_key, mut group_events) in groups {
            group_events.sort_by_key(|e| e.received_at);
            let windows = assign_windows(&group_events, &params.window, now);

            for window in windows {
                let row = self.build_row(params, &group_key, &window, now)?;
                if self.passes_having(params, &window.events, &row)? {
                    rows.push(row);
                }
            }
        }

        info!(
            input_events = events.len(),
            filtered_events = filtered.len(),
            result_rows = rows.len(),
            "aggregation completed"
        );

        Ok(rows)
    }

    fn build_row(
        &self,
        params: &AggregationParams,
        group_key: &str,
        window: &WindowSlice<'_>,
        _now: DateTime<Utc>,
    ) -> KlaxonResult<AggregationResultRow> {
        let events = &window.events;
        let first = events.first().expect("window slices are non-empty");
        let last = events.last().expect("window slices are non-empty");

        let mut group_values = BTreeMap::new();
        for key in &params.grouping_keys {
            if let Some(value) = text_field(first, key) {
                group_values.insert(key.clone(), value);
            }
        }

        let mut aggregates = BTreeMap::new();
        for (name, expr) in &params.aggregations {
            if let Some(value) = self.compute_aggregate(expr, events)? {
                aggregates.insert(name.clone(), value);
            }
        }

        let max_level = events.iter().map(|e| e.level).min();

        Ok(AggregationResultRow {
            window_id: window.window_id(group_key),
            fingerprint: first.fingerprint.clone(),
            group_values,
            event_count: events.len() as u64,
            event_ids: events.iter().map(|e| e.event_id.clone()).collect(),
            first_event_time: first.received_at,
            last_event_time: last.received_at,
            max_level,
            aggregates,
            window_start: window.start,
            window_end: window.end,
            session: window.session.clone(),
        })
    }

    fn passes_having(
        &self,
        params: &AggregationParams,
        events: &[&Event],
        row: &AggregationResultRow,
    ) -> KlaxonResult<bool> {
        if row.event_count < params.min_event_count {
            debug!(
                window_id = %row.window_id,
                event_count = row.event_count,
                min_event_count = params.min_event_count,
                "row dropped below min_event_count"
            );
            return Ok(false);
        }

        let applicable: Vec<&AggregateCondition> = params
            .having
            .iter()
            .filter(|c| !c.session_only || row.session.is_some())
            .collect();
        if applicable.is_empty() {
            return Ok(true);
        }

        let mut verdicts = Vec::with_capacity(applicable.len());
        for condition in applicable {
            verdicts.push(self.evaluate_condition(&condition.spec, events)?);
        }

        Ok(match params.logic {
            LogicOp::And => verdicts.iter().all(|v| *v),
            LogicOp::Or => verdicts.iter().any(|v| *v),
        })
    }

    fn evaluate_condition(&self, spec: &ThresholdSpec, events: &[&Event]) -> KlaxonResult<bool> {
        let aggregate = AggregateExpr::from_spec(spec);
        match self.compute_aggregate(&aggregate, events)? {
            // an undefined aggregate (no samples) compares like SQL NULL
            None => Ok(false),
            Some(value) => Ok(spec.op.compare(value, spec.value)),
        }
    }

    fn compute_aggregate(
        &self,
        expr: &AggregateExpr,
        events: &[&Event],
    ) -> KlaxonResult<Option<f64>> {
        let result = match expr {
            AggregateExpr::Count => Some(events.len() as f64),
            AggregateExpr::FirstEventTime => {
                events.first().map(|e| e.received_at.timestamp() as f64)
            }
            AggregateExpr::LastEventTime => {
                events.last().map(|e| e.received_at.timestamp() as f64)
            }
            AggregateExpr::TimeSpanSeconds => match (events.first(), events.last()) {
                (Some(first), Some(last)) => {
                    Some((last.received_at - first.received_at).num_milliseconds() as f64 / 1000.0)
                }
                _ => None,
            },
            AggregateExpr::Avg(field)
            | AggregateExpr::Sum(field)
            | AggregateExpr::Min(field)
            | AggregateExpr::Max(field)
            | AggregateExpr::StdDev(field) => {
                let values = self.numeric_values(field, events, expr)?;
                if values.is_empty() {
                    None
                } else {
                    Some(match expr {
                        AggregateExpr::Avg(_) => {
                            values.iter().sum::<f64>() / values.len() as f64
                        }
                        AggregateExpr::Sum(_) => values.iter().sum(),
                        AggregateExpr::Min(_) => {
                            values.iter().fold(f64::INFINITY, |a, &b| a.min(b))
                        }
                        AggregateExpr::Max(_) => {
                            values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b))
                        }
                        AggregateExpr::StdDev(_) => {
                            let mean = values.iter().sum::<f64>() / values.len() as f64;
                            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                                / values.len() as f64;
                            variance.sqrt()
                        }
                        _ => unreachable!(),
                    })
                }
            }
        };
        Ok(result)
    }

    fn numeric_values(
        &self,
        field: &str,
        events: &[&Event],
        expr: &AggregateExpr,
    ) -> KlaxonResult<Vec<f64>> {
        match field {
            "value" => Ok(events.iter().filter_map(|e| e.value).collect()),
            "level" => Ok(events.iter().map(|e| e.level as f64).collect()),
            other => Err(KlaxonError::aggregation(
                format!("field {other:?} is not numeric"),
                expr.expression(),
            )),
        }
    }
}

impl AggregateExpr {
    fn from_spec(spec: &ThresholdSpec) -> Self {
        use crate::rules::AggregateFunc;
        match spec.aggregate {
            AggregateFunc::Avg => AggregateExpr::Avg(spec.field.clone()),
            AggregateFunc::Sum => AggregateExpr::Sum(spec.field.clone()),
            AggregateFunc::Min => AggregateExpr::Min(spec.field.clone()),
            AggregateFunc::Max => AggregateExpr::Max(spec.field.clone()),
            AggregateFunc::StdDev => AggregateExpr::StdDev(spec.field.clone()),
            AggregateFunc::Count => AggregateExpr::Count,
        }
    }
}

// ---------------------------------------------------------------------------
// Grouping and window assignment
// ---------------------------------------------------------------------------

struct WindowSlice<'a> {
    events: Vec<&'a Event>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    session: Option<SessionRowMeta>,
    tag: &'static str,
}

impl WindowSlice<'_> {
    fn window_id(&self, group_key: &str) -> String {
        match &self.session {
            Some(meta) => format!(
                "{}-{}-{}-{}",
                self.tag,
                self.start.timestamp(),
                group_key,
                meta.session_id
            ),
            None => format!("{}-{}-{}", self.tag, self.start.timestamp(), group_key),
        }
    }
}

fn group_events<'a>(
    events: &[&'a Event],
    grouping_keys: &[String],
) -> KlaxonResult<HashMap<String, Vec<&'a Event>>> {
    let mut groups: HashMap<String, Vec<&'a Event>> = HashMap::new();
    for &event in events {
        let mut parts = Vec::with_capacity(grouping_keys.len());
        for key in grouping_keys {
            let value = text_field(event, key).ok_or_else(|| {
                KlaxonError::aggregation(
                    format!("grouping field {key:?} not resolvable on event {}", event.event_id),
                    key.clone(),
                )
            })?;
            parts.push(value);
        }
        groups.entry(parts.join("|")).or_default().push(event);
    }
    Ok(groups)
}

/// Split one grouping key's time-ordered events into window instances.
fn assign_windows<'a>(
    events: &[&'a Event],
    window: &WindowParams,
    now: DateTime<Utc>,
) -> Vec<WindowSlice<'a>> {
    match window {
        WindowParams::Fixed { window_size_secs } => {
            let size = *window_size_secs;
            let mut buckets: BTreeMap<i64, Vec<&Event>> = BTreeMap::new();
            for &event in events {
                let bucket = event.received_at.timestamp().div_euclid(size) * size;
                buckets.entry(bucket).or_default().push(event);
            }
            buckets
                .into_iter()
                // only complete windows: the in-progress bucket is left for
                // the invocation that sees it closed
                .filter(|(bucket, _)| bucket + size <= now.timestamp())
                .map(|(bucket, events)| WindowSlice {
                    events,
                    start: Utc.timestamp_opt(bucket, 0).single().unwrap_or(now),
                    end: Utc.timestamp_opt(bucket + size, 0).single().unwrap_or(now),
                    session: None,
                    tag: "FW",
                })
                .collect()
        }
        WindowParams::Sliding { window_size_secs, .. } => {
            // One trailing window anchored at the evaluation time; the
            // processor de-duplicates across overlapping invocations.
            let start = now - chrono::Duration::seconds(*window_size_secs);
            let in_window: Vec<&Event> = events
                .iter()
                .copied()
                .filter(|e| e.received_at >= start && e.received_at < now)
                .collect();
            if in_window.is_empty() {
                Vec::new()
            } else {
                vec![WindowSlice { events: in_window, start, end: now, session: None, tag: "SW" }]
            }
        }
        WindowParams::Session { session_timeout_secs, max_window_size_secs } => {
            let gap = chrono::Duration::seconds(*session_timeout_secs);
            let mut sessions: Vec<Vec<&Event>> = Vec::new();
            for &event in events {
                let start_new = match sessions.last().and_then(|s| s.last()) {
                    Some(prev) => event.received_at - prev.received_at > gap,
                    None => true,
                };
                if start_new {
                    sessions.push(Vec::new());
                }
                sessions.last_mut().expect("session list is non-empty").push(event);
            }

            sessions
                .into_iter()
                .enumerate()
                .map(|(idx, events)| {
                    let first = events.first().expect("sessions are non-empty");
                    let last = events.last().expect("sessions are non-empty");
                    let duration_secs = (last.received_at - first.received_at)
                        .num_milliseconds() as f64
                        / 1000.0;
                    let status = if max_window_size_secs
                        .is_some_and(|max| duration_secs > max as f64)
                    {
                        SessionStatus::Timeout
                    } else if now - last.received_at > gap {
                        SessionStatus::Closed
                    } else {
                        SessionStatus::Active
                    };
                    WindowSlice {
                        start: first.received_at,
                        end: last.received_at,
                        session: Some(SessionRowMeta {
                            session_id: idx as u64 + 1,
                            duration_secs,
                            status,
                        }),
                        events,
                        tag: "SESS",
                    }
                })
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Row-level filtering and field resolution
// ---------------------------------------------------------------------------

/// Resolve a text-valued event field by name.
fn text_field(event: &Event, name: &str) -> Option<String> {
    match name {
        "fingerprint" => Some(event.fingerprint.clone()),
        "event_id" => Some(event.event_id.clone()),
        "item" => Some(event.item.clone()),
        "resource_id" => Some(event.resource_id.clone()),
        "resource_type" => Some(event.resource_type.clone()),
        "resource_name" => Some(event.resource_name.clone()),
        "source_id" => Some(event.source_id.clone()),
        "source_name" | "alert_source" => Some(event.source_name.clone()),
        "title" => Some(event.title.clone()),
        "description" => Some(event.description.clone()),
        "status" => Some(event.status.to_string()),
        "level" => Some(event.level.to_string()),
        _ => None,
    }
}

fn numeric_field(event: &Event, name: &str) -> Option<f64> {
    match name {
        "value" => event.value,
        "level" => Some(event.level as f64),
        _ => None,
    }
}

/// Evaluate a row-level predicate. A field the event cannot resolve makes
/// the clause false rather than an error.
fn matches_filter(event: &Event, predicate: &FilterPredicate) -> bool {
    match predicate {
        FilterPredicate::All(preds) => preds.iter().all(|p| matches_filter(event, p)),
        FilterPredicate::Any(preds) => preds.iter().any(|p| matches_filter(event, p)),
        FilterPredicate::Simple { field, op, value } => match (op, value) {
            (FilterOp::In, FilterValue::List(items)) => text_field(event, field)
                .map(|v| items.contains(&v))
                .unwrap_or(false),
            (FilterOp::NotIn, FilterValue::List(items)) => text_field(event, field)
                .map(|v| !items.contains(&v))
                .unwrap_or(false),
            (FilterOp::Like, FilterValue::Text(needle)) => text_field(event, field)
                .map(|v| v.contains(needle.as_str()))
                .unwrap_or(false),
            (_, FilterValue::Number(expected)) => numeric_field(event, field)
                .map(|actual| compare_numeric(*op, actual, *expected))
                .unwrap_or(false),
            (_, FilterValue::Text(expected)) => text_field(event, field)
                .map(|actual| compare_text(*op, &actual, expected))
                .unwrap_or(false),
            _ => false,
        },
    }
}

fn compare_numeric(op: FilterOp, left: f64, right: f64) -> bool {
    match op {
        FilterOp::Eq => left == right,
        FilterOp::Ne => left != right,
        FilterOp::Gt => left > right,
        FilterOp::Lt => left < right,
        FilterOp::Ge => left >= right,
        FilterOp::Le => left <= right,
        _ => false,
    }
}

fn compare_text(op: FilterOp, left: &str, right: &str) -> bool {
    match op {
        FilterOp::Eq => left == right,
        FilterOp::Ne => left != right,
        FilterOp::Gt => left > right,
        FilterOp::Lt => left < right,
        FilterOp::Ge => left >= right,
        FilterOp::Le => left <= right,
        FilterOp::Like => left.contains(right),
        _ => false,
    }
}
