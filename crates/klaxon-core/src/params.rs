//! Resolution of a correlation rule into executable aggregation parameters.
//!
//! Each (window kind × strategy kind) combination maps to a strongly-typed
//! `AggregationParams` value, so a partially-built query can never reach the
//! engine. Resolution fails with a configuration error instead.

use std::collections::BTreeMap;

use crate::config::AggregationConfig;
use crate::error::{KlaxonError, KlaxonResult};
use crate::rules::{
    is_numeric_field, AggregateFunc, CorrelationRule, FilterPredicate, LogicOp, StrategyConfig,
    ThresholdSpec, WindowConfig,
};

/// One named aggregate column computed per result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateExpr {
    /// Row count of the group.
    Count,
    Avg(String),
    Sum(String),
    Min(String),
    Max(String),
    StdDev(String),
    /// Earliest `received_at` in the group, as epoch seconds.
    FirstEventTime,
    /// Latest `received_at` in the group, as epoch seconds.
    LastEventTime,
    /// `last - first` in seconds.
    TimeSpanSeconds,
}

impl AggregateExpr {
    /// Human-readable form for logs and error messages.
    pub fn expression(&self) -> String {
        match self {
            AggregateExpr::Count => "COUNT(*)".to_string(),
            AggregateExpr::Avg(f) => format!("AVG({f})"),
            AggregateExpr::Sum(f) => format!("SUM({f})"),
            AggregateExpr::Min(f) => format!("MIN({f})"),
            AggregateExpr::Max(f) => format!("MAX({f})"),
            AggregateExpr::StdDev(f) => format!("STDDEV({f})"),
            AggregateExpr::FirstEventTime => "MIN(received_at)".to_string(),
            AggregateExpr::LastEventTime => "MAX(received_at)".to_string(),
            AggregateExpr::TimeSpanSeconds => {
                "MAX(received_at) - MIN(received_at)".to_string()
            }
        }
    }

    fn from_func(func: AggregateFunc, field: &str) -> Self {
        match func {
            AggregateFunc::Avg => AggregateExpr::Avg(field.to_string()),
            AggregateFunc::Sum => AggregateExpr::Sum(field.to_string()),
            AggregateFunc::Min => AggregateExpr::Min(field.to_string()),
            AggregateFunc::Max => AggregateExpr::Max(field.to_string()),
            AggregateFunc::StdDev => AggregateExpr::StdDev(field.to_string()),
            AggregateFunc::Count => AggregateExpr::Count,
        }
    }

    /// The event field the expression reads, if any.
    fn source_field(&self) -> Option<&str> {
        match self {
            AggregateExpr::Avg(f)
            | AggregateExpr::Sum(f)
            | AggregateExpr::Min(f)
            | AggregateExpr::Max(f)
            | AggregateExpr::StdDev(f) => Some(f),
            _ => None,
        }
    }
}

/// Aggregate condition applied after grouping (HAVING semantics).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCondition {
    pub spec: ThresholdSpec,
    /// When true the condition only gates session-window rows (the
    /// composite strategy's session_close propagation).
    pub session_only: bool,
}

/// Window parameters in plain seconds, ready for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowParams {
    Fixed { window_size_secs: i64 },
    Sliding { window_size_secs: i64, slide_interval_secs: i64 },
    Session { session_timeout_secs: i64, max_window_size_secs: Option<i64> },
}

impl WindowParams {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WindowParams::Fixed { .. } => "fixed",
            WindowParams::Sliding { .. } => "sliding",
            WindowParams::Session { .. } => "session",
        }
    }
}

/// Fully resolved parameters for one aggregation execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationParams {
    pub grouping_keys: Vec<String>,
    pub filter: Option<FilterPredicate>,
    /// Extra named aggregate columns beyond the intrinsic row fields.
    pub aggregations: BTreeMap<String, AggregateExpr>,
    /// Aggregate conditions joined with `logic`.
    pub having: Vec<AggregateCondition>,
    pub logic: LogicOp,
    pub min_event_count: u64,
    pub window: WindowParams,
}

/// Resolve a rule into `AggregationParams`.
///
/// Never produces an expression over an unresolvable field: every referenced
/// field is checked against the event schema before the value is returned.
pub fn resolve(rule: &CorrelationRule, config: &AggregationConfig) -> KlaxonResult<AggregationParams> {
    let window = resolve_window(&rule.window);

    let mut aggregations = BTreeMap::new();
    let mut having = Vec::new();
    let mut logic = LogicOp::And;
    let mut min_event_count = rule.min_event_count;

    match &rule.strategy {
        StrategyConfig::Threshold(spec) => {
            insert_field_aggregates(&mut aggregations, &spec.field);
            aggregations.insert("sample_count".to_string(), AggregateExpr::Count);
            having.push(AggregateCondition { spec: spec.clone(), session_only: false });
        }
        StrategyConfig::Composite { logic: rule_logic, conditions, session_close } => {
            logic = *rule_logic;
            for spec in conditions {
                let name =
                    format!("{}_{}", spec.aggregate.to_string().to_lowercase(), spec.field);
                aggregations.insert(name, AggregateExpr::from_func(spec.aggregate, &spec.field));
                having.push(AggregateCondition { spec: spec.clone(), session_only: false });
            }
            if let Some(close) = session_close {
                having.push(AggregateCondition { spec: close.clone(), session_only: true });
            }
        }
        StrategyConfig::Frequency { count_threshold } => {
            aggregations.insert("event_count".to_string(), AggregateExpr::Count);
            aggregations.insert("first_event".to_string(), AggregateExpr::FirstEventTime);
            aggregations.insert("last_event".to_string(), AggregateExpr::LastEventTime);
            aggregations
                .insert("time_span_seconds".to_string(), AggregateExpr::TimeSpanSeconds);
            min_event_count = min_event_count
                .or(*count_threshold)
                .or(Some(config.default_count_threshold));
        }
    }

    for (name, expr) in &aggregations {
        if let Some(field) = expr.source_field() {
            if !is_numeric_field(field) {
                return Err(KlaxonError::configuration_field(
                    format!(
                        "aggregation {name:?} references unresolvable field in {}",
                        expr.expression()
                    ),
                    &rule.rule_id,
                    field,
                ));
            }
        }
    }

    Ok(AggregationParams {
        grouping_keys: rule.grouping_keys.clone(),
        filter: rule.filter.clone(),
        aggregations,
        having,
        logic,
        min_event_count: min_event_count.unwrap_or(config.default_min_event_count),
        window,
    })
}

fn resolve_window(window: &WindowConfig) -> WindowParams {
    match window {
        WindowConfig::Fixed { window_size } => {
            WindowParams::Fixed { window_size_secs: window_size.num_seconds() }
        }
        WindowConfig::Sliding { window_size, slide_interval } => WindowParams::Sliding {
            window_size_secs: window_size.num_seconds(),
            slide_interval_secs: slide_interval.num_seconds(),
        },
        WindowConfig::Session { session_timeout, max_window_size } => WindowParams::Session {
            session_timeout_secs: session_timeout.num_seconds(),
            max_window_size_secs: max_window_size.map(|d| d.num_seconds()),
        },
    }
}

fn insert_field_aggregates(map: &mut BTreeMap<String, AggregateExpr>, field: &str) {
    map.insert(format!("avg_{field}"), AggregateExpr::Avg(field.to_string()));
    map.insert(format!("max_{field}"), AggregateExpr::Max(field.to_string()));
    map.insert(format!("min_{field}"), AggregateExpr::Min(field.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::CompareOp;
    use chrono::Duration;

    fn config() -> AggregationConfig {
        AggregationConfig::default()
    }

    fn threshold_rule() -> CorrelationRule {
        CorrelationRule {
            rule_id: "r1".to_string(),
            name: "cpu pressure".to_string(),
            window: WindowConfig::Fixed { window_size: Duration::minutes(10) },
            strategy: StrategyConfig::Threshold(ThresholdSpec {
                aggregate: AggregateFunc::Avg,
                field: "value".to_string(),
                op: CompareOp::Ge,
                value: 80.0,
            }),
            grouping_keys: vec!["fingerprint".to_string()],
            filter: None,
            min_event_count: None,
        }
    }

    #[test]
    fn threshold_gets_default_field_aggregates() {
        let params = resolve(&threshold_rule(), &config()).unwrap();
        assert_eq!(params.min_event_count, 1);
        assert!(params.aggregations.contains_key("avg_value"));
        assert!(params.aggregations.contains_key("max_value"));
        assert!(params.aggregations.contains_key("min_value"));
        assert_eq!(params.aggregations.get("sample_count"), Some(&AggregateExpr::Count));
        assert_eq!(params.having.len(), 1);
        assert_eq!(params.window, WindowParams::Fixed { window_size_secs: 600 });
    }

    #[test]
    fn frequency_defaults_min_event_count_to_count_threshold() {
        let mut rule = threshold_rule();
        rule.strategy = StrategyConfig::Frequency { count_threshold: Some(25) };
        let params = resolve(&rule, &config()).unwrap();
        assert_eq!(params.min_event_count, 25);
        assert!(params.aggregations.contains_key("event_count"));
        assert!(params.aggregations.contains_key("time_span_seconds"));

        rule.strategy = StrategyConfig::Frequency { count_threshold: None };
        let params = resolve(&rule, &config()).unwrap();
        assert_eq!(params.min_event_count, config().default_count_threshold);
    }

    #[test]
    fn composite_unions_aggregations_and_carries_logic() {
        let mut rule = threshold_rule();
        rule.strategy = StrategyConfig::Composite {
            logic: LogicOp::Or,
            conditions: vec![
                ThresholdSpec {
                    aggregate: AggregateFunc::Max,
                    field: "value".to_string(),
                    op: CompareOp::Gt,
                    value: 95.0,
                },
                ThresholdSpec {
                    aggregate: AggregateFunc::Min,
                    field: "level".to_string(),
                    op: CompareOp::Le,
                    value: 2.0,
                },
            ],
            session_close: None,
        };
        let params = resolve(&rule, &config()).unwrap();
        assert_eq!(params.logic, LogicOp::Or);
        assert!(params.aggregations.contains_key("max_value"));
        assert!(params.aggregations.contains_key("min_level"));
        assert_eq!(params.having.len(), 2);
    }

    #[test]
    fn session_close_only_applies_to_session_windows() {
        let mut rule = threshold_rule();
        rule.window = WindowConfig::Session {
            session_timeout: Duration::minutes(5),
            max_window_size: Some(Duration::minutes(30)),
        };
        rule.strategy = StrategyConfig::Composite {
            logic: LogicOp::And,
            conditions: vec![ThresholdSpec {
                aggregate: AggregateFunc::Avg,
                field: "value".to_string(),
                op: CompareOp::Ge,
                value: 50.0,
            }],
            session_close: Some(ThresholdSpec {
                aggregate: AggregateFunc::Count,
                field: "value".to_string(),
                op: CompareOp::Ge,
                value: 3.0,
            }),
        };
        let params = resolve(&rule, &config()).unwrap();
        assert_eq!(params.having.len(), 2);
        assert!(params.having.iter().any(|h| h.session_only));
        assert_eq!(
            params.window,
            WindowParams::Session {
                session_timeout_secs: 300,
                max_window_size_secs: Some(1800)
            }
        );
    }

    #[test]
    fn rule_level_min_event_count_wins() {
        let mut rule = threshold_rule();
        rule.min_event_count = Some(4);
        let params = resolve(&rule, &config()).unwrap();
        assert_eq!(params.min_event_count, 4);
    }
}
