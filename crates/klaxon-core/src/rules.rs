//! Correlation-rule model.
//!
//! Rules arrive from the configuration store as loosely-typed documents
//! (`RuleDocument`). Validation and conversion produce the typed
//! `CorrelationRule`, whose window and strategy are tagged unions so a
//! missing case is a compile error rather than a runtime dispatch miss.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KlaxonError, KlaxonResult};
use crate::time_range::parse_duration_str;

/// Event fields usable as grouping keys or text filters.
pub const TEXT_FIELDS: &[&str] = &[
    "fingerprint",
    "event_id",
    "item",
    "resource_id",
    "resource_type",
    "resource_name",
    "source_id",
    "source_name",
    "alert_source",
    "title",
    "description",
    "status",
];

/// Event fields usable in numeric filters and aggregations.
pub const NUMERIC_FIELDS: &[&str] = &["value", "level"];

/// True if `name` resolves to any event field.
pub fn is_event_field(name: &str) -> bool {
    TEXT_FIELDS.contains(&name) || NUMERIC_FIELDS.contains(&name)
}

/// True if `name` resolves to a numeric event field.
pub fn is_numeric_field(name: &str) -> bool {
    NUMERIC_FIELDS.contains(&name)
}

/// Comparison operator for aggregate (HAVING-level) conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    /// Apply the comparison to two numeric values.
    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Gt => left > right,
            CompareOp::Lt => left < right,
            CompareOp::Ge => left >= right,
            CompareOp::Le => left <= right,
        }
    }

    fn parse(raw: &str) -> KlaxonResult<Self> {
        match raw {
            "=" | "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            ">" => Ok(CompareOp::Gt),
            "<" => Ok(CompareOp::Lt),
            ">=" => Ok(CompareOp::Ge),
            "<=" => Ok(CompareOp::Le),
            _ => Err(KlaxonError::configuration(format!("invalid comparison operator: {raw:?}"))),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        };
        write!(f, "{s}")
    }
}

/// Logic joining composite sub-conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicOp {
    And,
    Or,
}

/// Aggregate function applicable to a numeric event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Avg,
    Min,
    Max,
    Sum,
    Count,
    StdDev,
}

impl AggregateFunc {
    fn parse(raw: &str) -> KlaxonResult<Self> {
        match raw.to_uppercase().as_str() {
            "AVG" => Ok(AggregateFunc::Avg),
            "MIN" => Ok(AggregateFunc::Min),
            "MAX" => Ok(AggregateFunc::Max),
            "SUM" => Ok(AggregateFunc::Sum),
            "COUNT" => Ok(AggregateFunc::Count),
            "STDDEV" => Ok(AggregateFunc::StdDev),
            _ => Err(KlaxonError::configuration(format!("invalid aggregate function: {raw:?}"))),
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Count => "COUNT",
            AggregateFunc::StdDev => "STDDEV",
        };
        write!(f, "{s}")
    }
}

/// One aggregate condition: `AGG(field) OP value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub aggregate: AggregateFunc,
    pub field: String,
    pub op: CompareOp,
    pub value: f64,
}

impl ThresholdSpec {
    /// Render the condition the way the rule author wrote it, for error
    /// messages and logs.
    pub fn expression(&self) -> String {
        format!("{}({}) {} {}", self.aggregate, self.field, self.op, self.value)
    }
}

/// Row-level filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
    Like,
}

impl FilterOp {
    fn parse(raw: &str) -> KlaxonResult<Self> {
        match raw {
            "=" | "==" => Ok(FilterOp::Eq),
            "!=" => Ok(FilterOp::Ne),
            ">" => Ok(FilterOp::Gt),
            "<" => Ok(FilterOp::Lt),
            ">=" => Ok(FilterOp::Ge),
            "<=" => Ok(FilterOp::Le),
            "in" => Ok(FilterOp::In),
            "not_in" => Ok(FilterOp::NotIn),
            "like" => Ok(FilterOp::Like),
            _ => Err(KlaxonError::configuration(format!("invalid filter operator: {raw:?}"))),
        }
    }
}

/// Value side of a row-level filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

/// Row-level filter predicate applied to events before grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterPredicate {
    Simple { field: String, op: FilterOp, value: FilterValue },
    All(Vec<FilterPredicate>),
    Any(Vec<FilterPredicate>),
}

impl FilterPredicate {
    /// Collect every field the predicate references, for schema validation.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            FilterPredicate::Simple { field, .. } => out.push(field.clone()),
            FilterPredicate::All(preds) | FilterPredicate::Any(preds) => {
                for p in preds {
                    p.referenced_fields(out);
                }
            }
        }
    }
}

/// Window configuration as a tagged union: the required sub-fields per
/// window kind are enforced by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowConfig {
    /// Time-aligned non-overlapping buckets.
    Fixed { window_size: Duration },
    /// Overlapping windows anchored at the evaluation time.
    Sliding { window_size: Duration, slide_interval: Duration },
    /// Gap-driven dynamic windows, optionally capped in total span.
    Session { session_timeout: Duration, max_window_size: Option<Duration> },
}

impl WindowConfig {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WindowConfig::Fixed { .. } => "fixed",
            WindowConfig::Sliding { .. } => "sliding",
            WindowConfig::Session { .. } => "session",
        }
    }
}

/// Rule strategy as a tagged union.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyConfig {
    /// A single aggregate condition over a numeric field.
    Threshold(ThresholdSpec),
    /// Several aggregate conditions joined with AND/OR; may carry a
    /// session-close condition when paired with a session window.
    Composite {
        logic: LogicOp,
        conditions: Vec<ThresholdSpec>,
        session_close: Option<ThresholdSpec>,
    },
    /// Pure event-count strategy; the threshold becomes min_event_count.
    Frequency { count_threshold: Option<u64> },
}

impl StrategyConfig {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyConfig::Threshold(_) => "threshold",
            StrategyConfig::Composite { .. } => "composite",
            StrategyConfig::Frequency { .. } => "frequency",
        }
    }
}

/// A fully validated, typed correlation rule.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRule {
    pub rule_id: String,
    pub name: String,
    pub window: WindowConfig,
    pub strategy: StrategyConfig,
    /// Grouping columns; defaults to `["fingerprint"]`.
    pub grouping_keys: Vec<String>,
    pub filter: Option<FilterPredicate>,
    /// Per-rule HAVING threshold; engine default applies when unset.
    pub min_event_count: Option<u64>,
}

// ---------------------------------------------------------------------------
// Raw document form, as stored by the rule-configuration system.
// ---------------------------------------------------------------------------

/// One sub-condition in a raw strategy document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubConditionDocument {
    pub field: Option<String>,
    pub operator: Option<String>,
    pub value: Option<f64>,
    pub aggregation: Option<String>,
}

/// Raw strategy block; which fields matter depends on `strategy_type`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StrategyDocument {
    pub field: Option<String>,
    pub operator: Option<String>,
    pub value: Option<f64>,
    pub aggregation: Option<String>,
    pub logic: Option<String>,
    #[serde(default)]
    pub conditions: Vec<SubConditionDocument>,
    pub count_threshold: Option<u64>,
    pub session_close: Option<SubConditionDocument>,
}

/// One raw row-level filter clause.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterClauseDocument {
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
}

/// A correlation rule as authored: stringly-typed window and strategy tags,
/// duration strings, optional blocks. `validate` + `resolve` turn it into a
/// `CorrelationRule` or a `ConfigurationError` naming what is wrong.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDocument {
    pub rule_id: String,
    pub name: String,
    pub window_type: String,
    pub strategy_type: String,
    pub window_size: Option<String>,
    pub slide_interval: Option<String>,
    pub session_timeout: Option<String>,
    pub max_window_size: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub min_event_count: Option<u64>,
    #[serde(default)]
    pub filters: Vec<FilterClauseDocument>,
    #[serde(default)]
    pub strategy: StrategyDocument,
}

impl RuleDocument {
    /// Structural validation: every required field for the declared window
    /// and strategy type must be present and well-formed.
    pub fn validate(&self) -> KlaxonResult<()> {
        self.resolve().map(|_| ())
    }

    /// Convert into the typed rule, rejecting structurally invalid documents.
    pub fn resolve(&self) -> KlaxonResult<CorrelationRule> {
        let window = self.resolve_window().map_err(|e| e.with_rule_id(&self.rule_id))?;
        let strategy =
            self.resolve_strategy(&window).map_err(|e| e.with_rule_id(&self.rule_id))?;
        let filter = self.resolve_filter().map_err(|e| e.with_rule_id(&self.rule_id))?;

        let grouping_keys = if self.group_by.is_empty() {
            vec!["fingerprint".to_string()]
        } else {
            for key in &self.group_by {
                if !is_event_field(key) {
                    return Err(KlaxonError::configuration_field(
                        format!("unknown grouping field: {key:?}"),
                        &self.rule_id,
                        key,
                    ));
                }
            }
            self.group_by.clone()
        };

        Ok(CorrelationRule {
            rule_id: self.rule_id.clone(),
            name: self.name.clone(),
            window,
            strategy,
            grouping_keys,
            filter,
            min_event_count: self.min_event_count,
        })
    }

    fn resolve_window(&self) -> KlaxonResult<WindowConfig> {
        let require = |value: &Option<String>, field: &str| -> KlaxonResult<Duration> {
            let raw = value.as_deref().ok_or_else(|| {
                KlaxonError::configuration_field(
                    format!("{} window requires {field}", self.window_type),
                    &self.rule_id,
                    field,
                )
            })?;
            parse_duration_str(raw)
        };

        match self.window_type.as_str() {
            "fixed" => Ok(WindowConfig::Fixed { window_size: require(&self.window_size, "window_size")? }),
            "sliding" => Ok(WindowConfig::Sliding {
                window_size: require(&self.window_size, "window_size")?,
                slide_interval: require(&self.slide_interval, "slide_interval")?,
            }),
            "session" => Ok(WindowConfig::Session {
                session_timeout: require(&self.session_timeout, "session_timeout")?,
                max_window_size: match &self.max_window_size {
                    Some(raw) => Some(parse_duration_str(raw)?),
                    None => None,
                },
            }),
            other => Err(KlaxonError::configuration_field(
                format!("invalid window_type: {other:?}"),
                &self.rule_id,
                "window_type",
            )),
        }
    }

    fn resolve_strategy(&self, window: &WindowConfig) -> KlaxonResult<StrategyConfig> {
        match self.strategy_type.as_str() {
            "threshold" => {
                let spec = resolve_threshold_spec(
                    self.strategy.field.as_deref(),
                    self.strategy.operator.as_deref(),
                    self.strategy.value,
                    self.strategy.aggregation.as_deref(),
                )?;
                Ok(StrategyConfig::Threshold(spec))
            }
            "composite" => {
                if self.strategy.conditions.is_empty() {
                    return Err(KlaxonError::configuration(
                        "composite strategy requires at least one condition",
                    ));
                }
                let logic = match self.strategy.logic.as_deref() {
                    None | Some("AND") | Some("and") => LogicOp::And,
                    Some("OR") | Some("or") => LogicOp::Or,
                    Some(other) => {
                        return Err(KlaxonError::configuration(format!(
                            "invalid composite logic: {other:?}"
                        )))
                    }
                };
                let conditions = self
                    .strategy
                    .conditions
                    .iter()
                    .map(|c| {
                        resolve_threshold_spec(
                            c.field.as_deref(),
                            c.operator.as_deref(),
                            c.value,
                            c.aggregation.as_deref(),
                        )
                    })
                    .collect::<KlaxonResult<Vec<_>>>()?;
                // session_close only means something with a session window
                let session_close = match (&self.strategy.session_close, window) {
                    (Some(doc), WindowConfig::Session { .. }) => Some(resolve_threshold_spec(
                        doc.field.as_deref(),
                        doc.operator.as_deref(),
                        doc.value,
                        doc.aggregation.as_deref(),
                    )?),
                    _ => None,
                };
                Ok(StrategyConfig::Composite { logic, conditions, session_close })
            }
            "frequency" => {
                Ok(StrategyConfig::Frequency { count_threshold: self.strategy.count_threshold })
            }
            other => Err(KlaxonError::configuration_field(
                format!("invalid strategy_type: {other:?}"),
                &self.rule_id,
                "strategy_type",
            )),
        }
    }

    fn resolve_filter(&self) -> KlaxonResult<Option<FilterPredicate>> {
        if self.filters.is_empty() {
            return Ok(None);
        }
        let clauses = self
            .filters
            .iter()
            .map(|clause| self.resolve_filter_clause(clause))
            .collect::<KlaxonResult<Vec<_>>>()?;
        if clauses.len() == 1 {
            Ok(clauses.into_iter().next())
        } else {
            Ok(Some(FilterPredicate::All(clauses)))
        }
    }

    fn resolve_filter_clause(
        &self,
        clause: &FilterClauseDocument,
    ) -> KlaxonResult<FilterPredicate> {
        if !is_event_field(&clause.field) {
            return Err(KlaxonError::configuration_field(
                format!("unknown filter field: {:?}", clause.field),
                &self.rule_id,
                &clause.field,
            ));
        }
        let op = FilterOp::parse(&clause.operator)?;
        let value = match (&op, &clause.value) {
            (FilterOp::In | FilterOp::NotIn, serde_json::Value::Array(items)) => {
                let list = items
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => Ok(s.clone()),
                        other => Ok(other.to_string()),
                    })
                    .collect::<KlaxonResult<Vec<_>>>()?;
                FilterValue::List(list)
            }
            (FilterOp::In | FilterOp::NotIn, _) => {
                return Err(KlaxonError::configuration(format!(
                    "filter {:?} with in/not_in requires a list value",
                    clause.field
                )));
            }
            (_, serde_json::Value::Number(n)) => FilterValue::Number(n.as_f64().unwrap_or(0.0)),
            (_, serde_json::Value::String(s)) => FilterValue::Text(s.clone()),
            (_, other) => {
                return Err(KlaxonError::configuration(format!(
                    "unsupported filter value for {:?}: {other}",
                    clause.field
                )));
            }
        };
        Ok(FilterPredicate::Simple { field: clause.field.clone(), op, value })
    }
}

fn resolve_threshold_spec(
    field: Option<&str>,
    operator: Option<&str>,
    value: Option<f64>,
    aggregation: Option<&str>,
) -> KlaxonResult<ThresholdSpec> {
    let field = field
        .ok_or_else(|| KlaxonError::configuration("threshold condition missing field"))?;
    if !is_numeric_field(field) {
        return Err(KlaxonError::configuration(format!(
            "threshold condition references non-numeric field: {field:?}"
        )));
    }
    let op = CompareOp::parse(
        operator.ok_or_else(|| KlaxonError::configuration("threshold condition missing operator"))?,
    )?;
    let value =
        value.ok_or_else(|| KlaxonError::configuration("threshold condition missing value"))?;
    let aggregate = AggregateFunc::parse(aggregation.unwrap_or("AVG"))?;
    Ok(ThresholdSpec { aggregate, field: field.to_string(), op, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_document() -> RuleDocument {
        serde_json::from_value(serde_json::json!({
            "rule_id": "rule-1",
            "name": "cpu pressure",
            "window_type": "fixed",
            "strategy_type": "threshold",
            "window_size": "10min",
            "strategy": {
                "field": "value",
                "operator": ">=",
                "value": 80.0,
                "aggregation": "AVG"
            }
        }))
        .unwrap()
    }

    #[test]
    fn threshold_document_resolves_to_typed_rule() {
        let rule = base_document().resolve().unwrap();
        assert_eq!(rule.window, WindowConfig::Fixed { window_size: Duration::minutes(10) });
        match rule.strategy {
            StrategyConfig::Threshold(spec) => {
                assert_eq!(spec.expression(), "AVG(value) >= 80");
            }
            other => panic!("unexpected strategy: {other:?}"),
        }
        assert_eq!(rule.grouping_keys, vec!["fingerprint".to_string()]);
    }

    #[test]
    fn sliding_requires_slide_interval() {
        let mut doc = base_document();
        doc.window_type = "sliding".to_string();
        let err = doc.resolve().unwrap_err();
        assert!(err.is_configuration(), "expected configuration error, got {err:?}");
    }

    #[test]
    fn session_accepts_optional_max_window_size() {
        let mut doc = base_document();
        doc.window_type = "session".to_string();
        doc.session_timeout = Some("5min".to_string());
        assert!(doc.resolve().is_ok());

        doc.max_window_size = Some("30min".to_string());
        let rule = doc.resolve().unwrap();
        assert_eq!(
            rule.window,
            WindowConfig::Session {
                session_timeout: Duration::minutes(5),
                max_window_size: Some(Duration::minutes(30)),
            }
        );
    }

    #[test]
    fn unknown_window_type_is_a_configuration_error() {
        let mut doc = base_document();
        doc.window_type = "hopping".to_string();
        let err = doc.resolve().unwrap_err();
        match err {
            KlaxonError::Configuration { field, rule_id, .. } => {
                assert_eq!(field.as_deref(), Some("window_type"));
                assert_eq!(rule_id.as_deref(), Some("rule-1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn composite_unions_conditions_and_validates_each() {
        let doc: RuleDocument = serde_json::from_value(serde_json::json!({
            "rule_id": "rule-2",
            "name": "cpu and level",
            "window_type": "sliding",
            "strategy_type": "composite",
            "window_size": "10min",
            "slide_interval": "1min",
            "strategy": {
                "logic": "OR",
                "conditions": [
                    {"field": "value", "operator": ">", "value": 90.0, "aggregation": "MAX"},
                    {"field": "level", "operator": "<=", "value": 2.0, "aggregation": "MIN"}
                ]
            }
        }))
        .unwrap();
        let rule = doc.resolve().unwrap();
        match rule.strategy {
            StrategyConfig::Composite { logic, conditions, session_close } => {
                assert_eq!(logic, LogicOp::Or);
                assert_eq!(conditions.len(), 2);
                assert!(session_close.is_none());
            }
            other => panic!("unexpected strategy: {other:?}"),
        }
    }

    #[test]
    fn malformed_sub_condition_fails_resolution() {
        let doc: RuleDocument = serde_json::from_value(serde_json::json!({
            "rule_id": "rule-3",
            "name": "broken",
            "window_type": "fixed",
            "strategy_type": "composite",
            "window_size": "5min",
            "strategy": {
                "conditions": [
                    {"operator": ">", "value": 1.0}
                ]
            }
        }))
        .unwrap();
        assert!(doc.resolve().unwrap_err().is_configuration());
    }

    #[test]
    fn threshold_over_text_field_is_rejected() {
        let mut doc = base_document();
        doc.strategy.field = Some("title".to_string());
        assert!(doc.resolve().is_err());
    }

    #[test]
    fn filters_validate_fields_and_operators() {
        let mut doc = base_document();
        doc.filters = vec![FilterClauseDocument {
            field: "resource_type".to_string(),
            operator: "in".to_string(),
            value: serde_json::json!(["host", "vm"]),
        }];
        let rule = doc.resolve().unwrap();
        match rule.filter.unwrap() {
            FilterPredicate::Simple { op, value, .. } => {
                assert_eq!(op, FilterOp::In);
                assert_eq!(
                    value,
                    FilterValue::List(vec!["host".to_string(), "vm".to_string()])
                );
            }
            other => panic!("unexpected predicate: {other:?}"),
        }

        doc.filters = vec![FilterClauseDocument {
            field: "nonsense".to_string(),
            operator: "=".to_string(),
            value: serde_json::json!("x"),
        }];
        assert!(doc.resolve().is_err());
    }
}
