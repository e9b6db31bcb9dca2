use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a raw monitoring event.
///
/// Events enter the system as `Received` and are only ever advanced by the
/// surrounding platform; the aggregation core treats them as read-only apart
/// from excluding `Shield`ed events from every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Received,
    Pending,
    Shield,
    Processed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Received => write!(f, "received"),
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Shield => write!(f, "shield"),
            EventStatus::Processed => write!(f, "processed"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "received" => Ok(EventStatus::Received),
            "pending" => Ok(EventStatus::Pending),
            "shield" => Ok(EventStatus::Shield),
            "processed" => Ok(EventStatus::Processed),
            _ => Err(format!("unknown event status: {s}")),
        }
    }
}

/// An observed occurrence from a monitored source.
///
/// `level` is an ordered severity where a *smaller* number means *more*
/// severe — the whole engine preserves this numeric convention.
/// `fingerprint` is derived (not stored by ingestion); the query layer fills
/// it before events reach the aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub received_at: DateTime<Utc>,
    pub level: i64,
    pub resource_id: String,
    pub resource_type: String,
    pub resource_name: String,
    /// Metric or check name that produced the event.
    pub item: String,
    pub source_id: String,
    pub source_name: String,
    /// Whether the originating alert source is currently active.
    pub source_active: bool,
    pub status: EventStatus,
    pub value: Option<f64>,
    pub title: String,
    pub description: String,
    pub labels: HashMap<String, String>,
    /// Stable content hash identifying "the same underlying problem".
    /// Empty until the query layer computes it.
    #[serde(default)]
    pub fingerprint: String,
}

/// Workflow status of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Unassigned,
    Pending,
    Processing,
    Resolved,
    Closed,
}

/// Statuses in which an alert is considered active (not yet terminal).
/// At most one alert per fingerprint may hold one of these at any time.
pub const ACTIVE_ALERT_STATUSES: &[AlertStatus] = &[
    AlertStatus::Unassigned,
    AlertStatus::Pending,
    AlertStatus::Processing,
];

impl AlertStatus {
    /// True if the alert is still open (eligible for merge on upsert).
    pub fn is_active(&self) -> bool {
        ACTIVE_ALERT_STATUSES.contains(self)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Unassigned => write!(f, "unassigned"),
            AlertStatus::Pending => write!(f, "pending"),
            AlertStatus::Processing => write!(f, "processing"),
            AlertStatus::Resolved => write!(f, "resolved"),
            AlertStatus::Closed => write!(f, "closed"),
        }
    }
}

/// The durable entity representing an ongoing or closed incident.
///
/// Created and updated exclusively through the alert builder's upsert; never
/// deleted by this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub fingerprint: String,
    pub level: i64,
    pub title: String,
    pub content: String,
    pub item: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub source_name: String,
    pub status: AlertStatus,
    pub first_event_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    pub rule_id: String,
    /// Ids of the contributing events (set semantics, kept insertion-ordered).
    pub event_ids: Vec<String>,
}

/// One advisory audit record, written when an alert is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorLogEntry {
    pub action: String,
    pub target_type: String,
    pub operator: String,
    pub target_id: String,
    pub overview: String,
    pub created_at: DateTime<Utc>,
}

impl OperatorLogEntry {
    /// Entry recording that the system generated a new alert for a rule.
    pub fn alert_created(alert_id: &str, rule_id: &str, rule_name: &str) -> Self {
        Self {
            action: "add".to_string(),
            target_type: "alert".to_string(),
            operator: "system".to_string(),
            target_id: alert_id.to_string(),
            overview: format!("alert generated by rule {rule_name} ({rule_id}): {alert_id}"),
            created_at: Utc::now(),
        }
    }
}

/// Format a labels map into a stable human-readable string.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use klaxon_types::format_labels;
///
/// let mut labels = HashMap::new();
/// labels.insert("mount".to_string(), "/data".to_string());
/// labels.insert("device".to_string(), "sda1".to_string());
/// assert_eq!(format_labels(&labels), "device=sda1, mount=/data");
/// ```
pub fn format_labels(labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(", ")
}
