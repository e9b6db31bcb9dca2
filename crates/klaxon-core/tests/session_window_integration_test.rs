// Session-window integration: gap-driven session splitting, the maximum
// window span cap, and closed-session bookkeeping across invocations.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use klaxon_core::memory::{MemoryAlertStore, MemoryEventStore, MemoryStateStore};
use klaxon_core::stores::DefaultTemplateFormatter;
use klaxon_core::{AggregationConfig, RuleDocument, WindowProcessor};
use klaxon_types::{Event, EventStatus};

fn session_rule(max_window_size: Option<&str>) -> RuleDocument {
    let mut doc = serde_json::json!({
        "rule_id": "rule-session",
        "name": "failure stream",
        "window_type": "session",
        "strategy_type": "frequency",
        "session_timeout": "5min",
        "strategy": { "count_threshold": 1 }
    });
    if let Some(max) = max_window_size {
        doc["max_window_size"] = serde_json::json!(max);
    }
    serde_json::from_value(doc).unwrap()
}

fn failure_event(id: &str, at: DateTime<Utc>) -> Event {
    Event {
        event_id: id.to_string(),
        received_at: at,
        level: 2,
        resource_id: "F2".to_string(),
        resource_type: "service".to_string(),
        resource_name: "checkout".to_string(),
        item: "http_errors".to_string(),
        source_id: "src-2".to_string(),
        source_name: "prometheus".to_string(),
        source_active: true,
        status: EventStatus::Received,
        value: Some(1.0),
        title: "5xx burst".to_string(),
        description: "error rate spike".to_string(),
        labels: HashMap::new(),
        fingerprint: String::new(),
    }
}

fn processor(
    doc: RuleDocument,
    events: Arc<MemoryEventStore>,
    alerts: Arc<MemoryAlertStore>,
    state: Arc<MemoryStateStore>,
) -> WindowProcessor {
    WindowProcessor::new(
        doc.resolve().unwrap(),
        Arc::new(AggregationConfig::default()),
        events,
        alerts,
        state,
        Arc::new(DefaultTemplateFormatter),
    )
}

#[tokio::test]
async fn runaway_session_is_dropped_entirely() {
    let events = Arc::new(MemoryEventStore::new());
    let alerts = Arc::new(MemoryAlertStore::new());
    let state = Arc::new(MemoryStateStore::new());

    // events every four minutes for forty minutes: one continuous session
    // (no gap exceeds the five-minute timeout) far beyond the 30min cap
    let start = Utc::now() - Duration::minutes(45);
    for i in 0..11i64 {
        events
            .put(failure_event(&format!("e{i}"), start + Duration::minutes(i * 4)))
            .await;
    }

    let processor = processor(session_rule(Some("30min")), events, alerts.clone(), state);

    // first invocation sees a 20-minute session: below the cap, it alerts
    // and the open session is tracked
    let first = processor.process(start + Duration::minutes(21)).await.unwrap();
    assert_eq!(first.len(), 1);

    // by the second invocation the tracked session spans the full forty
    // minutes; the row is dropped whole, not truncated to the cap
    let second = processor.process(start + Duration::minutes(41)).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(alerts.all_alerts().await.len(), 1);

    // and the closed runaway session stays gone on later invocations
    let third = processor.process(start + Duration::minutes(42)).await.unwrap();
    assert!(third.is_empty());
}

#[tokio::test]
async fn gap_splits_sessions_and_upsert_converges_per_fingerprint() {
    let events = Arc::new(MemoryEventStore::new());
    let alerts = Arc::new(MemoryAlertStore::new());
    let state = Arc::new(MemoryStateStore::new());

    // two bursts separated by a ten-minute silence
    let start = Utc::now() - Duration::minutes(25);
    events.put(failure_event("a1", start)).await;
    events.put(failure_event("a2", start + Duration::minutes(2))).await;
    events.put(failure_event("b1", start + Duration::minutes(12))).await;
    events.put(failure_event("b2", start + Duration::minutes(13))).await;

    let processor = processor(session_rule(None), events, alerts.clone(), state);
    let produced = processor.process(start + Duration::minutes(14)).await.unwrap();

    // both sessions alert, but they share a fingerprint so the second row
    // merged into the first alert
    assert_eq!(produced.len(), 2);
    let fingerprint = &produced[0].fingerprint;
    assert_eq!(alerts.active_alerts(fingerprint).await.len(), 1);

    let merged = &alerts.active_alerts(fingerprint).await[0];
    assert_eq!(merged.event_ids.len(), 4);
}

#[tokio::test]
async fn closed_sessions_are_not_realerted() {
    let events = Arc::new(MemoryEventStore::new());
    let alerts = Arc::new(MemoryAlertStore::new());
    let state = Arc::new(MemoryStateStore::new());

    // a burst that ended more than one timeout ago: the session is closed
    let start = Utc::now() - Duration::minutes(9);
    events.put(failure_event("e1", start)).await;
    events.put(failure_event("e2", start + Duration::minutes(1))).await;

    let processor = processor(session_rule(None), events, alerts.clone(), state);

    let now = start + Duration::minutes(8);
    let first = processor.process(now).await.unwrap();
    assert_eq!(first.len(), 1);

    // the closed session was marked processed; the next invocation still
    // sees the events in its lookback but must not alert again
    let second = processor.process(now + Duration::minutes(1)).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(alerts.all_alerts().await.len(), 1);
}
