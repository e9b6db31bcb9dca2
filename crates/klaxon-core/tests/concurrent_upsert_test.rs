// The at-most-one-active-alert invariant must hold when rule evaluations
// targeting the same fingerprint run concurrently.

use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use klaxon_core::alert_builder::AlertBuilder;
use klaxon_core::engine::AggregationResultRow;
use klaxon_core::memory::{MemoryAlertStore, MemoryEventStore};
use klaxon_core::stores::DefaultTemplateFormatter;
use klaxon_core::{AggregationConfig, CorrelationRule, StrategyConfig, WindowConfig};
use klaxon_types::{Event, EventStatus};

fn rule() -> CorrelationRule {
    CorrelationRule {
        rule_id: "rule-concurrent".to_string(),
        name: "contended fingerprint".to_string(),
        window: WindowConfig::Fixed { window_size: Duration::minutes(10) },
        strategy: StrategyConfig::Frequency { count_threshold: None },
        grouping_keys: vec!["fingerprint".to_string()],
        filter: None,
        min_event_count: None,
    }
}

fn event(id: &str, level: i64) -> Event {
    Event {
        event_id: id.to_string(),
        received_at: Utc::now(),
        level,
        resource_id: "R9".to_string(),
        resource_type: "host".to_string(),
        resource_name: "db-1".to_string(),
        item: "io_wait".to_string(),
        source_id: "src-1".to_string(),
        source_name: "zabbix".to_string(),
        source_active: true,
        status: EventStatus::Received,
        value: Some(70.0),
        title: "io wait".to_string(),
        description: "io wait climbing".to_string(),
        labels: HashMap::new(),
        fingerprint: "fp-contended".to_string(),
    }
}

fn row(event_id: &str, level: i64, offset_mins: i64) -> AggregationResultRow {
    let now = Utc::now();
    AggregationResultRow {
        window_id: format!("FW-{offset_mins}-fp-contended"),
        fingerprint: "fp-contended".to_string(),
        group_values: BTreeMap::new(),
        event_count: 1,
        event_ids: vec![event_id.to_string()],
        first_event_time: now - Duration::minutes(offset_mins + 5),
        last_event_time: now - Duration::minutes(offset_mins),
        max_level: Some(level),
        aggregates: BTreeMap::new(),
        window_start: now - Duration::minutes(offset_mins + 10),
        window_end: now - Duration::minutes(offset_mins),
        session: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_builds_never_create_two_active_alerts() {
    let events = Arc::new(MemoryEventStore::new());
    let alerts = Arc::new(MemoryAlertStore::new());
    for i in 0..8 {
        events.put(event(&format!("e{i}"), 3)).await;
    }

    let builder = Arc::new(AlertBuilder::new(
        events,
        alerts.clone(),
        Arc::new(DefaultTemplateFormatter),
        Arc::new(AggregationConfig::default()),
    ));

    let mut handles = Vec::new();
    for i in 0..8i64 {
        let builder = builder.clone();
        handles.push(tokio::spawn(async move {
            builder
                .build_from_aggregation_result(
                    &[row(&format!("e{i}"), 3 + (i % 3), i)],
                    &rule(),
                )
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut updated = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        created += outcome.created.len();
        updated += outcome.updated.len();
    }

    // every build landed somewhere, exactly one of them created
    assert_eq!(created, 1);
    assert_eq!(updated, 7);

    let active = alerts.active_alerts("fp-contended").await;
    assert_eq!(active.len(), 1, "at most one active alert per fingerprint");
    // all eight events converged onto the surviving alert
    assert_eq!(active[0].event_ids.len(), 8);
}

#[tokio::test]
async fn merge_only_relaxes_severity() {
    // existing level 3, new level 5: merged level must be 5 (less severe)
    let events = Arc::new(MemoryEventStore::new());
    let alerts = Arc::new(MemoryAlertStore::new());
    events.put(event("e1", 3)).await;
    events.put(event("e2", 5)).await;

    let builder = AlertBuilder::new(
        events,
        alerts.clone(),
        Arc::new(DefaultTemplateFormatter),
        Arc::new(AggregationConfig::default()),
    );

    let first = builder
        .build_from_aggregation_result(&[row("e1", 3, 2)], &rule())
        .await
        .unwrap();
    assert_eq!(first.created[0].level, 3);

    let second = builder
        .build_from_aggregation_result(&[row("e2", 5, 0)], &rule())
        .await
        .unwrap();
    let merged = &second.updated[0];
    assert_eq!(merged.level, 5);
    assert!(merged.last_event_time >= first.created[0].last_event_time);
}
