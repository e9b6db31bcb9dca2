//! Candidate-event queries.
//!
//! Fetches the event set a rule execution will aggregate over: the lookback
//! range comes from `time_range`, shielded events are always excluded, and
//! every returned event is enriched with its fingerprint before it reaches
//! the engine.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use klaxon_types::{Event, EventStatus};

use crate::error::KlaxonResult;
use crate::fingerprint;
use crate::rules::CorrelationRule;
use crate::stores::{EventFilter, EventStore};
use crate::time_range::calculate_query_range;

/// Query layer over the external event store.
#[derive(Clone)]
pub struct EventQueryStrategy {
    store: Arc<dyn EventStore>,
}

impl EventQueryStrategy {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Fetch and enrich the candidate events for one rule execution.
    ///
    /// An empty result means "nothing to do" and is not an error. Unless
    /// `include_processed` is set, only `Received` events qualify; `Shield`ed
    /// events never qualify.
    pub async fn get_events_for_rule(
        &self,
        rule: &CorrelationRule,
        now: DateTime<Utc>,
        buffer_multiplier: f64,
        include_processed: bool,
    ) -> KlaxonResult<Vec<Event>> {
        let range = calculate_query_range(rule, now, buffer_multiplier);

        // empty status list means "any status"; shield is excluded either way
        let statuses =
            if include_processed { Vec::new() } else { vec![EventStatus::Received] };
        let filter = EventFilter {
            start: range.start,
            end: range.end,
            statuses,
            exclude_statuses: vec![EventStatus::Shield],
            source_active: Some(true),
        };

        let mut events = self.store.query(&filter).await?;
        if events.is_empty() {
            info!(rule = %rule.name, "no candidate events in range");
            return Ok(events);
        }

        for event in &mut events {
            event.fingerprint = fingerprint::fingerprint_for(event);
        }

        info!(
            rule = %rule.name,
            count = events.len(),
            start = %range.start,
            end = %range.end,
            "fetched candidate events"
        );

        Ok(events)
    }

    /// Count events received in `[since, until)`; a cheap probe the
    /// scheduler can use to skip idle rules entirely.
    pub async fn count_new_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> KlaxonResult<u64> {
        let filter = EventFilter {
            start: since,
            end: until,
            statuses: vec![EventStatus::Received],
            exclude_statuses: vec![EventStatus::Shield],
            source_active: None,
        };
        let count = self.store.count(&filter).await?;
        debug!(since = %since, until = %until, count, "counted new events");
        Ok(count)
    }
}
