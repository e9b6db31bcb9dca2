//! Multi-rule evaluation driver.
//!
//! Rules are independent: the driver evaluates them concurrently up to a
//! configured bound, and one rule's failure (including a configuration
//! error) never aborts the others. An optional idle probe skips rules with
//! no new events since their last recorded execution.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::processor::WindowProcessor;

/// Outcome counters for one driver pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub alerts: usize,
}

/// Whether a rule can be skipped because nothing new arrived since its last
/// recorded execution. Unknown last-execution time means "do not skip".
async fn should_skip(processor: &WindowProcessor, now: DateTime<Utc>) -> bool {
    let rule_id = &processor.rule().rule_id;
    let Some(last_exec) = processor.state().get_last_execution(rule_id).await else {
        return false;
    };
    match processor.query().count_new_events(last_exec, now).await {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => {
            warn!(rule_id = %rule_id, error = %e, "idle probe failed, evaluating anyway");
            false
        }
    }
}

/// Evaluate every processor once, at most `max_concurrent` at a time.
///
/// Per-rule isolation: failures are logged and counted, never propagated.
pub async fn run_rules(
    processors: &[WindowProcessor],
    now: DateTime<Utc>,
    max_concurrent: usize,
    skip_idle: bool,
) -> RunStats {
    if processors.is_empty() {
        info!("no active rules to evaluate");
        return RunStats::default();
    }

    let started = std::time::Instant::now();

    let results: Vec<(String, Result<usize, ()>, bool)> = stream::iter(processors)
        .map(|processor| async move {
            let rule_id = processor.rule().rule_id.clone();
            if skip_idle && should_skip(processor, now).await {
                info!(rule_id = %rule_id, "no new events since last execution, skipping");
                return (rule_id, Ok(0), true);
            }
            match processor.process(now).await {
                Ok(alerts) => (rule_id, Ok(alerts.len()), false),
                Err(e) => {
                    error!(
                        rule_id = %rule_id,
                        category = e.category(),
                        error = %e,
                        "rule evaluation raised"
                    );
                    (rule_id, Err(()), false)
                }
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut stats = RunStats { total: processors.len(), ..RunStats::default() };
    for (_, result, skipped) in results {
        match (result, skipped) {
            (_, true) => stats.skipped += 1,
            (Ok(count), false) => {
                stats.succeeded += 1;
                stats.alerts += count;
            }
            (Err(()), false) => stats.failed += 1,
        }
    }

    info!(
        total = stats.total,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped,
        alerts = stats.alerts,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rule evaluation pass finished"
    );

    stats
}
