//! Lookback range computation.
//!
//! Pure helpers that decide how far back the event query must reach for a
//! given window configuration so that every window instance which could
//! still produce a row is visible in the batch.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::{KlaxonError, KlaxonResult};
use crate::rules::{CorrelationRule, WindowConfig};

/// Half-open query range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Degraded one-hour default for callers holding unvalidated window
    /// configuration. Logs a warning; never panics.
    pub fn fallback(now: DateTime<Utc>) -> Self {
        warn!("unknown window configuration, falling back to 1h lookback");
        Self { start: now - Duration::hours(1), end: now }
    }
}

/// Parse a duration string in the rule-config format: `"30s"`, `"5min"`,
/// `"2h"`, `"1d"`; a bare integer is treated as minutes.
pub fn parse_duration_str(raw: &str) -> KlaxonResult<Duration> {
    let raw = raw.trim();
    let (digits, unit): (&str, &str) = if let Some(v) = raw.strip_suffix("min") {
        (v, "min")
    } else if let Some(v) = raw.strip_suffix('h') {
        (v, "h")
    } else if let Some(v) = raw.strip_suffix('d') {
        (v, "d")
    } else if let Some(v) = raw.strip_suffix('s') {
        (v, "s")
    } else {
        (raw, "min")
    };

    let count: i64 = digits.trim().parse().map_err(|_| {
        KlaxonError::configuration(format!("invalid duration string: {raw:?}"))
    })?;
    if count <= 0 {
        return Err(KlaxonError::configuration(format!(
            "duration must be positive: {raw:?}"
        )));
    }

    Ok(match unit {
        "s" => Duration::seconds(count),
        "h" => Duration::hours(count),
        "d" => Duration::days(count),
        _ => Duration::minutes(count),
    })
}

/// Compute the query lookback window for one rule execution.
///
/// - Fixed: `buffer_multiplier ×` the window size, so the previous complete
///   window and the in-progress one are both covered.
/// - Sliding: window size plus one slide interval, covering every window
///   instance that can overlap `now`.
/// - Session: the configured maximum window size, or twice the session
///   timeout when none is set.
///
/// Deterministic given `(rule, now)`; no side effects beyond debug logging.
pub fn calculate_query_range(
    rule: &CorrelationRule,
    now: DateTime<Utc>,
    buffer_multiplier: f64,
) -> TimeRange {
    let range = match &rule.window {
        WindowConfig::Fixed { window_size } => {
            let lookback_secs = window_size.num_seconds() as f64 * buffer_multiplier;
            TimeRange { start: now - Duration::seconds(lookback_secs.ceil() as i64), end: now }
        }
        WindowConfig::Sliding { window_size, slide_interval } => {
            TimeRange { start: now - *window_size - *slide_interval, end: now }
        }
        WindowConfig::Session { session_timeout, max_window_size } => {
            let lookback = max_window_size.unwrap_or(*session_timeout * 2);
            TimeRange { start: now - lookback, end: now }
        }
    };

    debug!(
        rule = %rule.name,
        window = rule.window.kind(),
        start = %range.start,
        end = %range.end,
        "computed query range"
    );

    range
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::StrategyConfig;

    fn rule_with(window: WindowConfig) -> CorrelationRule {
        CorrelationRule {
            rule_id: "r1".to_string(),
            name: "test rule".to_string(),
            window,
            strategy: StrategyConfig::Frequency { count_threshold: None },
            grouping_keys: vec!["fingerprint".to_string()],
            filter: None,
            min_event_count: None,
        }
    }

    #[test]
    fn parses_all_duration_suffixes() {
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_duration_str("5min").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration_str("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration_str("1d").unwrap(), Duration::days(1));
        // bare integers are minutes
        assert_eq!(parse_duration_str("15").unwrap(), Duration::minutes(15));
    }

    #[test]
    fn rejects_garbage_and_non_positive_durations() {
        assert!(parse_duration_str("soon").is_err());
        assert!(parse_duration_str("-5min").is_err());
        assert!(parse_duration_str("0s").is_err());
    }

    #[test]
    fn fixed_window_uses_the_buffer_multiplier() {
        let now = Utc::now();
        let rule = rule_with(WindowConfig::Fixed { window_size: Duration::minutes(10) });
        let range = calculate_query_range(&rule, now, 2.0);
        assert_eq!(range.start, now - Duration::minutes(20));
        assert_eq!(range.end, now);
    }

    #[test]
    fn sliding_window_covers_size_plus_slide() {
        let now = Utc::now();
        let rule = rule_with(WindowConfig::Sliding {
            window_size: Duration::minutes(10),
            slide_interval: Duration::minutes(1),
        });
        let range = calculate_query_range(&rule, now, 2.0);
        assert_eq!(range.start, now - Duration::minutes(11));
    }

    #[test]
    fn session_window_prefers_max_window_size() {
        let now = Utc::now();
        let capped = rule_with(WindowConfig::Session {
            session_timeout: Duration::minutes(5),
            max_window_size: Some(Duration::minutes(30)),
        });
        assert_eq!(calculate_query_range(&capped, now, 2.0).start, now - Duration::minutes(30));

        let uncapped = rule_with(WindowConfig::Session {
            session_timeout: Duration::minutes(5),
            max_window_size: None,
        });
        assert_eq!(calculate_query_range(&uncapped, now, 2.0).start, now - Duration::minutes(10));
    }

    #[test]
    fn fallback_range_is_one_hour() {
        let now = Utc::now();
        let range = TimeRange::fallback(now);
        assert_eq!(range.start, now - Duration::hours(1));
        assert_eq!(range.end, now);
    }
}
