//! Runtime configuration for the aggregation engine.
//!
//! All tunables live in one explicitly-constructed value that is built once
//! at process start and passed by reference to the components that need it.
//! Values deserialize from TOML with per-field defaults, so a partial file
//! (or none at all) yields a working configuration.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

fn default_buffer_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_window_state_ttl_secs() -> u64 {
    3_600
}
fn default_processed_window_ttl_secs() -> u64 {
    86_400
}
fn default_session_max_duration_secs() -> u64 {
    7_200
}
fn default_session_max_events() -> u64 {
    1_000
}
fn default_min_event_count() -> u64 {
    1
}
fn default_count_threshold() -> u64 {
    10
}
fn default_max_alerts_per_execution() -> usize {
    1_000
}
fn default_alert_level() -> i64 {
    5
}
fn default_state_key_prefix() -> String {
    "klaxon:agg:".to_string()
}
fn default_max_concurrent_rules() -> usize {
    10
}

/// Engine-wide configuration knobs with observed production defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Fixed-window lookback multiplier; must stay >= 2 so the previous
    /// complete window and the in-progress one are both visible.
    #[serde(default = "default_buffer_multiplier")]
    pub fixed_window_buffer_multiplier: f64,

    /// Master switch for cross-invocation window tracking. When off, every
    /// state-store operation is a no-op returning its safe default.
    #[serde(default = "default_true")]
    pub enable_window_tracking: bool,

    /// TTL for live window/session state blobs.
    #[serde(default = "default_window_state_ttl_secs")]
    pub window_state_ttl_secs: u64,

    /// TTL for processed-window markers; prevents immediate reprocessing.
    #[serde(default = "default_processed_window_ttl_secs")]
    pub processed_window_ttl_secs: u64,

    /// Hard cap on a session's lifetime when the rule does not set one.
    #[serde(default = "default_session_max_duration_secs")]
    pub session_max_duration_secs: u64,

    /// Hard cap on events accumulated in one session.
    #[serde(default = "default_session_max_events")]
    pub session_max_events: u64,

    /// HAVING threshold applied when a rule leaves min_event_count unset.
    #[serde(default = "default_min_event_count")]
    pub default_min_event_count: u64,

    /// Frequency-strategy count threshold when the rule leaves it unset.
    #[serde(default = "default_count_threshold")]
    pub default_count_threshold: u64,

    /// Upper bound on alerts produced by one rule invocation.
    #[serde(default = "default_max_alerts_per_execution")]
    pub max_alerts_per_execution: usize,

    /// Worst-case alert level used when neither the aggregation row nor the
    /// contributing events carry a usable one.
    #[serde(default = "default_alert_level")]
    pub default_alert_level: i64,

    /// Prefix for every state-store key written by this engine.
    #[serde(default = "default_state_key_prefix")]
    pub state_key_prefix: String,

    /// Concurrency bound for the multi-rule driver.
    #[serde(default = "default_max_concurrent_rules")]
    pub max_concurrent_rules: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        // serde defaults and Default must agree; route through an empty doc.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl AggregationConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<AggregationConfig>(&raw) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded aggregation config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Invalid aggregation config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Aggregation config not readable, using defaults");
                Self::default()
            }
        }
    }

    /// Sanity-check cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.fixed_window_buffer_multiplier < 2.0 {
            return Err(format!(
                "fixed_window_buffer_multiplier must be >= 2.0, got {}",
                self.fixed_window_buffer_multiplier
            ));
        }
        if self.max_concurrent_rules == 0 {
            return Err("max_concurrent_rules must be > 0".to_string());
        }
        if self.session_max_events == 0 {
            return Err("session_max_events must be > 0".to_string());
        }
        Ok(())
    }
}
