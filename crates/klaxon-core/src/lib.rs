//! Core functionality for the Klaxon alert-aggregation engine.
//!
//! This crate groups incoming monitoring events into alerts using three
//! windowing strategies (fixed, sliding, session) and three rule strategies
//! (threshold, composite, frequency). Storage, caching and templating are
//! collaborator traits so the engine stays a library-level component.

/// Alert construction and concurrency-safe upsert
pub mod alert_builder;
/// Runtime configuration with TOML loading
pub mod config;
/// Grouped in-memory aggregation per window kind
pub mod engine;
/// Structured error types for all engine operations
pub mod error;
/// Stable event fingerprinting
pub mod fingerprint;
/// In-memory collaborator implementations for tests and embedding
pub mod memory;
/// Rule resolution into executable aggregation parameters
pub mod params;
/// Per-rule window processing pipeline
pub mod processor;
/// Event candidate queries against the event store
pub mod query;
/// Redis-backed window state store
#[cfg(feature = "redis-state")]
pub mod redis_state;
/// Typed correlation-rule model and raw-document validation
pub mod rules;
/// Bounded-concurrency multi-rule driver
pub mod runner;
/// Session window lifecycle tracking across executions
pub mod session_state;
/// Best-effort window tracking over the state store
pub mod state_store;
/// Collaborator traits for external stores
pub mod stores;
/// Lookback range computation per window kind
pub mod time_range;

pub use alert_builder::{AlertBuilder, BuildOutcome};
pub use config::AggregationConfig;
pub use engine::{AggregationEngine, AggregationResultRow, SessionRowMeta, SessionStatus};
pub use error::{KlaxonError, KlaxonResult};
pub use params::{AggregateCondition, AggregateExpr, AggregationParams, WindowParams};
pub use processor::WindowProcessor;
pub use query::EventQueryStrategy;
pub use rules::{
    AggregateFunc, CompareOp, CorrelationRule, FilterOp, FilterPredicate, FilterValue, LogicOp,
    RuleDocument, StrategyConfig, ThresholdSpec, WindowConfig,
};
pub use runner::{run_rules, RunStats};
pub use session_state::{SessionStateManager, SessionWindow};
pub use state_store::WindowStateStore;
pub use stores::{
    AlertStore, DefaultTemplateFormatter, EventFilter, EventStore, StateStore, StoreError,
    TemplateFormatter,
};
pub use time_range::{calculate_query_range, parse_duration_str, TimeRange};
