//! Structured error handling for the Klaxon engine
//!
//! This module provides typed errors for all engine operations so callers can
//! distinguish non-retryable rule problems from transient store failures and
//! apply the per-rule isolation policy.

use thiserror::Error;

use crate::stores::StoreError;

/// Error type for Klaxon engine operations
#[derive(Error, Debug, Clone)]
pub enum KlaxonError {
    /// The correlation rule is structurally invalid for its declared window
    /// or strategy type. Not retryable; must reach the rule owner.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        rule_id: Option<String>,
        field: Option<String>,
    },

    /// The resolved aggregation failed to execute against the event batch
    /// (bad expression, type mismatch). The invocation yields zero alerts.
    #[error("Aggregation execution error: {message}")]
    AggregationExecution {
        message: String,
        rule_id: Option<String>,
        expression: Option<String>,
    },

    /// An I/O failure talking to the event, alert or state store. Aborts only
    /// the current rule invocation; state-tracking callers degrade instead.
    #[error("Store error: {message}")]
    Store {
        message: String,
        operation: Option<String>,
    },

    /// Generic internal invariant violation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KlaxonError {
    /// Configuration error scoped to a rule.
    pub fn configuration(message: impl Into<String>) -> Self {
        KlaxonError::Configuration { message: message.into(), rule_id: None, field: None }
    }

    /// Configuration error naming the offending rule and field.
    pub fn configuration_field(
        message: impl Into<String>,
        rule_id: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        KlaxonError::Configuration {
            message: message.into(),
            rule_id: Some(rule_id.into()),
            field: Some(field.into()),
        }
    }

    /// Aggregation failure naming the offending expression.
    pub fn aggregation(message: impl Into<String>, expression: impl Into<String>) -> Self {
        KlaxonError::AggregationExecution {
            message: message.into(),
            rule_id: None,
            expression: Some(expression.into()),
        }
    }

    /// Store failure for a named operation.
    pub fn store(message: impl Into<String>, operation: impl Into<String>) -> Self {
        KlaxonError::Store { message: message.into(), operation: Some(operation.into()) }
    }

    /// Internal invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        KlaxonError::Internal { message: message.into() }
    }

    /// Attach the owning rule id, preserving everything else.
    pub fn with_rule_id(self, id: &str) -> Self {
        match self {
            KlaxonError::Configuration { message, field, .. } => {
                KlaxonError::Configuration { message, rule_id: Some(id.to_string()), field }
            }
            KlaxonError::AggregationExecution { message, expression, .. } => {
                KlaxonError::AggregationExecution {
                    message,
                    rule_id: Some(id.to_string()),
                    expression,
                }
            }
            other => other,
        }
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            KlaxonError::Configuration { .. } => "configuration",
            KlaxonError::AggregationExecution { .. } => "aggregation_execution",
            KlaxonError::Store { .. } => "store",
            KlaxonError::Internal { .. } => "internal",
        }
    }

    /// True for errors that must surface to the rule owner instead of being
    /// absorbed by the per-rule isolation policy.
    pub fn is_configuration(&self) -> bool {
        matches!(self, KlaxonError::Configuration { .. })
    }
}

impl From<StoreError> for KlaxonError {
    fn from(err: StoreError) -> Self {
        KlaxonError::Store { message: err.to_string(), operation: None }
    }
}

/// Convenient result alias for engine operations
pub type KlaxonResult<T> = Result<T, KlaxonError>;
