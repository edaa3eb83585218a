//! Engine Errors
//!
//! Faults inside the engine are contained: a throwing binding loses only
//! its own update cycle, and structural faults (tracking overflow, cyclic
//! updates) abort the offending traversal without poisoning the rest of
//! the graph. Every fault is routed through the runtime's error hook, or
//! logged via `tracing` when no hook is installed.

use thiserror::Error;

/// Failure produced by user code inside a binding body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BindingError {
    message: String,
}

impl BindingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Faults the engine reports through the error hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReactiveError {
    /// Tracking frames nested past the depth limit, which means reactive
    /// reads are recursing through each other.
    #[error("tracking context depth exceeded the limit of {limit}")]
    TrackingOverflow { limit: usize },

    /// Bindings kept scheduling each other past the flush pass limit. The
    /// pending queue is dropped to regain control.
    #[error("update cycle did not settle after {passes} flush passes")]
    CyclicUpdate { passes: usize },

    /// A binding body failed; the failure is contained to that cycle.
    #[error("binding execution failed: {0}")]
    BindingExecution(#[from] BindingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text() {
        let err = ReactiveError::TrackingOverflow { limit: 64 };
        assert_eq!(err.to_string(), "tracking context depth exceeded the limit of 64");

        let err = ReactiveError::from(BindingError::new("boom"));
        assert_eq!(err.to_string(), "binding execution failed: boom");
        assert!(matches!(err, ReactiveError::BindingExecution(inner) if inner.message() == "boom"));
    }
}
