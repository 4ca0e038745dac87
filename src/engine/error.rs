//! Error taxonomy for the simulation engine.
//!
//! The core never panics across its API boundary for expected outcomes; every
//! public method returns a `Result<T, EngineError>` carrying a kind plus a
//! message. Invariant violations drive a session to `ERROR` rather than
//! aborting the process.

use std::fmt;

use crate::engine::events::RejectReason;

/// Error kinds recognized by the engine, matching the taxonomy in the design
/// document one-to-one.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Session or order id unknown to the caller.
    NotFound(String),
    /// Operation forbidden in the current session status.
    InvalidState(String),
    /// Malformed config, negative qty, symbol not enabled, etc.
    InvalidInput(String),
    /// Order rejected by the matching engine or risk checks; the order never
    /// enters the book.
    RejectedOrder(RejectReason),
    /// Data-source stall or producer backpressure. Logged, not surfaced as a
    /// session failure.
    Transient(String),
    /// Internal invariant violation or hard data-source failure. The owning
    /// session transitions to `ERROR`.
    Fatal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::RejectedOrder(reason) => write!(f, "order rejected: {reason:?}"),
            EngineError::Transient(msg) => write!(f, "transient failure: {msg}"),
            EngineError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Convenience alias used throughout the crate's public API.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// True for kinds that should drive the owning session into `ERROR`.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_flagged() {
        assert!(EngineError::Fatal("boom".into()).is_fatal());
        assert!(!EngineError::NotFound("session".into()).is_fatal());
    }

    #[test]
    fn display_is_human_readable() {
        let err = EngineError::invalid_state("cannot start a RUNNING session");
        assert_eq!(
            err.to_string(),
            "invalid state: cannot start a RUNNING session"
        );
    }
}
