//! Error types shared across the crate.

use std::fmt;

use thiserror::Error;

use crate::http::PipelineError;
use crate::ws::{ProtocolError, SubscriptionError};

/// Terminal phase of a [`Deferred`](super::Deferred) at the time of a failed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredPhase {
    /// No value yet.
    Pending,
    /// Completed with a value.
    Resolved,
    /// Completed with a rejection.
    Rejected,
}

impl fmt::Display for DeferredPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredPhase::Pending => f.write_str("pending"),
            DeferredPhase::Resolved => f.write_str("resolved"),
            DeferredPhase::Rejected => f.write_str("rejected"),
        }
    }
}

/// Errors raised by a single-assignment future.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeferredError {
    /// A second completion was attempted. This is a correlation bug.
    #[error("deferred already completed ({state})")]
    AlreadyCompleted {
        /// Phase the deferred was already in.
        state: DeferredPhase,
    },
}

/// Top-level tether errors.
#[derive(Debug, Error)]
pub enum TetherError {
    /// HTTP pipeline error.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Subscription protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Subscription lifecycle error.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Deferred completion error.
    #[error("deferred error: {0}")]
    Deferred(#[from] DeferredError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
