//! Subscription protocol errors.

use thiserror::Error;

use super::goal::Goal;
use super::subscription::SubscriptionStatus;
use crate::core::DeferredError;

/// Errors in the subscription lifecycle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscription was cancelled and cannot be reused.
    #[error("subscription cancelled")]
    Cancelled,

    /// The requested transition is not allowed from the current status.
    #[error("invalid subscription transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status.
        from: SubscriptionStatus,
        /// Requested status.
        to: SubscriptionStatus,
    },
}

/// Errors raised by the packet protocol.
///
/// `Clone` so it can be a [`Deferred`](crate::core::Deferred) rejection reason
/// and be fanned out to several error listeners.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// A frame could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(String),

    /// The socket could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The socket closed with the packet still outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived in time.
    #[error("no reply for packet {id}")]
    Timeout {
        /// Packet id.
        id: String,
    },

    /// The server answered with a non-zero result code.
    #[error("{goal:?} rejected with code {code}: {}", .message.as_deref().unwrap_or("no message"))]
    Rejected {
        /// Goal of the rejected packet.
        goal: Goal,
        /// Result code.
        code: i64,
        /// Optional server message.
        message: Option<String>,
    },

    /// A reply's goal does not match its request.
    #[error("goal mismatch: expected {expected:?}, got {actual:?}")]
    GoalMismatch {
        /// Request goal.
        expected: Goal,
        /// Reply goal.
        actual: Goal,
    },

    /// A reply's id does not match its request.
    #[error("id mismatch: expected {expected}, got {actual}")]
    IdMismatch {
        /// Request id.
        expected: String,
        /// Reply id.
        actual: String,
    },

    /// An unknown goal tag arrived.
    #[error("unknown goal {0}")]
    UnknownGoal(u8),

    /// A data push carried an unknown operation.
    #[error("unknown operation {0}")]
    UnknownOperation(u64),

    /// Subscription lifecycle error.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Deferred completion failed.
    #[error(transparent)]
    Deferred(#[from] DeferredError),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e.to_string())
    }
}
