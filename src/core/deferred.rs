//! Single-assignment future values.
//!
//! A [`Deferred`] starts pending and is completed at most once, either with a
//! value or with a rejection. Any number of tasks may await it; each receives a
//! clone of the outcome. It bridges wire traffic (a socket reply, a replayed
//! HTTP request) back to the call site that is waiting for it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

use super::error::{DeferredError, DeferredPhase};

/// Internal state of a deferred value.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredState<T, E> {
    /// Not completed yet.
    Pending,
    /// Completed with a value.
    Resolved(T),
    /// Completed with a rejection.
    Rejected(E),
}

impl<T, E> DeferredState<T, E> {
    /// Phase without the payload.
    pub fn phase(&self) -> DeferredPhase {
        match self {
            DeferredState::Pending => DeferredPhase::Pending,
            DeferredState::Resolved(_) => DeferredPhase::Resolved,
            DeferredState::Rejected(_) => DeferredPhase::Rejected,
        }
    }
}

/// A future value that can be completed exactly once.
///
/// Cloning yields another handle to the same slot.
pub struct Deferred<T, E> {
    slot: Arc<watch::Sender<DeferredState<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("phase", &self.phase())
            .finish()
    }
}

impl<T, E> Deferred<T, E> {
    /// Create a pending deferred.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(DeferredState::Pending);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> DeferredPhase {
        self.slot.borrow().phase()
    }

    /// `true` until the first completion.
    pub fn is_pending(&self) -> bool {
        self.phase() == DeferredPhase::Pending
    }

    /// `true` once completed with a value.
    pub fn is_resolved(&self) -> bool {
        self.phase() == DeferredPhase::Resolved
    }

    /// `true` once completed with a rejection.
    pub fn is_rejected(&self) -> bool {
        self.phase() == DeferredPhase::Rejected
    }

    /// Complete with a value.
    ///
    /// Fails with [`DeferredError::AlreadyCompleted`] if the deferred has already
    /// been resolved or rejected; the stored outcome is left untouched.
    pub fn resolve(&self, value: T) -> Result<(), DeferredError> {
        self.complete(DeferredState::Resolved(value))
    }

    /// Complete with a rejection.
    pub fn reject(&self, reason: E) -> Result<(), DeferredError> {
        self.complete(DeferredState::Rejected(reason))
    }

    fn complete(&self, next: DeferredState<T, E>) -> Result<(), DeferredError> {
        let mut existing = None;
        self.slot.send_if_modified(|state| {
            if matches!(state, DeferredState::Pending) {
                *state = next;
                true
            } else {
                existing = Some(state.phase());
                false
            }
        });

        match existing {
            None => Ok(()),
            Some(state) => {
                error!(%state, "deferred completed twice");
                Err(DeferredError::AlreadyCompleted { state })
            }
        }
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// The outcome, if already completed.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &*self.slot.borrow() {
            DeferredState::Pending => None,
            DeferredState::Resolved(value) => Some(Ok(value.clone())),
            DeferredState::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// Wait for completion.
    ///
    /// Waits for as long as the value stays pending; callers that need a bound
    /// wrap this in a timeout.
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            // `self` holds the sender, so the channel cannot close while we wait.
            let _ = rx.changed().await;
        }
    }
}
