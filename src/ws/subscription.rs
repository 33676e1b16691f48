//! Subscription state machine.
//!
//! ```text
//!   INACTIVE ──subscribe sent──► PENDING ──reply ok──► ACTIVE
//!       │                           │                    │
//!       └───────────── unsubscribe() or server error ────┴──► CANCELLED
//! ```
//!
//! CANCELLED is terminal. Data pushes are only dispatched while ACTIVE.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::{ProtocolError, SubscriptionError};
use super::events::EventChannel;
use super::goal::{Operation, OperationMask};
use super::packet::{PacketResponse, random_id};

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// Created, nothing sent yet.
    Inactive,
    /// Subscribe packet sent, waiting for the reply.
    Pending,
    /// Acknowledged by the server.
    Active,
    /// Terminal.
    Cancelled,
}

impl SubscriptionStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == SubscriptionStatus::Cancelled
    }
}

/// One change pushed by the server for an active subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    /// Concrete operation.
    pub operation: Operation,
    /// Server subscription id the push was addressed to, if present.
    pub subscription_id: Option<String>,
    /// Changed entity. The `data` field when present, the whole body otherwise.
    pub payload: Value,
}

impl DataEvent {
    /// Extract the event carried by a data push.
    pub fn from_response(response: &PacketResponse) -> Result<Self, ProtocolError> {
        let tag = response
            .field("operation")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::UnknownOperation(0))?;
        let operation = Operation::from_tag(tag)?;
        let subscription_id = response
            .field("subscriptionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = response
            .field("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(response.fields.clone()));

        Ok(Self {
            operation,
            subscription_id,
            payload,
        })
    }
}

#[derive(Debug)]
struct SubscriptionState {
    status: SubscriptionStatus,
    subscription_id: Option<String>,
}

struct SubscriptionInner {
    id: String,
    kind: String,
    operations: OperationMask,
    params: Value,
    state: Mutex<SubscriptionState>,
    on_create: EventChannel<DataEvent>,
    on_edit: EventChannel<DataEvent>,
    on_delete: EventChannel<DataEvent>,
    on_error: EventChannel<ProtocolError>,
    on_status: EventChannel<SubscriptionStatus>,
    on_unsubscribe: EventChannel<Subscription>,
    /// Owning protocol's unsubscribe queue. Not touched by `destroy`.
    close_hook: Mutex<Option<mpsc::UnboundedSender<Subscription>>>,
}

/// A logical feed of create/update/delete events. Cheap to clone; clones share
/// state and channels.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// New INACTIVE subscription with a fresh client id.
    pub fn new(kind: impl Into<String>, operations: OperationMask, params: Value) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id: random_id(),
                kind: kind.into(),
                operations,
                params,
                state: Mutex::new(SubscriptionState {
                    status: SubscriptionStatus::Inactive,
                    subscription_id: None,
                }),
                on_create: EventChannel::new(),
                on_edit: EventChannel::new(),
                on_delete: EventChannel::new(),
                on_error: EventChannel::new(),
                on_status: EventChannel::new(),
                on_unsubscribe: EventChannel::new(),
                close_hook: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Client-assigned id. Also the id of the Subscribe packet.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Entity type the feed covers.
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Operations of interest.
    pub fn operations(&self) -> OperationMask {
        self.inner.operations
    }

    /// Filter parameters.
    pub fn params(&self) -> Value {
        self.inner.params.clone()
    }

    /// Current status.
    pub fn status(&self) -> SubscriptionStatus {
        self.state().status
    }

    /// Server-assigned id, once ACTIVE.
    pub fn subscription_id(&self) -> Option<String> {
        self.state().subscription_id.clone()
    }

    /// Creation events.
    pub fn on_create(&self) -> &EventChannel<DataEvent> {
        &self.inner.on_create
    }

    /// Update events.
    pub fn on_edit(&self) -> &EventChannel<DataEvent> {
        &self.inner.on_edit
    }

    /// Deletion events.
    pub fn on_delete(&self) -> &EventChannel<DataEvent> {
        &self.inner.on_delete
    }

    /// Server-reported errors.
    pub fn on_error(&self) -> &EventChannel<ProtocolError> {
        &self.inner.on_error
    }

    /// Status changes. Fires only when the status actually changes.
    pub fn on_status(&self) -> &EventChannel<SubscriptionStatus> {
        &self.inner.on_status
    }

    /// Fires once when [`unsubscribe`](Self::unsubscribe) takes effect.
    pub fn on_unsubscribe(&self) -> &EventChannel<Subscription> {
        &self.inner.on_unsubscribe
    }

    fn lock_close_hook(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Subscription>>> {
        self.inner
            .close_hook
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue this subscription on `hook` when [`unsubscribe`](Self::unsubscribe)
    /// takes effect.
    pub(crate) fn set_close_hook(&self, hook: mpsc::UnboundedSender<Subscription>) {
        *self.lock_close_hook() = Some(hook);
    }

    /// Detach the close hook, if any.
    pub(crate) fn take_close_hook(&self) -> Option<mpsc::UnboundedSender<Subscription>> {
        self.lock_close_hook().take()
    }

    fn announce(&self, from: SubscriptionStatus, to: SubscriptionStatus) {
        if from != to {
            debug!(id = %self.inner.id, ?from, ?to, "subscription status");
            self.inner.on_status.emit(&to);
        }
    }

    /// INACTIVE → PENDING, when the Subscribe packet goes out.
    pub fn mark_pending(&self) -> Result<(), SubscriptionError> {
        let from = {
            let mut state = self.state();
            match state.status {
                SubscriptionStatus::Inactive => {
                    state.status = SubscriptionStatus::Pending;
                    SubscriptionStatus::Inactive
                }
                SubscriptionStatus::Cancelled => return Err(SubscriptionError::Cancelled),
                from => {
                    return Err(SubscriptionError::InvalidTransition {
                        from,
                        to: SubscriptionStatus::Pending,
                    });
                }
            }
        };
        self.announce(from, SubscriptionStatus::Pending);
        Ok(())
    }

    /// PENDING → ACTIVE on a successful Subscribe reply.
    pub fn activate(&self, subscription_id: impl Into<String>) -> Result<(), SubscriptionError> {
        let from = {
            let mut state = self.state();
            match state.status {
                SubscriptionStatus::Pending => {
                    state.status = SubscriptionStatus::Active;
                    state.subscription_id = Some(subscription_id.into());
                    SubscriptionStatus::Pending
                }
                SubscriptionStatus::Cancelled => return Err(SubscriptionError::Cancelled),
                from => {
                    return Err(SubscriptionError::InvalidTransition {
                        from,
                        to: SubscriptionStatus::Active,
                    });
                }
            }
        };
        self.announce(from, SubscriptionStatus::Active);
        Ok(())
    }

    /// Move to CANCELLED. Returns whether the status changed.
    pub fn cancel(&self) -> bool {
        let from = {
            let mut state = self.state();
            std::mem::replace(&mut state.status, SubscriptionStatus::Cancelled)
        };
        self.announce(from, SubscriptionStatus::Cancelled);
        !from.is_terminal()
    }

    /// Report an unrecoverable server error and cancel.
    pub fn fail(&self, error: ProtocolError) {
        self.inner.on_error.emit(&error);
        self.cancel();
    }

    /// Cancel on the caller's behalf and fire the unsubscribe channel.
    ///
    /// Only the first call on a non-terminal subscription has any effect.
    pub fn unsubscribe(&self) -> bool {
        if !self.cancel() {
            return false;
        }
        self.inner.on_unsubscribe.emit(self);
        if let Some(hook) = self.take_close_hook() {
            // Closed only when the protocol is gone; nothing left to notify.
            let _ = hook.send(self.clone());
        }
        true
    }

    /// Route a data push to the channel of its operation.
    ///
    /// Dropped unless ACTIVE and the operation is in the subscribed mask.
    pub fn dispatch(&self, event: &DataEvent) -> bool {
        if self.status() != SubscriptionStatus::Active {
            debug!(id = %self.inner.id, "data for inactive subscription dropped");
            return false;
        }
        if !self.inner.operations.contains(event.operation) {
            debug!(id = %self.inner.id, operation = ?event.operation, "operation not subscribed");
            return false;
        }
        let channel = match event.operation {
            Operation::Create => &self.inner.on_create,
            Operation::Update => &self.inner.on_edit,
            Operation::Delete => &self.inner.on_delete,
        };
        channel.emit(event);
        true
    }

    /// Detach every listener without notifying. The status is left as is, and
    /// a later [`unsubscribe`](Self::unsubscribe) still reaches the protocol.
    pub fn destroy(&self) {
        self.inner.on_create.reset();
        self.inner.on_edit.reset();
        self.inner.on_delete.reset();
        self.inner.on_error.reset();
        self.inner.on_status.reset();
        self.inner.on_unsubscribe.reset();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("operations", &self.inner.operations)
            .field("status", &state.status)
            .field("subscription_id", &state.subscription_id)
            .finish()
    }
}
