//! Typed publish/subscribe channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`EventChannel::listen`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of one event type to any number of listeners.
///
/// Listeners run synchronously on the emitting task, in registration order.
/// They are called outside the channel's lock, so a listener may add or
/// remove listeners on the same channel.
pub struct EventChannel<T> {
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> EventChannel<T> {
    /// Empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<T>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a listener.
    pub fn listen(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Remove every listener without notifying anyone.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every listener registered at the time of the call.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    /// Receive events on an unbounded queue.
    ///
    /// The listener removes nothing on its own; call [`remove`](Self::remove)
    /// with the returned id, or [`reset`](Self::reset), to stop delivery.
    pub fn stream(&self) -> (ListenerId, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.listen(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
