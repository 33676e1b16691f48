//! Session credential store.
//!
//! Holds the current token and tells the application when the user has to
//! log in again: either because the server rejected the token or because its
//! advertised expiry passed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why the application is asked to re-authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloginReason {
    /// The server answered with the unauthorized result code.
    Unauthorized,
    /// The credential's expiry time passed.
    Expired,
}

/// The armed expiry timer. `generation` changes whenever the timer is
/// replaced or cancelled, so a timer that already woke up can tell it is stale.
#[derive(Default)]
struct ExpiryTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl ExpiryTimer {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct SessionInner {
    token: RwLock<Option<String>>,
    expiry: Mutex<ExpiryTimer>,
    relogin: broadcast::Sender<ReloginReason>,
    invalidations: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        match self.expiry.get_mut() {
            Ok(timer) => timer.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }
}

/// Shared session state. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Empty session.
    pub fn new() -> Self {
        let (relogin, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SessionInner {
                token: RwLock::new(None),
                expiry: Mutex::new(ExpiryTimer::default()),
                relogin,
                invalidations: AtomicU64::new(0),
            }),
        }
    }

    /// Current token.
    pub async fn token(&self) -> Option<String> {
        self.inner.token.read().await.clone()
    }

    /// Store a token after login.
    ///
    /// Cancels the previous credential's expiry timer.
    pub async fn set_token(&self, token: impl Into<String>) {
        let mut slot = self.inner.token.write().await;
        self.cancel_expiry();
        *slot = Some(token.into());
        debug!("session token stored");
    }

    /// Whether a token is stored.
    pub async fn is_authenticated(&self) -> bool {
        self.inner.token.read().await.is_some()
    }

    /// Drop the token and cancel any pending expiry timer.
    pub async fn invalidate(&self) {
        let mut token = self.inner.token.write().await;
        let had_token = token.take().is_some();
        self.cancel_expiry();
        drop(token);
        self.inner.invalidations.fetch_add(1, Ordering::SeqCst);
        info!(had_token, "session invalidated");
    }

    /// Number of times [`invalidate`](Self::invalidate) ran.
    pub fn invalidation_count(&self) -> u64 {
        self.inner.invalidations.load(Ordering::SeqCst)
    }

    /// Tell listeners the user must log in again.
    pub fn notify_relogin(&self, reason: ReloginReason) {
        // No receivers is fine: nobody is listening yet.
        let delivered = self.inner.relogin.send(reason).unwrap_or(0);
        warn!(?reason, delivered, "re-login required");
    }

    /// Listen for re-login notifications.
    pub fn subscribe_relogin(&self) -> broadcast::Receiver<ReloginReason> {
        self.inner.relogin.subscribe()
    }

    /// Arm the expiry timer for a credential expiring at `expires_at_ms`
    /// (Unix epoch milliseconds). Replaces any previous timer.
    ///
    /// When it fires the session is invalidated and listeners receive
    /// [`ReloginReason::Expired`].
    pub fn schedule_expiry(&self, expires_at_ms: u64) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let delay = Duration::from_millis(expires_at_ms.saturating_sub(now_ms));
        debug!(?delay, "credential expiry scheduled");

        let mut slot = self.lock_expiry();
        slot.cancel();
        let generation = slot.generation;
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let store = SessionStore { inner };
                store.expire(generation).await;
            }
        }));
    }

    async fn expire(&self, generation: u64) {
        let mut token = self.inner.token.write().await;
        {
            let mut slot = self.lock_expiry();
            if slot.generation != generation {
                debug!("stale expiry timer ignored");
                return;
            }
            // Forget our own handle rather than abort ourselves.
            slot.handle.take();
        }
        *token = None;
        drop(token);

        self.inner.invalidations.fetch_add(1, Ordering::SeqCst);
        info!("session expired");
        self.notify_relogin(ReloginReason::Expired);
    }

    fn cancel_expiry(&self) {
        self.lock_expiry().cancel();
    }

    fn lock_expiry(&self) -> std::sync::MutexGuard<'_, ExpiryTimer> {
        self.inner
            .expiry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("invalidations", &self.invalidation_count())
            .finish_non_exhaustive()
    }
}
