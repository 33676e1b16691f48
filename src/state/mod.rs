//! Process-wide shared state.
//!
//! Everything here is cheap to clone and shared between the interceptors, the
//! subscription protocol and the application.

mod base_url;
mod connectivity;
mod session;

pub use base_url::{BaseUrlCache, BaseUrlDiscovery, DEFAULT_DISCOVERY_FIELD, HttpDiscovery};
pub use connectivity::{ConnectivityMonitor, ProbeConfig};
pub use session::{ReloginReason, SessionStore};

/// Shared state bundle handed to the standard interceptor stack.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    /// Online/offline flag.
    pub connectivity: ConnectivityMonitor,
    /// Cached base URL.
    pub base_url: BaseUrlCache,
    /// Current credential.
    pub session: SessionStore,
}

impl SharedState {
    /// Fresh state with a known base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: BaseUrlCache::new(Some(base_url.into())),
            ..Self::default()
        }
    }
}
