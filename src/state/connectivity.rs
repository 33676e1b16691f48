//! Shared online/offline flag.
//!
//! The resilience stage flips the flag to offline when the server stops
//! answering and parks replays until it flips back. Something else has to flip
//! it back: either the availability probe spawned with
//! [`ConnectivityMonitor::spawn_probe`] or the application itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::base_url::BaseUrlCache;
use crate::core::constants::{
    DEFAULT_API_PREFIX, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_PATH, UNAVAILABLE_STATUSES,
};
use crate::http::{HttpTransport, Method, RequestDescriptor, join_paths};

/// Availability probe settings.
///
/// The polled URL is `<base url>/<api prefix>/<path>`, with the base URL
/// resolved from the shared cache on every poll.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// API segment joined after the base URL.
    pub api_prefix: String,

    /// Exempt path polled while offline.
    pub path: String,

    /// Delay between polls.
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::for_prefix(DEFAULT_API_PREFIX)
    }
}

impl ProbeConfig {
    /// Probe `status/ping` under `api_prefix`.
    pub fn for_prefix(api_prefix: impl Into<String>) -> Self {
        Self {
            api_prefix: api_prefix.into(),
            path: DEFAULT_PROBE_PATH.to_string(),
            interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Override the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// URL polled for `base_url`.
    pub fn url(&self, base_url: &str) -> String {
        join_paths([base_url, self.api_prefix.as_str(), self.path.as_str()])
    }
}

/// Observable connectivity flag. Cheap to clone; clones share the flag.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    offline: Arc<watch::Sender<bool>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Start online.
    pub fn new() -> Self {
        let (offline, _) = watch::channel(false);
        Self {
            offline: Arc::new(offline),
        }
    }

    /// Whether the server is currently considered unreachable.
    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    /// Set the flag. Observers are only woken on an actual change.
    pub fn set_offline(&self, offline: bool) {
        let changed = self.offline.send_if_modified(|current| {
            if *current == offline {
                false
            } else {
                *current = offline;
                true
            }
        });
        if changed {
            info!(offline, "connectivity changed");
        }
    }

    /// Shorthand for `set_offline(false)`.
    pub fn set_online(&self) {
        self.set_offline(false);
    }

    /// Watch the flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.offline.subscribe()
    }

    /// Resolve once the flag reads online. Returns immediately if it already does.
    pub async fn wait_online(&self) {
        let mut rx = self.offline.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|offline| !*offline).await;
    }

    /// Mark offline and wait for the next transition back to online.
    pub async fn go_offline_and_wait_online(&self) {
        self.set_offline(true);
        self.wait_online().await;
    }

    /// Poll the availability endpoint while offline and flip back online on
    /// the first answer whose status is not in the unavailable set.
    pub fn spawn_probe(
        &self,
        transport: Arc<dyn HttpTransport>,
        base_url: BaseUrlCache,
        config: ProbeConfig,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut rx = monitor.subscribe();
            loop {
                if rx.wait_for(|offline| *offline).await.is_err() {
                    return;
                }
                tokio::time::sleep(config.interval).await;

                let base = match base_url.resolve().await {
                    Ok(base) => base,
                    Err(e) => {
                        debug!(error = %e, "probe: base url unavailable");
                        continue;
                    }
                };
                let request = RequestDescriptor::new(Method::GET, config.url(&base))
                    .without_auth()
                    .with_timeout(config.interval);
                match transport.send(request).await {
                    Ok(response) if !UNAVAILABLE_STATUSES.contains(&response.status) => {
                        monitor.set_online();
                    }
                    Ok(response) => {
                        debug!(status = response.status, "probe: server still unavailable");
                    }
                    Err(e) => debug!(error = %e, "probe: no response"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{PipelineError, ResponseBody, ResponseEnvelope};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_online_returns_immediately_when_online() {
        let monitor = ConnectivityMonitor::new();
        monitor.wait_online().await;
        assert!(!monitor.is_offline());
    }

    #[tokio::test]
    async fn test_go_offline_waits_for_transition() {
        let monitor = ConnectivityMonitor::new();
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.go_offline_and_wait_online().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.is_offline());
        assert!(!waiter.is_finished());

        monitor.set_online();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_only_see_changes() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_online();
        assert!(!rx.has_changed().unwrap());

        monitor.set_offline(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }

    struct Flaky {
        calls: AtomicU32,
        healthy_after: u32,
        urls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpTransport for Flaky {
        async fn send(
            &self,
            request: RequestDescriptor,
        ) -> Result<ResponseEnvelope, PipelineError> {
            self.urls.lock().unwrap().push(request.full_url());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let status = if n >= self.healthy_after { 200 } else { 503 };
            Ok(ResponseEnvelope::new(status, ResponseBody::Empty, request))
        }
    }

    #[tokio::test]
    async fn test_probe_restores_online() {
        let monitor = ConnectivityMonitor::new();
        let transport = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            healthy_after: 2,
            urls: Default::default(),
        });
        let config = ProbeConfig::default().with_interval(Duration::from_millis(5));
        let base_url = BaseUrlCache::new(Some("https://host".into()));

        let probe = monitor.spawn_probe(transport.clone(), base_url, config);
        monitor.set_offline(true);

        tokio::time::timeout(Duration::from_secs(1), monitor.wait_online())
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.urls.lock().unwrap()[0], "https://host/api/v1/status/ping");
        probe.abort();
    }

    #[tokio::test]
    async fn test_probe_waits_for_base_url() {
        let monitor = ConnectivityMonitor::new();
        let transport = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            healthy_after: 1,
            urls: Default::default(),
        });
        let base_url = BaseUrlCache::new(None);
        let config = ProbeConfig::for_prefix("v2").with_interval(Duration::from_millis(5));

        let probe = monitor.spawn_probe(transport.clone(), base_url.clone(), config);
        monitor.set_offline(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        base_url.set("https://late.example.com");
        tokio::time::timeout(Duration::from_secs(1), monitor.wait_online())
            .await
            .unwrap();
        assert_eq!(
            transport.urls.lock().unwrap()[0],
            "https://late.example.com/v2/status/ping"
        );
        probe.abort();
    }
}
