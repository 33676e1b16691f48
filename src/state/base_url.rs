//! Base URL cache with optional discovery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::http::{HttpTransport, Method, PipelineError, RequestDescriptor};

/// Field read from the discovery response by [`HttpDiscovery`].
pub const DEFAULT_DISCOVERY_FIELD: &str = "apiUrl";

/// Looks up the base URL when none is cached.
#[async_trait]
pub trait BaseUrlDiscovery: Send + Sync {
    /// Return the base URL, without the API prefix.
    async fn discover(&self) -> Result<String, PipelineError>;
}

/// Discovers the base URL by fetching a JSON document and reading one field.
pub struct HttpDiscovery {
    transport: Arc<dyn HttpTransport>,
    url: String,
    field: String,
}

impl HttpDiscovery {
    /// Fetch `url` and read [`DEFAULT_DISCOVERY_FIELD`].
    pub fn new(transport: Arc<dyn HttpTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            field: DEFAULT_DISCOVERY_FIELD.to_string(),
        }
    }

    /// Read a different field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }
}

#[async_trait]
impl BaseUrlDiscovery for HttpDiscovery {
    async fn discover(&self) -> Result<String, PipelineError> {
        let request = RequestDescriptor::new(Method::GET, self.url.clone()).without_auth();
        let response = self.transport.send(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(PipelineError::Status {
                response: Box::new(response),
            });
        }

        response
            .body
            .as_json()
            .and_then(|body| body.get(&self.field))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::BaseUrl(format!("discovery response has no `{}`", self.field))
            })
    }
}

impl fmt::Debug for HttpDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDiscovery")
            .field("url", &self.url)
            .field("field", &self.field)
            .finish()
    }
}

/// Cached base URL. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct BaseUrlCache {
    url: Arc<watch::Sender<Option<String>>>,
    discovery: Option<Arc<dyn BaseUrlDiscovery>>,
    lookup: Arc<Mutex<()>>,
}

impl Default for BaseUrlCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BaseUrlCache {
    /// Create a cache, optionally pre-populated.
    pub fn new(initial: Option<String>) -> Self {
        let (url, _) = watch::channel(initial);
        Self {
            url: Arc::new(url),
            discovery: None,
            lookup: Arc::new(Mutex::new(())),
        }
    }

    /// Use `discovery` when the cache is empty.
    pub fn with_discovery(mut self, discovery: Arc<dyn BaseUrlDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Current cached value.
    pub fn get(&self) -> Option<String> {
        self.url.borrow().clone()
    }

    /// Replace the cached value.
    pub fn set(&self, url: impl Into<String>) {
        let url = url.into();
        info!(%url, "base url set");
        self.url.send_replace(Some(url));
    }

    /// Drop the cached value so the next request rediscovers it.
    pub fn clear(&self) {
        self.url.send_replace(None);
    }

    /// Watch the value.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.url.subscribe()
    }

    /// Cached value, or the result of discovery.
    ///
    /// Concurrent callers share a single discovery round trip. Without a
    /// discovery source the call suspends until [`set`](Self::set) is called.
    pub async fn resolve(&self) -> Result<String, PipelineError> {
        if let Some(url) = self.get() {
            return Ok(url);
        }
        let Some(discovery) = &self.discovery else {
            debug!("waiting for base url");
            let mut rx = self.url.subscribe();
            let url = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| PipelineError::BaseUrl("base url source dropped".into()))?;
            return (*url)
                .clone()
                .ok_or_else(|| PipelineError::BaseUrl("base url cleared".into()));
        };

        let _guard = self.lookup.lock().await;
        if let Some(url) = self.get() {
            return Ok(url);
        }

        debug!("discovering base url");
        match discovery.discover().await {
            Ok(url) => {
                self.set(url.clone());
                Ok(url)
            }
            Err(e) => {
                warn!(error = %e, "base url discovery failed");
                Err(PipelineError::BaseUrl(e.to_string()))
            }
        }
    }
}

impl fmt::Debug for BaseUrlCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseUrlCache")
            .field("url", &self.get())
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}
