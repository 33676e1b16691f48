//! High-level tether client.
//!
//! [`TetherClient`] wires the shared state, the standard request pipeline and
//! the subscription protocol together from one [`ClientConfig`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::http::header::{HeaderValue, IntoHeaderName};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::TetherError;
use crate::core::constants::DEFAULT_PROBE_INTERVAL;
use crate::http::interceptors::{AuthConfig, ResilienceConfig};
use crate::http::{HttpTransport, Pipeline, PipelineConfig};
use crate::state::{BaseUrlCache, HttpDiscovery, ProbeConfig, ReloginReason, SharedState};
use crate::ws::{ProtocolConfig, SubscriptionProtocol};

#[cfg(feature = "websocket")]
use crate::ws::WsConnection;

/// Environment variable holding a fixed base URL.
pub const ENV_BASE_URL: &str = "TETHER_BASE_URL";
/// Environment variable holding the base-URL discovery endpoint.
pub const ENV_DISCOVERY_URL: &str = "TETHER_DISCOVERY_URL";
/// Environment variable holding the subscription socket URL.
pub const ENV_SOCKET_URL: &str = "TETHER_SOCKET_URL";
/// Environment variable overriding the API prefix.
pub const ENV_API_PREFIX: &str = "TETHER_API_PREFIX";
/// Environment variable overriding the request timeout, in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "TETHER_TIMEOUT_MS";
/// Environment variable overriding the socket reply timeout, in milliseconds.
pub const ENV_REPLY_TIMEOUT_MS: &str = "TETHER_REPLY_TIMEOUT_MS";
/// Environment variable overriding the replay limit.
pub const ENV_MAX_RETRIES: &str = "TETHER_MAX_RETRIES";
/// Environment variable overriding the availability probe interval, in milliseconds.
pub const ENV_PROBE_INTERVAL_MS: &str = "TETHER_PROBE_INTERVAL_MS";

// ============================================================================
// Configuration
// ============================================================================

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Request pipeline settings.
    pub pipeline: PipelineConfig,

    /// Credential handling.
    pub auth: AuthConfig,

    /// Replay and offline handling.
    pub resilience: ResilienceConfig,

    /// Subscription protocol settings.
    pub protocol: ProtocolConfig,

    /// Fixed base URL. Takes precedence over discovery.
    pub base_url: Option<String>,

    /// Endpoint answering `{"apiUrl": ...}`, used when no base URL is fixed.
    pub discovery_url: Option<String>,

    /// Subscription socket URL.
    pub socket_url: Option<String>,

    /// Poll interval of the availability probe that clears the offline flag.
    pub probe_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            auth: AuthConfig::default(),
            resilience: ResilienceConfig::default(),
            protocol: ProtocolConfig::default(),
            base_url: None,
            discovery_url: None,
            socket_url: None,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by the `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, TetherError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `TETHER_*`
    /// keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TetherError> {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_BASE_URL) {
            config.base_url = Some(url);
        }
        if let Some(url) = lookup(ENV_DISCOVERY_URL) {
            config.discovery_url = Some(url);
        }
        if let Some(url) = lookup(ENV_SOCKET_URL) {
            config.socket_url = Some(url);
        }
        if let Some(prefix) = lookup(ENV_API_PREFIX) {
            config.pipeline.api_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            config.pipeline.timeout = Duration::from_millis(parse_number(ENV_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_REPLY_TIMEOUT_MS) {
            config.protocol.reply_timeout =
                Duration::from_millis(parse_number(ENV_REPLY_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            config.resilience.max_retries = parse_number(ENV_MAX_RETRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PROBE_INTERVAL_MS) {
            config.probe_interval =
                Duration::from_millis(parse_number(ENV_PROBE_INTERVAL_MS, &raw)?);
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, TetherError> {
    raw.trim()
        .parse()
        .map_err(|_| TetherError::Config(format!("{key}: not a number: {raw:?}")))
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct TetherClientBuilder {
    config: ClientConfig,
}

impl TetherClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Set a fixed base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Set the base-URL discovery endpoint.
    pub fn discovery_url(mut self, url: impl Into<String>) -> Self {
        self.config.discovery_url = Some(url.into());
        self
    }

    /// Set the subscription socket URL.
    pub fn socket_url(mut self, url: impl Into<String>) -> Self {
        self.config.socket_url = Some(url.into());
        self
    }

    /// Set the API prefix.
    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.pipeline.api_prefix = prefix.into();
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.pipeline.timeout = timeout;
        self
    }

    /// Add a header sent with every request.
    pub fn default_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.config.pipeline.default_headers.insert(name, value);
        self
    }

    /// Set the replay limit.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.resilience.max_retries = max_retries;
        self
    }

    /// Never hold or replay requests to `path`.
    pub fn exempt_path(mut self, path: impl Into<String>) -> Self {
        self.config.resilience.exempt_paths.push(path.into());
        self
    }

    /// Replace the credential handling settings.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.config.auth = auth;
        self
    }

    /// Set how long socket packets wait for their reply.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.protocol.reply_timeout = timeout;
        self
    }

    /// Set how often the availability probe polls while offline.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for TetherClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Client
// ============================================================================

/// A tether client.
///
/// # Example
///
/// ```ignore
/// use tether::client::{TetherClient, TetherClientBuilder};
///
/// let config = TetherClientBuilder::new()
///     .base_url("https://cloud.example.com")
///     .socket_url("wss://cloud.example.com/ws")
///     .probe_interval(Duration::from_secs(5))
///     .build();
///
/// let client = TetherClient::with_reqwest(config);
/// client.state().session.set_token(token).await;
///
/// let devices = client.pipeline().get("devices").await?;
/// let socket = client.connect_socket().await?;
/// ```
pub struct TetherClient {
    config: ClientConfig,
    state: SharedState,
    pipeline: Pipeline,
    protocol: SubscriptionProtocol,
    outbound: Mutex<Option<mpsc::Receiver<String>>>,
    probe: JoinHandle<()>,
}

impl TetherClient {
    /// Assemble a client over `transport`.
    ///
    /// Spawns background tasks, so it must run inside a tokio runtime.
    pub fn new(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let mut base_url = BaseUrlCache::new(config.base_url.clone());
        if let Some(url) = &config.discovery_url {
            base_url = base_url.with_discovery(Arc::new(HttpDiscovery::new(
                Arc::clone(&transport),
                url.clone(),
            )));
        }
        let state = SharedState {
            base_url,
            ..SharedState::default()
        };

        let probe_config = ProbeConfig::for_prefix(config.pipeline.api_prefix.clone())
            .with_interval(config.probe_interval);
        debug!(
            path = %probe_config.path,
            interval = ?probe_config.interval,
            "starting availability probe"
        );
        let probe = state.connectivity.spawn_probe(
            Arc::clone(&transport),
            state.base_url.clone(),
            probe_config,
        );

        let pipeline = Pipeline::standard(
            config.pipeline.clone(),
            transport,
            &state,
            config.auth.clone(),
            config.resilience.clone(),
        );
        let (protocol, outbound) = SubscriptionProtocol::new(config.protocol.clone());

        info!(
            base_url = ?config.base_url,
            discovery = config.discovery_url.is_some(),
            "tether client ready"
        );

        Self {
            config,
            state,
            pipeline,
            protocol,
            outbound: Mutex::new(Some(outbound)),
            probe,
        }
    }

    /// Assemble a client over a default reqwest transport.
    #[cfg(feature = "http-client")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http-client")))]
    pub fn with_reqwest(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(crate::http::ReqwestTransport::default()))
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// The standard request pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The subscription protocol.
    pub fn protocol(&self) -> &SubscriptionProtocol {
        &self.protocol
    }

    /// Re-login notifications.
    pub fn subscribe_relogin(&self) -> broadcast::Receiver<ReloginReason> {
        self.state.session.subscribe_relogin()
    }

    /// Take the protocol's outbound frame queue to drive it with a custom
    /// socket. Returns `None` while a socket holds it.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<String>> {
        self.lock_outbound().take()
    }

    /// Hand the outbound queue back after a custom socket closed.
    pub fn restore_outbound(&self, outbound: mpsc::Receiver<String>) {
        *self.lock_outbound() = Some(outbound);
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Receiver<String>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the subscription socket and replay packets still in flight.
    #[cfg(feature = "websocket")]
    #[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
    pub async fn connect_socket(&self) -> Result<WsConnection, TetherError> {
        let url = self
            .config
            .socket_url
            .clone()
            .ok_or_else(|| TetherError::Config("no socket URL configured".to_string()))?;
        if self.lock_outbound().is_none() {
            return Err(TetherError::Config("socket already connected".to_string()));
        }

        let socket = WsConnection::dial(&url).await?;
        let outbound = self
            .take_outbound()
            .ok_or_else(|| TetherError::Config("socket already connected".to_string()))?;
        let connection = WsConnection::attach(socket, self.protocol.clone(), outbound);

        let resent = self.protocol.resend_outstanding().await?;
        if resent > 0 {
            info!(resent, "replayed outstanding packets");
        }
        Ok(connection)
    }

    /// Close `connection` and keep the outbound queue for the next
    /// [`connect_socket`](Self::connect_socket).
    #[cfg(feature = "websocket")]
    #[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
    pub async fn disconnect_socket(&self, connection: WsConnection) -> Result<(), TetherError> {
        let outbound = connection.close().await?;
        self.restore_outbound(outbound);
        Ok(())
    }
}

impl Drop for TetherClient {
    fn drop(&mut self) {
        self.probe.abort();
    }
}

impl fmt::Debug for TetherClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherClient")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("protocol", &self.protocol)
            .field("probe_running", &!self.probe.is_finished())
            .finish()
    }
}
