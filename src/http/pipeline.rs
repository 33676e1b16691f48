//! The request pipeline (data access layer).
//!
//! One [`Pipeline`] owns one transport and one interceptor chain. Every call
//! funnels into [`Pipeline::request`]; the verb methods only fill in the
//! method and body first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ::http::header::{HeaderMap, HeaderValue, IntoHeaderName};
use serde_json::Value;
use tracing::debug;

use super::descriptor::{Method, RequestDescriptor};
use super::error::PipelineError;
use super::interceptor::{Interceptor, InterceptorChain, PipelineHandle};
use super::interceptors::{
    AuthConfig, AuthInterceptor, BaseUrlInterceptor, NormalizeInterceptor, ResilienceConfig,
    ResilienceInterceptor,
};
use super::response::ResponseEnvelope;
use super::transport::HttpTransport;
use crate::core::constants::{DEFAULT_API_PREFIX, DEFAULT_REQUEST_TIMEOUT};
use crate::state::SharedState;

/// Accept 2xx statuses.
pub fn default_validate_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// API segment joined after the base URL.
    pub api_prefix: String,

    /// Timeout applied to requests without their own.
    pub timeout: Duration,

    /// Headers added to every request unless already present.
    pub default_headers: HeaderMap,

    /// Statuses outside this predicate are turned into [`PipelineError::Status`].
    pub validate_status: fn(u16) -> bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            default_headers: HeaderMap::new(),
            validate_status: default_validate_status,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API prefix.
    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.api_prefix = prefix.into();
        self
    }

    /// Set the default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Add a default header.
    pub fn default_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.config.default_headers.insert(name, value);
        self
    }

    /// Replace the status validator.
    pub fn validate_status(mut self, validate: fn(u16) -> bool) -> Self {
        self.config.validate_status = validate;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

pub(crate) struct PipelineInner {
    config: PipelineConfig,
    transport: Arc<dyn HttpTransport>,
    chain: InterceptorChain,
}

/// Request pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Build a pipeline from an ordered interceptor list (outermost first).
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn HttpTransport>,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        let pipeline = Self {
            inner: Arc::new(PipelineInner {
                config,
                transport,
                chain: InterceptorChain::new(interceptors),
            }),
        };
        pipeline.inner.chain.attach(&pipeline.handle());
        pipeline
    }

    /// Build a pipeline with the standard stack
    /// `[BaseUrl, Auth, Normalize, Resilience]`.
    ///
    /// The resilience stage is innermost so it sees raw transport outcomes;
    /// normalization runs on the way out before auth inspects rejections.
    pub fn standard(
        config: PipelineConfig,
        transport: Arc<dyn HttpTransport>,
        state: &SharedState,
        auth: AuthConfig,
        resilience: ResilienceConfig,
    ) -> Self {
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(BaseUrlInterceptor::new(
                state.base_url.clone(),
                config.api_prefix.clone(),
            )),
            Arc::new(AuthInterceptor::new(state.session.clone(), auth)),
            Arc::new(NormalizeInterceptor::new()),
            Arc::new(ResilienceInterceptor::new(
                state.connectivity.clone(),
                resilience,
            )),
        ];
        Self::new(config, transport, interceptors)
    }

    pub(super) fn from_inner(inner: Arc<PipelineInner>) -> Self {
        Self { inner }
    }

    /// Weak handle for interceptors.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle::new(Arc::downgrade(&self.inner))
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The interceptor chain.
    pub fn chain(&self) -> &InterceptorChain {
        &self.inner.chain
    }

    /// Run a request through the chain and the transport.
    pub async fn request(
        &self,
        request: RequestDescriptor,
    ) -> Result<ResponseEnvelope, PipelineError> {
        let outcome = match self.inner.chain.run_request(request).await {
            Ok(request) => self.dispatch(request).await,
            Err(error) => Err(error),
        };
        self.inner.chain.run_response(outcome).await
    }

    async fn dispatch(
        &self,
        mut request: RequestDescriptor,
    ) -> Result<ResponseEnvelope, PipelineError> {
        let config = &self.inner.config;
        for name in config.default_headers.keys() {
            if !request.headers.contains_key(name) {
                for value in config.default_headers.get_all(name) {
                    request.headers.append(name.clone(), value.clone());
                }
            }
        }
        if request.timeout.is_none() {
            request.timeout = Some(config.timeout);
        }

        debug!(
            method = %request.method,
            url = %request.full_url(),
            retry_count = request.retry_count,
            "dispatching request"
        );

        let response = self.inner.transport.send(request).await?;
        if (config.validate_status)(response.status) {
            Ok(response)
        } else {
            Err(PipelineError::Status {
                response: Box::new(response),
            })
        }
    }

    /// GET `url`.
    pub async fn get(&self, url: impl Into<String>) -> Result<ResponseEnvelope, PipelineError> {
        self.request(RequestDescriptor::new(Method::GET, url)).await
    }

    /// POST `body` to `url`.
    pub async fn post(
        &self,
        url: impl Into<String>,
        body: Value,
    ) -> Result<ResponseEnvelope, PipelineError> {
        self.request(RequestDescriptor::new(Method::POST, url).with_json(body))
            .await
    }

    /// PUT `body` to `url`.
    pub async fn put(
        &self,
        url: impl Into<String>,
        body: Value,
    ) -> Result<ResponseEnvelope, PipelineError> {
        self.request(RequestDescriptor::new(Method::PUT, url).with_json(body))
            .await
    }

    /// PATCH `url` with `body`.
    pub async fn patch(
        &self,
        url: impl Into<String>,
        body: Value,
    ) -> Result<ResponseEnvelope, PipelineError> {
        self.request(RequestDescriptor::new(Method::PATCH, url).with_json(body))
            .await
    }

    /// DELETE `url`.
    pub async fn delete(
        &self,
        url: impl Into<String>,
    ) -> Result<ResponseEnvelope, PipelineError> {
        self.request(RequestDescriptor::new(Method::DELETE, url))
            .await
    }

    /// HEAD `url`.
    pub async fn head(&self, url: impl Into<String>) -> Result<ResponseEnvelope, PipelineError> {
        self.request(RequestDescriptor::new(Method::HEAD, url)).await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.inner.config)
            .field("chain", &self.inner.chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseBody;
    use crate::state::{ConnectivityMonitor, SessionStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted replies and records every request it sees.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<(u16, ResponseBody)>>,
        fallback: (u16, ResponseBody),
        seen: Mutex<Vec<RequestDescriptor>>,
    }

    impl ScriptedTransport {
        fn always(status: u16, body: ResponseBody) -> Arc<Self> {
            Self::scripted(Vec::new(), (status, body))
        }

        fn scripted(replies: Vec<(u16, ResponseBody)>, fallback: (u16, ResponseBody)) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                fallback,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn seen(&self) -> Vec<RequestDescriptor> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            request: RequestDescriptor,
        ) -> Result<ResponseEnvelope, PipelineError> {
            self.seen.lock().unwrap().push(request.clone());
            let (status, body) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            Ok(ResponseEnvelope::new(status, body, request))
        }
    }

    /// Flip the monitor back online whenever it goes offline.
    fn auto_recover(monitor: &ConnectivityMonitor) -> tokio::task::JoinHandle<()> {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut rx = monitor.subscribe();
            while rx.wait_for(|offline| *offline).await.is_ok() {
                monitor.set_online();
            }
        })
    }

    fn ok_body() -> ResponseBody {
        ResponseBody::Json(json!({ "resultCode": 0 }))
    }

    fn accept_all(_status: u16) -> bool {
        true
    }

    #[tokio::test]
    async fn test_verbs_funnel_into_request() {
        let transport = ScriptedTransport::always(200, ok_body());
        let pipeline = Pipeline::new(PipelineConfig::default(), transport.clone(), Vec::new());

        pipeline.get("a").await.unwrap();
        pipeline.post("b", json!({ "x": 1 })).await.unwrap();
        pipeline.put("c", json!({})).await.unwrap();
        pipeline.patch("d", json!({})).await.unwrap();
        pipeline.delete("e").await.unwrap();
        pipeline.head("f").await.unwrap();

        let methods: Vec<Method> = transport.seen().iter().map(|r| r.method.clone()).collect();
        assert_eq!(
            methods,
            vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::HEAD
            ]
        );
        assert!(transport.seen()[1].body.is_some());
        assert!(transport.seen()[0].body.is_none());
    }

    #[tokio::test]
    async fn test_defaults_applied_before_dispatch() {
        let transport = ScriptedTransport::always(200, ok_body());
        let config = PipelineConfigBuilder::new()
            .timeout(Duration::from_secs(7))
            .default_header("x-client", HeaderValue::from_static("tether"))
            .build();
        let pipeline = Pipeline::new(config, transport.clone(), Vec::new());

        pipeline
            .request(RequestDescriptor::new(Method::GET, "a").with_header("x-client", HeaderValue::from_static("custom")))
            .await
            .unwrap();
        pipeline.get("b").await.unwrap();

        let seen = transport.seen();
        assert_eq!(seen[0].header("x-client"), Some("custom"));
        assert_eq!(seen[1].header("x-client"), Some("tether"));
        assert_eq!(seen[1].timeout, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_status_validation() {
        let transport = ScriptedTransport::always(404, ok_body());
        let pipeline = Pipeline::new(PipelineConfig::default(), transport, Vec::new());

        let result = pipeline.get("missing").await;
        assert!(matches!(result, Err(PipelineError::Status { .. })));
        assert_eq!(result.unwrap_err().status(), Some(404));
    }

    #[tokio::test]
    async fn test_standard_stack_order() {
        let transport = ScriptedTransport::always(200, ok_body());
        let pipeline = Pipeline::standard(
            PipelineConfig::default(),
            transport.clone(),
            &SharedState::with_base_url("https://cloud.example.com"),
            AuthConfig::default(),
            ResilienceConfig::default(),
        );
        assert_eq!(
            pipeline.chain().names(),
            vec!["base_url", "auth", "normalize", "resilience"]
        );

        pipeline.get("devices").await.unwrap();
        assert_eq!(
            transport.seen()[0].full_url(),
            "https://cloud.example.com/api/v1/devices"
        );
    }

    #[tokio::test]
    async fn test_unavailable_replayed_until_exhausted() {
        let connectivity = ConnectivityMonitor::new();
        let recover = auto_recover(&connectivity);
        let transport = ScriptedTransport::always(503, ResponseBody::Empty);
        let config = PipelineConfigBuilder::new().validate_status(accept_all).build();
        let resilience: Arc<dyn Interceptor> = Arc::new(ResilienceInterceptor::new(
            connectivity.clone(),
            ResilienceConfig::default(),
        ));
        let pipeline = Pipeline::new(config, transport.clone(), vec![resilience]);

        let response = pipeline.get("devices").await.unwrap();

        assert_eq!(transport.calls(), 4);
        assert_eq!(response.status, 503);
        assert_eq!(response.request.retry_count, 3);
        assert!(!response.request.ignore_response_transformation);

        let counts: Vec<u32> = transport.seen().iter().map(|r| r.retry_count).collect();
        assert_eq!(counts, vec![0, 1, 2, 3]);
        recover.abort();
    }

    #[tokio::test]
    async fn test_unavailable_error_reraised_when_exhausted() {
        let connectivity = ConnectivityMonitor::new();
        let recover = auto_recover(&connectivity);
        let transport = ScriptedTransport::always(502, ResponseBody::Empty);
        let resilience: Arc<dyn Interceptor> = Arc::new(ResilienceInterceptor::new(
            connectivity.clone(),
            ResilienceConfig::default(),
        ));
        let pipeline = Pipeline::new(PipelineConfig::default(), transport.clone(), vec![resilience]);

        let error = pipeline.get("devices").await.unwrap_err();

        assert_eq!(transport.calls(), 4);
        assert_eq!(error.status(), Some(502));
        assert_eq!(error.request().map(|r| r.retry_count), Some(3));
        recover.abort();
    }

    /// Fails every request before anything is sent.
    struct Unencodable {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for Unencodable {
        async fn send(
            &self,
            request: RequestDescriptor,
        ) -> Result<ResponseEnvelope, PipelineError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(PipelineError::Encode {
                reason: "unsupported body".into(),
                request: Box::new(request),
            })
        }
    }

    #[tokio::test]
    async fn test_encode_error_not_replayed() {
        let connectivity = ConnectivityMonitor::new();
        let transport = Arc::new(Unencodable {
            calls: Default::default(),
        });
        let resilience: Arc<dyn Interceptor> = Arc::new(ResilienceInterceptor::new(
            connectivity.clone(),
            ResilienceConfig::default(),
        ));
        let pipeline = Pipeline::new(PipelineConfig::default(), transport.clone(), vec![resilience]);

        let error = tokio::time::timeout(Duration::from_secs(1), pipeline.post("devices", json!({})))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(error, PipelineError::Encode { .. }));
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!connectivity.is_offline());
    }

    #[tokio::test]
    async fn test_replay_recovers_transparently() {
        let connectivity = ConnectivityMonitor::new();
        let recover = auto_recover(&connectivity);
        let transport = ScriptedTransport::scripted(
            vec![(503, ResponseBody::Empty)],
            (200, ResponseBody::Json(json!({ "resultCode": 0, "id": 9 }))),
        );
        let pipeline = Pipeline::standard(
            PipelineConfig::default(),
            transport.clone(),
            &SharedState {
                connectivity: connectivity.clone(),
                ..SharedState::with_base_url("https://cloud.example.com")
            },
            AuthConfig::default(),
            ResilienceConfig::default(),
        );

        let response = pipeline.get("devices/9").await.unwrap();

        assert_eq!(transport.calls(), 2);
        assert_eq!(response.body.as_json().unwrap()["id"], 9);
        assert_eq!(response.request.retry_count, 1);
        assert!(!response.request.ignore_response_transformation);
        recover.abort();
    }

    #[tokio::test]
    async fn test_exempt_path_never_replayed() {
        let connectivity = ConnectivityMonitor::new();
        let transport = ScriptedTransport::always(503, ResponseBody::Empty);
        let resilience: Arc<dyn Interceptor> = Arc::new(ResilienceInterceptor::new(
            connectivity.clone(),
            ResilienceConfig::default(),
        ));
        let pipeline = Pipeline::new(PipelineConfig::default(), transport.clone(), vec![resilience]);

        let error = pipeline.get("status/ping").await.unwrap_err();
        assert_eq!(error.status(), Some(503));
        assert_eq!(transport.calls(), 1);
        assert!(!connectivity.is_offline());

        let login = pipeline
            .post("auth/login", json!({ "user": "u" }))
            .await
            .unwrap_err();
        assert_eq!(login.request().map(|r| r.retry_count), Some(0));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_code_invalidates_once() {
        let session = SessionStore::new();
        session.set_token("abc").await;
        let transport =
            ScriptedTransport::always(200, ResponseBody::Json(json!({ "resultCode": 2 })));
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            transport,
            vec![
                Arc::new(AuthInterceptor::new(session.clone(), AuthConfig::default())),
                Arc::new(NormalizeInterceptor::new()),
            ],
        );

        let error = pipeline.get("devices").await.unwrap_err();

        assert!(matches!(error, PipelineError::Application { .. }));
        assert_eq!(session.invalidation_count(), 1);
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_offline_get_held_then_sent_once() {
        let state = SharedState::with_base_url("https://cloud.example.com");
        state.connectivity.set_offline(true);
        let transport = ScriptedTransport::always(200, ok_body());
        let pipeline = Pipeline::standard(
            PipelineConfig::default(),
            transport.clone(),
            &state,
            AuthConfig::default(),
            ResilienceConfig::default(),
        );

        let call = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.get("devices").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!call.is_finished());
        assert_eq!(transport.calls(), 0);

        state.connectivity.set_online();
        let response = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(response.status, 200);
        assert_eq!(response.request.retry_count, 0);
        assert!(!response.request.ignore_response_transformation);
    }
}
