//! Request descriptors threaded through the interceptor chain.

use std::time::Duration;

pub use ::http::Method;
use ::http::header::{AsHeaderName, HeaderMap, HeaderValue, IntoHeaderName};
use serde_json::Value;
use url::Url;

use super::path::{is_absolute_url, join_path};

/// How the response body should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// JSON envelope with a result code (default).
    #[default]
    Json,
    /// Raw text, returned without normalization.
    Text,
    /// Raw bytes, returned without normalization.
    Bytes,
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// JSON payload, sent as `application/json`.
    Json(Value),
    /// Plain text payload.
    Text(String),
    /// Binary payload with an explicit content type (uploads).
    Bytes {
        /// Content type sent with the payload.
        content_type: String,
        /// Raw bytes.
        data: Vec<u8>,
    },
}

/// Mutable request record handed from stage to stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Relative path, or an absolute URL that bypasses base-URL resolution.
    pub url: String,
    /// HTTP method.
    pub method: Method,
    /// Request headers.
    pub headers: HeaderMap,
    /// Query parameters, in order.
    pub params: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<RequestBody>,
    /// Resolved base URL including the API prefix. Filled by base-URL resolution.
    pub base_url: Option<String>,
    /// Response decoding hint.
    pub response_type: ResponseType,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
    /// Skip credential injection.
    pub no_auth: bool,
    /// Bypass response normalization. Set only while a replay is in flight.
    pub ignore_response_transformation: bool,
    /// Replays performed so far. Only the resilience stage increments it.
    pub retry_count: u32,
}

impl RequestDescriptor {
    /// Create a descriptor for `method` on `url`.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            base_url: None,
            response_type: ResponseType::Json,
            timeout: None,
            no_auth: false,
            ignore_response_transformation: false,
            retry_count: 0,
        }
    }

    /// Add a query parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Add a header, replacing any previous values.
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// First value of header `name`, if it is visible ASCII.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Attach a JSON body.
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Attach a binary body with its content type.
    pub fn with_bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Bytes {
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// Set the response decoding hint.
    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Use an explicit base URL instead of the configured one.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Override the transport timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send without credentials.
    pub fn without_auth(mut self) -> Self {
        self.no_auth = true;
        self
    }

    /// Path component used for exemption checks: no scheme, host, query or
    /// leading separator.
    pub fn path(&self) -> String {
        if is_absolute_url(&self.url) {
            return Url::parse(&self.url)
                .map(|url| url.path().trim_start_matches('/').to_string())
                .unwrap_or_default();
        }
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        path.trim_start_matches('/').to_string()
    }

    /// URL the transport should hit, without query parameters.
    pub fn full_url(&self) -> String {
        if is_absolute_url(&self.url) {
            return self.url.clone();
        }
        match &self.base_url {
            Some(base) => join_path(base, &self.url),
            None => self.url.clone(),
        }
    }
}
