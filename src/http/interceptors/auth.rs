//! Credential injection and unauthorized-code handling.

use ::http::header::{HeaderName, HeaderValue};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::core::ResultCode;
use crate::core::constants::{
    DEFAULT_CREDENTIAL_HEADER, DEFAULT_CREDENTIAL_SCHEME, DEFAULT_EXPIRY_FIELD,
};
use crate::http::descriptor::RequestDescriptor;
use crate::http::error::PipelineError;
use crate::http::interceptor::Interceptor;
use crate::http::response::ResponseEnvelope;
use crate::state::{ReloginReason, SessionStore};

/// Credential settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Header carrying the credential.
    pub header: HeaderName,

    /// Scheme prefixed to the token. Empty sends the bare token.
    pub scheme: String,

    /// Body field carrying the credential expiry, in epoch milliseconds.
    pub expiry_field: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_CREDENTIAL_HEADER,
            scheme: DEFAULT_CREDENTIAL_SCHEME.to_string(),
            expiry_field: DEFAULT_EXPIRY_FIELD.to_string(),
        }
    }
}

impl AuthConfig {
    fn credential(&self, token: &str) -> Result<HeaderValue, PipelineError> {
        let credential = if self.scheme.is_empty() {
            token.to_string()
        } else {
            format!("{} {}", self.scheme, token)
        };
        let mut value = HeaderValue::from_str(&credential).map_err(|_| {
            PipelineError::Interceptor("session token is not a valid header value".into())
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Injects the session token and reacts to the unauthorized result code.
///
/// * An unauthorized code in a response body, or an application rejection
///   carrying it from an inner normalization stage, invalidates the session
///   and broadcasts a re-login request.
/// * A transport-level error (no response, or a rejected status) whose body
///   carries the code only broadcasts the re-login request.
/// * A successful response advertising a credential expiry arms the session's
///   expiry timer while a token is held.
///
/// Responses to replays in flight are skipped; the original request's pass
/// handles them once the replay settles.
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    session: SessionStore,
    config: AuthConfig,
}

impl AuthInterceptor {
    /// Inject from `session` using `config`.
    pub fn new(session: SessionStore, config: AuthConfig) -> Self {
        Self { session, config }
    }

    async fn session_rejected(&self, url: &str) {
        debug!(%url, "credential rejected by server");
        self.session.invalidate().await;
        self.session.notify_relogin(ReloginReason::Unauthorized);
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn on_request(
        &self,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, PipelineError> {
        if request.no_auth || request.headers.contains_key(&self.config.header) {
            return Ok(request);
        }
        if let Some(token) = self.session.token().await {
            let credential = self.config.credential(&token)?;
            request
                .headers
                .insert(self.config.header.clone(), credential);
        }
        Ok(request)
    }

    async fn on_response(
        &self,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, PipelineError> {
        if response.request.ignore_response_transformation {
            return Ok(response);
        }

        if response.result_code() == Some(ResultCode::Unauthorized) {
            self.session_rejected(&response.request.url).await;
            return Ok(response);
        }

        let expires_at = response
            .body
            .as_json()
            .and_then(|body| body.get(&self.config.expiry_field))
            .and_then(Value::as_u64);
        if let Some(expires_at) = expires_at {
            if self.session.is_authenticated().await {
                self.session.schedule_expiry(expires_at);
            }
        }
        Ok(response)
    }

    async fn on_response_error(
        &self,
        error: PipelineError,
    ) -> Result<ResponseEnvelope, PipelineError> {
        let replaying = error
            .request()
            .is_some_and(|request| request.ignore_response_transformation);
        if replaying {
            return Err(error);
        }

        match &error {
            PipelineError::Application { failure, response }
                if failure.code == ResultCode::Unauthorized =>
            {
                self.session_rejected(&response.request.url).await;
            }
            _ if error.is_transport()
                && error.result_code() == Some(ResultCode::Unauthorized) =>
            {
                self.session.notify_relogin(ReloginReason::Unauthorized);
            }
            _ => {}
        }
        Err(error)
    }
}
