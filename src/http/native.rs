//! reqwest-backed transport.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::trace;

use super::descriptor::{RequestBody, RequestDescriptor};
use super::error::PipelineError;
use super::response::{ResponseBody, ResponseEnvelope};
use super::transport::HttpTransport;

/// [`HttpTransport`] over a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn network_error(message: impl ToString, request: RequestDescriptor) -> PipelineError {
    PipelineError::Network {
        message: message.to_string(),
        request: Box::new(request),
    }
}

/// Body bytes plus the content type to send when the caller set none.
fn encode_body(body: &RequestBody) -> Result<(Vec<u8>, &str), serde_json::Error> {
    Ok(match body {
        RequestBody::Json(value) => (serde_json::to_vec(value)?, "application/json"),
        RequestBody::Text(text) => (text.clone().into_bytes(), "text/plain"),
        RequestBody::Bytes { content_type, data } => (data.clone(), content_type.as_str()),
    })
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseEnvelope, PipelineError> {
        let url = request.full_url();
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone());

        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(body) = &request.body {
            let (bytes, content_type) = match encode_body(body) {
                Ok(encoded) => encoded,
                Err(e) => {
                    return Err(PipelineError::Encode {
                        reason: e.to_string(),
                        request: Box::new(request),
                    });
                }
            };
            let explicit = matches!(body, RequestBody::Bytes { .. });
            if explicit || !request.headers.contains_key(CONTENT_TYPE) {
                builder = builder.header(CONTENT_TYPE, content_type);
            }
            builder = builder.body(bytes);
        }

        trace!(method = %request.method, %url, "sending");
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Err(network_error(e, request)),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let raw = match response.bytes().await {
            Ok(raw) => raw.to_vec(),
            Err(e) => return Err(network_error(e, request)),
        };

        let body = ResponseBody::decode(raw, request.response_type);
        let mut envelope = ResponseEnvelope::new(status, body, request);
        envelope.headers = headers;
        Ok(envelope)
    }
}
