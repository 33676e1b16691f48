//! Response normalization against the `{ resultCode, ...payload }` envelope.

use async_trait::async_trait;
use tracing::{error, warn};

use crate::core::{ApiFailure, ResultCode};
use crate::http::descriptor::ResponseType;
use crate::http::error::PipelineError;
use crate::http::interceptor::Interceptor;
use crate::http::response::{ResponseBody, ResponseEnvelope};

/// Turns non-zero result codes into [`PipelineError::Application`].
///
/// Text and byte responses pass through, as does anything marked for a replay
/// in flight. A missing body is rejected; a missing result code is accepted
/// with a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeInterceptor;

impl NormalizeInterceptor {
    /// Create the stage.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for NormalizeInterceptor {
    fn name(&self) -> &'static str {
        "normalize"
    }

    async fn on_response(
        &self,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, PipelineError> {
        let request = &response.request;
        if request.ignore_response_transformation
            || matches!(request.response_type, ResponseType::Text | ResponseType::Bytes)
        {
            return Ok(response);
        }

        let body = match &response.body {
            ResponseBody::Empty => {
                error!(url = %request.url, status = response.status, "empty response body");
                return Err(PipelineError::EmptyResponse {
                    response: Box::new(response),
                });
            }
            ResponseBody::Json(body) => body,
            ResponseBody::Text(_) | ResponseBody::Bytes(_) => {
                error!(url = %request.url, status = response.status, "response body is not JSON");
                return Err(PipelineError::Malformed {
                    reason: "expected a JSON body".into(),
                    response: Box::new(response),
                });
            }
        };

        match ResultCode::from_body(body) {
            None => {
                warn!(url = %request.url, "response has no result code");
                Ok(response)
            }
            Some(ResultCode::Success) => Ok(response),
            Some(code) => {
                let failure = ApiFailure::new(code, body.clone());
                Err(PipelineError::Application {
                    failure,
                    response: Box::new(response),
                })
            }
        }
    }
}
