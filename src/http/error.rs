//! Request pipeline errors.

use thiserror::Error;

use super::descriptor::RequestDescriptor;
use super::response::ResponseEnvelope;
use crate::core::{ApiFailure, DeferredError, ResultCode};

/// Errors surfaced by the request pipeline.
///
/// `Clone` so a replayed request can hand its outcome back through a
/// [`Deferred`](crate::core::Deferred).
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// No response was received at all.
    #[error("network error for {}: {message}", .request.url)]
    Network {
        /// Transport failure description.
        message: String,
        /// Request that failed.
        request: Box<RequestDescriptor>,
    },

    /// The request could not be encoded. Nothing was sent.
    #[error("cannot encode request for {}: {reason}", .request.url)]
    Encode {
        /// Why encoding failed.
        reason: String,
        /// Request that failed.
        request: Box<RequestDescriptor>,
    },

    /// A response arrived but its status failed validation.
    #[error("unexpected status {}", .response.status)]
    Status {
        /// The full response.
        response: Box<ResponseEnvelope>,
    },

    /// The response had no body.
    #[error("empty response body for {}", .response.request.url)]
    EmptyResponse {
        /// The full response.
        response: Box<ResponseEnvelope>,
    },

    /// The response body could not be interpreted.
    #[error("malformed response: {reason}")]
    Malformed {
        /// Why the body was rejected.
        reason: String,
        /// The full response.
        response: Box<ResponseEnvelope>,
    },

    /// The server reported a non-zero result code.
    #[error("application error: {failure}")]
    Application {
        /// Code and body.
        failure: ApiFailure,
        /// The full response.
        response: Box<ResponseEnvelope>,
    },

    /// The base URL could not be resolved.
    #[error("base url unavailable: {0}")]
    BaseUrl(String),

    /// An interceptor failed for a reason of its own.
    #[error("interceptor error: {0}")]
    Interceptor(String),

    /// Deferred completion failed.
    #[error("deferred error: {0}")]
    Deferred(#[from] DeferredError),
}

impl PipelineError {
    /// The response attached to this error, if any.
    pub fn response(&self) -> Option<&ResponseEnvelope> {
        match self {
            PipelineError::Status { response }
            | PipelineError::EmptyResponse { response }
            | PipelineError::Malformed { response, .. }
            | PipelineError::Application { response, .. } => Some(response.as_ref()),
            _ => None,
        }
    }

    /// The request that produced this error, if known.
    pub fn request(&self) -> Option<&RequestDescriptor> {
        match self {
            PipelineError::Network { request, .. } | PipelineError::Encode { request, .. } => {
                Some(request.as_ref())
            }
            _ => self.response().map(|response| &response.request),
        }
    }

    /// Mutable access to the originating request.
    pub fn request_mut(&mut self) -> Option<&mut RequestDescriptor> {
        match self {
            PipelineError::Network { request, .. } | PipelineError::Encode { request, .. } => {
                Some(request.as_mut())
            }
            PipelineError::Status { response }
            | PipelineError::EmptyResponse { response }
            | PipelineError::Malformed { response, .. }
            | PipelineError::Application { response, .. } => Some(&mut response.request),
            _ => None,
        }
    }

    /// HTTP status of the attached response.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|response| response.status)
    }

    /// Result code found in the attached response body.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            PipelineError::Application { failure, .. } => Some(failure.code),
            _ => self.response().and_then(ResponseEnvelope::result_code),
        }
    }

    /// Whether the error came from the transport rather than from normalization.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PipelineError::Network { .. } | PipelineError::Status { .. }
        )
    }
}
