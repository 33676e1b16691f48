//! Response envelopes.

use ::http::header::{AsHeaderName, HeaderMap};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::descriptor::{RequestDescriptor, ResponseType};
use super::error::PipelineError;
use crate::core::ResultCode;

/// Decoded response body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseBody {
    /// No body.
    #[default]
    Empty,
    /// Parsed JSON.
    Json(Value),
    /// Text that was either requested as text or failed to parse as JSON.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl ResponseBody {
    /// Decode raw bytes according to the request's response-type hint.
    pub fn decode(raw: Vec<u8>, response_type: ResponseType) -> Self {
        if raw.is_empty() {
            return ResponseBody::Empty;
        }
        match response_type {
            ResponseType::Bytes => ResponseBody::Bytes(raw),
            ResponseType::Text => ResponseBody::Text(String::from_utf8_lossy(&raw).into_owned()),
            ResponseType::Json => match serde_json::from_slice(&raw) {
                Ok(value) => ResponseBody::Json(value),
                Err(_) => ResponseBody::Text(String::from_utf8_lossy(&raw).into_owned()),
            },
        }
    }

    /// Whether there is no body.
    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    /// JSON view, if parsed.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A response paired with the descriptor that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Decoded body.
    pub body: ResponseBody,
    /// Originating request, as it left the chain.
    pub request: RequestDescriptor,
}

impl ResponseEnvelope {
    /// Create an envelope.
    pub fn new(status: u16, body: ResponseBody, request: RequestDescriptor) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
            request,
        }
    }

    /// First value of header `name`, if it is visible ASCII.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Result code of a JSON body, if present.
    pub fn result_code(&self) -> Option<ResultCode> {
        self.body.as_json().and_then(ResultCode::from_body)
    }

    /// Deserialize the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        match &self.body {
            ResponseBody::Json(value) => {
                serde_json::from_value(value.clone()).map_err(|e| PipelineError::Malformed {
                    reason: e.to_string(),
                    response: Box::new(self.clone()),
                })
            }
            _ => Err(PipelineError::Malformed {
                reason: "body is not JSON".into(),
                response: Box::new(self.clone()),
            }),
        }
    }

    /// Text view of the body, if it is text.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }
}
