//! Tagged result codes carried by every server response.

use std::fmt;

use serde_json::Value;

use super::constants::{
    RESULT_CODE_FIELD, RESULT_CODE_MESSAGE_FIELD, RESULT_CODE_SUCCESS, RESULT_CODE_UNAUTHORIZED,
};

/// Server result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// `0`
    Success,
    /// `2`: credential rejected, the user must log in again.
    Unauthorized,
    /// Any other code, an application-level failure.
    Other(i64),
}

impl ResultCode {
    /// Map a raw code.
    pub fn from_code(code: i64) -> Self {
        match code {
            RESULT_CODE_SUCCESS => ResultCode::Success,
            RESULT_CODE_UNAUTHORIZED => ResultCode::Unauthorized,
            other => ResultCode::Other(other),
        }
    }

    /// Raw code.
    pub fn code(self) -> i64 {
        match self {
            ResultCode::Success => RESULT_CODE_SUCCESS,
            ResultCode::Unauthorized => RESULT_CODE_UNAUTHORIZED,
            ResultCode::Other(code) => code,
        }
    }

    /// Whether this is the success code.
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Read the result code field of a JSON body.
    ///
    /// Returns `None` when the body is not an object or has no numeric code.
    pub fn from_body(body: &Value) -> Option<Self> {
        body.get(RESULT_CODE_FIELD)
            .and_then(Value::as_i64)
            .map(Self::from_code)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A body whose result code was not success.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiFailure {
    /// Reported code.
    pub code: ResultCode,
    /// Full response body, surfaced to the caller as the error payload.
    pub body: Value,
}

impl ApiFailure {
    /// Create a failure from a code and body.
    pub fn new(code: ResultCode, body: Value) -> Self {
        Self { code, body }
    }

    /// Optional server message.
    pub fn message(&self) -> Option<&str> {
        self.body.get(RESULT_CODE_MESSAGE_FIELD).and_then(Value::as_str)
    }

    /// Whether the failure asks for a new login.
    pub fn is_unauthorized(&self) -> bool {
        self.code == ResultCode::Unauthorized
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "result code {}: {}", self.code, message),
            None => write!(f, "result code {}", self.code),
        }
    }
}
