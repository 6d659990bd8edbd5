//! Call result taxonomy for endpoint operations
//!
//! Endpoint clients never surface raw transport or protocol errors:
//! every operation resolves to a code from this table plus the daemon's
//! verbatim message when one was available.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    NotModified,
    NotFound,
    Conflict,
    /// The endpoint is in its offline cooldown; no network call was made.
    Offline,
    Timeout,
    Error,
}

/// A failed daemon or registry call.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct CallError {
    pub code: ResultCode,
    pub message: String,
}

impl CallError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Offline, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Timeout, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Error, message)
    }

    /// Map a non-2xx daemon response onto the result taxonomy, keeping the
    /// body verbatim.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let code = match status {
            StatusCode::NOT_MODIFIED => ResultCode::NotModified,
            StatusCode::NOT_FOUND => ResultCode::NotFound,
            StatusCode::CONFLICT => ResultCode::Conflict,
            _ => ResultCode::Error,
        };
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            format!("HTTP {}: {}", status.as_u16(), body.trim())
        };
        Self::new(code, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ResultCode::NotFound
    }

    pub fn is_offline(&self) -> bool {
        self.code == ResultCode::Offline
    }
}

pub type CallResult<T> = Result<T, CallError>;
