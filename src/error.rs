//! Closed error taxonomy for the capability invocation SDK.
//!
//! Copyright 2015-2020 Capital One Services, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of error codes from spec §6.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    ValidationError,
    SchemaValidationFailed,
    Unauthorized,
    AuthFailed,
    Forbidden,
    PolicyDenied,
    NotFound,
    Timeout,
    Cancelled,
    Conflict,
    RateLimited,
    LimitExceeded,
    UpstreamError,
    UnknownSubject,
    HandlerNotFound,
    RegistryUnavailable,
    PolicyEngineUnavailable,
    ObligationFailed,
    InternalError,
    InvalidRequest,
    InvalidArgument,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "INTERNAL_ERROR".to_string());
        write!(f, "{s}")
    }
}

/// A structured, caller-catchable capability error. Survives the facade boundary
/// with `code`/`retryable`/`details` intact (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityError {
    pub code: Code,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CapabilityError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        CapabilityError {
            code,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CapabilityError {}

/// Crate-wide error type. Every internal failure collapses into one of these
/// variants; [`Error::into_capability_error`] is how the facade boundary converts
/// an arbitrary internal error into the wire-shaped [`CapabilityError`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Capability(#[from] CapabilityError),

    #[error("bus transport error: {0}")]
    Bus(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid capability reference {raw:?}: {reason}")]
    InvalidReference { raw: String, reason: String },

    #[error("invalid semver {0:?}")]
    InvalidVersion(String),

    #[error("auth provider failure: {0}")]
    Auth(String),

    #[error("{0}")]
    Misc(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Converts any internal error into the closed, wire-shaped error. Structured
    /// [`CapabilityError`]s pass their code/retryable/details through unchanged;
    /// everything else collapses to `INTERNAL_ERROR` non-retryable, per spec §7.
    pub fn into_capability_error(self) -> CapabilityError {
        match self {
            Error::Capability(e) => e,
            other => CapabilityError::new(Code::InternalError, other.to_string()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::NotFound, message))
    }

    pub fn unknown_subject(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::UnknownSubject, message))
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::Timeout, message).retryable(true))
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::Cancelled, message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::InternalError, message))
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::AuthFailed, message).retryable(true))
    }

    pub fn policy_denied(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::PolicyDenied, message))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Capability(CapabilityError::new(Code::ValidationError, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    fn assert_sync_send<T: Send + Sync>() {}
    const _: fn() = || assert_sync_send::<Error>();

    #[test]
    fn capability_error_round_trips_through_json() {
        let err = CapabilityError::new(Code::NotFound, "no such capability").retryable(false);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        let back: CapabilityError = serde_json::from_value(json).unwrap();
        assert_eq!(back.code, Code::NotFound);
    }

    #[test]
    fn unknown_error_collapses_to_internal_error_non_retryable() {
        let err = Error::Misc("boom".into());
        let cap = err.into_capability_error();
        assert_eq!(cap.code, Code::InternalError);
        assert!(!cap.retryable);
    }

    #[test]
    fn structured_error_survives_conversion() {
        let err = Error::Capability(
            CapabilityError::new(Code::PolicyDenied, "denied").retryable(false),
        );
        let cap = err.into_capability_error();
        assert_eq!(cap.code, Code::PolicyDenied);
        assert_eq!(cap.message, "denied");
    }
}
