//! Transport-agnostic status reporting
//!
//! Every error produced while handling a request is eventually converted into
//! a [`Status`], a coarse [`Code`] plus a human-readable description. Module
//! specific errors keep their own types and convert here at the handler
//! boundary.

use std::fmt;

use broker_cache::{CacheError, LockError};
use thiserror::Error;

/// The kind of failure reported to a caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The caller's identity could not be established, or its session token
    /// is invalid or expired
    Unauthenticated,
    /// The caller is known but not allowed to do what it asked
    PermissionDenied,
    /// A parameter was missing or malformed
    InvalidArgument,
    /// A requested record does not exist
    NotFound,
    /// A backing service could not be reached
    Unavailable,
    /// An unexpected internal failure
    Internal,
}

impl Code {
    /// The conventional upper-snake-case name of the code
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure returned by the request handlers
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Constructs a status with the given code and description
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The caller is not authenticated
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// The caller is not permitted
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    /// A parameter was invalid
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// A record was not found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// A backing service was unavailable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// An internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// The status code
    pub fn code(&self) -> Code {
        self.code
    }

    /// The human-readable description
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<CacheError> for Status {
    fn from(err: CacheError) -> Self {
        let error: &dyn std::error::Error = &err;
        tracing::warn!(error, "cache failure");
        match err {
            CacheError::Unavailable(_) => Self::unavailable("Cache unavailable"),
            CacheError::Serialization(_) => Self::internal("Unable to serialize cached value"),
        }
    }
}

impl From<LockError> for Status {
    fn from(err: LockError) -> Self {
        let error: &dyn std::error::Error = &err;
        tracing::error!(error, "unable to acquire cache lock");
        Self::unavailable(err.to_string())
    }
}
