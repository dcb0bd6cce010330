// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime error types.

use std::fmt;

use thiserror::Error;

use crate::types::{ErrorReport, UNHANDLED_ERROR_TYPE};

/// Errors that can occur in the runtime client and dispatch loop.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/connection failure talking to the control plane
    #[error("transport error: {0}")]
    Transport(String),

    /// Control plane answered with a status the protocol does not allow
    #[error("unexpected status {status} from {operation}")]
    UnexpectedStatus {
        /// Operation that received the response
        operation: &'static str,
        /// HTTP status code
        status: u16,
    },

    /// Next-invocation response is missing or has invalid required fields
    #[error("malformed invocation: {0}")]
    MalformedInvocation(String),

    /// Handler returned without finishing its response writer
    #[error("handler returned without finishing the response for {request_id}")]
    UnhandledInvocation {
        /// Invocation left open
        request_id: String,
    },

    /// Write, finish or error report on a writer that already finished
    #[error("response writer for {request_id} is already finished")]
    WriterClosed {
        /// Invocation the writer was bound to
        request_id: String,
    },

    /// Startup error reporting was already used
    #[error("init error was already reported")]
    InitErrorAlreadyReported,

    /// Startup error reporting attempted after the loop received work
    #[error("init error cannot be reported after the first invocation")]
    InitErrorAfterFirstInvocation,

    /// Failure before the loop starts
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Local substitute server failed to start or serve
    #[error("local server error: {0}")]
    LocalServer(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RuntimeError {
    /// Whether a poll failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transport(_))
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for RuntimeError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        RuntimeError::Transport(err.to_string())
    }
}

impl From<hyper::Error> for RuntimeError {
    fn from(err: hyper::Error) -> Self {
        RuntimeError::Transport(err.to_string())
    }
}

/// Type alias for runtime results.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Boxed error used for background task failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error raised by a handler.
///
/// Reported verbatim to the control plane as `{errorType, errorMessage}`.
/// Any `std::error::Error` converts into it, so handlers can use `?` freely;
/// the error type becomes the unqualified Rust type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Error type reported to the control plane
    pub error_type: String,
    /// Human readable message
    pub error_message: String,
}

impl HandlerError {
    /// Create an error with an explicit type and message.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }

    /// Error reported for a handler that returned with its writer still open.
    pub fn unhandled(request_id: impl Into<String>) -> Self {
        let err = RuntimeError::UnhandledInvocation {
            request_id: request_id.into(),
        };
        Self::new(UNHANDLED_ERROR_TYPE, err.to_string())
    }

    /// Wire form of this error.
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport::new(&self.error_type, &self.error_message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            error_type: short_type_name::<E>().to_string(),
            error_message: err.to_string(),
        }
    }
}

/// `a::b::Foo<c::Bar>` -> `Foo<c::Bar>`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
