// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types shared by the client, writer and dispatcher.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Error type reported when a handler returns without finishing its writer.
pub const UNHANDLED_ERROR_TYPE: &str = "UnhandledInvocation";

/// Error type reported when a handler panics.
pub const PANIC_ERROR_TYPE: &str = "Panic";

/// One unit of work fetched from the control plane.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Correlation key for all reports about this invocation
    pub request_id: String,
    /// Deadline as sent by the control plane (milliseconds since epoch)
    pub deadline_ms: u64,
    /// Deadline translated to the local monotonic clock
    pub deadline: Instant,
    /// ARN of the function being invoked
    pub invoked_function_arn: String,
    /// Tracing header value, empty when absent
    pub trace_id: String,
    /// Client context blob, if the invoker sent one
    pub client_context: Option<String>,
    /// Cognito identity blob, if the invoker sent one
    pub cognito_identity: Option<String>,
    /// Raw event payload
    pub event: Bytes,
}

impl Invocation {
    /// Metadata view of this invocation, without the event payload.
    pub fn metadata(&self) -> InvocationMetadata {
        InvocationMetadata {
            request_id: self.request_id.clone(),
            deadline_ms: self.deadline_ms,
            deadline: self.deadline,
            invoked_function_arn: self.invoked_function_arn.clone(),
            trace_id: self.trace_id.clone(),
            client_context: self.client_context.clone(),
            cognito_identity: self.cognito_identity.clone(),
        }
    }
}

/// Read-only invocation metadata handed to handlers through the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationMetadata {
    pub request_id: String,
    pub deadline_ms: u64,
    pub deadline: Instant,
    pub invoked_function_arn: String,
    pub trace_id: String,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
}

impl InvocationMetadata {
    /// Time left until the deadline, zero once it has passed.
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Error body sent to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub error_message: String,
    pub error_type: String,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            error_type: error_type.into(),
        }
    }
}
