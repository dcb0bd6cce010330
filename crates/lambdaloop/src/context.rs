// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation context handed to handlers.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::BoxError;
use crate::tasks::BackgroundTasks;
use crate::types::InvocationMetadata;

/// Read-only invocation metadata plus background task scheduling.
///
/// The dispatcher owns the context and lends it to the handler; it is
/// dropped once the invocation's background tasks have drained.
pub struct Context {
    metadata: InvocationMetadata,
    tasks: BackgroundTasks,
}

impl Context {
    pub(crate) fn new(metadata: InvocationMetadata) -> Self {
        Self {
            metadata,
            tasks: BackgroundTasks::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.metadata.request_id
    }

    /// Deadline on the local monotonic clock.
    pub fn deadline(&self) -> Instant {
        self.metadata.deadline
    }

    /// Deadline in milliseconds since the Unix epoch, as sent by the control plane.
    pub fn deadline_ms(&self) -> u64 {
        self.metadata.deadline_ms
    }

    pub fn remaining_time(&self) -> Duration {
        self.metadata.remaining_time()
    }

    pub fn invoked_function_arn(&self) -> &str {
        &self.metadata.invoked_function_arn
    }

    pub fn trace_id(&self) -> &str {
        &self.metadata.trace_id
    }

    pub fn client_context(&self) -> Option<&str> {
        self.metadata.client_context.as_deref()
    }

    pub fn cognito_identity(&self) -> Option<&str> {
        self.metadata.cognito_identity.as_deref()
    }

    pub fn metadata(&self) -> &InvocationMetadata {
        &self.metadata
    }

    /// Run `task` in the background of this invocation.
    ///
    /// The task starts immediately. The runtime will not ask for the next
    /// invocation until it has finished, even if the response was already
    /// sent. Failures are logged and otherwise ignored.
    pub fn schedule_background<F, E>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.tasks.schedule(name, task);
    }

    pub(crate) fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("metadata", &self.metadata)
            .field("pending_tasks", &self.tasks.pending())
            .finish()
    }
}
