// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation background task registry.
//!
//! Tasks are spawned as soon as they are scheduled and run concurrently with
//! each other and with the rest of the handler. The dispatcher drains the
//! registry before it polls for the next invocation, so a function's
//! background work always finishes inside the invocation that started it.

use std::future::Future;
use std::sync::Mutex;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BoxError;

/// Result of draining a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Tasks that finished with `Ok`
    pub completed: usize,
    /// Tasks that returned an error or panicked
    pub failed: usize,
}

struct PendingTask {
    name: String,
    handle: JoinHandle<Result<(), BoxError>>,
}

/// Background tasks scheduled during one invocation.
#[derive(Default)]
pub struct BackgroundTasks {
    pending: Mutex<Vec<PendingTask>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` now; the next poll waits for it.
    pub fn schedule<F, E>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(async move { task.await.map_err(Into::into) });
        debug!(task = %name, "Background task scheduled");
        self.lock().push(PendingTask { name, handle });
    }

    /// Number of tasks not yet collected by [`drain`](Self::drain).
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for every scheduled task.
    ///
    /// Failures and panics are logged and counted, never propagated. The
    /// registry is re-checked after each round so a task scheduled while
    /// draining is awaited too.
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();
        loop {
            let batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                return summary;
            }

            let (names, handles): (Vec<_>, Vec<_>) =
                batch.into_iter().map(|t| (t.name, t.handle)).unzip();
            for (name, result) in names.into_iter().zip(join_all(handles).await) {
                match result {
                    Ok(Ok(())) => {
                        summary.completed += 1;
                        debug!(task = %name, "Background task completed");
                    }
                    Ok(Err(e)) => {
                        summary.failed += 1;
                        warn!(task = %name, error = %e, "Background task failed");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(task = %name, error = %e, "Background task panicked");
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingTask>> {
        // A poisoned lock only means a scheduler panicked mid-push.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
