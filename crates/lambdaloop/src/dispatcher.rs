// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation dispatch loop.
//!
//! One invocation at a time:
//!
//! ```text
//! Idle -> Polling -> Invoking -> Responding -> Draining -> Idle
//!   any -> Stopped
//! ```
//!
//! Cancellation is only observed at loop boundaries. While polling the loop
//! stops at once; a claimed invocation always runs through `Draining` first.
//!
//! An invocation counts as claimed once the poll returns. If shutdown fires
//! after the control plane sent the invocation but before the poll resolved,
//! the invocation is dropped unanswered; the control plane sees it time out
//! (the local server fails its pending invoke when it shuts down).

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::RuntimeClient;
use crate::config::PollRetryPolicy;
use crate::context::Context;
use crate::error::{HandlerError, Result};
use crate::handler::Handler;
use crate::types::{Invocation, PANIC_ERROR_TYPE};
use crate::writer::ResponseWriter;

/// Observable state of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Polling,
    Invoking,
    Responding,
    Draining,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Polling => "polling",
            DispatcherState::Invoking => "invoking",
            DispatcherState::Responding => "responding",
            DispatcherState::Draining => "draining",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Drives a handler against a runtime client.
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    poll_retry: PollRetryPolicy,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn Handler>, poll_retry: PollRetryPolicy) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            handler,
            poll_retry,
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Fatal errors are: transient poll failures beyond the retry policy, a
    /// non-success or malformed next-invocation answer, and a transport
    /// failure while delivering a response.
    pub async fn run(&self, client: &RuntimeClient, shutdown: CancellationToken) -> Result<()> {
        let result = self.run_loop(client, &shutdown).await;
        self.set_state(DispatcherState::Stopped);
        match &result {
            Ok(()) => info!("Dispatch loop stopped"),
            Err(e) => error!(error = %e, "Dispatch loop stopped on fatal error"),
        }
        result
    }

    async fn run_loop(&self, client: &RuntimeClient, shutdown: &CancellationToken) -> Result<()> {
        let mut consecutive_failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            self.set_state(DispatcherState::Polling);
            // Dropping the poll here abandons an invocation still in flight.
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested while polling");
                    return Ok(());
                }
                polled = client.next_invocation() => polled,
            };

            match polled {
                Ok((invocation, writer)) => {
                    consecutive_failures = 0;
                    self.dispatch(invocation, writer).await?;
                }
                Err(e) if e.is_transient() && consecutive_failures < self.poll_retry.max_retries => {
                    consecutive_failures += 1;
                    let delay = self.poll_retry.delay_for_attempt(consecutive_failures);
                    warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        max_retries = self.poll_retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Poll failed, retrying"
                    );
                    self.set_state(DispatcherState::Idle);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one claimed invocation through handler, response and drain.
    ///
    /// Returns the delivery failure of the response, if there was one.
    pub(crate) async fn dispatch(
        &self,
        invocation: Invocation,
        mut writer: ResponseWriter,
    ) -> Result<()> {
        let request_id = invocation.request_id.clone();
        let context = Context::new(invocation.metadata());

        self.set_state(DispatcherState::Invoking);
        debug!(%request_id, "Invoking handler");
        let outcome = AssertUnwindSafe(self.handler.handle(invocation.event, &mut writer, &context))
            .catch_unwind()
            .await;

        self.set_state(DispatcherState::Responding);
        let pending_error = match outcome {
            Ok(Ok(())) if writer.is_finished() => None,
            Ok(Ok(())) => {
                warn!(%request_id, "Handler returned without finishing the response");
                Some(HandlerError::unhandled(request_id.as_str()))
            }
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%request_id, panic = %message, "Handler panicked");
                Some(HandlerError::new(PANIC_ERROR_TYPE, message))
            }
        };
        if let Some(e) = pending_error {
            if writer.is_finished() {
                warn!(%request_id, error = %e, "Handler failed after finishing the response");
            } else {
                // Only fails on a finished writer, which was just ruled out.
                let _ = writer.report_error(e).await;
            }
        }

        self.set_state(DispatcherState::Draining);
        let summary = context.tasks().drain().await;
        if summary.completed + summary.failed > 0 {
            debug!(
                %request_id,
                completed = summary.completed,
                failed = summary.failed,
                "Background tasks drained"
            );
        }

        self.set_state(DispatcherState::Idle);
        match writer.take_delivery_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_state(&self, state: DispatcherState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Dispatcher state changed");
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("poll_retry", &self.poll_retry)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
