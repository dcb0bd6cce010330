// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime lifecycle.
//!
//! [`LambdaRuntime`] ties a handler to a runtime client and drives the
//! dispatch loop until it is cancelled.
//!
//! # Example
//!
//! ```rust,ignore
//! use lambdaloop::{LambdaRuntime, RuntimeConfig, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> lambdaloop::Result<()> {
//!     let runtime = LambdaRuntime::builder()
//!         .handler(handler_fn(|event, _meta| async move {
//!             Ok::<_, lambdaloop::HandlerError>(event)
//!         }))
//!         .config(RuntimeConfig::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::spawn(lambdaloop::shutdown_on_signal(runtime.cancellation_token()));
//!     runtime.run().await
//! }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::RuntimeClient;
use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, DispatcherState};
use crate::error::{HandlerError, Result, RuntimeError};
use crate::handler::Handler;

/// Builder for creating a [`LambdaRuntime`].
#[derive(Default)]
pub struct LambdaRuntimeBuilder {
    handler: Option<Arc<dyn Handler>>,
    config: Option<RuntimeConfig>,
}

impl std::fmt::Debug for LambdaRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaRuntimeBuilder")
            .field("handler", &self.handler.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl LambdaRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler (required).
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set a shared handler (required unless [`handler`](Self::handler) is used).
    pub fn shared_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the configuration.
    ///
    /// Default: [`RuntimeConfig::from_env`]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate the builder.
    ///
    /// Returns an error if the handler is missing or the environment holds an
    /// invalid configuration.
    pub fn build(self) -> Result<RuntimeConfigured> {
        let handler = self
            .handler
            .ok_or_else(|| RuntimeError::Initialization("handler is required".to_string()))?;
        let config = match self.config {
            Some(config) => config,
            None => RuntimeConfig::from_env()?,
        };
        Ok(RuntimeConfigured { handler, config })
    }
}

/// A validated runtime that has not connected yet.
pub struct RuntimeConfigured {
    handler: Arc<dyn Handler>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for RuntimeConfigured {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfigured")
            .field("handler", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl RuntimeConfigured {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create the runtime client, starting the local server when configured.
    pub async fn start(self) -> Result<LambdaRuntime> {
        let client = RuntimeClient::connect(&self.config).await?;
        let dispatcher = Dispatcher::new(self.handler, self.config.poll_retry.clone());
        info!(local = self.config.is_local(), "LambdaRuntime started");

        Ok(LambdaRuntime {
            client,
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }
}

/// A connected runtime, ready to run its dispatch loop.
pub struct LambdaRuntime {
    client: RuntimeClient,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl LambdaRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> LambdaRuntimeBuilder {
        LambdaRuntimeBuilder::new()
    }

    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }

    /// Report a startup failure to the control plane.
    ///
    /// Usable once, before the loop received its first invocation.
    pub async fn report_startup_error(&self, error: impl Into<HandlerError>) -> Result<()> {
        let report = error.into().to_report();
        self.client.report_init_error(&report).await
    }

    /// Token that stops the loop at its next boundary when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Watch the dispatcher state.
    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.dispatcher.subscribe()
    }

    /// Drive the dispatch loop until cancelled or a fatal error occurs.
    pub async fn run(self) -> Result<()> {
        let result = self.dispatcher.run(&self.client, self.shutdown).await;
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Failed to close runtime client");
        }
        result
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> RunningRuntime {
        let shutdown = self.shutdown.clone();
        let state = self.dispatcher.subscribe();
        let handle = tokio::spawn(self.run());
        RunningRuntime {
            handle,
            shutdown,
            state,
        }
    }
}

impl std::fmt::Debug for LambdaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaRuntime")
            .field("client", &self.client)
            .field("dispatcher", &self.dispatcher)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// A runtime whose loop runs on a background task.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct RunningRuntime {
    handle: JoinHandle<Result<()>>,
    shutdown: CancellationToken,
    state: watch::Receiver<DispatcherState>,
}

impl RunningRuntime {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Watch the dispatcher state.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.state.clone()
    }

    /// Check if the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Wait for the loop to stop on its own.
    pub async fn join(self) -> Result<()> {
        join_loop(self.handle).await
    }

    /// Cancel the loop and wait for it to stop.
    ///
    /// An invocation in progress finishes (including its background tasks)
    /// before the loop stops.
    pub async fn shutdown(self) -> Result<()> {
        info!("LambdaRuntime shutting down...");
        self.shutdown.cancel();
        let result = join_loop(self.handle).await;
        if result.is_ok() {
            info!("LambdaRuntime shutdown complete");
        }
        result
    }
}

async fn join_loop(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Ok(()),
    }
}

/// Cancel `token` on ctrl-c or, on Unix, SIGTERM.
pub async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = token.cancelled() => return,
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
    token.cancel();
}

/// Run `handler` with configuration from the environment until ctrl-c or
/// SIGTERM.
pub async fn run(handler: impl Handler + 'static) -> Result<()> {
    let runtime = LambdaRuntime::builder()
        .handler(handler)
        .build()?
        .start()
        .await?;
    let signals = tokio::spawn(shutdown_on_signal(runtime.cancellation_token()));
    let result = runtime.run().await;
    signals.abort();
    result
}
