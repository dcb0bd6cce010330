// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! lambdaloop - Runtime client for serverless function control planes.
//!
//! A function process links this crate, registers one [`Handler`] and hands
//! control to [`LambdaRuntime`]. The runtime repeatedly fetches the next
//! invocation from the control plane over HTTP, runs the handler against it,
//! delivers the result and waits for any background work the handler
//! scheduled before asking for more.
//!
//! # Features
//!
//! - **Fixed and streamed responses**: a [`ResponseWriter`] sends one body, or
//!   streams chunks in order with backpressure
//! - **Error reporting**: handler errors, unfinished writers and panics are
//!   reported as `{errorType, errorMessage}`
//! - **Background tasks**: work scheduled through [`Context`] finishes before
//!   the next invocation is fetched
//! - **Graceful shutdown**: cancellation stops the loop at invocation
//!   boundaries
//! - **Local development**: with no control plane configured, a substitute
//!   server on `127.0.0.1:7000` accepts events at `POST /invoke`
//!
//! # Quick Start
//!
//! ```ignore
//! use lambdaloop::{Context, HandlerError, ResponseWriter, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> lambdaloop::Result<()> {
//!     lambdaloop::run(handler_fn(|event, _meta| async move {
//!         Ok::<_, HandlerError>(event)
//!     }))
//!     .await
//! }
//! ```
//!
//! # Streaming
//!
//! ```ignore
//! #[async_trait::async_trait]
//! impl Handler for Countdown {
//!     async fn handle(
//!         &self,
//!         _event: Bytes,
//!         writer: &mut ResponseWriter,
//!         context: &Context,
//!     ) -> Result<(), HandlerError> {
//!         for n in (1..=3).rev() {
//!             writer.write(format!("{n}\n")).await?;
//!         }
//!         context.schedule_background("metrics", flush_metrics());
//!         writer.finish().await?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Once a chunk was streamed, an error can no longer replace the response.
//! [`ResponseWriter::report_error`] then ends the stream with error trailers
//! and the control plane records the invocation as failed.
//!
//! # Configuration
//!
//! ## Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AWS_LAMBDA_RUNTIME_API` | No | - | Control-plane `host:port`; unset selects the local server |
//! | `LAMBDALOOP_LOCAL_PORT` | No | `7000` | Local server port |
//! | `LAMBDALOOP_LOCAL_INVOKE_PATH` | No | `/invoke` | Local developer invoke endpoint |
//! | `LAMBDALOOP_POLL_MAX_RETRIES` | No | `5` | Transient poll failures tolerated |
//! | `LAMBDALOOP_POLL_RETRY_DELAY_MS` | No | `100` | Base poll retry backoff |
//! | `LAMBDALOOP_POLL_RETRY_MAX_DELAY_MS` | No | `5000` | Poll retry backoff cap |
//!
//! ## Programmatic Configuration
//!
//! ```ignore
//! use lambdaloop::{PollRetryPolicy, RuntimeConfig};
//!
//! let config = RuntimeConfig::local()
//!     .with_local_port(9000)
//!     .with_poll_retry(PollRetryPolicy::new(10, 50, 2_000));
//! ```

pub mod backend;
mod client;
pub mod codec;
mod config;
mod context;
mod dispatcher;
mod error;
mod handler;
#[cfg(feature = "local-server")]
pub mod local_server;
mod runtime;
mod tasks;
mod types;
mod writer;

pub use backend::http::HttpBackend;
pub use backend::{ResponseStream, RuntimeBackend};
pub use client::RuntimeClient;
pub use codec::Endpoint;
pub use config::{
    ControlPlane, DEFAULT_LOCAL_INVOKE_PATH, DEFAULT_LOCAL_PORT, PollRetryPolicy, RUNTIME_API_ENV,
    RuntimeConfig,
};
pub use context::Context;
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{BoxError, HandlerError, Result, RuntimeError};
pub use handler::{
    Handler, HandlerFn, INVALID_EVENT_ERROR_TYPE, INVALID_RESPONSE_ERROR_TYPE, JsonHandler,
    handler_fn, json_handler,
};
#[cfg(feature = "local-server")]
pub use local_server::{LocalInvokeResult, LocalServer};
pub use runtime::{
    LambdaRuntime, LambdaRuntimeBuilder, RunningRuntime, RuntimeConfigured, run,
    shutdown_on_signal,
};
pub use tasks::{BackgroundTasks, DrainSummary};
pub use types::{
    ErrorReport, Invocation, InvocationMetadata, PANIC_ERROR_TYPE, UNHANDLED_ERROR_TYPE,
};
pub use writer::{ResponseWriter, WriterOutcome};
