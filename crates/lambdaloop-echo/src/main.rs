// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! lambdaloop-echo - Example function built on lambdaloop.
//!
//! Modes (`ECHO_MODE`):
//! - `echo` (default): respond with the event unchanged
//! - `stream`: stream the event back in `ECHO_CHUNK_BYTES` sized chunks
//! - `json`: decode `{"message": ...}` and answer with a JSON envelope
//!
//! Without `AWS_LAMBDA_RUNTIME_API` the function runs against the local
//! control plane:
//!
//! ```bash
//! cargo run -p lambdaloop-echo &
//! curl -d 'hello' http://127.0.0.1:7000/invoke
//! ```

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lambdaloop::{
    BoxError, Context, Handler, HandlerError, InvocationMetadata, LambdaRuntime, ResponseWriter,
    RuntimeConfig, handler_fn, json_handler, shutdown_on_signal,
};

const DEFAULT_CHUNK_BYTES: usize = 16;

/// Streams the event back and logs a summary in the background.
struct StreamEcho {
    chunk_bytes: usize,
}

#[async_trait]
impl Handler for StreamEcho {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        context: &Context,
    ) -> Result<(), HandlerError> {
        let started = Instant::now();
        for chunk in event.chunks(self.chunk_bytes) {
            writer.write(Bytes::copy_from_slice(chunk)).await?;
        }
        writer.finish().await?;

        let request_id = context.request_id().to_string();
        let chunks = writer.chunks_written();
        context.schedule_background("summary", async move {
            info!(%request_id, chunks, elapsed_ms = started.elapsed().as_millis() as u64, "Stream sent");
            Ok::<_, BoxError>(())
        });
        Ok(())
    }
}

#[derive(Deserialize)]
struct EchoRequest {
    message: String,
}

#[derive(Serialize)]
struct EchoResponse {
    echo: String,
    request_id: String,
    remaining_ms: u64,
}

async fn json_echo(
    request: EchoRequest,
    meta: InvocationMetadata,
) -> Result<EchoResponse, HandlerError> {
    if request.message.is_empty() {
        return Err(HandlerError::new("EmptyMessage", "message must not be empty"));
    }
    Ok(EchoResponse {
        echo: request.message,
        remaining_ms: meta.remaining_time().as_millis() as u64,
        request_id: meta.request_id,
    })
}

fn select_handler() -> Result<Box<dyn Handler>, HandlerError> {
    let mode = std::env::var("ECHO_MODE").unwrap_or_else(|_| "echo".to_string());
    match mode.as_str() {
        "echo" => Ok(Box::new(handler_fn(|event: Bytes, _meta| async move {
            Ok::<_, HandlerError>(event)
        }))),
        "stream" => {
            let chunk_bytes = match std::env::var("ECHO_CHUNK_BYTES") {
                Ok(raw) => raw.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                    HandlerError::new("InvalidConfig", format!("invalid ECHO_CHUNK_BYTES: {raw}"))
                })?,
                Err(_) => DEFAULT_CHUNK_BYTES,
            };
            Ok(Box::new(StreamEcho { chunk_bytes }))
        }
        "json" => Ok(Box::new(json_handler(json_echo))),
        other => Err(HandlerError::new(
            "InvalidConfig",
            format!("unknown ECHO_MODE: {other}"),
        )),
    }
}

/// Forwards to the selected handler, so startup can pick one at runtime.
struct Selected(Result<Box<dyn Handler>, HandlerError>);

#[async_trait]
impl Handler for Selected {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        context: &Context,
    ) -> Result<(), HandlerError> {
        match &self.0 {
            Ok(handler) => handler.handle(event, writer, context).await,
            Err(e) => Err(e.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lambdaloop=info,lambdaloop_echo=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = RuntimeConfig::from_env()?;
    info!(control_plane = ?config.control_plane, "Starting lambdaloop-echo");

    let handler = select_handler();
    let startup_error = handler.as_ref().err().cloned();

    let runtime = LambdaRuntime::builder()
        .handler(Selected(handler))
        .config(config)
        .build()?
        .start()
        .await?;

    if let Some(e) = startup_error {
        runtime.report_startup_error(e.clone()).await?;
        anyhow::bail!("startup failed: {}", e);
    }

    let running = runtime.spawn();
    let token = running.cancellation_token();
    shutdown_on_signal(token).await;

    running.shutdown().await?;
    info!("lambdaloop-echo stopped");
    Ok(())
}
