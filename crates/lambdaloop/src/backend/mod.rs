// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane backends.
//!
//! - `http`: HTTP/1.1 client for a real control plane or the local substitute server
//! - `recording`: in-memory backend for unit tests

pub mod http;

#[cfg(test)]
pub(crate) mod recording;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{ErrorReport, Invocation};

/// Backend trait for control-plane operations.
///
/// This trait abstracts the transport so the dispatcher works the same
/// against the real control plane, the local substitute server, or an
/// in-memory fake.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Suspend until the control plane hands out the next invocation.
    async fn next_invocation(&self) -> Result<Invocation>;

    /// Send a complete, non-streamed response.
    async fn report_response(&self, request_id: &str, body: Bytes) -> Result<()>;

    /// Open a streamed response exchange.
    async fn start_streaming(&self, request_id: &str) -> Result<Box<dyn ResponseStream>>;

    /// Report that the invocation failed.
    async fn report_error(&self, request_id: &str, report: &ErrorReport) -> Result<()>;

    /// Report that the function failed to initialize.
    async fn report_init_error(&self, report: &ErrorReport) -> Result<()>;
}

/// An open streamed response.
///
/// Chunks are delivered in call order. The stream ends either normally
/// (`finish`) or with an error trailer (`fail`).
#[async_trait]
pub trait ResponseStream: Send {
    /// Send one chunk, suspending while the transport applies backpressure.
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// End the stream and wait for the control plane to acknowledge it.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// End the stream with an error trailer and wait for acknowledgement.
    async fn fail(self: Box<Self>, report: &ErrorReport) -> Result<()>;
}
