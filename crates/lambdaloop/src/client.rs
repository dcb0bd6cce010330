// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime client for control-plane communication.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::backend::http::HttpBackend;
use crate::backend::{ResponseStream, RuntimeBackend};
use crate::codec::Endpoint;
use crate::config::{ControlPlane, RuntimeConfig};
use crate::error::{Result, RuntimeError};
#[cfg(feature = "local-server")]
use crate::local_server::LocalServer;
use crate::types::{ErrorReport, Invocation};
use crate::writer::ResponseWriter;

/// High-level client for the control plane.
///
/// Wraps a [`RuntimeBackend`] and enforces the protocol rules that do not
/// belong to the transport: init errors may be reported once and only before
/// the first invocation, and invocation error reports are best-effort.
///
/// # Example
///
/// ```ignore
/// use lambdaloop::{RuntimeClient, RuntimeConfig};
///
/// let client = RuntimeClient::connect(&RuntimeConfig::from_env()?).await?;
/// let (invocation, mut writer) = client.next_invocation().await?;
/// writer.write_and_finish(invocation.event).await?;
/// ```
pub struct RuntimeClient {
    backend: Arc<dyn RuntimeBackend>,
    /// Set once a poll returned an invocation
    polled: AtomicBool,
    /// Set once an init error was sent
    init_error_reported: AtomicBool,
    #[cfg(feature = "local-server")]
    local_server: Option<LocalServer>,
}

impl RuntimeClient {
    /// Client for the control plane at `endpoint`.
    pub fn http(endpoint: Endpoint) -> Self {
        Self::with_backend(Arc::new(HttpBackend::new(endpoint)))
    }

    /// Client over an arbitrary backend.
    pub fn with_backend(backend: Arc<dyn RuntimeBackend>) -> Self {
        Self {
            backend,
            polled: AtomicBool::new(false),
            init_error_reported: AtomicBool::new(false),
            #[cfg(feature = "local-server")]
            local_server: None,
        }
    }

    /// Create a client for the configured control plane.
    ///
    /// A local configuration starts the substitute server first; it is owned
    /// by the client and stopped by [`close`](Self::close).
    pub async fn connect(config: &RuntimeConfig) -> Result<Self> {
        match &config.control_plane {
            ControlPlane::Remote(authority) => {
                info!(control_plane = %authority, "Using remote control plane");
                Ok(Self::http(Endpoint::new(authority.clone())))
            }
            #[cfg(feature = "local-server")]
            ControlPlane::Local { port, invoke_path } => {
                let server = LocalServer::start(*port, invoke_path).await?;
                info!(
                    addr = %server.local_addr(),
                    invoke_path = %server.invoke_path(),
                    "Using local control plane"
                );
                let mut client = Self::http(server.endpoint());
                client.local_server = Some(server);
                Ok(client)
            }
            #[cfg(not(feature = "local-server"))]
            ControlPlane::Local { .. } => Err(RuntimeError::Config(format!(
                "{} is not set and the local-server feature is disabled",
                crate::config::RUNTIME_API_ENV
            ))),
        }
    }

    /// The local substitute server backing this client, if any.
    #[cfg(feature = "local-server")]
    pub fn local_server(&self) -> Option<&LocalServer> {
        self.local_server.as_ref()
    }

    /// Whether a poll has already returned an invocation.
    pub fn has_polled(&self) -> bool {
        self.polled.load(Ordering::SeqCst)
    }

    /// Wait for the next invocation and a writer bound to it.
    ///
    /// Fails with `Transport` when the control plane is unreachable,
    /// `UnexpectedStatus` on a non-2xx answer and `MalformedInvocation` when
    /// required fields are missing.
    #[instrument(skip(self))]
    pub async fn next_invocation(&self) -> Result<(Invocation, ResponseWriter)> {
        let invocation = self.backend.next_invocation().await?;
        self.polled.store(true, Ordering::SeqCst);
        let writer = ResponseWriter::new(&invocation.request_id, self.backend.clone());
        Ok((invocation, writer))
    }

    /// Send a complete response.
    #[instrument(skip(self, body), fields(body_size = body.len()))]
    pub async fn report_response(&self, request_id: &str, body: Bytes) -> Result<()> {
        self.backend.report_response(request_id, body).await
    }

    /// Open a streamed response.
    #[instrument(skip(self))]
    pub async fn start_streaming(&self, request_id: &str) -> Result<Box<dyn ResponseStream>> {
        self.backend.start_streaming(request_id).await
    }

    /// Report an invocation failure. Delivery failures are logged only.
    #[instrument(skip(self, report), fields(error_type = %report.error_type))]
    pub async fn report_error(&self, request_id: &str, report: &ErrorReport) {
        match self.backend.report_error(request_id, report).await {
            Ok(()) => debug!("Invocation error reported"),
            Err(e) => warn!(error = %e, "Failed to report invocation error"),
        }
    }

    /// Report that the function failed to start.
    ///
    /// Allowed once, and only before the first invocation was received. The
    /// report itself is best-effort: a wire failure is logged and `Ok` is
    /// returned.
    #[instrument(skip(self, report), fields(error_type = %report.error_type))]
    pub async fn report_init_error(&self, report: &ErrorReport) -> Result<()> {
        if self.has_polled() {
            return Err(RuntimeError::InitErrorAfterFirstInvocation);
        }
        if self.init_error_reported.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::InitErrorAlreadyReported);
        }

        match self.backend.report_init_error(report).await {
            Ok(()) => info!("Init error reported"),
            Err(e) => warn!(error = %e, "Failed to report init error"),
        }
        Ok(())
    }

    /// Release the client, stopping the local substitute server if one runs.
    pub async fn close(self) -> Result<()> {
        #[cfg(feature = "local-server")]
        if let Some(server) = self.local_server {
            server.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RuntimeClient");
        s.field("polled", &self.has_polled()).field(
            "init_error_reported",
            &self.init_error_reported.load(Ordering::SeqCst),
        );
        #[cfg(feature = "local-server")]
        s.field("local_server", &self.local_server);
        s.finish()
    }
}
