// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local substitute control plane.
//!
//! Serves the same operations as the real control plane on `127.0.0.1`, so a
//! function can run on a developer machine without any platform. Events are
//! submitted through a developer endpoint (`POST /invoke` by default), which
//! blocks until the runtime answers:
//!
//! | Request | Result |
//! |---------|--------|
//! | `POST /invoke` with an event body | `200` with the response body, or `500` with the JSON error report |
//! | `GET {prefix}/invocation/next` | next queued event |
//! | `POST {prefix}/invocation/{id}/response` | `202`, completes the matching `/invoke` |
//! | `POST {prefix}/invocation/{id}/error` | `202`, completes the matching `/invoke` |
//! | `POST {prefix}/init/error` | `202`, logged |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, API_PREFIX, Endpoint, headers};
use crate::error::{Result, RuntimeError};
use crate::types::ErrorReport;

/// Deadline granted to locally submitted events.
const LOCAL_DEADLINE_MS: i64 = 300_000;

/// Function ARN reported for local invocations.
pub const LOCAL_FUNCTION_ARN: &str = "arn:aws:lambda:local:000000000000:function:lambdaloop-local";

/// Result of a local invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInvokeResult {
    /// The runtime responded (fixed or streamed, concatenated)
    Response(Bytes),
    /// The runtime reported an error, possibly after streaming part of a body
    Error(ErrorReport),
}

struct QueuedEvent {
    request_id: String,
    body: Bytes,
}

struct LocalState {
    queue_tx: mpsc::UnboundedSender<QueuedEvent>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedEvent>>,
    waiting: Mutex<HashMap<String, oneshot::Sender<LocalInvokeResult>>>,
    init_error: Mutex<Option<ErrorReport>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LocalState {
    fn enqueue(&self, body: Bytes) -> (String, oneshot::Receiver<LocalInvokeResult>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(request_id.clone(), tx);
        // The receiver lives in this state, so the send cannot fail.
        let _ = self.queue_tx.send(QueuedEvent {
            request_id: request_id.clone(),
            body,
        });
        (request_id, rx)
    }

    fn complete(&self, request_id: &str, result: LocalInvokeResult) -> bool {
        match self.waiters().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<LocalInvokeResult>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A running local substitute server.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct LocalServer {
    local_addr: SocketAddr,
    invoke_path: String,
    state: Arc<LocalState>,
    shutdown_tx: watch::Sender<bool>,
    server_handle: JoinHandle<Result<()>>,
}

impl LocalServer {
    /// Bind `127.0.0.1:port` (0 picks a free port) and start serving.
    pub async fn start(port: u16, invoke_path: &str) -> Result<Self> {
        if !invoke_path.starts_with('/') || invoke_path.starts_with(API_PREFIX) {
            return Err(RuntimeError::LocalServer(format!(
                "invalid invoke path: {}",
                invoke_path
            )));
        }
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| {
                RuntimeError::LocalServer(format!("failed to bind 127.0.0.1:{}: {}", port, e))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::LocalServer(e.to_string()))?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = Arc::new(LocalState {
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            waiting: Mutex::new(HashMap::new()),
            init_error: Mutex::new(None),
            shutdown_rx: shutdown_rx.clone(),
        });

        let app = router(state.clone(), invoke_path);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
                .map_err(|e| RuntimeError::LocalServer(e.to_string()))
        });

        info!(addr = %local_addr, invoke_path, "Local control plane started");

        Ok(Self {
            local_addr,
            invoke_path: invoke_path.to_string(),
            state,
            shutdown_tx,
            server_handle,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Path of the developer invoke endpoint.
    pub fn invoke_path(&self) -> &str {
        &self.invoke_path
    }

    /// Control-plane endpoint for a runtime client talking to this server.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.to_string())
    }

    /// Submit an event without going through HTTP and wait for its result.
    pub async fn invoke(&self, event: impl Into<Bytes>) -> Result<LocalInvokeResult> {
        let (request_id, rx) = self.state.enqueue(event.into());
        rx.await.map_err(|_| {
            RuntimeError::LocalServer(format!("invocation {} abandoned", request_id))
        })
    }

    /// Init error reported by the runtime, if any.
    pub fn init_error(&self) -> Option<ErrorReport> {
        self.state
            .init_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop accepting requests and wait for in-flight ones.
    ///
    /// Invocations still waiting for a result are abandoned.
    pub async fn shutdown(self) -> Result<()> {
        info!("Local control plane shutting down...");
        let _ = self.shutdown_tx.send(true);
        self.state.waiters().clear();

        match self.server_handle.await {
            Ok(result) => {
                info!("Local control plane stopped");
                result
            }
            Err(e) => {
                error!("Local control plane task panicked: {}", e);
                Err(RuntimeError::LocalServer(format!(
                    "server task panicked: {}",
                    e
                )))
            }
        }
    }

    /// Check if the server task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}

impl std::fmt::Debug for LocalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServer")
            .field("local_addr", &self.local_addr)
            .field("invoke_path", &self.invoke_path)
            .finish()
    }
}

fn router(state: Arc<LocalState>, invoke_path: &str) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/invocation/next"), get(next_invocation))
        .route(
            &format!("{API_PREFIX}/invocation/{{request_id}}/response"),
            post(invocation_response),
        )
        .route(
            &format!("{API_PREFIX}/invocation/{{request_id}}/error"),
            post(invocation_error),
        )
        .route(&format!("{API_PREFIX}/init/error"), post(init_error))
        .route(invoke_path, post(invoke))
        .with_state(state)
}

async fn next_invocation(State(state): State<Arc<LocalState>>) -> Response {
    let mut shutdown_rx = state.shutdown_rx.clone();
    let mut queue = state.queue_rx.lock().await;
    let event = tokio::select! {
        biased;
        _ = shutdown_rx.wait_for(|stop| *stop) => None,
        event = queue.recv() => event,
    };
    let Some(event) = event else {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    };

    let deadline_ms = chrono::Utc::now().timestamp_millis() + LOCAL_DEADLINE_MS;
    let mut headers = HeaderMap::new();
    let pairs = [
        (headers::REQUEST_ID, event.request_id.clone()),
        (headers::DEADLINE_MS, deadline_ms.to_string()),
        (headers::INVOKED_FUNCTION_ARN, LOCAL_FUNCTION_ARN.to_string()),
        (headers::TRACE_ID, format!("Root=1-local-{}", event.request_id)),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    debug!(request_id = %event.request_id, event_size = event.body.len(), "Local invocation handed out");
    (StatusCode::OK, headers, event.body).into_response()
}

async fn invocation_response(
    State(state): State<Arc<LocalState>>,
    Path(request_id): Path<String>,
    request: Request,
) -> Response {
    let streamed = request
        .headers()
        .get(headers::RESPONSE_MODE)
        .is_some_and(|v| v.as_bytes() == headers::RESPONSE_MODE_STREAMING.as_bytes());

    let (data, trailers) = match read_body(request.into_body()).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(%request_id, error = %e, "Failed to read local response body");
            return (StatusCode::BAD_REQUEST, e).into_response();
        }
    };

    let result = match trailers.as_ref().and_then(codec::decode_streaming_error) {
        Some(report) => LocalInvokeResult::Error(report),
        None => LocalInvokeResult::Response(data),
    };
    debug!(%request_id, streamed, "Local invocation completed");
    acknowledge(&state, &request_id, result)
}

async fn invocation_error(
    State(state): State<Arc<LocalState>>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> Response {
    let report = parse_report(&body);
    debug!(%request_id, error_type = %report.error_type, "Local invocation failed");
    acknowledge(&state, &request_id, LocalInvokeResult::Error(report))
}

async fn init_error(State(state): State<Arc<LocalState>>, body: Bytes) -> Response {
    let report = parse_report(&body);
    error!(
        error_type = %report.error_type,
        error_message = %report.error_message,
        "Function reported an init error"
    );
    *state.init_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
    StatusCode::ACCEPTED.into_response()
}

async fn invoke(State(state): State<Arc<LocalState>>, body: Bytes) -> Response {
    let (request_id, rx) = state.enqueue(body);
    debug!(%request_id, "Local event queued");

    match rx.await {
        Ok(LocalInvokeResult::Response(body)) => (StatusCode::OK, body).into_response(),
        Ok(LocalInvokeResult::Error(report)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(report)).into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "invocation abandoned").into_response(),
    }
}

fn acknowledge(state: &LocalState, request_id: &str, result: LocalInvokeResult) -> Response {
    if state.complete(request_id, result) {
        StatusCode::ACCEPTED.into_response()
    } else {
        warn!(%request_id, "Result for unknown local invocation");
        (StatusCode::NOT_FOUND, "unknown request id").into_response()
    }
}

/// Read every frame of a request body, keeping the trailers.
async fn read_body(mut body: Body) -> std::result::Result<(Bytes, Option<HeaderMap>), String> {
    let mut data = BytesMut::new();
    let mut trailers = None;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| e.to_string())?;
        match frame.into_data() {
            Ok(chunk) => data.extend_from_slice(&chunk),
            Err(frame) => {
                if let Ok(t) = frame.into_trailers() {
                    trailers = Some(t);
                }
            }
        }
    }
    Ok((data.freeze(), trailers))
}

/// Error report from a request body; unparsable bodies are kept as the message.
fn parse_report(body: &[u8]) -> ErrorReport {
    serde_json::from_slice(body).unwrap_or_else(|_| {
        ErrorReport::new("Unknown", String::from_utf8_lossy(body).into_owned())
    })
}
