// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for lambdaloop integration tests.
//!
//! Provides a scripted mock control plane that records every request it
//! receives, plus a small HTTP helper for the local server tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use lambdaloop::codec::{API_PREFIX, decode_streaming_error, headers};
use lambdaloop::{ErrorReport, PollRetryPolicy, RuntimeConfig};

/// What the mock hands out for one `GET /invocation/next`.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// A well-formed invocation
    Invocation { request_id: String, event: Bytes },
    /// An arbitrary answer, for malformed-response tests
    Raw {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
        body: Bytes,
    },
}

/// Kind of a recorded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Next,
    Response,
    Error,
    InitError,
}

/// One request received by the mock.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub kind: Kind,
    pub request_id: Option<String>,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
    pub trailers: Option<HeaderMap>,
    pub at: Instant,
}

impl Recorded {
    /// All body bytes concatenated.
    pub fn body(&self) -> Bytes {
        Bytes::from(self.chunks.concat())
    }

    pub fn is_streamed(&self) -> bool {
        self.headers
            .get(headers::RESPONSE_MODE)
            .is_some_and(|v| v == headers::RESPONSE_MODE_STREAMING)
    }

    /// Error report carried as JSON body.
    pub fn report(&self) -> ErrorReport {
        serde_json::from_slice(&self.body()).expect("error body is not a JSON report")
    }

    /// Error report carried in streaming trailers.
    pub fn trailer_report(&self) -> Option<ErrorReport> {
        self.trailers.as_ref().and_then(decode_streaming_error)
    }
}

struct MockState {
    script_tx: tokio::sync::mpsc::UnboundedSender<Scripted>,
    script_rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Scripted>>,
    log: Mutex<Vec<Recorded>>,
    response_status: AtomicU16,
}

impl MockState {
    fn record(
        &self,
        kind: Kind,
        request_id: Option<String>,
        headers: HeaderMap,
        chunks: Vec<Bytes>,
        trailers: Option<HeaderMap>,
    ) {
        self.log.lock().unwrap().push(Recorded {
            kind,
            request_id,
            headers,
            chunks,
            trailers,
            at: Instant::now(),
        });
    }
}

/// Scripted control plane on a random local port.
pub struct MockControlPlane {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockControlPlane {
    pub async fn start() -> Self {
        let (script_tx, script_rx) = tokio::sync::mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            script_tx,
            script_rx: tokio::sync::Mutex::new(script_rx),
            log: Mutex::new(Vec::new()),
            response_status: AtomicU16::new(202),
        });

        let app = Router::new()
            .route(&format!("{API_PREFIX}/invocation/next"), get(next))
            .route(
                &format!("{API_PREFIX}/invocation/{{request_id}}/response"),
                post(response),
            )
            .route(
                &format!("{API_PREFIX}/invocation/{{request_id}}/error"),
                post(error),
            )
            .route(&format!("{API_PREFIX}/init/error"), post(init_error))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    /// Remote configuration pointing at this mock with fast retries.
    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig::remote(self.authority()).with_poll_retry(PollRetryPolicy::new(2, 5, 20))
    }

    pub fn push(&self, request_id: &str, event: &'static [u8]) {
        self.push_scripted(Scripted::Invocation {
            request_id: request_id.to_string(),
            event: Bytes::from_static(event),
        });
    }

    pub fn push_scripted(&self, scripted: Scripted) {
        self.state.script_tx.send(scripted).unwrap();
    }

    /// Status returned for response posts (default 202).
    pub fn set_response_status(&self, status: u16) {
        self.state.response_status.store(status, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<Recorded> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: Kind) -> Vec<Recorded> {
        self.log().into_iter().filter(|r| r.kind == kind).collect()
    }

    /// Wait until `count` requests of `kind` were recorded.
    pub async fn wait_for(&self, kind: Kind, count: usize) -> Vec<Recorded> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let matching = self.of_kind(kind);
            if matching.len() >= count {
                return matching;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} {kind:?} requests, log: {:?}",
                self.log()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockControlPlane {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn next(State(state): State<Arc<MockState>>, request_headers: HeaderMap) -> Response {
    state.record(Kind::Next, None, request_headers, Vec::new(), None);
    let scripted = state.script_rx.lock().await.recv().await;

    match scripted {
        Some(Scripted::Invocation { request_id, event }) => {
            let deadline = chrono::Utc::now().timestamp_millis() + 30_000;
            let mut headers = HeaderMap::new();
            headers.insert(headers::REQUEST_ID, HeaderValue::from_str(&request_id).unwrap());
            headers.insert(
                headers::DEADLINE_MS,
                HeaderValue::from_str(&deadline.to_string()).unwrap(),
            );
            headers.insert(
                headers::INVOKED_FUNCTION_ARN,
                HeaderValue::from_static("arn:aws:lambda:us-east-1:123456789012:function:mock"),
            );
            headers.insert(headers::TRACE_ID, HeaderValue::from_static("Root=1-mock"));
            (StatusCode::OK, headers, event).into_response()
        }
        Some(Scripted::Raw {
            status,
            headers: pairs,
            body,
        }) => {
            let mut headers = HeaderMap::new();
            for (name, value) in pairs {
                headers.insert(name, HeaderValue::from_str(&value).unwrap());
            }
            (status, headers, body).into_response()
        }
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn response(
    State(state): State<Arc<MockState>>,
    Path(request_id): Path<String>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let (chunks, trailers) = read_frames(request.into_body()).await;
    state.record(Kind::Response, Some(request_id), headers, chunks, trailers);
    let status = state.response_status.load(Ordering::SeqCst);
    StatusCode::from_u16(status).unwrap().into_response()
}

async fn error(
    State(state): State<Arc<MockState>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(Kind::Error, Some(request_id), headers, vec![body], None);
    StatusCode::ACCEPTED.into_response()
}

async fn init_error(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> Response {
    state.record(Kind::InitError, None, headers, vec![body], None);
    StatusCode::ACCEPTED.into_response()
}

async fn read_frames(mut body: Body) -> (Vec<Bytes>, Option<HeaderMap>) {
    let mut chunks = Vec::new();
    let mut trailers = None;
    while let Some(frame) = body.frame().await {
        let frame = frame.unwrap();
        match frame.into_data() {
            Ok(chunk) => chunks.push(chunk),
            Err(frame) => trailers = frame.into_trailers().ok(),
        }
    }
    (chunks, trailers)
}

/// POST `body` to `http://{addr}{path}`, returning status and body.
pub async fn post_bytes(addr: SocketAddr, path: &str, body: &'static [u8]) -> (StatusCode, Bytes) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = http::Request::post(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::from_static(body)))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}
