// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP backend for the control plane.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use super::{ResponseStream, RuntimeBackend};
use crate::codec::{self, Endpoint, RequestBody};
use crate::error::{Result, RuntimeError};
use crate::types::{ErrorReport, Invocation};

/// Frames buffered between the writer and the socket before `write` suspends.
const STREAM_BUFFER_FRAMES: usize = 8;

/// HTTP/1.1 backend for control-plane operations.
///
/// Holds one pooled hyper client; the dispatch loop is its only caller.
pub struct HttpBackend {
    client: Client<HttpConnector, RequestBody>,
    endpoint: Endpoint,
}

impl HttpBackend {
    /// Create a backend talking to `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, endpoint }
    }

    /// The control plane this backend talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(
        &self,
        request: Request<RequestBody>,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        send_request(&self.client, request).await
    }

    async fn send_expecting_success(
        &self,
        operation: &'static str,
        request: Request<RequestBody>,
    ) -> Result<()> {
        let (status, _, _) = self.send(request).await?;
        ensure_success(operation, status)
    }
}

#[async_trait]
impl RuntimeBackend for HttpBackend {
    #[instrument(skip(self), fields(control_plane = %self.endpoint.authority()))]
    async fn next_invocation(&self) -> Result<Invocation> {
        let request = self.endpoint.encode_next_request()?;
        let (status, headers, body) = self.send(request).await?;
        let invocation = codec::decode_next_response(status, &headers, body)?;
        debug!(request_id = %invocation.request_id, event_size = invocation.event.len(), "Invocation received");
        Ok(invocation)
    }

    #[instrument(skip(self, body), fields(body_size = body.len()))]
    async fn report_response(&self, request_id: &str, body: Bytes) -> Result<()> {
        let request = self.endpoint.encode_response(request_id, body)?;
        self.send_expecting_success("response", request).await
    }

    #[instrument(skip(self))]
    async fn start_streaming(&self, request_id: &str) -> Result<Box<dyn ResponseStream>> {
        let (frames, rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
        let body = ChannelBody { rx }.boxed();
        let request = self
            .endpoint
            .encode_streaming_response_start(request_id, body)?;

        let client = self.client.clone();
        let exchange = tokio::spawn(async move {
            let (status, _, _) = send_request(&client, request).await?;
            ensure_success("streaming response", status)
        });

        debug!("Streaming response opened");
        Ok(Box::new(HttpResponseStream {
            frames: Some(frames),
            exchange: Some(exchange),
        }))
    }

    #[instrument(skip(self, report), fields(error_type = %report.error_type))]
    async fn report_error(&self, request_id: &str, report: &ErrorReport) -> Result<()> {
        let request = self.endpoint.encode_error(request_id, report)?;
        self.send_expecting_success("error", request).await
    }

    #[instrument(skip(self, report), fields(error_type = %report.error_type))]
    async fn report_init_error(&self, report: &ErrorReport) -> Result<()> {
        let request = self.endpoint.encode_init_error(report)?;
        self.send_expecting_success("init error", request).await
    }
}

async fn send_request(
    client: &Client<HttpConnector, RequestBody>,
    request: Request<RequestBody>,
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let response = client.request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok((parts.status, parts.headers, body))
}

fn ensure_success(operation: &'static str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(RuntimeError::UnexpectedStatus {
            operation,
            status: status.as_u16(),
        })
    }
}

/// Streamed response backed by a spawned request whose body reads from a channel.
struct HttpResponseStream {
    frames: Option<mpsc::Sender<Frame<Bytes>>>,
    exchange: Option<JoinHandle<Result<()>>>,
}

impl HttpResponseStream {
    /// Close the body and wait for the control plane's answer.
    async fn complete(&mut self) -> Result<()> {
        self.frames.take();
        match self.exchange.take() {
            Some(exchange) => exchange
                .await
                .map_err(|e| RuntimeError::Transport(format!("streaming task failed: {}", e)))?,
            None => Err(RuntimeError::Transport(
                "streaming response already completed".to_string(),
            )),
        }
    }

    async fn push(&mut self, frame: Frame<Bytes>) -> Result<()> {
        let sent = match &self.frames {
            Some(frames) => frames.send(frame).await.is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        // The request ended early; its result explains why.
        match self.complete().await {
            Ok(()) => Err(RuntimeError::Transport(
                "control plane closed the streaming response".to_string(),
            )),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ResponseStream for HttpResponseStream {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.push(codec::encode_streaming_chunk(chunk)).await
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut stream = self;
        stream.complete().await
    }

    async fn fail(self: Box<Self>, report: &ErrorReport) -> Result<()> {
        let mut stream = self;
        let trailers = codec::encode_streaming_error(report)?;
        stream.push(trailers).await?;
        stream.complete().await
    }
}

/// Request body fed frame by frame through a bounded channel.
struct ChannelBody {
    rx: mpsc::Receiver<Frame<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_body_yields_frames_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let body = ChannelBody { rx };

        tx.send(Frame::data(Bytes::from_static(b"he"))).await.unwrap();
        tx.send(Frame::data(Bytes::from_static(b"llo"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap();
        assert!(collected.trailers().is_none());
        assert_eq!(&collected.to_bytes()[..], b"hello");
    }

    #[tokio::test]
    async fn test_channel_body_carries_trailers() {
        let (tx, rx) = mpsc::channel(4);
        let body = ChannelBody { rx };

        tx.send(Frame::data(Bytes::from_static(b"partial")))
            .await
            .unwrap();
        let report = ErrorReport::new("Cut", "stopped");
        tx.send(codec::encode_streaming_error(&report).unwrap())
            .await
            .unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(codec::decode_streaming_error(&trailers), Some(report));
        assert_eq!(&collected.to_bytes()[..], b"partial");
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_transport_error() {
        // Port 9 (discard) is almost never listening on loopback.
        let backend = HttpBackend::new(Endpoint::new("127.0.0.1:9"));
        let err = backend.next_invocation().await.unwrap_err();
        assert!(err.is_transient(), "expected transport error, got {err:?}");
    }

    #[test]
    fn test_ensure_success() {
        assert!(ensure_success("response", StatusCode::ACCEPTED).is_ok());
        let err = ensure_success("response", StatusCode::PAYLOAD_TOO_LARGE).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::UnexpectedStatus {
                operation: "response",
                status: 413
            }
        ));
    }
}
