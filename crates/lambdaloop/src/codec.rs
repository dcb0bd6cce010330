// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire codec for the control-plane HTTP protocol.
//!
//! All paths are relative to [`API_PREFIX`]:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | next invocation | `GET /invocation/next` |
//! | response | `POST /invocation/{id}/response` |
//! | streaming response | same, with [`headers::RESPONSE_MODE`] and error trailers |
//! | error | `POST /invocation/{id}/error` |
//! | init error | `POST /init/error` |

use std::convert::Infallible;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

use crate::error::{Result, RuntimeError};
use crate::types::{ErrorReport, Invocation};

/// Version prefix of the control-plane API.
pub const API_PREFIX: &str = "/2018-06-01/runtime";

/// Body type of every request sent to the control plane.
pub type RequestBody = BoxBody<Bytes, Infallible>;

/// Header names used by the protocol.
pub mod headers {
    pub const REQUEST_ID: &str = "lambda-runtime-aws-request-id";
    pub const DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
    pub const INVOKED_FUNCTION_ARN: &str = "lambda-runtime-invoked-function-arn";
    pub const TRACE_ID: &str = "lambda-runtime-trace-id";
    pub const CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
    pub const COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";

    /// Marks a response request as streamed.
    pub const RESPONSE_MODE: &str = "lambda-runtime-function-response-mode";
    pub const RESPONSE_MODE_STREAMING: &str = "streaming";

    /// Error type, sent as a header on error reports and as a trailer on streams.
    pub const ERROR_TYPE: &str = "lambda-runtime-function-error-type";
    /// Base64 of the JSON error report, sent as a trailer on streams.
    pub const ERROR_BODY: &str = "lambda-runtime-function-error-body";
}

/// Fully qualified `http://host:port` base of the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    authority: String,
}

impl Endpoint {
    /// Create an endpoint for `host:port`.
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    /// The `host:port` this endpoint targets.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn uri(&self, path: &str) -> Result<Uri> {
        format!("http://{}{}{}", self.authority, API_PREFIX, path)
            .parse()
            .map_err(|e| RuntimeError::Config(format!("invalid control plane uri: {}", e)))
    }

    pub fn encode_next_request(&self) -> Result<Request<RequestBody>> {
        build(
            Request::builder()
                .method(Method::GET)
                .uri(self.uri("/invocation/next")?),
            empty(),
        )
    }

    pub fn encode_response(&self, request_id: &str, body: Bytes) -> Result<Request<RequestBody>> {
        build(
            Request::builder()
                .method(Method::POST)
                .uri(self.uri(&format!("/invocation/{}/response", request_id))?),
            full(body),
        )
    }

    /// Start of a streamed response.
    ///
    /// The body is produced incrementally by the caller: data frames from
    /// [`encode_streaming_chunk`], optionally ended by a trailer frame from
    /// [`encode_streaming_error`]. Ending the body without a trailer is a
    /// successful end of stream.
    pub fn encode_streaming_response_start(
        &self,
        request_id: &str,
        body: RequestBody,
    ) -> Result<Request<RequestBody>> {
        build(
            Request::builder()
                .method(Method::POST)
                .uri(self.uri(&format!("/invocation/{}/response", request_id))?)
                .header(headers::RESPONSE_MODE, headers::RESPONSE_MODE_STREAMING)
                .header(http::header::TRANSFER_ENCODING, "chunked")
                .header(
                    http::header::TRAILER,
                    format!("{}, {}", headers::ERROR_TYPE, headers::ERROR_BODY),
                )
                .header(http::header::CONTENT_TYPE, "application/octet-stream"),
            body,
        )
    }

    pub fn encode_error(
        &self,
        request_id: &str,
        report: &ErrorReport,
    ) -> Result<Request<RequestBody>> {
        self.json_error(&format!("/invocation/{}/error", request_id), report)
    }

    pub fn encode_init_error(&self, report: &ErrorReport) -> Result<Request<RequestBody>> {
        self.json_error("/init/error", report)
    }

    fn json_error(&self, path: &str, report: &ErrorReport) -> Result<Request<RequestBody>> {
        let json = serde_json::to_vec(report)?;
        build(
            Request::builder()
                .method(Method::POST)
                .uri(self.uri(path)?)
                .header(http::header::CONTENT_TYPE, "application/json")
                .header(headers::ERROR_TYPE, header_safe(&report.error_type)),
            full(Bytes::from(json)),
        )
    }
}

/// One data frame of a streamed response.
pub fn encode_streaming_chunk(chunk: Bytes) -> Frame<Bytes> {
    Frame::data(chunk)
}

/// Trailer frame that turns a streamed response into an error.
pub fn encode_streaming_error(report: &ErrorReport) -> Result<Frame<Bytes>> {
    let json = serde_json::to_vec(report)?;
    let mut trailers = HeaderMap::new();
    trailers.insert(
        headers::ERROR_TYPE,
        HeaderValue::from_str(&header_safe(&report.error_type))
            .map_err(|e| RuntimeError::Serialization(e.to_string()))?,
    );
    trailers.insert(
        headers::ERROR_BODY,
        HeaderValue::from_str(&BASE64.encode(json))
            .map_err(|e| RuntimeError::Serialization(e.to_string()))?,
    );
    Ok(Frame::trailers(trailers))
}

/// Error carried by the trailers of a streamed response, if any.
pub fn decode_streaming_error(trailers: &HeaderMap) -> Option<ErrorReport> {
    let error_type = header_str(trailers, headers::ERROR_TYPE);
    let body = header_str(trailers, headers::ERROR_BODY)
        .and_then(|raw| BASE64.decode(raw).ok())
        .and_then(|json| serde_json::from_slice::<ErrorReport>(&json).ok());

    match (body, error_type) {
        (Some(report), _) => Some(report),
        (None, Some(error_type)) => Some(ErrorReport::new(error_type, "")),
        (None, None) => None,
    }
}

/// Decode a next-invocation response.
pub fn decode_next_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Invocation> {
    if !status.is_success() {
        return Err(RuntimeError::UnexpectedStatus {
            operation: "next invocation",
            status: status.as_u16(),
        });
    }

    let request_id = header_str(headers, headers::REQUEST_ID)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            RuntimeError::MalformedInvocation(format!("missing {} header", headers::REQUEST_ID))
        })?;
    if request_id
        .chars()
        .any(|c| c == '/' || c == '?' || c == '#' || c.is_whitespace())
    {
        return Err(RuntimeError::MalformedInvocation(format!(
            "request id {:?} is not a valid path segment",
            request_id
        )));
    }

    let deadline_ms: u64 = header_str(headers, headers::DEADLINE_MS)
        .ok_or_else(|| {
            RuntimeError::MalformedInvocation(format!("missing {} header", headers::DEADLINE_MS))
        })?
        .trim()
        .parse()
        .map_err(|e| {
            RuntimeError::MalformedInvocation(format!("invalid {}: {}", headers::DEADLINE_MS, e))
        })?;

    Ok(Invocation {
        request_id: request_id.to_string(),
        deadline_ms,
        deadline: deadline_instant(deadline_ms),
        invoked_function_arn: header_str(headers, headers::INVOKED_FUNCTION_ARN)
            .unwrap_or_default()
            .to_string(),
        trace_id: header_str(headers, headers::TRACE_ID)
            .unwrap_or_default()
            .to_string(),
        client_context: header_str(headers, headers::CLIENT_CONTEXT).map(str::to_string),
        cognito_identity: header_str(headers, headers::COGNITO_IDENTITY).map(str::to_string),
        event: body,
    })
}

/// Translate an epoch deadline into the monotonic clock.
fn deadline_instant(deadline_ms: u64) -> Instant {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    Instant::now() + Duration::from_millis(deadline_ms.saturating_sub(now_ms))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Header values cannot carry control characters.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

pub(crate) fn empty() -> RequestBody {
    Full::new(Bytes::new()).boxed()
}

pub(crate) fn full(body: Bytes) -> RequestBody {
    Full::new(body).boxed()
}

fn build(builder: http::request::Builder, body: RequestBody) -> Result<Request<RequestBody>> {
    builder
        .body(body)
        .map_err(|e| RuntimeError::Serialization(format!("failed to build request: {}", e)))
}
