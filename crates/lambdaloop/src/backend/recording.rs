// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backend that scripts invocations and records every report.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ResponseStream, RuntimeBackend};
use crate::error::{Result, RuntimeError};
use crate::types::{ErrorReport, Invocation};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    Next,
    Response { request_id: String, body: Bytes },
    StreamOpened { request_id: String },
    Chunk { request_id: String, chunk: Bytes },
    StreamFinished { request_id: String },
    StreamFailed { request_id: String, report: ErrorReport },
    Error { request_id: String, report: ErrorReport },
    InitError(ErrorReport),
}

#[derive(Default)]
pub(crate) struct RecordingBackend {
    script: Mutex<VecDeque<Result<Invocation>>>,
    log: Arc<Mutex<Vec<Recorded>>>,
    fail_deliveries: bool,
}

impl RecordingBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Responses, stream chunks and error reports fail with a transport error.
    pub(crate) fn failing_deliveries() -> Self {
        Self {
            fail_deliveries: true,
            ..Self::default()
        }
    }

    pub(crate) fn push(&self, invocation: Invocation) {
        self.script.lock().unwrap().push_back(Ok(invocation));
    }

    pub(crate) fn push_failure(&self, error: RuntimeError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub(crate) fn log(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: Recorded) {
        self.log.lock().unwrap().push(entry);
    }

    fn delivery(&self) -> Result<()> {
        if self.fail_deliveries {
            Err(RuntimeError::Transport("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

pub(crate) fn invocation(request_id: &str, event: &'static [u8]) -> Invocation {
    Invocation {
        request_id: request_id.to_string(),
        deadline_ms: 0,
        deadline: Instant::now() + Duration::from_secs(30),
        invoked_function_arn: "arn:aws:lambda:us-east-1:000000000000:function:test".to_string(),
        trace_id: String::new(),
        client_context: None,
        cognito_identity: None,
        event: Bytes::from_static(event),
    }
}

#[async_trait]
impl RuntimeBackend for RecordingBackend {
    async fn next_invocation(&self) -> Result<Invocation> {
        self.record(Recorded::Next);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            // Nothing scripted: behave like an idle control plane.
            None => futures::future::pending().await,
        }
    }

    async fn report_response(&self, request_id: &str, body: Bytes) -> Result<()> {
        self.delivery()?;
        self.record(Recorded::Response {
            request_id: request_id.to_string(),
            body,
        });
        Ok(())
    }

    async fn start_streaming(&self, request_id: &str) -> Result<Box<dyn ResponseStream>> {
        self.record(Recorded::StreamOpened {
            request_id: request_id.to_string(),
        });
        Ok(Box::new(RecordingStream {
            request_id: request_id.to_string(),
            log: self.log.clone(),
            fail_deliveries: self.fail_deliveries,
        }))
    }

    async fn report_error(&self, request_id: &str, report: &ErrorReport) -> Result<()> {
        self.delivery()?;
        self.record(Recorded::Error {
            request_id: request_id.to_string(),
            report: report.clone(),
        });
        Ok(())
    }

    async fn report_init_error(&self, report: &ErrorReport) -> Result<()> {
        self.record(Recorded::InitError(report.clone()));
        Ok(())
    }
}

struct RecordingStream {
    request_id: String,
    log: Arc<Mutex<Vec<Recorded>>>,
    fail_deliveries: bool,
}

#[async_trait]
impl ResponseStream for RecordingStream {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        if self.fail_deliveries {
            return Err(RuntimeError::Transport("broken pipe".to_string()));
        }
        self.log.lock().unwrap().push(Recorded::Chunk {
            request_id: self.request_id.clone(),
            chunk,
        });
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().push(Recorded::StreamFinished {
            request_id: self.request_id.clone(),
        });
        Ok(())
    }

    async fn fail(self: Box<Self>, report: &ErrorReport) -> Result<()> {
        self.log.lock().unwrap().push(Recorded::StreamFailed {
            request_id: self.request_id.clone(),
            report: report.clone(),
        });
        Ok(())
    }
}
