// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-use response writer bound to one invocation.
//!
//! A writer starts `Open` and reaches `Finished` exactly once, through
//! [`finish`](ResponseWriter::finish), [`write_and_finish`](ResponseWriter::write_and_finish)
//! or [`report_error`](ResponseWriter::report_error). Every operation on a
//! finished writer fails with [`RuntimeError::WriterClosed`] and sends nothing.
//!
//! Nothing goes on the wire until the first operation. A
//! `write_and_finish` (or `finish`) on an untouched writer sends a single
//! fixed response; the first `write` opens a streamed response instead.
//!
//! # Errors after streaming
//!
//! Bytes already streamed cannot be retracted. A `report_error` after one or
//! more `write` calls ends the stream with an error trailer, and the control
//! plane treats the truncated stream plus trailer as an error response.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::backend::{ResponseStream, RuntimeBackend};
use crate::error::{HandlerError, Result, RuntimeError};

/// How a writer reached `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterOutcome {
    /// A normal (fixed or streamed) response was delivered
    Responded,
    /// An error report was sent instead of a response
    ErrorReported,
    /// Delivering the response failed
    Failed,
}

enum WriterState {
    Open {
        stream: Option<Box<dyn ResponseStream>>,
    },
    Finished(WriterOutcome),
}

/// Writer for the response of one invocation.
pub struct ResponseWriter {
    request_id: String,
    backend: Arc<dyn RuntimeBackend>,
    state: WriterState,
    chunks_written: usize,
    delivery_failure: Option<RuntimeError>,
}

impl ResponseWriter {
    pub(crate) fn new(request_id: impl Into<String>, backend: Arc<dyn RuntimeBackend>) -> Self {
        Self {
            request_id: request_id.into(),
            backend,
            state: WriterState::Open { stream: None },
            chunks_written: 0,
            delivery_failure: None,
        }
    }

    /// Request id this writer is bound to.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, WriterState::Finished(_))
    }

    /// Terminal outcome, `None` while the writer is open.
    pub fn outcome(&self) -> Option<WriterOutcome> {
        match self.state {
            WriterState::Open { .. } => None,
            WriterState::Finished(outcome) => Some(outcome),
        }
    }

    /// Number of chunks streamed so far.
    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }

    /// Stream one chunk.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let chunk = chunk.into();
        let stream = match &mut self.state {
            WriterState::Open { stream } => stream,
            WriterState::Finished(_) => return Err(closed(&self.request_id)),
        };

        let mut open = match stream.take() {
            Some(open) => open,
            None => match self.backend.start_streaming(&self.request_id).await {
                Ok(open) => open,
                Err(e) => return Err(self.poison(e)),
            },
        };
        let sent = open.send_chunk(chunk).await;
        *stream = Some(open);

        match sent {
            Ok(()) => {
                self.chunks_written += 1;
                Ok(())
            }
            Err(e) => Err(self.poison(e)),
        }
    }

    /// End the response without further data.
    pub async fn finish(&mut self) -> Result<()> {
        let stream = self.begin_terminal()?;
        let result = match stream {
            Some(stream) => stream.finish().await,
            None => {
                self.backend
                    .report_response(&self.request_id, Bytes::new())
                    .await
            }
        };
        self.settle(result)
    }

    /// Send the final bytes and end the response.
    pub async fn write_and_finish(&mut self, body: impl Into<Bytes>) -> Result<()> {
        let body = body.into();
        let stream = self.begin_terminal()?;
        let result = match stream {
            Some(mut stream) => match stream.send_chunk(body).await {
                Ok(()) => {
                    self.chunks_written += 1;
                    stream.finish().await
                }
                Err(e) => Err(e),
            },
            None => self.backend.report_response(&self.request_id, body).await,
        };
        self.settle(result)
    }

    /// Report the invocation as failed instead of responding.
    ///
    /// Delivery is best-effort: a failure to send the report is logged and
    /// the writer still finishes.
    pub async fn report_error(&mut self, error: impl Into<HandlerError>) -> Result<()> {
        let report = error.into().to_report();
        let stream = self.begin_terminal()?;
        let streamed = stream.is_some();
        let result = match stream {
            Some(stream) => stream.fail(&report).await,
            None => self.backend.report_error(&self.request_id, &report).await,
        };

        if let Err(e) = result {
            warn!(
                request_id = %self.request_id,
                error_type = %report.error_type,
                error = %e,
                "Failed to report invocation error"
            );
        } else {
            debug!(
                request_id = %self.request_id,
                error_type = %report.error_type,
                streamed,
                "Invocation error reported"
            );
        }
        self.state = WriterState::Finished(WriterOutcome::ErrorReported);
        Ok(())
    }

    /// Transport failure that happened while delivering the response, if any.
    pub(crate) fn take_delivery_failure(&mut self) -> Option<RuntimeError> {
        self.delivery_failure.take()
    }

    /// Move out of `Open`, handing back the stream if one was opened.
    fn begin_terminal(&mut self) -> Result<Option<Box<dyn ResponseStream>>> {
        let previous = std::mem::replace(
            &mut self.state,
            WriterState::Finished(WriterOutcome::Failed),
        );
        match previous {
            WriterState::Open { stream } => Ok(stream),
            finished @ WriterState::Finished(_) => {
                self.state = finished;
                Err(closed(&self.request_id))
            }
        }
    }

    fn settle(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = WriterState::Finished(WriterOutcome::Responded);
                debug!(request_id = %self.request_id, chunks = self.chunks_written, "Response delivered");
                Ok(())
            }
            Err(e) => Err(self.poison(e)),
        }
    }

    /// A failed delivery finishes the writer; transport failures are kept
    /// for the dispatcher because the invocation cannot be re-run safely.
    fn poison(&mut self, err: RuntimeError) -> RuntimeError {
        self.state = WriterState::Finished(WriterOutcome::Failed);
        if err.is_transient() {
            self.delivery_failure = Some(err.clone());
        }
        warn!(request_id = %self.request_id, error = %err, "Response delivery failed");
        err
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("request_id", &self.request_id)
            .field("outcome", &self.outcome())
            .field("chunks_written", &self.chunks_written)
            .finish()
    }
}

fn closed(request_id: &str) -> RuntimeError {
    RuntimeError::WriterClosed {
        request_id: request_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Recorded, RecordingBackend};
    use crate::types::ErrorReport;

    fn writer(backend: &Arc<RecordingBackend>) -> ResponseWriter {
        ResponseWriter::new("req-1", backend.clone() as Arc<dyn RuntimeBackend>)
    }

    #[tokio::test]
    async fn test_write_and_finish_sends_fixed_response() {
        let backend = Arc::new(RecordingBackend::new());
        let mut w = writer(&backend);

        w.write_and_finish("hello").await.unwrap();

        assert_eq!(w.outcome(), Some(WriterOutcome::Responded));
        assert_eq!(
            backend.log(),
            vec![Recorded::Response {
                request_id: "req-1".into(),
                body: Bytes::from_static(b"hello"),
            }]
        );
    }

    #[tokio::test]
    async fn test_streamed_chunks_keep_order() {
        let backend = Arc::new(RecordingBackend::new());
        let mut w = writer(&backend);

        for c in ["h", "e", "l", "l", "o"] {
            w.write(c).await.unwrap();
        }
        w.finish().await.unwrap();

        let chunks: Vec<Bytes> = backend
            .log()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Chunk { chunk, .. } => Some(chunk),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.concat(), b"hello");
        assert_eq!(w.chunks_written(), 5);
        assert!(matches!(
            backend.log().last(),
            Some(Recorded::StreamFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_finish_untouched_writer_sends_empty_response() {
        let backend = Arc::new(RecordingBackend::new());
        let mut w = writer(&backend);

        w.finish().await.unwrap();

        assert_eq!(
            backend.log(),
            vec![Recorded::Response {
                request_id: "req-1".into(),
                body: Bytes::new(),
            }]
        );
    }

    #[tokio::test]
    async fn test_operations_after_finish_fail_without_traffic() {
        let backend = Arc::new(RecordingBackend::new());
        let mut w = writer(&backend);
        w.write_and_finish("done").await.unwrap();
        let before = backend.log().len();

        assert!(matches!(
            w.write("more").await,
            Err(RuntimeError::WriterClosed { .. })
        ));
        assert!(matches!(
            w.write_and_finish("more").await,
            Err(RuntimeError::WriterClosed { .. })
        ));
        assert!(matches!(
            w.finish().await,
            Err(RuntimeError::WriterClosed { .. })
        ));
        assert!(matches!(
            w.report_error(HandlerError::new("Late", "too late")).await,
            Err(RuntimeError::WriterClosed { .. })
        ));

        assert_eq!(backend.log().len(), before);
        assert_eq!(w.outcome(), Some(WriterOutcome::Responded));
    }

    #[tokio::test]
    async fn test_report_error_before_streaming() {
        let backend = Arc::new(RecordingBackend::new());
        let mut w = writer(&backend);

        w.report_error(HandlerError::new("Invalid", "bad input"))
            .await
            .unwrap();

        assert_eq!(w.outcome(), Some(WriterOutcome::ErrorReported));
        assert_eq!(
            backend.log(),
            vec![Recorded::Error {
                request_id: "req-1".into(),
                report: ErrorReport::new("Invalid", "bad input"),
            }]
        );
    }

    #[tokio::test]
    async fn test_report_error_after_streaming_uses_trailer() {
        let backend = Arc::new(RecordingBackend::new());
        let mut w = writer(&backend);

        w.write("partial").await.unwrap();
        w.report_error(HandlerError::new("Upstream", "cut off"))
            .await
            .unwrap();

        let log = backend.log();
        assert!(matches!(
            log.last(),
            Some(Recorded::StreamFailed { report, .. }) if report.error_type == "Upstream"
        ));
        assert!(!log.iter().any(|r| matches!(r, Recorded::Error { .. })));
    }

    #[tokio::test]
    async fn test_report_error_delivery_failure_still_finishes() {
        let backend = Arc::new(RecordingBackend::failing_deliveries());
        let mut w = writer(&backend);

        w.report_error(HandlerError::new("Invalid", "bad input"))
            .await
            .unwrap();

        assert_eq!(w.outcome(), Some(WriterOutcome::ErrorReported));
        assert!(w.take_delivery_failure().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_poisons_writer() {
        let backend = Arc::new(RecordingBackend::failing_deliveries());
        let mut w = writer(&backend);

        let err = w.write_and_finish("hello").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(w.outcome(), Some(WriterOutcome::Failed));
        assert!(w.take_delivery_failure().is_some());
        assert!(matches!(
            w.write("again").await,
            Err(RuntimeError::WriterClosed { .. })
        ));
    }
}
