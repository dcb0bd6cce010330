// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler interface and adapters.
//!
//! [`Handler`] is the one interface the dispatcher knows: raw event bytes in,
//! results out through the [`ResponseWriter`]. The adapters here layer the
//! common shapes on top of it:
//!
//! - [`handler_fn`]: an async closure returning the full response body
//! - [`json_handler`]: an async closure over typed, JSON-encoded input and output

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::Context;
use crate::error::HandlerError;
use crate::types::InvocationMetadata;
use crate::writer::ResponseWriter;

/// Error type for events the JSON adapter cannot decode.
pub const INVALID_EVENT_ERROR_TYPE: &str = "InvalidEvent";

/// Error type for results the JSON adapter cannot encode.
pub const INVALID_RESPONSE_ERROR_TYPE: &str = "InvalidResponse";

/// User logic invoked once per invocation.
///
/// The handler must finish `writer` (respond or report an error). If it
/// returns `Ok` with the writer still open the dispatcher reports an
/// unhandled-invocation error; if it returns `Err` with the writer open, that
/// error is reported.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        context: &Context,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        context: &Context,
    ) -> Result<(), HandlerError> {
        (**self).handle(event, writer, context).await
    }
}

/// Handler built from an async function returning the whole response body.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a [`Handler`] that sends its result with `write_and_finish`.
///
/// ```ignore
/// let handler = handler_fn(|event: Bytes, _meta| async move {
///     Ok::<_, HandlerError>(event)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Bytes, InvocationMetadata) -> Fut,
    Fut: Future,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut, R, E> Handler for HandlerFn<F>
where
    F: Fn(Bytes, InvocationMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Into<Bytes> + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        context: &Context,
    ) -> Result<(), HandlerError> {
        let output = (self.f)(event, context.metadata().clone())
            .await
            .map_err(Into::into)?;
        writer.write_and_finish(output).await?;
        Ok(())
    }
}

/// Handler that decodes the event as JSON, calls a typed function and
/// encodes its result as JSON.
pub struct JsonHandler<F, In> {
    f: F,
    _input: PhantomData<fn(In)>,
}

/// Wrap a typed async function as a [`Handler`].
pub fn json_handler<F, Fut, In>(f: F) -> JsonHandler<F, In>
where
    F: Fn(In, InvocationMetadata) -> Fut,
    Fut: Future,
{
    JsonHandler {
        f,
        _input: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, In, Out, E> Handler for JsonHandler<F, In>
where
    F: Fn(In, InvocationMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        context: &Context,
    ) -> Result<(), HandlerError> {
        let input: In = serde_json::from_slice(&event)
            .map_err(|e| HandlerError::new(INVALID_EVENT_ERROR_TYPE, e.to_string()))?;
        let output = (self.f)(input, context.metadata().clone())
            .await
            .map_err(Into::into)?;
        let body = serde_json::to_vec(&output)
            .map_err(|e| HandlerError::new(INVALID_RESPONSE_ERROR_TYPE, e.to_string()))?;
        writer.write_and_finish(body).await?;
        Ok(())
    }
}
