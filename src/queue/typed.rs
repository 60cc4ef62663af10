//! Typed wrapper around the byte queue.
//!
//! [`TypedQueue`] serializes values with `serde_json` before enqueueing and
//! decodes them on the way out, so producers and consumers exchange domain
//! types instead of raw byte strings. [`handler`] adapts a typed async
//! function into a stream handler that decodes the payload before invoking
//! it.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::stream::{HandlerFuture, StreamHandler};

use super::{Notification, Queue, QueueError};

/// Errors that can occur on a typed queue.
#[derive(Debug, Error)]
pub enum TypedQueueError {
    /// The underlying queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for typed queue operations.
pub type Result<T> = std::result::Result<T, TypedQueueError>;

/// A view over a [`Queue`] that speaks `T` instead of bytes.
pub struct TypedQueue<T> {
    queue: Arc<Queue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedQueue<T> {
    fn clone(&self) -> Self {
        TypedQueue {
            queue: Arc::clone(&self.queue),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedQueue<T> {
    /// Wraps a byte queue.
    pub fn new(queue: Arc<Queue>) -> Self {
        TypedQueue {
            queue,
            _marker: PhantomData,
        }
    }

    /// Encodes `value` and appends it at the tail.
    pub fn put(&self, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.queue.put(&encoded)?;
        Ok(())
    }

    /// Decodes and returns the head without removing it.
    pub fn head(&self) -> Result<T> {
        let bytes = self.queue.head()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Removes the head. A no-op on an empty queue.
    pub fn remove(&self) -> Result<()> {
        self.queue.remove()?;
        Ok(())
    }

    /// See [`Queue::empty`].
    pub fn empty(&self) -> bool {
        self.queue.empty()
    }

    /// See [`Queue::size`].
    pub fn size(&self) -> i64 {
        self.queue.size()
    }

    /// Handle to the bus that pulses on every successful put.
    pub fn on_created(&self) -> &Notification {
        self.queue.on_created()
    }

    /// The underlying byte queue.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

/// Adapts an `async fn(T) -> anyhow::Result<()>` into a [`StreamHandler`]
/// that decodes each payload before invoking it.
///
/// A payload that fails to decode is a handler error, so the configured
/// strategy decides whether it is retried or dropped.
pub fn handler<T, F, Fut>(f: F) -> Box<dyn StreamHandler>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let wrapped = move |value: T| -> HandlerFuture { Box::pin(f(value)) };
    Box::new(DecodeHandler {
        f: wrapped,
        _marker: PhantomData,
    })
}

struct DecodeHandler<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F> StreamHandler for DecodeHandler<T, F>
where
    T: DeserializeOwned + Send + Sync,
    F: Fn(T) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, _cancel: &CancellationToken, data: &[u8]) -> anyhow::Result<()> {
        let value: T = serde_json::from_slice(data).context("decode queued payload")?;
        (self.f)(value).await
    }
}
