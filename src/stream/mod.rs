//! Single-consumer dispatcher that drains the queue through a handler chain.
//!
//! A [`Stream`] owns exactly one worker task. The worker waits on the
//! queue's notification bus, takes the head payload, runs the configured
//! handlers in order, consults the finish strategy, and removes the head
//! only when the strategy commits. A message is therefore delivered at
//! least once: it stays at the head across retries, crashes, and restarts
//! until a delivery attempt succeeds.
//!
//! # Lifecycle
//!
//! ```text
//! created ──start()──▶ running ──cancel or fatal──▶ stopping ──▶ done
//! ```
//!
//! The terminal result is published once and observed through
//! [`Stream::done`]; [`Stream::stop`] cancels and waits for it. A queue
//! error on head or remove is fatal and surfaces there, loudly signalling
//! storage trouble. Handler errors are never fatal; the strategy decides
//! their fate.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::queue::{Queue, QueueError};

pub mod strategy;

pub use strategy::{Delay, FinishStrategy, Ignore};

/// Errors that terminate the dispatcher.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The queue failed on head or remove; the in-flight message was not
    /// committed and will be re-attempted after a restart.
    #[error("queue error: {0}")]
    Queue(#[source] Arc<QueueError>),

    /// Cancellation was observed while a message was in flight.
    #[error("stream cancelled")]
    Cancelled,
}

/// Result type for the dispatcher's terminal state.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Boxed future returned by closure-based handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A stage in the delivery chain.
///
/// Handlers must honor cancellation promptly: the overall request deadline
/// for whatever a handler does is carried by the token.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Processes one payload. Returning an error marks the attempt failed;
    /// the finish strategy then decides between retry and commit.
    async fn handle(&self, cancel: &CancellationToken, data: &[u8]) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> StreamHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Vec<u8>) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, cancel: &CancellationToken, data: &[u8]) -> anyhow::Result<()> {
        (self.0)(cancel.clone(), data.to_vec()).await
    }
}

/// Configuration builder for a [`Stream`].
///
/// Defaults: `Delay(5s, 3s)` strategy, fresh root cancellation token, no
/// handlers. The builder is consumed by [`StreamConfig::start`]; nothing
/// can be changed afterwards.
pub struct StreamConfig {
    queue: Arc<Queue>,
    handlers: Vec<Box<dyn StreamHandler>>,
    strategy: Option<Box<dyn FinishStrategy>>,
    cancel: CancellationToken,
}

impl StreamConfig {
    /// Starts a builder for a dispatcher over `queue`.
    pub fn new(queue: Arc<Queue>) -> Self {
        StreamConfig {
            queue,
            handlers: Vec::new(),
            strategy: Some(Box::new(Delay::new(
                Duration::from_secs(5),
                Duration::from_secs(3),
            ))),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the token whose cancellation stops the dispatcher.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Appends a handler to the chain. Handlers run sequentially in the
    /// order they were added; every one must succeed for a commit.
    pub fn handle(mut self, handler: impl StreamHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Appends a boxed handler to the chain.
    pub fn handle_boxed(mut self, handler: Box<dyn StreamHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Appends a closure handler to the chain.
    pub fn process<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(CancellationToken, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped =
            move |cancel: CancellationToken, data: Vec<u8>| -> HandlerFuture {
                Box::pin(handler(cancel, data))
            };
        self.handle(FnHandler(wrapped))
    }

    /// Replaces the finish strategy.
    pub fn strategy(mut self, strategy: impl FinishStrategy + 'static) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// Removes the strategy entirely: commit on success, retry immediately
    /// and forever on failure.
    pub fn no_strategy(mut self) -> Self {
        self.strategy = None;
        self
    }

    /// Freezes the configuration and starts the worker task.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(self) -> Stream {
        let cancel = self.cancel.child_token();
        let finished = CancellationToken::new();
        let result = Arc::new(OnceLock::new());

        let worker = Worker {
            queue: self.queue,
            handlers: self.handlers,
            strategy: self.strategy,
            cancel: cancel.clone(),
        };

        let finished_signal = finished.clone();
        let result_slot = Arc::clone(&result);
        tokio::spawn(async move {
            let outcome = worker.run().await;
            if let Err(e) = &outcome {
                error!(error = %e, "stream worker terminated");
            } else {
                debug!("stream worker finished cleanly");
            }
            let _ = result_slot.set(outcome);
            finished_signal.cancel();
        });

        Stream {
            cancel,
            finished,
            result,
        }
    }
}

/// Handle to a running dispatcher.
pub struct Stream {
    cancel: CancellationToken,
    finished: CancellationToken,
    result: Arc<OnceLock<Result<()>>>,
}

impl Stream {
    /// Waits for the worker to terminate and returns its terminal state:
    /// `Ok` after a clean shutdown, the fatal error otherwise.
    ///
    /// Any number of callers may wait, before or after termination.
    pub async fn done(&self) -> Result<()> {
        self.finished.cancelled().await;
        self.result
            .get()
            .cloned()
            .expect("terminal result is set before the finished signal")
    }

    /// Cancels the worker and waits until it has terminated. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Progress {
    /// A message was committed; check for more immediately.
    Processed,
    /// Nothing to do; wait for a notification.
    Idle,
}

struct Worker {
    queue: Arc<Queue>,
    handlers: Vec<Box<dyn StreamHandler>>,
    strategy: Option<Box<dyn FinishStrategy>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self) -> Result<()> {
        let mut sub = self.queue.on_created().subscribe();
        loop {
            match self.process_pending().await? {
                Progress::Processed => {}
                Progress::Idle => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = sub.wait() => {}
                    }
                }
            }
        }
    }

    /// Drives the current head to a commit, retrying as the strategy
    /// dictates. Returns `Idle` when there is nothing to work on.
    async fn process_pending(&self) -> Result<Progress> {
        let mut last_err: Option<anyhow::Error>;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            if self.handlers.is_empty() {
                return Ok(Progress::Idle);
            }
            if self.queue.empty() {
                return Ok(Progress::Idle);
            }

            let data = match self.queue.head() {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "failed to get head from queue");
                    return Err(StreamError::Queue(Arc::new(e)));
                }
            };

            last_err = None;
            for (i, handler) in self.handlers.iter().enumerate() {
                let attempt = handler.handle(&self.cancel, &data).await;
                if self.cancel.is_cancelled() {
                    return Err(StreamError::Cancelled);
                }
                if let Err(e) = attempt {
                    warn!(
                        handler = i,
                        queue_size = self.queue.size(),
                        error = %e,
                        "handler failed"
                    );
                    last_err = Some(e);
                    break;
                }
            }

            if let Some(strategy) = &self.strategy {
                last_err = strategy.done(&self.cancel, last_err.take()).await;
            }
            if last_err.is_some() {
                // Retry the same head; any pause already happened inside
                // the strategy.
                continue;
            }

            if let Err(e) = self.queue.remove() {
                error!(error = %e, "failed to commit processed message");
                return Err(StreamError::Queue(Arc::new(e)));
            }
            return Ok(Progress::Processed);
        }
    }
}
