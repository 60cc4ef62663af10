//! HTTP fan-out processor: delivers one payload to N destinations.
//!
//! The processor is a [`StreamHandler`] with three delivery modes:
//!
//! - [`DeliveryMode::Everyone`]: every destination must accept the payload.
//!   The first failure cancels the in-flight peers and fails the attempt.
//! - [`DeliveryMode::AtLeastOne`]: one acceptance is enough. Failures do
//!   not cancel peers, so a slow-but-willing destination still counts.
//! - [`DeliveryMode::AtMostOnce`]: destinations are tried one at a time in
//!   random order; the first acceptance wins and nobody else sees the
//!   payload on that attempt.
//!
//! Failed attempts are reported to the dispatcher, whose strategy decides
//! when the whole fan-out runs again.

use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use reqwest::{Client, Method, StatusCode, Url};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stream::StreamHandler;

/// Errors constructing an [`HttpProcessor`].
#[derive(Debug, Error)]
pub enum HttpProcessorError {
    /// A configured destination is not a valid URL.
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The expected success code is not a valid HTTP status.
    #[error("invalid success status code: {0}")]
    InvalidStatus(u16),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Which destination successes count as overall success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// At least one destination must accept the payload.
    AtLeastOne,
    /// Every destination must accept the payload.
    Everyone,
    /// Exactly one destination receives the payload per attempt.
    AtMostOnce,
}

/// Configuration builder for an [`HttpProcessor`].
///
/// Defaults: method `POST`, success code 200, connection timeout 20s, mode
/// [`DeliveryMode::Everyone`], empty URL list. The connection timeout only
/// bounds dialing; the overall request deadline is carried by the
/// cancellation token handed to each attempt.
#[derive(Debug, Clone)]
pub struct HttpProcessorConfig {
    urls: Vec<String>,
    connection_timeout: Duration,
    method: Method,
    success: u16,
    mode: DeliveryMode,
    custom_client: Option<Client>,
}

impl Default for HttpProcessorConfig {
    fn default() -> Self {
        HttpProcessorConfig {
            urls: Vec::new(),
            connection_timeout: Duration::from_secs(20),
            method: Method::POST,
            success: 200,
            mode: DeliveryMode::Everyone,
            custom_client: None,
        }
    }
}

impl HttpProcessorConfig {
    /// Starts a builder with the default configuration.
    pub fn new() -> Self {
        HttpProcessorConfig::default()
    }

    /// Appends a destination URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    /// Appends several destination URLs.
    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(urls.into_iter().map(Into::into));
        self
    }

    /// Sets the connection (dial) timeout. Ignored when a custom client is
    /// supplied.
    pub fn timeout(mut self, connection_timeout: Duration) -> Self {
        self.connection_timeout = connection_timeout;
        self
    }

    /// Sets the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the status code treated as success.
    pub fn success(mut self, code: u16) -> Self {
        self.success = code;
        self
    }

    /// Sets the delivery mode.
    pub fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Supplies a pre-built client instead of constructing one.
    pub fn client(mut self, client: Client) -> Self {
        self.custom_client = Some(client);
        self
    }

    /// Validates the configuration and builds the processor.
    pub fn build(self) -> Result<HttpProcessor, HttpProcessorError> {
        let mut urls = Vec::with_capacity(self.urls.len());
        for raw in &self.urls {
            let parsed = Url::parse(raw).map_err(|e| HttpProcessorError::InvalidUrl {
                url: raw.clone(),
                reason: e.to_string(),
            })?;
            urls.push(parsed);
        }

        let success = StatusCode::from_u16(self.success)
            .map_err(|_| HttpProcessorError::InvalidStatus(self.success))?;

        let client = match self.custom_client {
            Some(client) => client,
            None => Client::builder()
                .connect_timeout(self.connection_timeout)
                .build()?,
        };

        Ok(HttpProcessor {
            client,
            urls,
            method: self.method,
            success,
            mode: self.mode,
        })
    }
}

/// Frozen snapshot of the fan-out configuration plus a shared client.
pub struct HttpProcessor {
    client: Client,
    urls: Vec<Url>,
    method: Method,
    success: StatusCode,
    mode: DeliveryMode,
}

#[async_trait]
impl StreamHandler for HttpProcessor {
    async fn handle(&self, cancel: &CancellationToken, data: &[u8]) -> anyhow::Result<()> {
        let payload = Bytes::copy_from_slice(data);
        match self.mode {
            DeliveryMode::AtMostOnce => self.send_shuffled(cancel, payload).await,
            mode => self.fan_out(cancel, payload, mode).await,
        }
    }
}

impl HttpProcessor {
    /// Concurrent delivery to every destination.
    ///
    /// In [`DeliveryMode::Everyone`] the first failure cancels the in-flight
    /// peers. In [`DeliveryMode::AtLeastOne`] peers always run to
    /// completion: cancelling them on a sibling's failure could abort a
    /// request that was about to succeed and force a pointless retry of the
    /// whole fan-out.
    async fn fan_out(
        &self,
        cancel: &CancellationToken,
        payload: Bytes,
        mode: DeliveryMode,
    ) -> anyhow::Result<()> {
        let child = cancel.child_token();
        let total = self.urls.len();

        let mut tasks = JoinSet::new();
        for url in self.urls.iter().cloned() {
            tasks.spawn(request_url(
                self.client.clone(),
                self.method.clone(),
                url,
                self.success,
                payload.clone(),
                child.clone(),
            ));
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => Err(anyhow!("request task failed: {join_error}")),
            };
            if let Err(e) = outcome {
                if mode == DeliveryMode::Everyone {
                    child.cancel();
                }
                errors.push(e.to_string());
            }
        }

        // No failures (including the vacuous zero-URL case) is success for
        // both concurrent modes.
        if errors.is_empty() {
            debug!(delivered = total, total, "fan-out complete");
            return Ok(());
        }
        if mode == DeliveryMode::AtLeastOne && errors.len() < total {
            debug!(
                delivered = total - errors.len(),
                total,
                "fan-out partially delivered"
            );
            return Ok(());
        }
        bail!(errors.join("; "))
    }

    /// Sequential delivery in uniformly random order; stops at the first
    /// acceptance so no other destination sees the payload this attempt.
    async fn send_shuffled(
        &self,
        cancel: &CancellationToken,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        let mut shuffled = self.urls.clone();
        shuffled.shuffle(&mut rand::thread_rng());

        let mut errors = Vec::new();
        for url in shuffled {
            let attempt = request_url(
                self.client.clone(),
                self.method.clone(),
                url,
                self.success,
                payload.clone(),
                cancel.clone(),
            )
            .await;
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) => errors.push(e.to_string()),
            }
        }

        if errors.is_empty() {
            bail!("no destination urls configured")
        } else {
            bail!(errors.join("; "))
        }
    }
}

/// Sends the payload to one URL.
///
/// The body carries the raw payload bytes with an explicit Content-Length.
/// The response body is drained so the connection can be reused; success
/// means the status code equals the configured one exactly.
async fn request_url(
    client: Client,
    method: Method,
    url: Url,
    success: StatusCode,
    payload: Bytes,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let request = client
        .request(method, url.clone())
        .header(reqwest::header::CONTENT_LENGTH, payload.len())
        .body(payload)
        .build()?;

    let response = tokio::select! {
        result = client.execute(request) => {
            result.map_err(|e| anyhow!("{url}: {e}"))?
        }
        _ = cancel.cancelled() => bail!("{url}: request cancelled"),
    };

    let status = response.status();
    let _ = response.bytes().await;
    if status != success {
        bail!("{url}: non-success code: {status}");
    }
    Ok(())
}
