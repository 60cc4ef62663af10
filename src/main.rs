//! Durable HTTP relay - main entry point.
//!
//! This binary runs the ingress HTTP server that queues incoming payloads
//! and the stream dispatcher that forwards each of them to the configured
//! destination URLs until delivery succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wal_relay::processor::HttpProcessorConfig;
use wal_relay::queue::Queue;
use wal_relay::server::{AppState, build_router};
use wal_relay::storage::DiskMap;
use wal_relay::stream::{Delay, StreamConfig};

/// Durable write-ahead HTTP relay.
///
/// Accepts payloads on a local HTTP endpoint, stores them in an on-disk
/// queue, and forwards each one to every destination URL until delivery
/// succeeds.
#[derive(Debug, Parser)]
#[command(name = "http-relay", version)]
struct RelayArgs {
    /// Delay between delivery attempts after a failure.
    #[arg(long, env = "DELAY", default_value = "5s", value_parser = humantime::parse_duration)]
    delay: Duration,

    /// Additional random pause in [0, jitter) added to the delay.
    #[arg(long, env = "JITTER", default_value = "2s", value_parser = humantime::parse_duration)]
    jitter: Duration,

    /// Destination URLs (repeatable; comma-separated in the environment).
    #[arg(
        short = 'u',
        long = "url",
        env = "URL",
        value_delimiter = ',',
        required = true
    )]
    urls: Vec<String>,

    /// Connection timeout for outgoing requests.
    #[arg(short = 't', long, env = "TIMEOUT", default_value = "20s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// HTTP method for outgoing requests.
    #[arg(short = 'm', long, env = "METHOD", default_value = "POST")]
    method: String,

    /// Status code treated as a successful delivery.
    #[arg(short = 's', long, env = "SUCCESS", default_value_t = 200)]
    success: u16,

    /// Ingress bind address.
    #[arg(short = 'b', long, env = "BIND", default_value = "localhost:9876")]
    bind: String,

    /// Queue directory path.
    #[arg(short = 'q', long = "queue", env = "QUEUE", default_value = "queue.dat")]
    queue: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wal_relay=info,http_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match RelayArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let method = match reqwest::Method::from_bytes(args.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            eprintln!("invalid HTTP method: {}", args.method);
            std::process::exit(1);
        }
    };

    info!(
        queue = %args.queue.display(),
        bind = %args.bind,
        urls = ?args.urls,
        "starting relay"
    );

    let storage = match DiskMap::open(&args.queue) {
        Ok(storage) => storage,
        Err(e) => {
            error!(error = %e, path = %args.queue.display(), "failed to open queue storage");
            std::process::exit(1);
        }
    };
    let queue = match Queue::new(Box::new(storage)) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!(error = %e, "failed to reconstruct queue");
            std::process::exit(1);
        }
    };

    let processor = match HttpProcessorConfig::new()
        .urls(args.urls.clone())
        .timeout(args.timeout)
        .method(method)
        .success(args.success)
        .build()
    {
        Ok(processor) => processor,
        Err(e) => {
            error!(error = %e, "invalid processor configuration");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let stream = StreamConfig::new(Arc::clone(&queue))
        .cancel_token(cancel.clone())
        .handle(processor)
        .strategy(Delay::new(args.delay, args.jitter))
        .start();

    let app = build_router(AppState::new(Arc::clone(&queue)));
    let listener = match tokio::net::TcpListener::bind(args.bind.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, bind = %args.bind, "failed to bind ingress address");
            std::process::exit(1);
        }
    };
    info!("server available on {}", args.bind);

    let server_cancel = cancel.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let mut exit_code = 0;
    let mut server_finished = false;
    tokio::select! {
        _ = cancel.cancelled() => {
            info!("application interrupted by signal");
        }
        result = stream.done() => {
            match result {
                Ok(()) => info!("stream processor stopped"),
                Err(e) => {
                    error!(error = %e, "stream processor failed");
                    exit_code = 1;
                }
            }
        }
        result = &mut server_task => {
            server_finished = true;
            match result {
                Ok(Ok(())) => info!("http server stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "http server failed");
                    exit_code = 1;
                }
                Err(e) => {
                    error!(error = %e, "http server task failed");
                    exit_code = 1;
                }
            }
        }
    }

    cancel.cancel();
    if !server_finished {
        // Graceful shutdown started when the token was cancelled; give
        // in-flight ingress requests five seconds to finish.
        if tokio::time::timeout(Duration::from_secs(5), &mut server_task)
            .await
            .is_err()
        {
            server_task.abort();
        }
    }
    stream.stop().await;
    if let Err(e) = queue.close() {
        error!(error = %e, "failed to close queue storage");
    }
    info!("finished");
    std::process::exit(exit_code);
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let args = RelayArgs::try_parse_from(["http-relay", "--url", "http://localhost:8080/"])
            .unwrap();

        assert_eq!(args.delay, Duration::from_secs(5));
        assert_eq!(args.jitter, Duration::from_secs(2));
        assert_eq!(args.timeout, Duration::from_secs(20));
        assert_eq!(args.method, "POST");
        assert_eq!(args.success, 200);
        assert_eq!(args.bind, "localhost:9876");
        assert_eq!(args.queue, PathBuf::from("queue.dat"));
    }

    #[test]
    fn urls_are_required() {
        assert!(RelayArgs::try_parse_from(["http-relay"]).is_err());
    }

    #[test]
    fn repeated_url_flags_accumulate() {
        let args = RelayArgs::try_parse_from([
            "http-relay",
            "--url",
            "http://a/",
            "--url",
            "http://b/",
        ])
        .unwrap();
        assert_eq!(args.urls, vec!["http://a/", "http://b/"]);
    }
}
