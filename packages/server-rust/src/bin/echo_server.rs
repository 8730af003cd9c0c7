//! Demo server: an echo endpoint behind the resilient middleware chain.
//!
//! ```text
//! curl -s localhost:8080/echo -d '{"message":"hi"}'
//! curl -i localhost:8080/status/503
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use trellis_core::{Endpoint, Error, LogKey, RequestContext, StatusError};
use trellis_server::network::{encode_json, RequestHead};
use trellis_server::service::{Breaker, BreakerConfig, ExponentialBackoff};
use trellis_server::{
    build_resilient_chain, HttpConfig, HttpEndpoint, HttpTransport, LogLayer, Server, ServerConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "echo-server", about = "Echo endpoint served over HTTP")]
struct Args {
    #[arg(long, env = "TRELLIS_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "TRELLIS_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "TRELLIS_LIVENESS_PATH", default_value = "/alivez")]
    liveness_path: String,

    #[arg(long, env = "TRELLIS_READINESS_PATH", default_value = "/readyz")]
    readiness_path: String,

    /// Serve GET /debug/status.
    #[arg(long, env = "TRELLIS_DEBUG")]
    debug: bool,

    #[arg(long, env = "TRELLIS_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, env = "TRELLIS_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// Request metadata attached to every log line, e.g. `http-method,http-x-request-id`.
    #[arg(long, env = "TRELLIS_LOG_KEYS", value_delimiter = ',')]
    log_keys: Vec<LogKey>,

    /// What the endpoint logger records: `request`, `response`, `errors`.
    #[arg(long, env = "TRELLIS_LOG_FIELDS", value_delimiter = ',', default_value = "response")]
    log_fields: Vec<String>,

    #[arg(long, env = "TRELLIS_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Maximum retries of a retryable endpoint failure.
    #[arg(long, env = "TRELLIS_RETRIES", default_value_t = 3)]
    retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Echo {
    message: String,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,trellis_server=debug,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
    }
}

/// Reads the status code from `/status/{code}`.
fn decode_status(_ctx: &RequestContext, head: &RequestHead, _body: Bytes) -> Result<StatusCode, Error> {
    let code = head
        .uri
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .parse::<u16>()?;
    StatusCode::from_u16(code).map_err(|_| Error::msg(format!("no such status {code}")))
}

async fn respond_with_status(_ctx: RequestContext, status: StatusCode) -> Result<Echo, Error> {
    if status.is_success() {
        return Ok(Echo {
            message: status.to_string(),
        });
    }
    Err(StatusError::new(status).into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let http = HttpConfig {
        host: args.host,
        port: args.port,
        liveness_path: args.liveness_path,
        readiness_path: args.readiness_path,
        enable_debug: args.debug,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        ..HttpConfig::default()
    }
    .merged_with_defaults();

    let transport = HttpTransport::new(http)
        .endpoint(HttpEndpoint::new(
            [Method::POST],
            ["/echo"],
            |_ctx, echo: Echo| async move { Ok(echo) },
        ))
        .endpoint(HttpEndpoint::with_codec(
            [Method::GET],
            ["/status/{code}"],
            Endpoint::typed(respond_with_status),
            decode_status,
            encode_json::<Echo>,
        ));

    let chain = build_resilient_chain(
        LogLayer::from_fields(args.log_fields.iter().map(String::as_str)),
        ExponentialBackoff::default()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_retries(args.retries),
        Arc::new(Breaker::new("echo", BreakerConfig::default())),
    );

    let server = Server::builder()
        .config(ServerConfig {
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            handle_signals: true,
            log_keys: args.log_keys,
        })
        .middleware(chain)
        .transport(transport)
        .shutdown_hook(|| info!("echo server shutting down"))
        .build();

    server.run(CancellationToken::new()).await?;
    info!("echo server stopped");
    Ok(())
}
