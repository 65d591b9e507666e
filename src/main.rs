//! Keyring Failover
//!
//! Runs requests against a key-per-path data API through a pool of API keys,
//! then prints each outcome and the resulting credential health.

use anyhow::{Context, Result};
use clap::Parser;
use keyring_failover::{
    config::Settings,
    logging::{self, LogFormat},
    services::{CredentialPool, HttpTransport, RequestExecutor, RequestSpec},
    utils::presets,
    ExecutorError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Keyring Failover
///
/// Sends requests through a rotating pool of API keys with health tracking
/// and retry backoff. Keys come from KEYRING_API_KEYS.
#[derive(Parser, Debug)]
#[command(name = "keyring-failover")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint path below the base URL, e.g. hslt/list
    #[arg(required_unless_present = "snapshot_only")]
    endpoint: Option<String>,

    /// Query parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Number of times to send the request
    #[arg(short = 'n', long, default_value_t = 1)]
    repeat: u32,

    /// Base URL of the upstream API (overrides KEYRING_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides KEYRING_LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (overrides KEYRING_LOG_FORMAT)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Fail on the first transient error instead of backing off
    #[arg(long)]
    no_retry: bool,

    /// Only print the initial credential health and exit
    #[arg(long)]
    snapshot_only: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration first (before logging, so we can use log_level)
    let mut settings = Settings::load()?;

    // Override settings with CLI arguments
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(log_format) = args.log_format {
        settings.log_format = log_format;
    }
    settings.validate()?;

    logging::init_tracing(&settings.log_level, settings.log_format)?;

    for warning in settings.warnings() {
        tracing::warn!("{}", warning);
    }

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        base_url = %settings.base_url,
        credentials = settings.api_keys.len(),
        "Starting application"
    );

    let pool = Arc::new(CredentialPool::new(
        settings.api_keys.iter().map(|key| key.expose().to_string()),
        settings.thresholds,
    )?);

    if args.snapshot_only {
        print_health(&pool)?;
        return Ok(());
    }

    let transport = HttpTransport::new(settings.base_url.clone(), settings.request_timeout())
        .context("Failed to build HTTP client")?;
    let backoff = if args.no_retry {
        presets::no_retry()
    } else {
        settings.retry.backoff_policy()
    };
    let executor = RequestExecutor::new(Arc::clone(&pool), transport, backoff);

    // Cancel in-flight work on Ctrl+C
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling");
                cancel.cancel();
            }
        }
    });

    let mut request = RequestSpec::new(args.endpoint.unwrap_or_default());
    for (key, value) in args.params {
        request = request.with_param(key, value);
    }

    let mut failure: Option<ExecutorError> = None;
    for _ in 0..args.repeat.max(1) {
        match executor.execute_with_cancel(&request, &cancel).await {
            Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
            Err(err) => {
                tracing::error!(error = %err, "Request failed");
                failure = Some(err);
                break;
            }
        }
    }

    print_health(&pool)?;

    if let Some(err) = failure {
        let code = match &err {
            ExecutorError::Cancelled => 130,
            e if e.is_exhaustion() => 3,
            _ => 1,
        };
        eprintln!("error: {}", err);
        std::process::exit(code);
    }

    tracing::info!("Application shutdown complete");

    Ok(())
}

fn print_health(pool: &CredentialPool) -> Result<()> {
    let report = serde_json::json!({
        "stats": pool.stats(),
        "credentials": pool.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
