use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::admission::{Admission, AdmissionGuard, RequestInfo};
use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::context::RequestContext;
use turnstile::metrics::{MetricsCollector, MetricsSnapshot, Monitor, Violator};
use turnstile::ratelimit::{CounterStore, Policy, RateLimiter};
use turnstile::sweeper::CleanupTask;

#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Fixed-window request admission controller")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the limiter and its cleanup task until interrupted
    Serve,
    /// Read `path origin [identity]` lines from stdin and print a decision for each
    Replay {
        /// Number of top violators to report at the end
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

/// Everything a running limiter needs, wired from configuration.
struct Runtime {
    limiter: Arc<RateLimiter>,
    monitor: Arc<Monitor>,
    guard: AdmissionGuard<RateLimiter>,
    cleanup_interval: Duration,
}

impl Runtime {
    fn from_config(config: &TurnstileConfig) -> Self {
        let rl = &config.rate_limiting;
        let store = Arc::new(CounterStore::new());
        let limiter = Arc::new(
            RateLimiter::new(store)
                .with_default_limit(rl.default.requests)
                .with_count_denied(rl.count_denied),
        );
        let monitor = Arc::new(Monitor::new(Arc::new(MetricsCollector::new())));
        let guard = AdmissionGuard::new(limiter.clone(), Policy::from_config(rl), monitor.clone())
            .with_headers(rl.include_headers);

        Self {
            limiter,
            monitor,
            guard,
            cleanup_interval: Duration::from_secs(rl.cleanup_interval_secs),
        }
    }
}

#[derive(Serialize)]
struct ReplayLine<'a> {
    request_id: &'a str,
    path: &'a str,
    origin: &'a str,
    #[serde(flatten)]
    admission: &'a Admission,
    headers: Vec<(&'static str, String)>,
}

#[derive(Serialize)]
struct Summary {
    metrics: MetricsSnapshot,
    top_violators: Vec<Violator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        key_strategy = %config.rate_limiting.key_strategy,
        default_limit = config.rate_limiting.default.requests,
        default_window_secs = config.rate_limiting.default.window_secs,
        exempt_paths = config.rate_limiting.exempt_paths.len(),
        "Configuration loaded"
    );

    let runtime = Runtime::from_config(&config);
    let shutdown = CancellationToken::new();
    let cleanup = CleanupTask::spawn(
        runtime.limiter.clone(),
        runtime.monitor.clone(),
        runtime.cleanup_interval,
        shutdown.child_token(),
    );

    match cli.command {
        Command::Serve => {
            shutdown_signal().await;
            cleanup.shutdown().await;

            let ctx = RequestContext::background();
            let snapshot = runtime.monitor.get_metrics(&ctx);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Replay { top } => {
            let result = replay(&runtime, &shutdown).await;
            cleanup.shutdown().await;
            result?;

            let summary = Summary {
                metrics: runtime.monitor.collector().snapshot(),
                top_violators: runtime.monitor.current_top_violators(top),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Feed stdin lines through the admission guard.
async fn replay(runtime: &Runtime, shutdown: &CancellationToken) -> anyhow::Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    while let Some(line) = lines.next().await {
        let line = line?;
        let mut fields = line.split_whitespace();
        let (Some(path), Some(origin)) = (fields.next(), fields.next()) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Skipping malformed line");
            }
            continue;
        };
        let identity = fields.next();

        let request_id = uuid::Uuid::new_v4().to_string();
        let ctx = RequestContext::with_token(shutdown.child_token()).with_request_id(&request_id);

        let req = RequestInfo {
            path,
            origin,
            identity,
        };
        let admission = runtime.guard.check(&ctx, &req).await?;
        let output = ReplayLine {
            request_id: &request_id,
            path,
            origin,
            headers: runtime.guard.headers(&admission),
            admission: &admission,
        };
        println!("{}", serde_json::to_string(&output)?);
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
