//! Vigil - infrastructure monitoring poller
//!
//! Polls configured backends on a schedule and serves their health with:
//! - Per-source caches that keep the last good value through failures
//! - A scheduler with per-node minimum intervals and failure backoff
//! - Stale-while-revalidate host resolution
//! - Prometheus metrics

mod api;
mod cache;
mod config;
mod error;
mod metrics;
mod polling;
mod sources;

use crate::api::AppState;
use crate::cache::StaleCache;
use crate::config::Config;
use crate::metrics::create_metrics;
use crate::polling::PollingRegistry;
use crate::sources::{node_for_target, HostResolver};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Vigil - infrastructure monitoring poller
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about = "Infrastructure monitoring poller", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Server port (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting vigil v{}", env!("CARGO_PKG_VERSION"));

    // Load config (CLI port overrides env var)
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let metrics = create_metrics()?;

    let resolver = HostResolver::new(
        StaleCache::with_metrics("dns", config.dns.refresh_lock_timeout, metrics.clone()),
        config.dns.fresh_for,
        config.dns.stale_grace,
    );

    let registry = Arc::new(PollingRegistry::with_metrics(
        config.polling.tick_interval,
        metrics.clone(),
    ));

    for target in &config.targets {
        let node = match node_for_target(target, &config.polling, &resolver) {
            Ok(node) => node,
            Err(e) => {
                error!(node = %target.name, kind = %target.kind, error = %e, "Skipping target");
                continue;
            }
        };
        // Rejections are logged by the registry and only affect this node
        let _ = registry.try_add(node);
    }

    if registry.is_empty() {
        warn!("No monitor targets registered; set MONITOR_TARGETS=kind:name=address,...");
    }

    let poller = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run().await })
    };

    // Names nobody asks for again would otherwise stay cached forever
    let sweeper = {
        let resolver = resolver.clone();
        let every = config
            .dns
            .stale_grace
            .max(config.dns.fresh_for)
            .max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = resolver.evict_expired();
                if evicted > 0 {
                    info!(evicted, "Evicted expired host lookups");
                }
            }
        })
    };

    let app = api::router(AppState {
        registry: registry.clone(),
        metrics: metrics.clone(),
    })
    .layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(
        nodes = registry.len(),
        "Listening on http://{} (Nodes: /nodes, Metrics: /metrics, Health: /health)",
        addr
    );

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, initiating graceful shutdown...");
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    let report = registry.shutdown(config.polling.shutdown_grace).await;
    if let Err(e) = poller.await {
        error!(error = %e, "Polling loop ended abnormally");
    }
    sweeper.abort();

    info!(
        completed = report.completed,
        abandoned = report.abandoned,
        "Vigil shutdown complete"
    );
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::new(format!("vigil={},tower_http=info,hyper=warn", level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}
