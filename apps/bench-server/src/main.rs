use anyhow::{Context, Result};
use bench_server::{cli, config, db, routes, state};
use bench_server::services::ingest::IngestService;
use bench_server::services::timeline::TimelineUpdater;
use bench_server::services::validity::StatsCache;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr).await.with_context(|| {
        format!(
            "bench-server cannot listen on {addr}; if another ingest server owns the port, pick a free one with --port"
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ServerConfig::from_env();
    let pool = db::connect_lazy(&config.database_url)?;
    db::ensure_schema(&pool).await?;

    let stats_cache = Arc::new(StatsCache::new(config.cache_invalidation_delay));
    let timeline = config
        .timeline_enabled
        .then(|| TimelineUpdater::new(pool.clone(), config.bootstrap_replicates));
    let ingest = Arc::new(IngestService::new(
        pool.clone(),
        timeline.clone(),
        stats_cache.clone(),
    ));

    let cancel = CancellationToken::new();
    if let Some(updater) = &timeline {
        updater.start(cancel.clone());
        match updater.recover_pending_jobs().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "re-enqueued persisted timeline jobs"),
            Err(err) => tracing::warn!("failed to recover timeline jobs: {err:#}"),
        }
    }

    let state = state::AppState {
        config: config.clone(),
        db: pool,
        ingest,
        stats_cache,
    };

    let app = routes::router(state);
    let listener = bind_listener(&args.host, args.port).await?;
    tracing::info!(host = %args.host, port = args.port, "bench-server listening");
    axum::serve(listener, app).await?;

    if let Some(updater) = &timeline {
        updater.shutdown().await;
    }
    cancel.cancel();
    Ok(())
}
