// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stride ingest server
//!
//! Accepts Strava webhooks and admin backfills, and runs the polling worker
//! that turns queued jobs into activities and daily stats.

use std::sync::Arc;
use stride_ingest::{
    config::Config,
    db::{Database, PgStore},
    services::{ActivityFetcher, IngestWorker, KmaWeatherClient, StravaClient, StravaService},
    AppState,
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging
    init_logging()?;

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(port = config.port, "Starting stride-ingest");

    // Connect to Postgres and make sure the schema exists
    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let db: Arc<dyn Database> = Arc::new(store);

    // Token cache and refresh locks are shared by the worker and the admin routes
    let token_cache = Arc::new(dashmap::DashMap::new());
    let refresh_locks = Arc::new(dashmap::DashMap::new());

    let strava_client = StravaClient::new(&config)?;
    let fetcher: Arc<dyn ActivityFetcher> = Arc::new(StravaService::new(
        strava_client,
        db.clone(),
        token_cache,
        refresh_locks,
    ));

    // Start the ingest worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker = IngestWorker::new(db.clone(), fetcher.clone(), &config);
    match &config.kma_auth_key {
        Some(key) => {
            worker = worker.with_weather(Arc::new(KmaWeatherClient::new(&config, key)?));
            tracing::info!("Weather enrichment enabled");
        }
        None => tracing::info!("KMA_AUTH_KEY not set, weather enrichment disabled"),
    }
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    // Build shared state and router
    let state = Arc::new(AppState::new(config.clone(), db, fetcher));
    let app = stride_ingest::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, waiting for worker");
    let _ = shutdown_tx.send(true);
    worker_handle.await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging.
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stride_ingest=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with(format)
        .init();
    Ok(())
}
