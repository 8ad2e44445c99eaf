// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Stride ingest: durable Strava activity ingestion.
//!
//! Webhook pushes and admin backfills become rows in a job queue. A polling
//! worker claims due jobs, fetches the activity from Strava, upserts it and
//! folds it into per-day statistics.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use config::Config;
use db::Database;
use services::{ActivityFetcher, BackfillService, WebhookIntake};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Arc<dyn Database>,
    pub intake: WebhookIntake,
    pub backfill: BackfillService,
}

impl AppState {
    pub fn new(config: Config, db: Arc<dyn Database>, fetcher: Arc<dyn ActivityFetcher>) -> Self {
        Self {
            intake: WebhookIntake::new(db.clone()),
            backfill: BackfillService::new(db.clone(), fetcher),
            config,
            db,
        }
    }
}
