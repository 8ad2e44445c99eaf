// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod aggregation;
pub mod backfill;
pub mod ingest;
pub mod strava;
pub mod weather;
pub mod webhook;
pub mod worker;

pub use aggregation::AggregationService;
pub use backfill::{BackfillResult, BackfillService};
pub use ingest::{FetchedActivity, IngestService};
pub use strava::{ActivityFetcher, StravaClient, StravaService};
pub use weather::{KmaWeatherClient, WeatherFetcher};
pub use webhook::{IntakeOutcome, WebhookIntake};
pub use worker::{IngestWorker, TickReport};
