// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stride_ingest::config::Config;
use stride_ingest::db::MemoryStore;
use stride_ingest::error::AppError;
use stride_ingest::routes::create_router;
use stride_ingest::services::strava::StravaActivitySummary;
use stride_ingest::services::ActivityFetcher;
use stride_ingest::AppState;

/// Check if a Postgres database is available via environment variable.
#[allow(dead_code)]
pub fn database_available() -> bool {
    std::env::var("DATABASE_URL").is_ok()
}

/// Skip test with message if no database is configured.
#[macro_export]
macro_rules! require_database {
    () => {
        if !crate::common::database_available() {
            eprintln!("⚠️  Skipping: DATABASE_URL not set");
            return;
        }
    };
}

/// Detailed activity payload shaped like Strava's.
#[allow(dead_code)]
pub fn activity_json(id: i64, start_date: &str, distance: f64, moving_time: i64) -> Value {
    json!({
        "id": id,
        "type": "Run",
        "sport_type": "Run",
        "start_date": start_date,
        "timezone": "(GMT+09:00) Asia/Seoul",
        "distance": distance,
        "moving_time": moving_time,
        "elapsed_time": moving_time + 60,
        "average_heartrate": 148.0,
        "max_heartrate": 171.0,
        "total_elevation_gain": 35.0
    })
}

/// In-process provider with canned payloads.
#[derive(Default)]
pub struct FakeFetcher {
    activities: Mutex<HashMap<i64, Value>>,
    laps: Mutex<HashMap<i64, Value>>,
    streams: Mutex<HashMap<i64, Value>>,
    failures: Mutex<HashMap<i64, String>>,
    listing: Mutex<Vec<i64>>,
}

#[allow(dead_code)]
impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_activity(&self, id: i64, payload: Value) {
        self.activities.lock().unwrap().insert(id, payload);
    }

    pub fn set_laps(&self, id: i64, payload: Value) {
        self.laps.lock().unwrap().insert(id, payload);
    }

    pub fn set_streams(&self, id: i64, payload: Value) {
        self.streams.lock().unwrap().insert(id, payload);
    }

    /// Make every fetch for `id` fail with a provider error.
    pub fn fail(&self, id: i64, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(id, message.to_string());
    }

    pub fn recover(&self, id: i64) {
        self.failures.lock().unwrap().remove(&id);
    }

    /// Activity IDs returned by `list_activities`, newest first.
    pub fn set_listing(&self, ids: Vec<i64>) {
        *self.listing.lock().unwrap() = ids;
    }

    fn check(&self, id: i64) -> Result<(), AppError> {
        match self.failures.lock().unwrap().get(&id) {
            Some(msg) => Err(AppError::StravaApi(msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ActivityFetcher for FakeFetcher {
    async fn fetch_activity(&self, _user_id: i64, activity_id: i64) -> Result<Value, AppError> {
        self.check(activity_id)?;
        self.activities
            .lock()
            .unwrap()
            .get(&activity_id)
            .cloned()
            .ok_or_else(|| AppError::StravaApi("HTTP 404 Not Found: {}".to_string()))
    }

    async fn fetch_laps(&self, _user_id: i64, activity_id: i64) -> Result<Option<Value>, AppError> {
        self.check(activity_id)?;
        Ok(self.laps.lock().unwrap().get(&activity_id).cloned())
    }

    async fn fetch_streams(
        &self,
        _user_id: i64,
        activity_id: i64,
    ) -> Result<Option<Value>, AppError> {
        self.check(activity_id)?;
        Ok(self.streams.lock().unwrap().get(&activity_id).cloned())
    }

    async fn list_activities(
        &self,
        _user_id: i64,
        _after: Option<i64>,
        _before: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<StravaActivitySummary>, AppError> {
        let listing = self.listing.lock().unwrap();
        let start = ((page.max(1) - 1) * per_page) as usize;
        Ok(listing
            .iter()
            .skip(start)
            .take(per_page as usize)
            .map(|&id| StravaActivitySummary { id })
            .collect())
    }
}

/// Everything a router test needs a handle on.
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub store: MemoryStore,
    pub fetcher: Arc<FakeFetcher>,
}

/// Create a test app on the in-memory store and a fake provider.
#[allow(dead_code)]
pub fn create_test_app() -> TestApp {
    create_test_app_with_config(Config::test_default())
}

#[allow(dead_code)]
pub fn create_test_app_with_config(config: Config) -> TestApp {
    let store = MemoryStore::new();
    let fetcher = Arc::new(FakeFetcher::new());

    let state = Arc::new(AppState::new(
        config,
        Arc::new(store.clone()),
        fetcher.clone(),
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
        fetcher,
    }
}
