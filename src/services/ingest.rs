// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Turns fetched Strava payloads into canonical rows.
//!
//! Every step is idempotent, so a job that fails halfway through converges
//! when it is retried.

use crate::db::Database;
use crate::error::AppError;
use crate::models::{Activity, ActivityStreams, Lap, PayloadType, Provider, RawPayload};
use crate::services::aggregation::{AggregationService, RefreshResult};
use crate::services::strava::{StravaActivity, StravaLap};
use crate::services::weather::WeatherFetcher;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Provider payloads for one activity, as fetched.
#[derive(Debug, Clone)]
pub struct FetchedActivity {
    pub activity: serde_json::Value,
    pub laps: Option<serde_json::Value>,
    pub streams: Option<serde_json::Value>,
}

/// What an ingest wrote.
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub activity_id: i64,
    pub lap_count: usize,
    pub has_streams: bool,
    pub has_weather: bool,
    pub refresh: RefreshResult,
}

#[derive(Clone)]
pub struct IngestService {
    db: Arc<dyn Database>,
    aggregation: AggregationService,
    weather: Option<Arc<dyn WeatherFetcher>>,
}

impl IngestService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            aggregation: AggregationService::new(db.clone()),
            db,
            weather: None,
        }
    }

    pub fn with_weather(mut self, weather: Arc<dyn WeatherFetcher>) -> Self {
        self.weather = Some(weather);
        self
    }

    /// Store raw payloads, upsert the activity, replace laps, store streams,
    /// attach weather when a source is configured, then refresh derived pace
    /// and daily stats.
    ///
    /// Laps or streams missing from `fetched` leave the stored rows in place.
    pub async fn ingest(
        &self,
        user_id: i64,
        fetched: &FetchedActivity,
    ) -> Result<IngestResult, AppError> {
        let now = Utc::now();

        let parsed: StravaActivity = serde_json::from_value(fetched.activity.clone())
            .map_err(|e| AppError::StravaApi(format!("Invalid activity payload: {}", e)))?;
        let source_activity_id = parsed.id;

        self.save_raw(user_id, source_activity_id, PayloadType::Activity, &fetched.activity)
            .await?;
        if let Some(laps) = &fetched.laps {
            self.save_raw(user_id, source_activity_id, PayloadType::Laps, laps)
                .await?;
        }
        if let Some(streams) = &fetched.streams {
            self.save_raw(user_id, source_activity_id, PayloadType::Streams, streams)
                .await?;
        }

        let new_activity = parsed.to_new_activity(user_id);
        self.db.upsert_activity(&new_activity, now).await?;

        let activity = self
            .db
            .get_activity_by_source(&new_activity.source, source_activity_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "Upserted activity {} not found",
                    source_activity_id
                ))
            })?;

        let mut lap_count = 0;
        if let Some(laps_json) = &fetched.laps {
            let laps = parse_laps(activity.id, laps_json)?;
            lap_count = laps.len();
            self.db.replace_laps(activity.id, &laps).await?;
        } else {
            tracing::debug!(activity_id = activity.id, "No laps fetched, keeping stored laps");
        }

        let has_streams = fetched.streams.is_some();
        if let Some(streams_json) = &fetched.streams {
            let streams = ActivityStreams::new(activity.id, user_id, streams_json.clone(), now);
            self.db.upsert_streams(&streams).await?;
        } else {
            tracing::debug!(
                activity_id = activity.id,
                "No streams fetched, keeping stored streams"
            );
        }

        let has_weather = self.attach_weather(&activity, now).await;

        let refresh = self.aggregation.refresh(user_id, activity.id).await?;

        tracing::info!(
            user_id,
            activity_id = activity.id,
            source_activity_id,
            lap_count,
            has_streams,
            has_weather,
            avg_pace = refresh.avg_pace,
            "Activity ingested"
        );

        Ok(IngestResult {
            activity_id: activity.id,
            lap_count,
            has_streams,
            has_weather,
            refresh,
        })
    }

    /// Best effort: a weather failure is logged and never fails the ingest.
    async fn attach_weather(&self, activity: &Activity, now: DateTime<Utc>) -> bool {
        let Some(weather) = &self.weather else {
            return false;
        };

        let observed = match weather.observe(activity.start_time).await {
            Ok(Some(observed)) => observed,
            Ok(None) => {
                tracing::debug!(activity_id = activity.id, "No weather observation available");
                return false;
            }
            Err(e) => {
                tracing::warn!(activity_id = activity.id, error = %e, "Weather lookup failed");
                return false;
            }
        };

        match self.db.update_weather(activity.id, &observed, now).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(activity_id = activity.id, error = %e, "Failed to store weather");
                false
            }
        }
    }

    async fn save_raw(
        &self,
        user_id: i64,
        source_activity_id: i64,
        payload_type: PayloadType,
        payload: &serde_json::Value,
    ) -> Result<(), AppError> {
        self.db
            .save_raw_payload(&RawPayload {
                user_id,
                provider: Provider::Strava.as_str().to_string(),
                source_activity_id,
                payload_type,
                payload: payload.clone(),
                fetched_at: Utc::now(),
            })
            .await
    }
}

/// Laps are indexed in the order Strava returns them.
fn parse_laps(activity_id: i64, laps_json: &serde_json::Value) -> Result<Vec<Lap>, AppError> {
    let laps: Vec<StravaLap> = serde_json::from_value(laps_json.clone())
        .map_err(|e| AppError::StravaApi(format!("Invalid laps payload: {}", e)))?;

    Ok(laps
        .iter()
        .enumerate()
        .map(|(idx, lap)| lap.to_lap(activity_id, idx as i32))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ActivityStore, MemoryStore, StatsStore};
    use crate::models::Weather;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedWeather(Weather);

    #[async_trait]
    impl WeatherFetcher for FixedWeather {
        async fn observe(&self, _at: DateTime<Utc>) -> Result<Option<Weather>, AppError> {
            Ok(Some(self.0.clone()))
        }
    }

    struct UnreachableWeather;

    #[async_trait]
    impl WeatherFetcher for UnreachableWeather {
        async fn observe(&self, _at: DateTime<Utc>) -> Result<Option<Weather>, AppError> {
            Err(AppError::Weather("HTTP 503 Service Unavailable".to_string()))
        }
    }

    fn fetched(distance: f64, lap_count: usize) -> FetchedActivity {
        let laps: Vec<serde_json::Value> = (0..lap_count)
            .map(|i| json!({"distance": 1000.0, "moving_time": 300 + i as i64}))
            .collect();
        FetchedActivity {
            activity: json!({
                "id": 987654,
                "sport_type": "Run",
                "start_date": "2024-03-10T06:30:00Z",
                "distance": distance,
                "moving_time": 1500,
                "elapsed_time": 1600,
                "average_heartrate": 150.0
            }),
            laps: Some(json!(laps)),
            streams: Some(json!({
                "time": {"data": [0, 1, 2]},
                "velocity_smooth": {"data": [3.0, 4.0, 5.0]}
            })),
        }
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let store = MemoryStore::new();
        let service = IngestService::new(Arc::new(store.clone()));

        let first = service.ingest(1, &fetched(5000.0, 5)).await.unwrap();
        let second = service.ingest(1, &fetched(5000.0, 3)).await.unwrap();

        assert_eq!(first.activity_id, second.activity_id);
        assert_eq!(store.activity_count().await, 1);

        // Laps reflect only the latest fetch
        let laps = store.get_laps(first.activity_id).await.unwrap();
        assert_eq!(laps.len(), 3);
        assert_eq!(
            laps.iter().map(|l| l.lap_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let stat = store.get_daily_stat(1, date).await.unwrap().unwrap();
        assert_eq!(stat.run_count, 1);
    }

    #[tokio::test]
    async fn test_ingest_records_raw_payloads_and_streams() {
        let store = MemoryStore::new();
        let service = IngestService::new(Arc::new(store.clone()));

        let result = service.ingest(1, &fetched(5000.0, 1)).await.unwrap();

        let raw = store.raw_payloads().await;
        let kinds: Vec<PayloadType> = raw.iter().map(|r| r.payload_type).collect();
        assert_eq!(
            kinds,
            vec![PayloadType::Activity, PayloadType::Laps, PayloadType::Streams]
        );

        let streams = store.get_streams(result.activity_id).await.unwrap().unwrap();
        assert_eq!(streams.sample_count, Some(3));
        assert_eq!(streams.stream_keys, vec!["time", "velocity_smooth"]);
        // mean velocity 4 m/s
        assert_eq!(result.refresh.avg_pace, Some(250));
    }

    #[tokio::test]
    async fn test_ingest_without_laps_or_streams() {
        let store = MemoryStore::new();
        let service = IngestService::new(Arc::new(store.clone()));

        let mut payload = fetched(5000.0, 0);
        payload.laps = None;
        payload.streams = None;

        let result = service.ingest(1, &payload).await.unwrap();
        assert_eq!(result.lap_count, 0);
        assert!(!result.has_streams);
        // 1500 s over 5 km
        assert_eq!(result.refresh.avg_pace, Some(300));
    }

    #[tokio::test]
    async fn test_reingest_without_laps_keeps_stored_rows() {
        let store = MemoryStore::new();
        let service = IngestService::new(Arc::new(store.clone()));

        let first = service.ingest(1, &fetched(5000.0, 3)).await.unwrap();

        let mut partial = fetched(5000.0, 0);
        partial.laps = None;
        partial.streams = None;
        service.ingest(1, &partial).await.unwrap();

        assert_eq!(store.get_laps(first.activity_id).await.unwrap().len(), 3);
        assert!(store.get_streams(first.activity_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ingest_attaches_weather() {
        let store = MemoryStore::new();
        let observed = Weather {
            temp: Some(12.5),
            humidity: Some(61),
            wind_speed: Some(3.2),
            precip_type: Some("NONE".to_string()),
            sky: None,
        };
        let service = IngestService::new(Arc::new(store.clone()))
            .with_weather(Arc::new(FixedWeather(observed)));

        let result = service.ingest(1, &fetched(5000.0, 1)).await.unwrap();
        assert!(result.has_weather);

        let activity = store.get_activity(result.activity_id).await.unwrap().unwrap();
        assert_eq!(activity.weather_temp, Some(12.5));
        assert_eq!(activity.weather_humidity, Some(61));
        assert_eq!(activity.weather_wind_speed, Some(3.2));
        assert_eq!(activity.weather_precip_type.as_deref(), Some("NONE"));
    }

    #[tokio::test]
    async fn test_weather_failure_does_not_fail_ingest() {
        let store = MemoryStore::new();
        let service = IngestService::new(Arc::new(store.clone()))
            .with_weather(Arc::new(UnreachableWeather));

        let result = service.ingest(1, &fetched(5000.0, 1)).await.unwrap();
        assert!(!result.has_weather);

        let activity = store.get_activity(result.activity_id).await.unwrap().unwrap();
        assert_eq!(activity.weather_temp, None);

        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let stat = store.get_daily_stat(1, date).await.unwrap().unwrap();
        assert_eq!(stat.run_count, 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_activity() {
        let store = MemoryStore::new();
        let service = IngestService::new(Arc::new(store.clone()));

        let payload = FetchedActivity {
            activity: json!({"message": "Record Not Found"}),
            laps: None,
            streams: None,
        };
        assert!(service.ingest(1, &payload).await.is_err());
        assert_eq!(store.activity_count().await, 0);
    }
}
