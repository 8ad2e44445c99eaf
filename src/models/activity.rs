// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Canonical activity records and their child rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Velocity samples at or below this (m/s) are treated as standing still.
pub const MIN_MOVING_VELOCITY: f64 = 0.3;

/// Stored activity, unique per (source, source_activity_id).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: i64,
    pub user_id: i64,
    /// Provider tag, e.g. "STRAVA"
    pub source: String,
    pub source_activity_id: i64,
    pub sport_type: String,
    pub start_time: DateTime<Utc>,
    pub timezone: Option<String>,
    /// Distance in meters
    pub distance: f64,
    /// Seconds
    pub moving_time: i64,
    /// Seconds
    pub elapsed_time: i64,
    pub avg_hr: Option<i32>,
    pub max_hr: Option<i32>,
    /// Meters
    pub elevation_gain: Option<f64>,
    /// Derived seconds per kilometer
    pub avg_pace: Option<i32>,

    // Best-effort enrichment, filled by the weather source when configured.
    pub weather_temp: Option<f64>,
    pub weather_humidity: Option<i32>,
    pub weather_wind_speed: Option<f64>,
    pub weather_precip_type: Option<String>,
    pub weather_sky: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    /// UTC calendar date used for daily aggregation.
    pub fn stat_date(&self) -> NaiveDate {
        self.start_time.date_naive()
    }

    pub fn apply_weather(&mut self, weather: &Weather, now: DateTime<Utc>) {
        self.weather_temp = weather.temp;
        self.weather_humidity = weather.humidity;
        self.weather_wind_speed = weather.wind_speed;
        self.weather_precip_type = weather.precip_type.clone();
        self.weather_sky = weather.sky.clone();
        self.updated_at = now;
    }

    /// Pace from totals, when both distance and moving time are positive.
    pub fn fallback_pace(&self) -> Option<i32> {
        if self.moving_time > 0 && self.distance > 0.0 {
            Some((self.moving_time as f64 / (self.distance / 1000.0)) as i32)
        } else {
            None
        }
    }
}

/// Mutable fields written by an ingestion upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub user_id: i64,
    pub source: String,
    pub source_activity_id: i64,
    pub sport_type: String,
    pub start_time: DateTime<Utc>,
    pub timezone: Option<String>,
    pub distance: f64,
    pub moving_time: i64,
    pub elapsed_time: i64,
    pub avg_hr: Option<i32>,
    pub max_hr: Option<i32>,
    pub elevation_gain: Option<f64>,
}

impl NewActivity {
    /// Materialize a fresh row (store assigns the id).
    pub fn into_activity(self, id: i64, now: DateTime<Utc>) -> Activity {
        Activity {
            id,
            user_id: self.user_id,
            source: self.source,
            source_activity_id: self.source_activity_id,
            sport_type: self.sport_type,
            start_time: self.start_time,
            timezone: self.timezone,
            distance: self.distance,
            moving_time: self.moving_time,
            elapsed_time: self.elapsed_time,
            avg_hr: self.avg_hr,
            max_hr: self.max_hr,
            elevation_gain: self.elevation_gain,
            avg_pace: None,
            weather_temp: None,
            weather_humidity: None,
            weather_wind_speed: None,
            weather_precip_type: None,
            weather_sky: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the mutable fields of an existing row in place.
    pub fn apply_to(self, existing: &mut Activity, now: DateTime<Utc>) {
        existing.user_id = self.user_id;
        existing.sport_type = self.sport_type;
        existing.start_time = self.start_time;
        existing.timezone = self.timezone;
        existing.distance = self.distance;
        existing.moving_time = self.moving_time;
        existing.elapsed_time = self.elapsed_time;
        existing.avg_hr = self.avg_hr;
        existing.max_hr = self.max_hr;
        existing.elevation_gain = self.elevation_gain;
        existing.updated_at = now;
    }
}

/// Lap row, keyed by (activity_id, lap_index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lap {
    pub activity_id: i64,
    pub lap_index: i32,
    pub distance: f64,
    pub moving_time: i64,
    pub avg_hr: Option<i32>,
    pub avg_cadence: Option<f64>,
    pub elevation_gain: Option<f64>,
}

/// Keyed time-series blob for one activity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityStreams {
    pub activity_id: i64,
    pub user_id: i64,
    /// Streams keyed by type, as returned with `key_by_type=true`
    #[sqlx(json)]
    pub streams: serde_json::Value,
    /// Sorted stream keys
    pub stream_keys: Vec<String>,
    /// Length of the `time` series, when present
    pub sample_count: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityStreams {
    pub fn new(
        activity_id: i64,
        user_id: i64,
        streams: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stream_keys: Vec<String> = streams
            .as_object()
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        stream_keys.sort();

        let sample_count = streams
            .get("time")
            .and_then(|t| t.get("data"))
            .and_then(|d| d.as_array())
            .map(|d| d.len() as i32);

        Self {
            activity_id,
            user_id,
            streams,
            stream_keys,
            sample_count,
            updated_at: now,
        }
    }

    /// Pace from the smoothed velocity series, ignoring near-stationary samples.
    pub fn velocity_pace(&self) -> Option<i32> {
        let data = self
            .streams
            .get("velocity_smooth")
            .and_then(|v| v.get("data"))
            .and_then(|d| d.as_array())?;

        let moving: Vec<f64> = data
            .iter()
            .filter_map(|v| v.as_f64())
            .filter(|v| *v > MIN_MOVING_VELOCITY)
            .collect();

        if moving.is_empty() {
            return None;
        }

        let mean = moving.iter().sum::<f64>() / moving.len() as f64;
        Some((1000.0 / mean) as i32)
    }
}

/// Surface observation near an activity's start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    /// Degrees Celsius
    pub temp: Option<f64>,
    /// Percent
    pub humidity: Option<i32>,
    /// Meters per second
    pub wind_speed: Option<f64>,
    /// NONE, RAIN, SLEET or SNOW
    pub precip_type: Option<String>,
    pub sky: Option<String>,
}

/// Kind of provider payload kept in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Activity,
    Laps,
    Streams,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Activity => "activity",
            PayloadType::Laps => "laps",
            PayloadType::Streams => "streams",
        }
    }
}

/// Append-only copy of a fetched provider payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub user_id: i64,
    pub provider: String,
    pub source_activity_id: i64,
    pub payload_type: PayloadType,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}
