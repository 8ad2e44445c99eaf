// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Best-effort weather enrichment from the KMA (Korea Meteorological
//! Administration) API hub.
//!
//! Uses the ultra-short-term nowcast, which publishes an observation every
//! hour on the hour that becomes queryable at 40 minutes past.

use crate::config::Config;
use crate::error::AppError;
use crate::models::Weather;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;

const ULTRA_SRT_NCST: &str = "/getUltraSrtNcst";

/// Forecast grid cell for central Seoul.
pub const DEFAULT_NX: i32 = 60;
pub const DEFAULT_NY: i32 = 127;

/// Minutes past the hour after which that hour's observation is published.
const NCST_PUBLISH_MINUTE: u32 = 40;

const KST_OFFSET_HOURS: i64 = 9;

/// KMA header code for an empty result.
const RESULT_NO_DATA: &str = "03";

/// Source of a weather observation for an activity.
#[async_trait]
pub trait WeatherFetcher: Send + Sync {
    /// Observation closest to `at`, or `None` if the source has nothing for it.
    async fn observe(&self, at: DateTime<Utc>) -> Result<Option<Weather>, AppError>;
}

/// KMA API hub client.
#[derive(Clone)]
pub struct KmaWeatherClient {
    http: reqwest::Client,
    base_url: String,
    auth_key: String,
    nx: i32,
    ny: i32,
}

impl KmaWeatherClient {
    pub fn new(config: &Config, auth_key: &str) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: config.kma_api_base_url.trim_end_matches('/').to_string(),
            auth_key: auth_key.to_string(),
            nx: DEFAULT_NX,
            ny: DEFAULT_NY,
        })
    }
}

#[async_trait]
impl WeatherFetcher for KmaWeatherClient {
    async fn observe(&self, at: DateTime<Utc>) -> Result<Option<Weather>, AppError> {
        let (base_date, base_time) = ncst_base(at);
        let url = format!("{}{}", self.base_url, ULTRA_SRT_NCST);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("authKey", self.auth_key.clone()),
                ("numOfRows", "10".to_string()),
                ("pageNo", "1".to_string()),
                ("dataType", "JSON".to_string()),
                ("base_date", base_date.clone()),
                ("base_time", base_time.clone()),
                ("nx", self.nx.to_string()),
                ("ny", self.ny.to_string()),
            ])
            .send()
            .await
            .map_err(|e| AppError::Weather(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Weather(format!("HTTP {}: {}", status, body)));
        }

        let envelope: NcstEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::Weather(format!("JSON parse error: {}", e)))?;

        tracing::debug!(%base_date, %base_time, "KMA nowcast fetched");
        parse_ncst(envelope)
    }
}

/// `(base_date, base_time)` of the latest nowcast published by `at`, in KST.
fn ncst_base(at: DateTime<Utc>) -> (String, String) {
    let mut local: NaiveDateTime = (at + Duration::hours(KST_OFFSET_HOURS)).naive_utc();
    if local.minute() < NCST_PUBLISH_MINUTE {
        local -= Duration::hours(1);
    }
    (
        local.format("%Y%m%d").to_string(),
        local.format("%H00").to_string(),
    )
}

#[derive(Debug, Deserialize)]
struct NcstEnvelope {
    response: NcstResponse,
}

#[derive(Debug, Deserialize)]
struct NcstResponse {
    header: NcstHeader,
    #[serde(default)]
    body: Option<NcstBody>,
}

#[derive(Debug, Deserialize)]
struct NcstHeader {
    #[serde(rename = "resultCode")]
    result_code: String,
    #[serde(rename = "resultMsg", default)]
    result_msg: String,
}

#[derive(Debug, Deserialize)]
struct NcstBody {
    items: NcstItems,
}

#[derive(Debug, Deserialize)]
struct NcstItems {
    #[serde(default)]
    item: Vec<NcstItem>,
}

#[derive(Debug, Deserialize)]
struct NcstItem {
    category: String,
    /// Sent as a string, occasionally as a number.
    #[serde(rename = "obsrValue")]
    obsr_value: serde_json::Value,
}

impl NcstItem {
    fn value(&self) -> Option<f64> {
        match &self.obsr_value {
            serde_json::Value::String(s) => s.trim().parse().ok(),
            v => v.as_f64(),
        }
    }
}

fn parse_ncst(envelope: NcstEnvelope) -> Result<Option<Weather>, AppError> {
    let NcstResponse { header, body } = envelope.response;
    match header.result_code.as_str() {
        "00" => {}
        RESULT_NO_DATA => return Ok(None),
        code => {
            return Err(AppError::Weather(format!(
                "KMA result {}: {}",
                code, header.result_msg
            )))
        }
    }

    let items = body.map(|b| b.items.item).unwrap_or_default();
    if items.is_empty() {
        return Ok(None);
    }

    let mut weather = Weather {
        temp: None,
        humidity: None,
        wind_speed: None,
        precip_type: None,
        sky: None,
    };
    for item in &items {
        let Some(value) = item.value() else {
            continue;
        };
        match item.category.as_str() {
            "T1H" => weather.temp = Some(value),
            "REH" => weather.humidity = Some(value.round() as i32),
            "WSD" => weather.wind_speed = Some(value),
            "PTY" => weather.precip_type = Some(precip_type(value as i32).to_string()),
            _ => {}
        }
    }
    // The nowcast carries no sky state.
    Ok(Some(weather))
}

fn precip_type(code: i32) -> &'static str {
    match code {
        1 | 5 => "RAIN",
        2 | 6 => "SLEET",
        3 | 7 => "SNOW",
        _ => "NONE",
    }
}
