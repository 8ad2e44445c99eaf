// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Strava API client for fetching activities.
//!
//! Handles:
//! - Activity, lap and stream fetching
//! - Paginated activity listing for backfill
//! - Token refresh before expiry
//! - Rate limit detection (surfaced to the job queue as a retryable failure)

use crate::config::Config;
use crate::error::AppError;
use crate::models::{Lap, NewActivity, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

/// Streams requested for every activity.
pub const STREAM_KEYS: &str = "time,distance,latlng,altitude,velocity_smooth,heartrate,cadence";

/// Strava API client.
#[derive(Clone)]
pub struct StravaClient {
    http: reqwest::Client,
    base_url: String,
    oauth_url: String,
    client_id: String,
    client_secret: String,
}

impl StravaClient {
    /// Create a new Strava client from configuration.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: config.strava_api_base_url.trim_end_matches('/').to_string(),
            oauth_url: config.strava_oauth_url.clone(),
            client_id: config.strava_client_id.clone(),
            client_secret: config.strava_client_secret.clone(),
        })
    }

    /// Get a detailed activity by ID.
    pub async fn get_activity(
        &self,
        access_token: &str,
        activity_id: i64,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/activities/{}", self.base_url, activity_id);
        self.get_json(&url, access_token, &[]).await
    }

    /// Get laps for an activity. `None` if Strava has none to give (404).
    pub async fn get_laps(
        &self,
        access_token: &str,
        activity_id: i64,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let url = format!("{}/activities/{}/laps", self.base_url, activity_id);
        self.get_json_optional(&url, access_token, &[]).await
    }

    /// Get streams keyed by type. `None` if the activity has no streams (404).
    pub async fn get_streams(
        &self,
        access_token: &str,
        activity_id: i64,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let url = format!("{}/activities/{}/streams", self.base_url, activity_id);
        self.get_json_optional(
            &url,
            access_token,
            &[("keys", STREAM_KEYS.to_string()), ("key_by_type", "true".to_string())],
        )
        .await
    }

    /// List activities for backfill (paginated).
    pub async fn list_activities(
        &self,
        access_token: &str,
        after: Option<i64>,
        before: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<StravaActivitySummary>, AppError> {
        let url = format!("{}/athlete/activities", self.base_url);

        let mut query = vec![
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        self.get_json(&url, access_token, &query).await
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenRefreshResponse, AppError> {
        let response = self
            .http
            .post(&self.oauth_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| AppError::StravaApi(format!("Token refresh request failed: {}", e)))?;

        Self::parse_json(Self::check_response(response).await?).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let response = self.send_get(url, access_token, query).await?;
        Self::parse_json(Self::check_response(response).await?).await
    }

    async fn get_json_optional<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, AppError> {
        let response = self.send_get(url, access_token, query).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_json(Self::check_response(response).await?)
            .await
            .map(Some)
    }

    async fn send_get(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, AppError> {
        self.http
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::StravaApi(e.to_string()))
    }

    /// Check response status and return error if not successful.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!("Strava rate limit hit (429)");
            return Err(AppError::StravaApi(AppError::STRAVA_RATE_LIMIT.to_string()));
        }

        // Token may be expired or revoked
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::StravaApi(AppError::STRAVA_TOKEN_ERROR.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(AppError::StravaApi(format!("HTTP {}: {}", status, body)))
    }

    async fn parse_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, AppError> {
        response
            .json()
            .await
            .map_err(|e| AppError::StravaApi(format!("JSON parse error: {}", e)))
    }
}

/// Token refresh response from Strava.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default)]
    pub athlete: Option<StravaAthleteRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StravaAthleteRef {
    pub id: i64,
}

/// Detailed Strava activity response (the fields ingestion keeps).
#[derive(Debug, Clone, Deserialize)]
pub struct StravaActivity {
    pub id: i64,
    #[serde(default)]
    pub sport_type: Option<String>,
    #[serde(rename = "type", default)]
    pub activity_type: Option<String>,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub moving_time: i64,
    #[serde(default)]
    pub elapsed_time: i64,
    #[serde(default)]
    pub average_heartrate: Option<f64>,
    #[serde(default)]
    pub max_heartrate: Option<f64>,
    #[serde(default)]
    pub total_elevation_gain: Option<f64>,
}

impl StravaActivity {
    pub fn to_new_activity(&self, user_id: i64) -> NewActivity {
        let sport_type = self
            .sport_type
            .clone()
            .or_else(|| self.activity_type.clone())
            .unwrap_or_else(|| "Run".to_string());

        NewActivity {
            user_id,
            source: Provider::Strava.as_str().to_string(),
            source_activity_id: self.id,
            sport_type,
            start_time: self.start_date,
            timezone: self.timezone.clone(),
            distance: self.distance,
            moving_time: self.moving_time,
            elapsed_time: self.elapsed_time,
            avg_hr: self.average_heartrate.map(|hr| hr as i32),
            max_hr: self.max_heartrate.map(|hr| hr as i32),
            elevation_gain: self.total_elevation_gain,
        }
    }
}

/// Lap as returned by `/activities/{id}/laps`.
#[derive(Debug, Clone, Deserialize)]
pub struct StravaLap {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub moving_time: i64,
    #[serde(default)]
    pub average_heartrate: Option<f64>,
    #[serde(default)]
    pub average_cadence: Option<f64>,
    #[serde(default)]
    pub total_elevation_gain: Option<f64>,
}

impl StravaLap {
    pub fn to_lap(&self, activity_id: i64, lap_index: i32) -> Lap {
        Lap {
            activity_id,
            lap_index,
            distance: self.distance,
            moving_time: self.moving_time,
            avg_hr: self.average_heartrate.map(|hr| hr as i32),
            avg_cadence: self.average_cadence,
            elevation_gain: self.total_elevation_gain,
        }
    }
}

/// Summary activity for list endpoints. Backfill only needs the ID; the
/// worker fetches the detailed activity.
#[derive(Debug, Clone, Deserialize)]
pub struct StravaActivitySummary {
    pub id: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// ActivityFetcher - what the worker and backfill need from a provider
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticated access to a user's provider activities.
#[async_trait]
pub trait ActivityFetcher: Send + Sync {
    async fn fetch_activity(
        &self,
        user_id: i64,
        activity_id: i64,
    ) -> Result<serde_json::Value, AppError>;

    async fn fetch_laps(
        &self,
        user_id: i64,
        activity_id: i64,
    ) -> Result<Option<serde_json::Value>, AppError>;

    async fn fetch_streams(
        &self,
        user_id: i64,
        activity_id: i64,
    ) -> Result<Option<serde_json::Value>, AppError>;

    async fn list_activities(
        &self,
        user_id: i64,
        after: Option<i64>,
        before: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<StravaActivitySummary>, AppError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// StravaService - High-level service with token management
// ─────────────────────────────────────────────────────────────────────────────

use crate::db::Database;
use crate::models::ProviderTokens;
use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Margin before token expiration when we proactively refresh (5 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Cached access token with expiry information.
#[derive(Clone)]
pub struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Shared token cache, keyed by local user ID.
pub type TokenCache = Arc<DashMap<i64, CachedToken>>;

/// Shared refresh locks, keyed by local user ID.
pub type RefreshLocks = Arc<DashMap<i64, Arc<Mutex<()>>>>;

/// High-level Strava service that manages token lifecycle and API calls.
///
/// This service encapsulates:
/// - Token retrieval from the database
/// - Automatic token refresh when expiring (with 5-minute margin)
/// - Persisting refreshed tokens and repointing the athlete link if it moved
/// - In-memory token caching
/// - Per-user locking to prevent duplicate refresh calls
#[derive(Clone)]
pub struct StravaService {
    client: StravaClient,
    db: Arc<dyn Database>,
    token_cache: TokenCache,
    refresh_locks: RefreshLocks,
}

impl StravaService {
    pub fn new(
        client: StravaClient,
        db: Arc<dyn Database>,
        token_cache: TokenCache,
        refresh_locks: RefreshLocks,
    ) -> Self {
        Self {
            client,
            db,
            token_cache,
            refresh_locks,
        }
    }

    // ─── Token Management ────────────────────────────────────────────────────

    fn cached_token(&self, user_id: i64, now: DateTime<Utc>) -> Option<String> {
        let margin = Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        self.token_cache
            .get(&user_id)
            .filter(|cached| now + margin < cached.expires_at)
            .map(|cached| cached.access_token.clone())
    }

    fn cache_token(&self, user_id: i64, access_token: &str, expires_at: DateTime<Utc>) {
        self.token_cache.insert(
            user_id,
            CachedToken {
                access_token: access_token.to_string(),
                expires_at,
            },
        );
    }

    /// Forget a cached token, e.g. after Strava rejected it.
    pub fn invalidate_token(&self, user_id: i64) {
        self.token_cache.remove(&user_id);
    }

    /// Get an access token for the user that is valid for at least 5 more minutes.
    ///
    /// 1. Check in-memory cache
    /// 2. Acquire per-user lock and re-check (another task may have refreshed)
    /// 3. Load tokens; if not expiring, cache and return
    /// 4. Otherwise refresh, persist, repoint the link if needed, cache
    pub async fn get_valid_access_token(&self, user_id: i64) -> Result<String, AppError> {
        let now = Utc::now();

        if let Some(token) = self.cached_token(user_id, now) {
            return Ok(token);
        }

        let lock = self
            .refresh_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(token) = self.cached_token(user_id, now) {
            return Ok(token);
        }

        let tokens = self
            .db
            .get_tokens(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Tokens for user {}", user_id)))?;

        let margin = Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        if !tokens.expires_within(now, margin) {
            self.cache_token(user_id, &tokens.access_token, tokens.expires_at_utc());
            return Ok(tokens.access_token);
        }

        tracing::info!(user_id, "Access token expiring, refreshing");

        // Another instance may have already rotated the refresh token.
        let refreshed = match self.client.refresh_token(&tokens.refresh_token).await {
            Ok(t) => t,
            Err(AppError::StravaApi(ref msg)) if msg.contains("invalid_grant") => {
                tracing::info!(user_id, "Refresh token already rotated, reloading tokens");
                return self.reload_tokens(user_id, now).await;
            }
            Err(e) => return Err(e),
        };

        let updated = ProviderTokens {
            user_id,
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed.refresh_token.clone(),
            expires_at: refreshed.expires_at,
            updated_at: now,
        };
        self.db.save_tokens(&updated).await?;

        if let Some(athlete) = &refreshed.athlete {
            self.update_link(user_id, athlete.id, now).await?;
        }

        self.cache_token(user_id, &updated.access_token, updated.expires_at_utc());
        tracing::info!(user_id, "Token refreshed and cached");
        Ok(refreshed.access_token)
    }

    async fn reload_tokens(&self, user_id: i64, now: DateTime<Utc>) -> Result<String, AppError> {
        let tokens = self
            .db
            .get_tokens(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Tokens for user {}", user_id)))?;

        if tokens.expires_within(now, Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)) {
            return Err(AppError::StravaApi(AppError::STRAVA_TOKEN_ERROR.to_string()));
        }

        self.cache_token(user_id, &tokens.access_token, tokens.expires_at_utc());
        Ok(tokens.access_token)
    }

    async fn update_link(
        &self,
        user_id: i64,
        athlete_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let current = self.db.get_link(user_id).await?;
        if current.as_ref().map(|l| l.athlete_id) != Some(athlete_id) {
            tracing::info!(
                user_id,
                old_athlete_id = ?current.map(|l| l.athlete_id),
                new_athlete_id = athlete_id,
                "Athlete changed on token refresh, updating link"
            );
            self.db.upsert_link(user_id, athlete_id, now).await?;
        }
        Ok(())
    }

    /// Drop the cached token when Strava says it is no longer valid.
    fn forget_on_token_error<T>(
        &self,
        user_id: i64,
        result: Result<T, AppError>,
    ) -> Result<T, AppError> {
        if let Err(e) = &result {
            if e.is_strava_token_error() {
                self.invalidate_token(user_id);
            }
        }
        result
    }
}

#[async_trait]
impl ActivityFetcher for StravaService {
    async fn fetch_activity(
        &self,
        user_id: i64,
        activity_id: i64,
    ) -> Result<serde_json::Value, AppError> {
        let access_token = self.get_valid_access_token(user_id).await?;
        let result = self.client.get_activity(&access_token, activity_id).await;
        self.forget_on_token_error(user_id, result)
    }

    async fn fetch_laps(
        &self,
        user_id: i64,
        activity_id: i64,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let access_token = self.get_valid_access_token(user_id).await?;
        let result = self.client.get_laps(&access_token, activity_id).await;
        self.forget_on_token_error(user_id, result)
    }

    async fn fetch_streams(
        &self,
        user_id: i64,
        activity_id: i64,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let access_token = self.get_valid_access_token(user_id).await?;
        let result = self.client.get_streams(&access_token, activity_id).await;
        self.forget_on_token_error(user_id, result)
    }

    async fn list_activities(
        &self,
        user_id: i64,
        after: Option<i64>,
        before: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<StravaActivitySummary>, AppError> {
        let access_token = self.get_valid_access_token(user_id).await?;
        let result = self
            .client
            .list_activities(&access_token, after, before, page, per_page)
            .await;
        self.forget_on_token_error(user_id, result)
    }
}
