// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! A `.env` file is honoured for local development.

use std::env;
use std::time::Duration;

pub const DEFAULT_STRAVA_API_BASE_URL: &str = "https://www.strava.com/api/v3";
pub const DEFAULT_STRAVA_OAUTH_URL: &str = "https://www.strava.com/oauth/token";
pub const DEFAULT_KMA_API_BASE_URL: &str =
    "https://apihub.kma.go.kr/api/typ02/openApi/VilageFcstInfoService_2.0";

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// Strava OAuth client ID (public)
    pub strava_client_id: String,
    /// Base URL of the Strava REST API
    pub strava_api_base_url: String,
    /// Strava OAuth token endpoint
    pub strava_oauth_url: String,
    /// Expected push subscription ID; events for other subscriptions are rejected
    pub strava_subscription_id: Option<u64>,
    /// Postgres connection string
    pub database_url: String,
    /// Server port
    pub port: u16,
    /// Base URL of the KMA short-term forecast service
    pub kma_api_base_url: String,

    // --- Worker tuning ---
    /// Seconds between polling ticks
    pub worker_poll_interval_secs: u64,
    /// Maximum jobs claimed per tick
    pub worker_batch_size: u32,
    /// How long a claim stays exclusive before the job is recoverable
    pub job_lease_secs: u64,
    /// Timeout for each outbound Strava request
    pub http_timeout_secs: u64,

    // --- Secrets ---
    /// Strava OAuth client secret
    pub strava_client_secret: String,
    /// Webhook verification token
    pub webhook_verify_token: String,
    /// Bearer token for `/admin/*` routes
    pub admin_api_token: String,
    /// KMA API hub key; weather enrichment is off without it
    pub kma_auth_key: Option<String>,
}

impl Config {
    /// Default config for testing only.
    pub fn test_default() -> Self {
        Self {
            strava_client_id: "test_client_id".to_string(),
            strava_api_base_url: DEFAULT_STRAVA_API_BASE_URL.to_string(),
            strava_oauth_url: DEFAULT_STRAVA_OAUTH_URL.to_string(),
            strava_subscription_id: Some(12345),
            database_url: "postgres://localhost/stride_test".to_string(),
            port: 8080,
            kma_api_base_url: DEFAULT_KMA_API_BASE_URL.to_string(),
            worker_poll_interval_secs: 30,
            worker_batch_size: 10,
            job_lease_secs: 900,
            http_timeout_secs: 5,
            strava_client_secret: "test_secret".to_string(),
            webhook_verify_token: "test_verify_token".to_string(),
            admin_api_token: "test_admin_token".to_string(),
            kma_auth_key: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            strava_client_id: required("STRAVA_CLIENT_ID")?,
            strava_api_base_url: env::var("STRAVA_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_STRAVA_API_BASE_URL.to_string()),
            strava_oauth_url: env::var("STRAVA_OAUTH_URL")
                .unwrap_or_else(|_| DEFAULT_STRAVA_OAUTH_URL.to_string()),
            strava_subscription_id: optional_parsed("STRAVA_SUBSCRIPTION_ID")?,
            database_url: required("DATABASE_URL")?,
            port: optional_parsed("PORT")?.unwrap_or(8080),
            kma_api_base_url: env::var("KMA_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_KMA_API_BASE_URL.to_string()),

            worker_poll_interval_secs: optional_parsed("WORKER_POLL_INTERVAL_SECS")?
                .unwrap_or(30),
            worker_batch_size: optional_parsed("WORKER_BATCH_SIZE")?.unwrap_or(10),
            job_lease_secs: optional_parsed("JOB_LEASE_SECS")?.unwrap_or(900),
            http_timeout_secs: optional_parsed("HTTP_TIMEOUT_SECS")?.unwrap_or(30),

            strava_client_secret: required("STRAVA_CLIENT_SECRET")?,
            webhook_verify_token: required("WEBHOOK_VERIFY_TOKEN")?,
            admin_api_token: required("ADMIN_API_TOKEN")?,
            kma_auth_key: env::var("KMA_AUTH_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker_poll_interval_secs)
    }

    pub fn job_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_lease_secs as i64)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Read a required variable, trimming stray whitespace from secret bindings.
fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .map(|v| v.trim().to_string())
        .map_err(|_| ConfigError::Missing(name))
}

fn optional_parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        // Set required env vars for test
        env::set_var("STRAVA_CLIENT_ID", "test_id");
        env::set_var("STRAVA_CLIENT_SECRET", " test_secret\n");
        env::set_var("WEBHOOK_VERIFY_TOKEN", "test_verify");
        env::set_var("ADMIN_API_TOKEN", "admin");
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("WORKER_BATCH_SIZE", "25");

        let config = Config::from_env().expect("Config should load");

        assert_eq!(config.strava_client_id, "test_id");
        assert_eq!(config.strava_client_secret, "test_secret");
        assert_eq!(config.worker_batch_size, 25);
        assert_eq!(config.worker_poll_interval_secs, 30);
        assert_eq!(config.strava_api_base_url, DEFAULT_STRAVA_API_BASE_URL);

        env::remove_var("WORKER_BATCH_SIZE");
    }

    #[test]
    fn test_optional_parsed_rejects_garbage() {
        env::set_var("STRIDE_TEST_GARBAGE_PORT", "eighty");
        let result: Result<Option<u16>, _> = optional_parsed("STRIDE_TEST_GARBAGE_PORT");
        assert!(matches!(result, Err(ConfigError::Invalid("STRIDE_TEST_GARBAGE_PORT", _))));
        env::remove_var("STRIDE_TEST_GARBAGE_PORT");
    }
}
