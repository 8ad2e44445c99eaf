//! Database layer.
//!
//! Storage is split into narrow async traits so the worker, webhook intake
//! and aggregation code can run against Postgres in production and against
//! `MemoryStore` in tests and local runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::Result;
use crate::models::job::FailureOutcome;
use crate::models::stats::ContributionChange;
use crate::models::{
    Activity, ActivityStreams, DailyContribution, DailyStat, EnqueueOutcome, IngestJob, JobStatus,
    JobType, Lap, NewActivity, Provider, ProviderLink, ProviderTokens, RawPayload, Weather,
    WebhookEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Durable ingest job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job due at `now`, unless an active job exists for the key.
    async fn enqueue(
        &self,
        provider: Provider,
        provider_ref_id: i64,
        user_id: Option<i64>,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome>;

    /// Claim up to `limit` due PENDING jobs, oldest due first.
    ///
    /// Claimed jobs carry a lease of `lease` and are invisible to other
    /// claimers until it expires. Rows locked by a concurrent claimer are
    /// skipped, never waited on.
    async fn claim_due(
        &self,
        limit: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<IngestJob>>;

    /// PENDING -> RUNNING, counting the attempt.
    async fn mark_running(&self, job_id: i64, now: DateTime<Utc>) -> Result<()>;

    async fn mark_done(&self, job_id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Record a failure. `retry_count` is the job's count before this attempt.
    async fn mark_failed(
        &self,
        job_id: i64,
        error: &str,
        retry_count: i32,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome>;

    /// Return RUNNING jobs with an expired lease to PENDING. Returns the count.
    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn get_job(&self, job_id: i64) -> Result<Option<IngestJob>>;

    /// Most recently updated jobs first.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<IngestJob>>;
}

/// Stored push notifications.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn find_events(&self, owner_id: i64, object_id: i64) -> Result<Vec<WebhookEvent>>;

    /// Persist an event and return its id.
    ///
    /// Returns `None` when an identical delivery (same owner, object, object
    /// type, aspect and event time) is already stored.
    async fn save_event(&self, event: &WebhookEvent) -> Result<Option<i64>>;
}

/// Athlete links and their OAuth tokens.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn find_user_by_athlete(&self, athlete_id: i64) -> Result<Option<i64>>;

    async fn get_link(&self, user_id: i64) -> Result<Option<ProviderLink>>;

    /// Create or repoint the user's link to `athlete_id`.
    async fn upsert_link(&self, user_id: i64, athlete_id: i64, now: DateTime<Utc>) -> Result<()>;

    async fn get_tokens(&self, user_id: i64) -> Result<Option<ProviderTokens>>;

    async fn save_tokens(&self, tokens: &ProviderTokens) -> Result<()>;
}

/// Canonical activity rows, laps, stream blobs and the raw payload log.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn save_raw_payload(&self, raw: &RawPayload) -> Result<()>;

    /// Insert or update by (source, source_activity_id). Callers re-fetch by key.
    async fn upsert_activity(&self, activity: &NewActivity, now: DateTime<Utc>) -> Result<()>;

    async fn get_activity(&self, activity_id: i64) -> Result<Option<Activity>>;

    async fn get_activity_by_source(
        &self,
        source: &str,
        source_activity_id: i64,
    ) -> Result<Option<Activity>>;

    async fn update_avg_pace(
        &self,
        activity_id: i64,
        avg_pace: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Overwrite all weather columns of the activity.
    async fn update_weather(
        &self,
        activity_id: i64,
        weather: &Weather,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete all laps of the activity, then insert `laps`.
    async fn replace_laps(&self, activity_id: i64, laps: &[Lap]) -> Result<()>;

    async fn get_laps(&self, activity_id: i64) -> Result<Vec<Lap>>;

    async fn upsert_streams(&self, streams: &ActivityStreams) -> Result<()>;

    async fn get_streams(&self, activity_id: i64) -> Result<Option<ActivityStreams>>;
}

/// Daily aggregates and the per-activity contributions behind them.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Fold an activity's contribution into its day, serialized per user.
    ///
    /// Unchanged contributions are a no-op. A new contribution that sorts
    /// after everything already counted on its day is merged incrementally;
    /// one that sorts earlier rebuilds the day, so the stored stat always
    /// equals a replay in (start_time, activity_id) order. Corrected
    /// contributions replace the stored one and rebuild every affected day.
    async fn apply_contribution(
        &self,
        contribution: &DailyContribution,
        now: DateTime<Utc>,
    ) -> Result<ContributionChange>;

    async fn get_daily_stat(&self, user_id: i64, stat_date: NaiveDate)
        -> Result<Option<DailyStat>>;

    async fn get_contribution(&self, activity_id: i64) -> Result<Option<DailyContribution>>;
}

/// Everything the service needs from storage.
pub trait Database: JobStore + WebhookStore + LinkStore + ActivityStore + StatsStore {}

impl<T> Database for T where T: JobStore + WebhookStore + LinkStore + ActivityStore + StatsStore {}
