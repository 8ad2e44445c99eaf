// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Postgres storage.
//!
//! Provides:
//! - Job queue with `FOR UPDATE SKIP LOCKED` claims and a lease column
//! - Webhook event log
//! - Athlete links and tokens
//! - Canonical activities, laps, stream blobs and raw payloads
//! - Daily stats, serialized per user by a transaction-scoped advisory lock

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Transaction};

use super::{ActivityStore, JobStore, LinkStore, StatsStore, WebhookStore};
use crate::error::{AppError, Result};
use crate::models::job::{failure_outcome, FailureOutcome};
use crate::models::stats::{classify, ContributionChange};
use crate::models::{
    Activity, ActivityStreams, DailyContribution, DailyStat, EnqueueOutcome, IngestJob, JobStatus,
    JobType, Lap, NewActivity, Provider, ProviderLink, ProviderTokens, RawPayload, Weather,
    WebhookEvent,
};

const MAX_CONNECTIONS: u32 = 10;

const JOB_COLUMNS: &str = "id, provider, provider_ref_id, user_id, job_type, status, retry_count, \
     last_error, next_run_at, locked_until, created_at, updated_at";

const ACTIVITY_COLUMNS: &str = "id, user_id, source, source_activity_id, sport_type, start_time, \
     timezone, distance, moving_time, elapsed_time, avg_hr, max_hr, elevation_gain, avg_pace, \
     weather_temp, weather_humidity, weather_wind_speed, weather_precip_type, weather_sky, \
     created_at, updated_at";

const CONTRIBUTION_COLUMNS: &str =
    "user_id, activity_id, stat_date, start_time, distance, moving_time, avg_pace, avg_hr";

const WEBHOOK_EVENT_COLUMNS: &str =
    "id, object_type, aspect_type, object_id, owner_id, event_time, raw_payload, created_at";

const STAT_COLUMNS: &str = "user_id, stat_date, run_count, total_distance, total_moving_time, \
     avg_pace, avg_hr, updated_at";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Postgres: {}", e)))?;

        tracing::info!("Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ingest_jobs (
                id              BIGSERIAL PRIMARY KEY,
                provider        TEXT NOT NULL,
                provider_ref_id BIGINT NOT NULL,
                user_id         BIGINT NULL,
                job_type        TEXT NOT NULL,
                status          TEXT NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT NULL,
                next_run_at     TIMESTAMPTZ NULL,
                locked_until    TIMESTAMPTZ NULL,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ingest_jobs_status_next_run_idx
              ON ingest_jobs (status, next_run_at)
            "#,
            // Backstop for the enqueue lookup: one active job per key.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ingest_jobs_active_key_idx
              ON ingest_jobs (provider, provider_ref_id, job_type)
              WHERE status IN ('PENDING', 'RUNNING')
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id          BIGSERIAL PRIMARY KEY,
                object_type TEXT NOT NULL,
                aspect_type TEXT NOT NULL,
                object_id   BIGINT NOT NULL,
                owner_id    BIGINT NOT NULL,
                event_time  TIMESTAMPTZ NOT NULL,
                raw_payload JSONB NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS webhook_events_owner_object_idx
              ON webhook_events (owner_id, object_id)
            "#,
            // Concurrent identical deliveries collapse to one row.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS webhook_events_delivery_idx
              ON webhook_events (owner_id, object_id, object_type, aspect_type, event_time)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS strava_user_links (
                user_id    BIGINT PRIMARY KEY,
                athlete_id BIGINT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS strava_tokens (
                user_id       BIGINT PRIMARY KEY,
                access_token  TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at    BIGINT NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                id                  BIGSERIAL PRIMARY KEY,
                user_id             BIGINT NOT NULL,
                source              TEXT NOT NULL,
                source_activity_id  BIGINT NOT NULL,
                sport_type          TEXT NOT NULL,
                start_time          TIMESTAMPTZ NOT NULL,
                timezone            TEXT NULL,
                distance            DOUBLE PRECISION NOT NULL,
                moving_time         BIGINT NOT NULL,
                elapsed_time        BIGINT NOT NULL,
                avg_hr              INTEGER NULL,
                max_hr              INTEGER NULL,
                elevation_gain      DOUBLE PRECISION NULL,
                avg_pace            INTEGER NULL,
                weather_temp        DOUBLE PRECISION NULL,
                weather_humidity    INTEGER NULL,
                weather_wind_speed  DOUBLE PRECISION NULL,
                weather_precip_type TEXT NULL,
                weather_sky         TEXT NULL,
                created_at          TIMESTAMPTZ NOT NULL,
                updated_at          TIMESTAMPTZ NOT NULL,
                UNIQUE (source, source_activity_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS laps (
                activity_id    BIGINT NOT NULL REFERENCES activities (id) ON DELETE CASCADE,
                lap_index      INTEGER NOT NULL,
                distance       DOUBLE PRECISION NOT NULL,
                moving_time    BIGINT NOT NULL,
                avg_hr         INTEGER NULL,
                avg_cadence    DOUBLE PRECISION NULL,
                elevation_gain DOUBLE PRECISION NULL,
                PRIMARY KEY (activity_id, lap_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS activity_streams (
                activity_id  BIGINT PRIMARY KEY REFERENCES activities (id) ON DELETE CASCADE,
                user_id      BIGINT NOT NULL,
                streams      JSONB NOT NULL,
                stream_keys  TEXT[] NOT NULL,
                sample_count INTEGER NULL,
                updated_at   TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS raw_payloads (
                id                 BIGSERIAL PRIMARY KEY,
                user_id            BIGINT NOT NULL,
                provider           TEXT NOT NULL,
                source_activity_id BIGINT NOT NULL,
                payload_type       TEXT NOT NULL,
                payload            JSONB NOT NULL,
                fetched_at         TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                user_id           BIGINT NOT NULL,
                stat_date         DATE NOT NULL,
                run_count         INTEGER NOT NULL,
                total_distance    DOUBLE PRECISION NOT NULL,
                total_moving_time BIGINT NOT NULL,
                avg_pace          INTEGER NULL,
                avg_hr            INTEGER NULL,
                updated_at        TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, stat_date)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS daily_contributions (
                activity_id BIGINT PRIMARY KEY,
                user_id     BIGINT NOT NULL,
                stat_date   DATE NOT NULL,
                start_time  TIMESTAMPTZ NOT NULL,
                distance    DOUBLE PRECISION NOT NULL,
                moving_time BIGINT NOT NULL,
                avg_pace    INTEGER NULL,
                avg_hr      INTEGER NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS daily_contributions_user_date_idx
              ON daily_contributions (user_id, stat_date)
            "#,
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        tracing::info!("Database schema up to date");
        Ok(())
    }

    async fn active_job_id(
        &self,
        provider: Provider,
        provider_ref_id: i64,
        job_type: JobType,
    ) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM ingest_jobs
            WHERE provider = $1 AND provider_ref_id = $2 AND job_type = $3
              AND status IN ('PENDING', 'RUNNING')
            LIMIT 1
            "#,
        )
        .bind(provider.as_str())
        .bind(provider_ref_id)
        .bind(job_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(
        &self,
        provider: Provider,
        provider_ref_id: i64,
        user_id: Option<i64>,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if let Some(id) = self.active_job_id(provider, provider_ref_id, job_type).await? {
            return Ok(EnqueueOutcome::AlreadyActive(id));
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO ingest_jobs
                (provider, provider_ref_id, user_id, job_type, status, retry_count,
                 next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'PENDING', 0, $5, $5, $5)
            ON CONFLICT (provider, provider_ref_id, job_type)
              WHERE status IN ('PENDING', 'RUNNING')
              DO NOTHING
            RETURNING id
            "#,
        )
        .bind(provider.as_str())
        .bind(provider_ref_id)
        .bind(user_id)
        .bind(job_type.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(EnqueueOutcome::Enqueued(id));
        }

        // Lost a race with a concurrent enqueue for the same key.
        self.active_job_id(provider, provider_ref_id, job_type)
            .await?
            .map(EnqueueOutcome::AlreadyActive)
            .ok_or_else(|| {
                AppError::Database(format!(
                    "enqueue conflict without active job for {} {}",
                    provider, provider_ref_id
                ))
            })
    }

    #[tracing::instrument(skip(self))]
    async fn claim_due(
        &self,
        limit: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<IngestJob>> {
        let mut tx = self.pool.begin().await?;

        let mut jobs: Vec<IngestJob> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ingest_jobs
            WHERE status = 'PENDING'
              AND next_run_at <= $1
              AND (locked_until IS NULL OR locked_until <= $1)
            ORDER BY next_run_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        if jobs.is_empty() {
            tx.commit().await?;
            return Ok(jobs);
        }

        let locked_until = now + lease;
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        sqlx::query(
            "UPDATE ingest_jobs SET locked_until = $1, updated_at = $2 WHERE id = ANY($3)",
        )
        .bind(locked_until)
        .bind(now)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        for job in &mut jobs {
            job.locked_until = Some(locked_until);
            job.updated_at = now;
        }
        Ok(jobs)
    }

    async fn mark_running(&self, job_id: i64, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'RUNNING', retry_count = retry_count + 1, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_found(result.rows_affected(), "Job", job_id)
    }

    async fn mark_done(&self, job_id: i64, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'DONE', locked_until = NULL, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_found(result.rows_affected(), "Job", job_id)
    }

    async fn mark_failed(
        &self,
        job_id: i64,
        error: &str,
        retry_count: i32,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let outcome = failure_outcome(retry_count, max_retries, now);
        let (status, next_run_at) = match outcome {
            FailureOutcome::Retry { next_run_at } => (JobStatus::Pending, Some(next_run_at)),
            FailureOutcome::Permanent => (JobStatus::Failed, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = $2, last_error = $3, next_run_at = $4,
                locked_until = NULL, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_found(result.rows_affected(), "Job", job_id)?;
        Ok(outcome)
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'PENDING', next_run_at = $1, locked_until = NULL, updated_at = $1
            WHERE status = 'RUNNING' AND locked_until <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<IngestJob>> {
        let job: Option<IngestJob> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<IngestJob>> {
        let jobs: Vec<IngestJob> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ingest_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY updated_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

#[async_trait]
impl WebhookStore for PgStore {
    async fn find_events(&self, owner_id: i64, object_id: i64) -> Result<Vec<WebhookEvent>> {
        let events: Vec<WebhookEvent> = sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events
            WHERE owner_id = $1 AND object_id = $2
            ORDER BY id ASC
            "#
        ))
        .bind(owner_id)
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn save_event(&self, event: &WebhookEvent) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events
                (object_type, aspect_type, object_id, owner_id, event_time, raw_payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (owner_id, object_id, object_type, aspect_type, event_time) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.object_type)
        .bind(&event.aspect_type)
        .bind(event.object_id)
        .bind(event.owner_id)
        .bind(event.event_time)
        .bind(Json(&event.raw_payload))
        .bind(event.created_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl LinkStore for PgStore {
    async fn find_user_by_athlete(&self, athlete_id: i64) -> Result<Option<i64>> {
        let user_id: Option<i64> =
            sqlx::query_scalar("SELECT user_id FROM strava_user_links WHERE athlete_id = $1")
                .bind(athlete_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(user_id)
    }

    async fn get_link(&self, user_id: i64) -> Result<Option<ProviderLink>> {
        let link = sqlx::query_as::<_, ProviderLink>(
            "SELECT user_id, athlete_id, created_at FROM strava_user_links WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    async fn upsert_link(&self, user_id: i64, athlete_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strava_user_links (user_id, athlete_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET athlete_id = EXCLUDED.athlete_id
            "#,
        )
        .bind(user_id)
        .bind(athlete_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tokens(&self, user_id: i64) -> Result<Option<ProviderTokens>> {
        let tokens = sqlx::query_as::<_, ProviderTokens>(
            r#"
            SELECT user_id, access_token, refresh_token, expires_at, updated_at
            FROM strava_tokens WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tokens)
    }

    async fn save_tokens(&self, tokens: &ProviderTokens) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strava_tokens (user_id, access_token, refresh_token, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tokens.user_id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at)
        .bind(tokens.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn save_raw_payload(&self, raw: &RawPayload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_payloads
                (user_id, provider, source_activity_id, payload_type, payload, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(raw.user_id)
        .bind(&raw.provider)
        .bind(raw.source_activity_id)
        .bind(raw.payload_type.as_str())
        .bind(Json(&raw.payload))
        .bind(raw.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(
        skip(self, activity),
        fields(source_activity_id = activity.source_activity_id)
    )]
    async fn upsert_activity(&self, activity: &NewActivity, now: DateTime<Utc>) -> Result<()> {
        // Weather columns and avg_pace are left alone on conflict.
        sqlx::query(
            r#"
            INSERT INTO activities
                (user_id, source, source_activity_id, sport_type, start_time, timezone,
                 distance, moving_time, elapsed_time, avg_hr, max_hr, elevation_gain,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            ON CONFLICT (source, source_activity_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                sport_type = EXCLUDED.sport_type,
                start_time = EXCLUDED.start_time,
                timezone = EXCLUDED.timezone,
                distance = EXCLUDED.distance,
                moving_time = EXCLUDED.moving_time,
                elapsed_time = EXCLUDED.elapsed_time,
                avg_hr = EXCLUDED.avg_hr,
                max_hr = EXCLUDED.max_hr,
                elevation_gain = EXCLUDED.elevation_gain,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(activity.user_id)
        .bind(&activity.source)
        .bind(activity.source_activity_id)
        .bind(&activity.sport_type)
        .bind(activity.start_time)
        .bind(&activity.timezone)
        .bind(activity.distance)
        .bind(activity.moving_time)
        .bind(activity.elapsed_time)
        .bind(activity.avg_hr)
        .bind(activity.max_hr)
        .bind(activity.elevation_gain)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_activity(&self, activity_id: i64) -> Result<Option<Activity>> {
        let activity: Option<Activity> = sqlx::query_as(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = $1"
        ))
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(activity)
    }

    async fn get_activity_by_source(
        &self,
        source: &str,
        source_activity_id: i64,
    ) -> Result<Option<Activity>> {
        let activity: Option<Activity> = sqlx::query_as(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE source = $1 AND source_activity_id = $2"
        ))
        .bind(source)
        .bind(source_activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(activity)
    }

    async fn update_avg_pace(
        &self,
        activity_id: i64,
        avg_pace: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE activities SET avg_pace = $2, updated_at = $3 WHERE id = $1")
                .bind(activity_id)
                .bind(avg_pace)
                .bind(now)
                .execute(&self.pool)
                .await?;

        ensure_found(result.rows_affected(), "Activity", activity_id)
    }

    async fn update_weather(
        &self,
        activity_id: i64,
        weather: &Weather,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE activities
            SET weather_temp = $2, weather_humidity = $3, weather_wind_speed = $4,
                weather_precip_type = $5, weather_sky = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(activity_id)
        .bind(weather.temp)
        .bind(weather.humidity)
        .bind(weather.wind_speed)
        .bind(&weather.precip_type)
        .bind(&weather.sky)
        .bind(now)
        .execute(&self.pool)
        .await?;

        ensure_found(result.rows_affected(), "Activity", activity_id)
    }

    async fn replace_laps(&self, activity_id: i64, laps: &[Lap]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM laps WHERE activity_id = $1")
            .bind(activity_id)
            .execute(&mut *tx)
            .await?;

        if !laps.is_empty() {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO laps (activity_id, lap_index, distance, moving_time, \
                 avg_hr, avg_cadence, elevation_gain) ",
            );
            qb.push_values(laps, |mut b, lap| {
                b.push_bind(activity_id)
                    .push_bind(lap.lap_index)
                    .push_bind(lap.distance)
                    .push_bind(lap.moving_time)
                    .push_bind(lap.avg_hr)
                    .push_bind(lap.avg_cadence)
                    .push_bind(lap.elevation_gain);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_laps(&self, activity_id: i64) -> Result<Vec<Lap>> {
        let laps = sqlx::query_as::<_, Lap>(
            r#"
            SELECT activity_id, lap_index, distance, moving_time,
                   avg_hr, avg_cadence, elevation_gain
            FROM laps WHERE activity_id = $1
            ORDER BY lap_index ASC
            "#,
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(laps)
    }

    async fn upsert_streams(&self, streams: &ActivityStreams) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_streams
                (activity_id, user_id, streams, stream_keys, sample_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (activity_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                streams = EXCLUDED.streams,
                stream_keys = EXCLUDED.stream_keys,
                sample_count = EXCLUDED.sample_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(streams.activity_id)
        .bind(streams.user_id)
        .bind(Json(&streams.streams))
        .bind(&streams.stream_keys)
        .bind(streams.sample_count)
        .bind(streams.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_streams(&self, activity_id: i64) -> Result<Option<ActivityStreams>> {
        let streams = sqlx::query_as::<_, ActivityStreams>(
            r#"
            SELECT activity_id, user_id, streams, stream_keys, sample_count, updated_at
            FROM activity_streams WHERE activity_id = $1
            "#,
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(streams)
    }
}

#[async_trait]
impl StatsStore for PgStore {
    #[tracing::instrument(
        skip(self, contribution),
        fields(user_id = contribution.user_id, activity_id = contribution.activity_id)
    )]
    async fn apply_contribution(
        &self,
        contribution: &DailyContribution,
        now: DateTime<Utc>,
    ) -> Result<ContributionChange> {
        let mut tx = self.pool.begin().await?;

        // Released at commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(contribution.user_id)
            .execute(&mut *tx)
            .await?;

        let prev: Option<DailyContribution> = sqlx::query_as(&format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM daily_contributions WHERE activity_id = $1"
        ))
        .bind(contribution.activity_id)
        .fetch_optional(&mut *tx)
        .await?;

        let counted_later: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM daily_contributions
                WHERE user_id = $1 AND stat_date = $2
                  AND (start_time, activity_id) > ($3, $4)
            )
            "#,
        )
        .bind(contribution.user_id)
        .bind(contribution.stat_date)
        .bind(contribution.start_time)
        .bind(contribution.activity_id)
        .fetch_one(&mut *tx)
        .await?;

        let change = classify(prev.as_ref(), contribution, counted_later);

        match &change {
            ContributionChange::Unchanged => {}
            ContributionChange::Fresh => {
                save_contribution(&mut tx, contribution).await?;
                let mut stat = load_stat(&mut tx, contribution.user_id, contribution.stat_date)
                    .await?
                    .unwrap_or_else(|| {
                        DailyStat::empty(contribution.user_id, contribution.stat_date, now)
                    });
                stat.apply(contribution, now);
                save_stat(&mut tx, &stat).await?;
            }
            ContributionChange::Backdated { stat_date } => {
                save_contribution(&mut tx, contribution).await?;
                rebuild_day(&mut tx, contribution.user_id, *stat_date, now).await?;
            }
            ContributionChange::Corrected { affected_dates } => {
                save_contribution(&mut tx, contribution).await?;
                for date in affected_dates {
                    rebuild_day(&mut tx, contribution.user_id, *date, now).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(change)
    }

    async fn get_daily_stat(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
    ) -> Result<Option<DailyStat>> {
        let stat: Option<DailyStat> = sqlx::query_as(&format!(
            "SELECT {STAT_COLUMNS} FROM daily_stats WHERE user_id = $1 AND stat_date = $2"
        ))
        .bind(user_id)
        .bind(stat_date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stat)
    }

    async fn get_contribution(&self, activity_id: i64) -> Result<Option<DailyContribution>> {
        let contribution: Option<DailyContribution> = sqlx::query_as(&format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM daily_contributions WHERE activity_id = $1"
        ))
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(contribution)
    }
}

// ─── Transaction helpers ─────────────────────────────────────────────────────

async fn save_contribution(
    tx: &mut Transaction<'_, Postgres>,
    c: &DailyContribution,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_contributions
            (user_id, activity_id, stat_date, start_time, distance, moving_time, avg_pace, avg_hr)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (activity_id) DO UPDATE SET
            user_id = EXCLUDED.user_id,
            stat_date = EXCLUDED.stat_date,
            start_time = EXCLUDED.start_time,
            distance = EXCLUDED.distance,
            moving_time = EXCLUDED.moving_time,
            avg_pace = EXCLUDED.avg_pace,
            avg_hr = EXCLUDED.avg_hr
        "#,
    )
    .bind(c.user_id)
    .bind(c.activity_id)
    .bind(c.stat_date)
    .bind(c.start_time)
    .bind(c.distance)
    .bind(c.moving_time)
    .bind(c.avg_pace)
    .bind(c.avg_hr)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn load_stat(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    stat_date: NaiveDate,
) -> Result<Option<DailyStat>> {
    let stat: Option<DailyStat> = sqlx::query_as(&format!(
        "SELECT {STAT_COLUMNS} FROM daily_stats WHERE user_id = $1 AND stat_date = $2"
    ))
    .bind(user_id)
    .bind(stat_date)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(stat)
}

async fn save_stat(tx: &mut Transaction<'_, Postgres>, stat: &DailyStat) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_stats
            (user_id, stat_date, run_count, total_distance, total_moving_time,
             avg_pace, avg_hr, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (user_id, stat_date) DO UPDATE SET
            run_count = EXCLUDED.run_count,
            total_distance = EXCLUDED.total_distance,
            total_moving_time = EXCLUDED.total_moving_time,
            avg_pace = EXCLUDED.avg_pace,
            avg_hr = EXCLUDED.avg_hr,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(stat.user_id)
    .bind(stat.stat_date)
    .bind(stat.run_count)
    .bind(stat.total_distance)
    .bind(stat.total_moving_time)
    .bind(stat.avg_pace)
    .bind(stat.avg_hr)
    .bind(stat.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn rebuild_day(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    stat_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<()> {
    let day: Vec<DailyContribution> = sqlx::query_as(&format!(
        "SELECT {CONTRIBUTION_COLUMNS} FROM daily_contributions \
         WHERE user_id = $1 AND stat_date = $2"
    ))
    .bind(user_id)
    .bind(stat_date)
    .fetch_all(&mut **tx)
    .await?;

    match DailyStat::replay(user_id, stat_date, &day, now) {
        Some(stat) => save_stat(tx, &stat).await,
        None => {
            sqlx::query("DELETE FROM daily_stats WHERE user_id = $1 AND stat_date = $2")
                .bind(user_id)
                .bind(stat_date)
                .execute(&mut **tx)
                .await?;
            Ok(())
        }
    }
}

fn ensure_found(rows_affected: u64, what: &str, id: i64) -> Result<()> {
    if rows_affected == 0 {
        return Err(AppError::NotFound(format!("{} {}", what, id)));
    }
    Ok(())
}
