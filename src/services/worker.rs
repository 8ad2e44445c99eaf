// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Polling worker that drains the ingest job queue.
//!
//! Each tick:
//! - returns RUNNING jobs with an expired lease to PENDING
//! - claims up to `batch_size` due jobs
//! - runs fetch -> upsert -> aggregate for each, independently
//! - records DONE, a retry with backoff, or FAILED

use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::models::job::{FailureOutcome, MAX_RETRY_COUNT};
use crate::models::{IngestJob, JobKind};
use crate::services::ingest::{FetchedActivity, IngestService};
use crate::services::strava::ActivityFetcher;
use crate::services::weather::WeatherFetcher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Counts from one polling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub requeued: u64,
    pub claimed: usize,
    pub done: usize,
    pub unsupported: usize,
    pub retried: usize,
    pub failed: usize,
}

impl TickReport {
    /// Nothing was claimed or recovered.
    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.requeued == 0
    }
}

/// How a single job resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Done,
    Unsupported,
    Retried,
    Failed,
    /// Bookkeeping failed; the lease will bring the job back.
    Abandoned,
}

pub struct IngestWorker {
    db: Arc<dyn Database>,
    fetcher: Arc<dyn ActivityFetcher>,
    ingest: IngestService,
    batch_size: u32,
    lease: chrono::Duration,
    poll_interval: Duration,
}

impl IngestWorker {
    pub fn new(db: Arc<dyn Database>, fetcher: Arc<dyn ActivityFetcher>, config: &Config) -> Self {
        Self {
            ingest: IngestService::new(db.clone()),
            db,
            fetcher,
            batch_size: config.worker_batch_size,
            lease: config.job_lease(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Enrich ingested activities with weather observations.
    pub fn with_weather(mut self, weather: Arc<dyn WeatherFetcher>) -> Self {
        self.ingest = self.ingest.with_weather(weather);
        self
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "Ingest worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if report.is_idle() => {}
                        Ok(report) => tracing::info!(?report, "Worker tick complete"),
                        Err(e) => tracing::error!(error = %e, "Worker tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Ingest worker stopped");
    }

    /// One polling tick. Only queue-level failures are returned; per-job
    /// errors become job state.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let mut report = TickReport {
            requeued: self.db.requeue_stale(now).await?,
            ..Default::default()
        };
        if report.requeued > 0 {
            tracing::warn!(count = report.requeued, "Requeued jobs with expired leases");
        }

        let jobs = self.db.claim_due(self.batch_size, now, self.lease).await?;
        report.claimed = jobs.len();

        for job in &jobs {
            match self.run_job(job, now).await {
                JobResult::Done => report.done += 1,
                JobResult::Unsupported => report.unsupported += 1,
                JobResult::Retried => report.retried += 1,
                JobResult::Failed => report.failed += 1,
                JobResult::Abandoned => {}
            }
        }

        Ok(report)
    }

    async fn run_job(&self, job: &IngestJob, now: DateTime<Utc>) -> JobResult {
        if let Err(e) = self.db.mark_running(job.id, now).await {
            tracing::error!(job_id = job.id, error = %e, "Failed to mark job running");
            return JobResult::Abandoned;
        }

        let result = match self.process(job).await {
            Ok(result) => result,
            Err(e) => return self.record_failure(job, &e, now).await,
        };

        match self.db.mark_done(job.id, now).await {
            Ok(()) => result,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to mark job done");
                JobResult::Abandoned
            }
        }
    }

    async fn process(&self, job: &IngestJob) -> Result<JobResult, AppError> {
        match job.kind() {
            Some(JobKind::StravaActivityUpsert) => {
                let user_id = job.user_id.ok_or_else(|| {
                    AppError::BadRequest(format!("Job {} has no user", job.id))
                })?;
                self.ingest_strava_activity(user_id, job.provider_ref_id)
                    .await?;
                Ok(JobResult::Done)
            }
            None => {
                tracing::warn!(
                    job_id = job.id,
                    provider = %job.provider,
                    job_type = %job.job_type,
                    "Unsupported job, marking done"
                );
                Ok(JobResult::Unsupported)
            }
        }
    }

    async fn ingest_strava_activity(&self, user_id: i64, activity_id: i64) -> Result<(), AppError> {
        let fetched = FetchedActivity {
            activity: self.fetcher.fetch_activity(user_id, activity_id).await?,
            laps: self.fetcher.fetch_laps(user_id, activity_id).await?,
            streams: self.fetcher.fetch_streams(user_id, activity_id).await?,
        };
        self.ingest.ingest(user_id, &fetched).await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        job: &IngestJob,
        error: &AppError,
        now: DateTime<Utc>,
    ) -> JobResult {
        let message = error.to_string();
        match self
            .db
            .mark_failed(job.id, &message, job.retry_count, MAX_RETRY_COUNT, now)
            .await
        {
            Ok(FailureOutcome::Retry { next_run_at }) => {
                tracing::warn!(
                    job_id = job.id,
                    provider_ref_id = job.provider_ref_id,
                    attempt = job.retry_count + 1,
                    %next_run_at,
                    rate_limited = error.is_rate_limited(),
                    error = %message,
                    "Job failed, will retry"
                );
                JobResult::Retried
            }
            Ok(FailureOutcome::Permanent) => {
                tracing::error!(
                    job_id = job.id,
                    provider_ref_id = job.provider_ref_id,
                    attempt = job.retry_count + 1,
                    error = %message,
                    "Job failed permanently"
                );
                JobResult::Failed
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to record job failure");
                JobResult::Abandoned
            }
        }
    }
}
