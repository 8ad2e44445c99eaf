// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory store for tests and local runs without Postgres.
//!
//! A single mutex guards every table, so each trait call is atomic with
//! respect to every other call. That is stronger than what Postgres gives
//! and is enough to exercise the queue's claim semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{ActivityStore, JobStore, LinkStore, StatsStore, WebhookStore};
use crate::error::{AppError, Result};
use crate::models::job::{failure_outcome, FailureOutcome};
use crate::models::stats::{classify, ContributionChange};
use crate::models::{
    Activity, ActivityStreams, DailyContribution, DailyStat, EnqueueOutcome, IngestJob, JobStatus,
    JobType, Lap, NewActivity, Provider, ProviderLink, ProviderTokens, RawPayload, Weather,
    WebhookEvent,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    jobs: Vec<IngestJob>,
    webhook_events: Vec<WebhookEvent>,
    links: HashMap<i64, ProviderLink>,
    tokens: HashMap<i64, ProviderTokens>,
    activities: HashMap<i64, Activity>,
    laps: HashMap<i64, Vec<Lap>>,
    streams: HashMap<i64, ActivityStreams>,
    raw_payloads: Vec<RawPayload>,
    daily_stats: HashMap<(i64, NaiveDate), DailyStat>,
    contributions: HashMap<i64, DailyContribution>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn job_mut(&mut self, job_id: i64) -> Result<&mut IngestJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))
    }

    fn rebuild_day(&mut self, user_id: i64, stat_date: NaiveDate, now: DateTime<Utc>) {
        let day: Vec<DailyContribution> = self
            .contributions
            .values()
            .filter(|c| c.user_id == user_id && c.stat_date == stat_date)
            .cloned()
            .collect();

        match DailyStat::replay(user_id, stat_date, &day, now) {
            Some(stat) => {
                self.daily_stats.insert((user_id, stat_date), stat);
            }
            None => {
                self.daily_stats.remove(&(user_id, stat_date));
            }
        }
    }
}

/// Store backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn raw_payloads(&self) -> Vec<RawPayload> {
        self.tables.lock().await.raw_payloads.clone()
    }

    /// Number of stored activities (primarily for tests).
    pub async fn activity_count(&self) -> usize {
        self.tables.lock().await.activities.len()
    }

    /// Insert a job row as-is, bypassing the active-key check. Lets tests
    /// load rows with tags this build does not know.
    pub async fn insert_job(&self, mut job: IngestJob) -> i64 {
        let mut t = self.tables.lock().await;
        job.id = t.next_id();
        let id = job.id;
        t.jobs.push(job);
        id
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(
        &self,
        provider: Provider,
        provider_ref_id: i64,
        user_id: Option<i64>,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut t = self.tables.lock().await;

        if let Some(active) = t
            .jobs
            .iter()
            .find(|j| j.status.is_active() && j.key_matches(provider, provider_ref_id, job_type))
        {
            return Ok(EnqueueOutcome::AlreadyActive(active.id));
        }

        let mut job = IngestJob::new_pending(provider, provider_ref_id, user_id, job_type, now);
        job.id = t.next_id();
        let id = job.id;
        t.jobs.push(job);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim_due(
        &self,
        limit: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<IngestJob>> {
        let mut t = self.tables.lock().await;

        let mut due: Vec<&mut IngestJob> = t
            .jobs
            .iter_mut()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.next_run_at.is_some_and(|at| at <= now)
                    && j.locked_until.is_none_or(|until| until <= now)
            })
            .collect();
        due.sort_by_key(|j| (j.next_run_at, j.id));

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|j| {
                j.locked_until = Some(now + lease);
                j.updated_at = now;
                j.clone()
            })
            .collect())
    }

    async fn mark_running(&self, job_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock().await;
        let job = t.job_mut(job_id)?;
        job.status = JobStatus::Running;
        job.retry_count += 1;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_done(&self, job_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock().await;
        let job = t.job_mut(job_id)?;
        job.status = JobStatus::Done;
        job.locked_until = None;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: i64,
        error: &str,
        retry_count: i32,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let mut t = self.tables.lock().await;
        let job = t.job_mut(job_id)?;
        let outcome = failure_outcome(retry_count, max_retries, now);

        match outcome {
            FailureOutcome::Retry { next_run_at } => {
                job.status = JobStatus::Pending;
                job.next_run_at = Some(next_run_at);
            }
            FailureOutcome::Permanent => {
                job.status = JobStatus::Failed;
                job.next_run_at = None;
            }
        }
        job.last_error = Some(error.to_string());
        job.locked_until = None;
        job.updated_at = now;
        Ok(outcome)
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock().await;
        let mut count = 0;
        for job in t.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && j.locked_until.is_some_and(|until| until <= now)
        }) {
            job.status = JobStatus::Pending;
            job.next_run_at = Some(now);
            job.locked_until = None;
            job.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<IngestJob>> {
        let t = self.tables.lock().await;
        Ok(t.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<IngestJob>> {
        let t = self.tables.lock().await;
        let mut jobs: Vec<IngestJob> = t
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn find_events(&self, owner_id: i64, object_id: i64) -> Result<Vec<WebhookEvent>> {
        let t = self.tables.lock().await;
        Ok(t.webhook_events
            .iter()
            .filter(|e| e.owner_id == owner_id && e.object_id == object_id)
            .cloned()
            .collect())
    }

    async fn save_event(&self, event: &WebhookEvent) -> Result<Option<i64>> {
        let mut t = self.tables.lock().await;
        if t.webhook_events.iter().any(|e| e.is_same_delivery(event)) {
            return Ok(None);
        }
        let mut stored = event.clone();
        stored.id = t.next_id();
        let id = stored.id;
        t.webhook_events.push(stored);
        Ok(Some(id))
    }
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn find_user_by_athlete(&self, athlete_id: i64) -> Result<Option<i64>> {
        let t = self.tables.lock().await;
        Ok(t.links
            .values()
            .find(|l| l.athlete_id == athlete_id)
            .map(|l| l.user_id))
    }

    async fn get_link(&self, user_id: i64) -> Result<Option<ProviderLink>> {
        Ok(self.tables.lock().await.links.get(&user_id).cloned())
    }

    async fn upsert_link(&self, user_id: i64, athlete_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.links
            .entry(user_id)
            .and_modify(|l| l.athlete_id = athlete_id)
            .or_insert(ProviderLink {
                user_id,
                athlete_id,
                created_at: now,
            });
        Ok(())
    }

    async fn get_tokens(&self, user_id: i64) -> Result<Option<ProviderTokens>> {
        Ok(self.tables.lock().await.tokens.get(&user_id).cloned())
    }

    async fn save_tokens(&self, tokens: &ProviderTokens) -> Result<()> {
        self.tables
            .lock()
            .await
            .tokens
            .insert(tokens.user_id, tokens.clone());
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn save_raw_payload(&self, raw: &RawPayload) -> Result<()> {
        self.tables.lock().await.raw_payloads.push(raw.clone());
        Ok(())
    }

    async fn upsert_activity(&self, activity: &NewActivity, now: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock().await;
        let existing = t
            .activities
            .values()
            .find(|a| {
                a.source == activity.source && a.source_activity_id == activity.source_activity_id
            })
            .map(|a| a.id);

        match existing {
            Some(id) => {
                if let Some(row) = t.activities.get_mut(&id) {
                    activity.clone().apply_to(row, now);
                }
            }
            None => {
                let id = t.next_id();
                t.activities
                    .insert(id, activity.clone().into_activity(id, now));
            }
        }
        Ok(())
    }

    async fn get_activity(&self, activity_id: i64) -> Result<Option<Activity>> {
        Ok(self.tables.lock().await.activities.get(&activity_id).cloned())
    }

    async fn get_activity_by_source(
        &self,
        source: &str,
        source_activity_id: i64,
    ) -> Result<Option<Activity>> {
        let t = self.tables.lock().await;
        Ok(t.activities
            .values()
            .find(|a| a.source == source && a.source_activity_id == source_activity_id)
            .cloned())
    }

    async fn update_avg_pace(
        &self,
        activity_id: i64,
        avg_pace: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        let activity = t
            .activities
            .get_mut(&activity_id)
            .ok_or_else(|| AppError::NotFound(format!("Activity {}", activity_id)))?;
        activity.avg_pace = avg_pace;
        activity.updated_at = now;
        Ok(())
    }

    async fn update_weather(
        &self,
        activity_id: i64,
        weather: &Weather,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.activities
            .get_mut(&activity_id)
            .ok_or_else(|| AppError::NotFound(format!("Activity {}", activity_id)))?
            .apply_weather(weather, now);
        Ok(())
    }

    async fn replace_laps(&self, activity_id: i64, laps: &[Lap]) -> Result<()> {
        self.tables
            .lock()
            .await
            .laps
            .insert(activity_id, laps.to_vec());
        Ok(())
    }

    async fn get_laps(&self, activity_id: i64) -> Result<Vec<Lap>> {
        let t = self.tables.lock().await;
        let mut laps = t.laps.get(&activity_id).cloned().unwrap_or_default();
        laps.sort_by_key(|l| l.lap_index);
        Ok(laps)
    }

    async fn upsert_streams(&self, streams: &ActivityStreams) -> Result<()> {
        self.tables
            .lock()
            .await
            .streams
            .insert(streams.activity_id, streams.clone());
        Ok(())
    }

    async fn get_streams(&self, activity_id: i64) -> Result<Option<ActivityStreams>> {
        Ok(self.tables.lock().await.streams.get(&activity_id).cloned())
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn apply_contribution(
        &self,
        contribution: &DailyContribution,
        now: DateTime<Utc>,
    ) -> Result<ContributionChange> {
        let mut t = self.tables.lock().await;
        let counted_later = t.contributions.values().any(|c| {
            c.user_id == contribution.user_id
                && c.stat_date == contribution.stat_date
                && contribution.replays_before(c)
        });
        let change = classify(
            t.contributions.get(&contribution.activity_id),
            contribution,
            counted_later,
        );

        match &change {
            ContributionChange::Unchanged => {}
            ContributionChange::Fresh => {
                t.contributions
                    .insert(contribution.activity_id, contribution.clone());
                t.daily_stats
                    .entry((contribution.user_id, contribution.stat_date))
                    .or_insert_with(|| {
                        DailyStat::empty(contribution.user_id, contribution.stat_date, now)
                    })
                    .apply(contribution, now);
            }
            ContributionChange::Backdated { stat_date } => {
                t.contributions
                    .insert(contribution.activity_id, contribution.clone());
                t.rebuild_day(contribution.user_id, *stat_date, now);
            }
            ContributionChange::Corrected { affected_dates } => {
                t.contributions
                    .insert(contribution.activity_id, contribution.clone());
                for date in affected_dates {
                    t.rebuild_day(contribution.user_id, *date, now);
                }
            }
        }
        Ok(change)
    }

    async fn get_daily_stat(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
    ) -> Result<Option<DailyStat>> {
        Ok(self
            .tables
            .lock()
            .await
            .daily_stats
            .get(&(user_id, stat_date))
            .cloned())
    }

    async fn get_contribution(&self, activity_id: i64) -> Result<Option<DailyContribution>> {
        Ok(self
            .tables
            .lock()
            .await
            .contributions
            .get(&activity_id)
            .cloned())
    }
}
