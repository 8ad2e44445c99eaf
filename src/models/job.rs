// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Ingest job model and retry policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of attempts after which a failing job stops being rescheduled.
pub const MAX_RETRY_COUNT: i32 = 5;

/// Backoff delays in seconds, indexed by the job's retry count at failure time.
const BACKOFF_SCHEDULE_SECS: [i64; 4] = [5 * 60, 15 * 60, 30 * 60, 60 * 60];

/// Delay applied once the schedule above is exhausted.
const BACKOFF_CEILING_SECS: i64 = 3 * 60 * 60;

/// Delay before a failed job becomes due again.
pub fn backoff_delay(retry_count: i32) -> Duration {
    let secs = usize::try_from(retry_count)
        .ok()
        .and_then(|idx| BACKOFF_SCHEDULE_SECS.get(idx).copied())
        .unwrap_or(BACKOFF_CEILING_SECS);
    Duration::seconds(secs)
}

/// Queue status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Active jobs block a second enqueue for the same key.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownTag;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Remote provider an activity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Strava,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Strava => "STRAVA",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STRAVA" => Ok(Provider::Strava),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    ActivityUpsert,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ActivityUpsert => "ACTIVITY_UPSERT",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVITY_UPSERT" => Ok(JobType::ActivityUpsert),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

/// A stored tag that this build does not know about.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tag: {0}")]
pub struct UnknownTag(pub String);

/// A unit of deferred ingestion work.
///
/// `provider` and `job_type` stay as the stored strings so that rows written
/// by other builds can still be loaded and resolved.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestJob {
    pub id: i64,
    pub provider: String,
    pub provider_ref_id: i64,
    pub user_id: Option<i64>,
    pub job_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    /// `None` once the job has permanently failed.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Claim lease; the job is hidden from other claimers until this passes.
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestJob {
    /// Build a fresh PENDING job due at `now` (id assigned by the store).
    pub fn new_pending(
        provider: Provider,
        provider_ref_id: i64,
        user_id: Option<i64>,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            provider: provider.as_str().to_string(),
            provider_ref_id,
            user_id,
            job_type: job_type.as_str().to_string(),
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_run_at: Some(now),
            locked_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolve the stored tags into a dispatchable kind.
    pub fn kind(&self) -> Option<JobKind> {
        match (self.provider.parse(), self.job_type.parse()) {
            (Ok(Provider::Strava), Ok(JobType::ActivityUpsert)) => {
                Some(JobKind::StravaActivityUpsert)
            }
            _ => None,
        }
    }

    pub fn key_matches(&self, provider: Provider, provider_ref_id: i64, job_type: JobType) -> bool {
        self.provider == provider.as_str()
            && self.provider_ref_id == provider_ref_id
            && self.job_type == job_type.as_str()
    }
}

/// Supported (provider, job type) combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    StravaActivityUpsert,
}

/// Result of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new PENDING job was created.
    Enqueued(i64),
    /// An active job for the same key already exists.
    AlreadyActive(i64),
}

impl EnqueueOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

/// How a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to PENDING, due again at the given time.
    Retry { next_run_at: DateTime<Utc> },
    /// Frozen in FAILED.
    Permanent,
}

/// Decide what a failure with `retry_count` prior attempts turns into.
pub fn failure_outcome(retry_count: i32, max_retries: i32, now: DateTime<Utc>) -> FailureOutcome {
    if retry_count < max_retries {
        FailureOutcome::Retry {
            next_run_at: now + backoff_delay(retry_count),
        }
    } else {
        FailureOutcome::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_strictly_increasing() {
        let delays: Vec<i64> = (0..4).map(|n| backoff_delay(n).num_seconds()).collect();
        assert_eq!(delays, vec![300, 900, 1800, 3600]);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_backoff_ceiling() {
        assert_eq!(backoff_delay(4).num_seconds(), 10800);
        assert_eq!(backoff_delay(5).num_seconds(), 10800);
        assert_eq!(backoff_delay(42).num_seconds(), 10800);
        assert_eq!(backoff_delay(-1).num_seconds(), 10800);
    }

    #[test]
    fn test_failure_outcome_retry_vs_permanent() {
        let now = Utc::now();
        assert_eq!(
            failure_outcome(0, MAX_RETRY_COUNT, now),
            FailureOutcome::Retry {
                next_run_at: now + Duration::seconds(300)
            }
        );
        assert_eq!(
            failure_outcome(4, MAX_RETRY_COUNT, now),
            FailureOutcome::Retry {
                next_run_at: now + Duration::seconds(10800)
            }
        );
        assert_eq!(
            failure_outcome(5, MAX_RETRY_COUNT, now),
            FailureOutcome::Permanent
        );
    }

    #[test]
    fn test_job_kind_dispatch() {
        let now = Utc::now();
        let job =
            IngestJob::new_pending(Provider::Strava, 1, Some(7), JobType::ActivityUpsert, now);
        assert_eq!(job.kind(), Some(JobKind::StravaActivityUpsert));

        let mut unknown = job.clone();
        unknown.provider = "GARMIN".to_string();
        assert_eq!(unknown.kind(), None);

        let mut unknown_type = job;
        unknown_type.job_type = "ATHLETE_SYNC".to_string();
        assert_eq!(unknown_type.kind(), None);
    }

    #[test]
    fn test_status_round_trip_tags() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("QUEUED".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::try_from("DONE".to_string()), Ok(JobStatus::Done));
        assert!(JobStatus::try_from("queued".to_string()).is_err());
    }
}
