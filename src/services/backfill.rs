// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Admin-triggered backfill: list provider activities, enqueue one job each.

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{EnqueueOutcome, JobType, Provider};
use crate::services::strava::ActivityFetcher;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use std::sync::Arc;

const MAX_CONCURRENT_ENQUEUES: usize = 16;

/// Upper bound on pages walked by `enqueue_all`.
pub const MAX_BACKFILL_PAGES: u32 = 50;

/// Outcome of enqueueing one or more listing pages.
#[derive(Debug, Clone, Default)]
pub struct BackfillResult {
    /// Activities returned by the provider.
    pub listed_count: u32,
    /// New jobs created.
    pub enqueued_count: u32,
    /// Activities that already had a PENDING or RUNNING job.
    pub already_active_count: u32,
    /// Activity IDs whose enqueue failed.
    pub failed_ids: Vec<i64>,
    /// Listing pages fetched.
    pub pages: u32,
}

impl BackfillResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed_ids.is_empty()
    }

    /// Nothing was enqueued and at least one enqueue failed.
    pub fn is_complete_failure(&self) -> bool {
        self.enqueued_count == 0 && self.already_active_count == 0 && !self.failed_ids.is_empty()
    }

    fn absorb(&mut self, other: BackfillResult) {
        self.listed_count += other.listed_count;
        self.enqueued_count += other.enqueued_count;
        self.already_active_count += other.already_active_count;
        self.failed_ids.extend(other.failed_ids);
        self.pages += other.pages;
    }
}

#[derive(Clone)]
pub struct BackfillService {
    db: Arc<dyn Database>,
    fetcher: Arc<dyn ActivityFetcher>,
}

impl BackfillService {
    pub fn new(db: Arc<dyn Database>, fetcher: Arc<dyn ActivityFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Enqueue one listing page of the user's activities.
    pub async fn enqueue_window(
        &self,
        user_id: i64,
        after: Option<i64>,
        before: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<BackfillResult> {
        self.require_link(user_id).await?;
        self.enqueue_page(user_id, after, before, page, per_page)
            .await
    }

    /// Walk listing pages from 1 until a short page (or the page cap).
    pub async fn enqueue_all(
        &self,
        user_id: i64,
        after: Option<i64>,
        before: Option<i64>,
        per_page: u32,
    ) -> Result<BackfillResult> {
        self.require_link(user_id).await?;

        let mut total = BackfillResult::default();
        for page in 1..=MAX_BACKFILL_PAGES {
            let result = self
                .enqueue_page(user_id, after, before, page, per_page)
                .await?;
            let short_page = result.listed_count < per_page;
            total.absorb(result);
            if short_page {
                return Ok(total);
            }
        }

        tracing::warn!(
            user_id,
            pages = MAX_BACKFILL_PAGES,
            "Backfill stopped at page cap"
        );
        Ok(total)
    }

    async fn require_link(&self, user_id: i64) -> Result<()> {
        match self.db.get_link(user_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::BadRequest(format!(
                "No linked Strava athlete for user {}",
                user_id
            ))),
        }
    }

    async fn enqueue_page(
        &self,
        user_id: i64,
        after: Option<i64>,
        before: Option<i64>,
        page: u32,
        per_page: u32,
    ) -> Result<BackfillResult> {
        let activities = self
            .fetcher
            .list_activities(user_id, after, before, page, per_page)
            .await?;

        let now = Utc::now();
        let ids: Vec<i64> = activities.iter().map(|a| a.id).collect();
        let outcomes: Vec<(i64, Result<EnqueueOutcome>)> = stream::iter(ids)
            .map(|activity_id| async move {
                let outcome = self
                    .db
                    .enqueue(
                        Provider::Strava,
                        activity_id,
                        Some(user_id),
                        JobType::ActivityUpsert,
                        now,
                    )
                    .await;
                (activity_id, outcome)
            })
            .buffer_unordered(MAX_CONCURRENT_ENQUEUES)
            .collect()
            .await;

        let mut result = BackfillResult {
            listed_count: activities.len() as u32,
            pages: 1,
            ..Default::default()
        };
        for (activity_id, outcome) in outcomes {
            match outcome {
                Ok(EnqueueOutcome::Enqueued(_)) => result.enqueued_count += 1,
                Ok(EnqueueOutcome::AlreadyActive(_)) => result.already_active_count += 1,
                Err(e) => {
                    tracing::warn!(activity_id, error = %e, "Failed to enqueue backfill job");
                    result.failed_ids.push(activity_id);
                }
            }
        }

        tracing::info!(
            user_id,
            page,
            per_page,
            listed = result.listed_count,
            enqueued = result.enqueued_count,
            already_active = result.already_active_count,
            failed = result.failed_ids.len(),
            "Backfill page enqueued"
        );

        Ok(result)
    }
}
