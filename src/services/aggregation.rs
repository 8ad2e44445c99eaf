// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Derived activity metrics and daily rollups.

use crate::db::Database;
use crate::error::AppError;
use crate::models::stats::ContributionChange;
use crate::models::{Activity, ActivityStreams, DailyContribution};
use chrono::Utc;
use std::sync::Arc;

/// Result of refreshing one activity's derived values.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshResult {
    pub avg_pace: Option<i32>,
    pub change: ContributionChange,
}

/// Average pace in seconds per km: velocity stream first, totals as fallback.
pub fn derive_avg_pace(activity: &Activity, streams: Option<&ActivityStreams>) -> Option<i32> {
    streams
        .and_then(ActivityStreams::velocity_pace)
        .or_else(|| activity.fallback_pace())
}

/// Computes per-activity pace and folds activities into `DailyStat`.
#[derive(Clone)]
pub struct AggregationService {
    db: Arc<dyn Database>,
}

impl AggregationService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Recompute the activity's pace and apply it to the user's day.
    ///
    /// Safe to call repeatedly: an unchanged activity leaves the day alone.
    pub async fn refresh(&self, user_id: i64, activity_id: i64) -> Result<RefreshResult, AppError> {
        let now = Utc::now();

        let activity = self
            .db
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Activity {}", activity_id)))?;
        let streams = self.db.get_streams(activity_id).await?;

        let avg_pace = derive_avg_pace(&activity, streams.as_ref());
        // An underivable pace keeps whatever the activity already holds.
        if avg_pace.is_some() {
            self.db.update_avg_pace(activity_id, avg_pace, now).await?;
        }

        let mut contribution = DailyContribution::from_activity(&activity, avg_pace);
        contribution.user_id = user_id;

        let change = self.db.apply_contribution(&contribution, now).await?;

        tracing::debug!(
            user_id,
            activity_id,
            avg_pace,
            stat_date = %contribution.stat_date,
            change = ?change,
            "Daily stats refreshed"
        );

        Ok(RefreshResult { avg_pace, change })
    }
}
