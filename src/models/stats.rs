//! Per-user, per-day running aggregates.
//!
//! A `DailyStat` is maintained incrementally as activities are ingested, but
//! it is always derivable by replaying the day's `DailyContribution` rows.
//! Re-ingesting an activity with different numbers replaces its contribution
//! and rebuilds the affected days instead of merging twice.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Activity;

/// Aggregate row keyed by (user_id, stat_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyStat {
    pub user_id: i64,
    /// UTC calendar date
    pub stat_date: NaiveDate,
    pub run_count: i32,
    /// Meters
    pub total_distance: f64,
    /// Seconds
    pub total_moving_time: i64,
    /// Seconds per kilometer, weighted by moving time
    pub avg_pace: Option<i32>,
    /// Beats per minute, weighted by moving time
    pub avg_hr: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl DailyStat {
    pub fn empty(user_id: i64, stat_date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            stat_date,
            run_count: 0,
            total_distance: 0.0,
            total_moving_time: 0,
            avg_pace: None,
            avg_hr: None,
            updated_at: now,
        }
    }

    /// Merge one activity's contribution into the day.
    pub fn apply(&mut self, c: &DailyContribution, now: DateTime<Utc>) {
        // Weights must be read before the totals move.
        let old_weight = self.total_moving_time;
        self.avg_pace = weighted_merge(self.avg_pace, old_weight, c.avg_pace, c.moving_time);
        self.avg_hr = weighted_merge(self.avg_hr, old_weight, c.avg_hr, c.moving_time);

        self.run_count += 1;
        self.total_distance += c.distance;
        self.total_moving_time += c.moving_time;
        self.updated_at = now;
    }

    /// Rebuild a day from its contributions, applied in (start_time, activity_id) order.
    ///
    /// Returns `None` when no contribution falls on the day.
    pub fn replay(
        user_id: i64,
        stat_date: NaiveDate,
        contributions: &[DailyContribution],
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let mut day: Vec<&DailyContribution> = contributions
            .iter()
            .filter(|c| c.user_id == user_id && c.stat_date == stat_date)
            .collect();

        if day.is_empty() {
            return None;
        }

        day.sort_by_key(|c| c.replay_key());

        let mut stat = Self::empty(user_id, stat_date, now);
        for c in day {
            stat.apply(c, now);
        }
        Some(stat)
    }
}

/// Time-weighted average of two optional values.
///
/// `floor((old * old_weight + new * new_weight) / (old_weight + new_weight))`.
/// A missing operand is ignored; if both weights are zero the new value wins.
pub fn weighted_merge(
    old: Option<i32>,
    old_weight: i64,
    new: Option<i32>,
    new_weight: i64,
) -> Option<i32> {
    match (old, new) {
        (None, None) => None,
        (Some(o), None) => Some(o),
        (None, Some(n)) => Some(n),
        (Some(o), Some(n)) => {
            let total = old_weight + new_weight;
            if total == 0 {
                return Some(n);
            }
            let sum = o as i64 * old_weight + n as i64 * new_weight;
            Some(sum.div_euclid(total) as i32)
        }
    }
}

/// What a single activity last added to its day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyContribution {
    pub user_id: i64,
    pub activity_id: i64,
    pub stat_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub distance: f64,
    pub moving_time: i64,
    pub avg_pace: Option<i32>,
    pub avg_hr: Option<i32>,
}

impl DailyContribution {
    pub fn from_activity(activity: &Activity, avg_pace: Option<i32>) -> Self {
        Self {
            user_id: activity.user_id,
            activity_id: activity.id,
            stat_date: activity.stat_date(),
            start_time: activity.start_time,
            distance: activity.distance,
            moving_time: activity.moving_time,
            avg_pace,
            avg_hr: activity.avg_hr,
        }
    }

    /// Position of this contribution when its day is replayed.
    pub fn replay_key(&self) -> (DateTime<Utc>, i64) {
        (self.start_time, self.activity_id)
    }

    /// True when `self` would be applied before `other` on replay.
    pub fn replays_before(&self, other: &DailyContribution) -> bool {
        self.replay_key() < other.replay_key()
    }
}

/// How a new contribution relates to the one already applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ContributionChange {
    /// Identical to what is already counted.
    Unchanged,
    /// Activity not counted yet; merge incrementally.
    Fresh,
    /// Activity not counted yet, but it starts before one already counted
    /// on the same day. Merging at the end would not match a replay, so the
    /// day is rebuilt.
    Backdated { stat_date: NaiveDate },
    /// Activity counted with different numbers; the listed days must be rebuilt.
    Corrected { affected_dates: Vec<NaiveDate> },
}

/// `counted_later` says whether the day already holds a contribution that
/// replays after `next`.
pub fn classify(
    prev: Option<&DailyContribution>,
    next: &DailyContribution,
    counted_later: bool,
) -> ContributionChange {
    match prev {
        None if counted_later => ContributionChange::Backdated {
            stat_date: next.stat_date,
        },
        None => ContributionChange::Fresh,
        Some(p) if p == next => ContributionChange::Unchanged,
        Some(p) => {
            let mut affected_dates = vec![p.stat_date];
            if next.stat_date != p.stat_date {
                affected_dates.push(next.stat_date);
            }
            ContributionChange::Corrected { affected_dates }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contribution(
        activity_id: i64,
        hour: u32,
        moving_time: i64,
        avg_pace: Option<i32>,
        avg_hr: Option<i32>,
    ) -> DailyContribution {
        let start_time = Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap();
        DailyContribution {
            user_id: 1,
            activity_id,
            stat_date: start_time.date_naive(),
            start_time,
            distance: 5000.0,
            moving_time,
            avg_pace,
            avg_hr,
        }
    }

    #[test]
    fn test_weighted_merge_pace() {
        // 300 s/km over 1800 s plus 330 s/km over 900 s
        assert_eq!(weighted_merge(Some(300), 1800, Some(330), 900), Some(310));
    }

    #[test]
    fn test_weighted_merge_floors() {
        // (100 * 1 + 101 * 1) / 2 = 100.5 -> 100
        assert_eq!(weighted_merge(Some(100), 1, Some(101), 1), Some(100));
    }

    #[test]
    fn test_weighted_merge_missing_operands() {
        assert_eq!(weighted_merge(None, 1800, Some(330), 900), Some(330));
        assert_eq!(weighted_merge(Some(300), 1800, None, 900), Some(300));
        assert_eq!(weighted_merge(None, 1800, None, 900), None);
    }

    #[test]
    fn test_weighted_merge_zero_weights() {
        assert_eq!(weighted_merge(Some(300), 0, Some(330), 0), Some(330));
    }

    #[test]
    fn test_apply_accumulates_totals() {
        let now = Utc::now();
        let first = contribution(1, 6, 1800, Some(300), Some(150));
        let second = contribution(2, 18, 900, Some(330), None);

        let mut stat = DailyStat::empty(1, first.stat_date, now);
        stat.apply(&first, now);
        stat.apply(&second, now);

        assert_eq!(stat.run_count, 2);
        assert_eq!(stat.total_distance, 10000.0);
        assert_eq!(stat.total_moving_time, 2700);
        assert_eq!(stat.avg_pace, Some(310));
        assert_eq!(stat.avg_hr, Some(150));
    }

    #[test]
    fn test_replay_orders_by_start_time() {
        let now = Utc::now();
        let early = contribution(9, 6, 1800, Some(300), None);
        let late = contribution(3, 18, 900, Some(330), None);

        // Supplied out of order; replay must match incremental ingestion order.
        let stat = DailyStat::replay(1, early.stat_date, &[late.clone(), early.clone()], now)
            .unwrap();

        let mut incremental = DailyStat::empty(1, early.stat_date, now);
        incremental.apply(&early, now);
        incremental.apply(&late, now);

        assert_eq!(stat, incremental);
    }

    #[test]
    fn test_replay_empty_day() {
        let c = contribution(1, 6, 1800, Some(300), None);
        let other_day = c.stat_date.succ_opt().unwrap();
        assert_eq!(DailyStat::replay(1, other_day, &[c], Utc::now()), None);
    }

    #[test]
    fn test_incremental_order_differs_from_replay() {
        // Paces 312, 250, 125 at 08h, 06h, 07h. Flooring at each merge
        // makes arrival order visible in the result.
        let now = Utc::now();
        let a = contribution(1, 6, 1000, Some(250), None);
        let b = contribution(2, 7, 1000, Some(125), None);
        let c = contribution(3, 8, 1000, Some(312), None);

        let mut arrival = DailyStat::empty(1, a.stat_date, now);
        for x in [&c, &a, &b] {
            arrival.apply(x, now);
        }
        let replayed = DailyStat::replay(1, a.stat_date, &[c.clone(), a.clone(), b.clone()], now)
            .unwrap();

        assert_eq!(arrival.avg_pace, Some(229));
        assert_eq!(replayed.avg_pace, Some(228));
        assert!(a.replays_before(&c));
        assert!(!c.replays_before(&b));
    }

    #[test]
    fn test_classify() {
        let c = contribution(1, 6, 1800, Some(300), None);
        assert_eq!(classify(None, &c, false), ContributionChange::Fresh);
        assert_eq!(
            classify(None, &c, true),
            ContributionChange::Backdated {
                stat_date: c.stat_date
            }
        );
        assert_eq!(classify(Some(&c), &c.clone(), false), ContributionChange::Unchanged);

        let mut faster = c.clone();
        faster.avg_pace = Some(290);
        assert_eq!(
            classify(Some(&c), &faster, false),
            ContributionChange::Corrected {
                affected_dates: vec![c.stat_date]
            }
        );

        let mut moved = c.clone();
        moved.start_time = c.start_time + chrono::Duration::days(1);
        moved.stat_date = moved.start_time.date_naive();
        assert_eq!(
            classify(Some(&c), &moved, true),
            ContributionChange::Corrected {
                affected_dates: vec![c.stat_date, moved.stat_date]
            }
        );
    }
}
