/*!
Retention and scheduling decisions.

Everything here is a pure function of its arguments: the current time is
always passed in, and the pool-capacity check used for prune deferral is an
injected [`PruneDeferral`] predicate.
*/

use crate::config::SnapshotTiming;
use crate::dataset::{DatasetNode, DatasetTree};
use crate::property::RecursionMode;
use crate::snapshot::SnapshotRecord;
use crate::SnapshotPeriod;
use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use std::collections::BTreeMap;
use tracing::debug;

/// How many snapshots of each periodic kind to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionCounts {
    pub frequent: u64,
    pub hourly: u64,
    pub daily: u64,
    pub weekly: u64,
    pub monthly: u64,
    pub yearly: u64,
}

impl RetentionCounts {
    /// Manual and temporary snapshots have no retention count
    pub fn for_period(&self, period: SnapshotPeriod) -> u64 {
        match period {
            SnapshotPeriod::Frequent => self.frequent,
            SnapshotPeriod::Hourly => self.hourly,
            SnapshotPeriod::Daily => self.daily,
            SnapshotPeriod::Weekly => self.weekly,
            SnapshotPeriod::Monthly => self.monthly,
            SnapshotPeriod::Yearly => self.yearly,
            SnapshotPeriod::Manual | SnapshotPeriod::Temporary => 0,
        }
    }
}

/// A dataset's policy with inheritance already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPolicy {
    pub enabled: bool,
    pub take_snapshots: bool,
    pub prune_snapshots: bool,
    pub recursion: RecursionMode,
    pub template: String,
    pub retention: RetentionCounts,
    /// Pool used-capacity percentage below which pruning waits; 0 disables
    pub prune_deferral: u8,
}

/// Decides whether pruning a dataset should wait for its pool to fill up
#[cfg_attr(test, mockall::automock)]
pub trait PruneDeferral {
    fn should_defer(&self, node: &DatasetNode, threshold_percent: u8) -> bool;
}

/// Never defers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDeferral;

impl PruneDeferral for NoDeferral {
    fn should_defer(&self, _node: &DatasetNode, _threshold_percent: u8) -> bool {
        false
    }
}

/// Defers pruning while a pool's used capacity is below the threshold.
///
/// Capacity comes from each pool root's `used` and `available` bytes.
#[derive(Debug, Clone, Default)]
pub struct PoolCapacityDeferral {
    used_percent: BTreeMap<String, u8>,
}

impl PoolCapacityDeferral {
    pub fn from_tree(tree: &DatasetTree) -> Self {
        let used_percent = tree
            .pool_roots()
            .map(|root| {
                let used = u128::from(root.used_bytes());
                let total = used + u128::from(root.available_bytes());
                let percent = if total == 0 { 100 } else { used * 100 / total };
                (root.name().to_string(), percent as u8)
            })
            .collect();
        Self { used_percent }
    }

    pub fn used_percent(&self, pool: &str) -> Option<u8> {
        self.used_percent.get(pool).copied()
    }
}

impl PruneDeferral for PoolCapacityDeferral {
    fn should_defer(&self, node: &DatasetNode, threshold_percent: u8) -> bool {
        self.used_percent(node.pool_name())
            .is_some_and(|used| used < threshold_percent)
    }
}

/// Whether a new snapshot of `period` is due for `node` at `now`.
///
/// A snapshot is due once the most recent scheduled boundary has passed and
/// the node's last snapshot of that period predates it. Periods with a
/// retention count of zero are never due.
pub fn is_snapshot_due(
    node: &DatasetNode,
    policy: &DatasetPolicy,
    timing: &SnapshotTiming,
    period: SnapshotPeriod,
    now: DateTime<Utc>,
) -> bool {
    if !period.is_periodic() || policy.retention.for_period(period) == 0 {
        return false;
    }

    let Some(boundary) = most_recent_boundary(timing, period, now) else {
        return false;
    };

    match node.last_snapshot_at(period) {
        Some(last) => last < boundary,
        None => true,
    }
}

/// Every periodic kind due for `node` at `now`, shortest period first
pub fn due_periods(
    node: &DatasetNode,
    policy: &DatasetPolicy,
    timing: &SnapshotTiming,
    now: DateTime<Utc>,
) -> Vec<SnapshotPeriod> {
    SnapshotPeriod::PERIODIC
        .into_iter()
        .filter(|period| is_snapshot_due(node, policy, timing, *period, now))
        .collect()
}

/// The latest scheduled boundary for `period` at or before `now`
pub fn most_recent_boundary(
    timing: &SnapshotTiming,
    period: SnapshotPeriod,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if timing.use_local_time {
        boundary_in(&Local, timing, period, now)
    } else {
        boundary_in(&Utc, timing, period, now)
    }
}

fn boundary_in<Tz: TimeZone>(
    tz: &Tz,
    timing: &SnapshotTiming,
    period: SnapshotPeriod,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(tz).naive_local();
    let date = local.date();

    let boundary = match period {
        SnapshotPeriod::Frequent => {
            let step = timing.frequent_period.max(1);
            let minute = local.minute() - local.minute() % step;
            date.and_hms_opt(local.hour(), minute, 0)?
        }
        SnapshotPeriod::Hourly => {
            let this_hour = date.and_hms_opt(local.hour(), timing.hourly_minute, 0)?;
            latest_not_after(this_hour, this_hour - Duration::hours(1), local)
        }
        SnapshotPeriod::Daily => {
            let today = date.and_time(timing.daily_time);
            latest_not_after(today, today - Duration::days(1), local)
        }
        SnapshotPeriod::Weekly => {
            let days_back = (7 + date.weekday().num_days_from_monday()
                - timing.weekly_day.num_days_from_monday())
                % 7;
            let this_week = (date - Duration::days(i64::from(days_back))).and_time(timing.weekly_time);
            latest_not_after(this_week, this_week - Duration::days(7), local)
        }
        SnapshotPeriod::Monthly => {
            let this_month =
                clamped_date(date.year(), date.month(), timing.monthly_day)?.and_time(timing.monthly_time);
            let (year, month) = if date.month() == 1 {
                (date.year() - 1, 12)
            } else {
                (date.year(), date.month() - 1)
            };
            let last_month =
                clamped_date(year, month, timing.monthly_day)?.and_time(timing.monthly_time);
            latest_not_after(this_month, last_month, local)
        }
        SnapshotPeriod::Yearly => {
            let this_year = clamped_date(date.year(), timing.yearly_month, timing.yearly_day)?
                .and_time(timing.yearly_time);
            let last_year = clamped_date(date.year() - 1, timing.yearly_month, timing.yearly_day)?
                .and_time(timing.yearly_time);
            latest_not_after(this_year, last_year, local)
        }
        SnapshotPeriod::Manual | SnapshotPeriod::Temporary => return None,
    };

    resolve_local(tz, boundary)
}

fn latest_not_after(current: NaiveDateTime, previous: NaiveDateTime, now: NaiveDateTime) -> NaiveDateTime {
    if current <= now {
        current
    } else {
        previous
    }
}

/// `day` of the given month, clamped to the month's last day
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let last_day = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()?.day();
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last_day))
}

/// Map a wall-clock time back to an instant. Times skipped by a DST jump
/// resolve to the first instant after the gap.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|instant| instant.with_timezone(&Utc))
}

/// Snapshots of `period` on `node` beyond the retention count, oldest first.
///
/// Manual and temporary snapshots are never returned. When the policy sets a
/// prune-deferral percentage and `deferral` says the pool still has room,
/// nothing is returned for this node.
pub fn snapshots_to_prune(
    node: &DatasetNode,
    policy: &DatasetPolicy,
    period: SnapshotPeriod,
    deferral: &dyn PruneDeferral,
) -> Vec<SnapshotRecord> {
    if !period.is_periodic() {
        return Vec::new();
    }

    let keep = usize::try_from(policy.retention.for_period(period)).unwrap_or(usize::MAX);
    let mut newest_first: Vec<&SnapshotRecord> = node.snapshots(period).collect();
    if newest_first.len() <= keep {
        return Vec::new();
    }

    if policy.prune_deferral > 0 && deferral.should_defer(node, policy.prune_deferral) {
        debug!(
            "{}: pruning {} snapshots deferred below {}% pool usage",
            node.name(),
            period,
            policy.prune_deferral
        );
        return Vec::new();
    }

    newest_first.sort_by(|a, b| b.cmp(a));
    let mut expired: Vec<SnapshotRecord> = newest_first.into_iter().skip(keep).cloned().collect();
    expired.sort();
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use chrono::{FixedOffset, LocalResult, NaiveTime, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn policy() -> DatasetPolicy {
        DatasetPolicy {
            enabled: true,
            take_snapshots: true,
            prune_snapshots: true,
            recursion: RecursionMode::SnapKeep,
            template: "default".to_string(),
            retention: RetentionCounts {
                frequent: 4,
                hourly: 48,
                daily: 2,
                weekly: 4,
                monthly: 6,
                yearly: 1,
            },
            prune_deferral: 0,
        }
    }

    fn node_with(snapshots: &[(&str, SnapshotPeriod, DateTime<Utc>)]) -> DatasetNode {
        let mut node = DatasetNode::new("pool1", DatasetKind::FileSystem).unwrap();
        for (short, period, ts) in snapshots {
            node.add_snapshot(
                SnapshotRecord::new(format!("pool1@{short}"), *period, *ts, false).unwrap(),
            )
            .unwrap();
        }
        node
    }

    #[test]
    fn test_hourly_due_at_configured_minute() {
        let timing = SnapshotTiming::utc();
        let node = node_with(&[("h", SnapshotPeriod::Hourly, utc(2024, 5, 1, 12, 0, 0))]);

        assert!(!is_snapshot_due(
            &node,
            &policy(),
            &timing,
            SnapshotPeriod::Hourly,
            utc(2024, 5, 1, 12, 59, 59)
        ));
        assert!(is_snapshot_due(
            &node,
            &policy(),
            &timing,
            SnapshotPeriod::Hourly,
            utc(2024, 5, 1, 13, 0, 0)
        ));
    }

    #[test]
    fn test_hourly_with_offset_minute() {
        let timing = SnapshotTiming {
            hourly_minute: 30,
            ..SnapshotTiming::utc()
        };
        let node = node_with(&[("h", SnapshotPeriod::Hourly, utc(2024, 5, 1, 11, 30, 0))]);

        // 12:10 is before the 12:30 boundary, so the 11:30 snapshot still covers it
        assert!(!is_snapshot_due(
            &node,
            &policy(),
            &timing,
            SnapshotPeriod::Hourly,
            utc(2024, 5, 1, 12, 10, 0)
        ));
        assert!(is_snapshot_due(
            &node,
            &policy(),
            &timing,
            SnapshotPeriod::Hourly,
            utc(2024, 5, 1, 12, 30, 0)
        ));
    }

    #[test]
    fn test_frequent_boundaries_align_to_the_hour() {
        let timing = SnapshotTiming {
            frequent_period: 15,
            ..SnapshotTiming::utc()
        };
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Frequent, utc(2024, 5, 1, 9, 44, 59)),
            Some(utc(2024, 5, 1, 9, 30, 0))
        );

        let node = node_with(&[("f", SnapshotPeriod::Frequent, utc(2024, 5, 1, 9, 30, 0))]);
        assert!(!is_snapshot_due(
            &node,
            &policy(),
            &timing,
            SnapshotPeriod::Frequent,
            utc(2024, 5, 1, 9, 44, 59)
        ));
        assert!(is_snapshot_due(
            &node,
            &policy(),
            &timing,
            SnapshotPeriod::Frequent,
            utc(2024, 5, 1, 9, 45, 0)
        ));
    }

    #[test]
    fn test_daily_uses_configured_time_of_day() {
        let timing = SnapshotTiming {
            daily_time: NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            ..SnapshotTiming::utc()
        };
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Daily, utc(2024, 5, 2, 1, 0, 0)),
            Some(utc(2024, 5, 1, 2, 30, 0))
        );
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Daily, utc(2024, 5, 2, 2, 30, 0)),
            Some(utc(2024, 5, 2, 2, 30, 0))
        );
    }

    #[test]
    fn test_boundaries_follow_a_fixed_offset_zone() {
        let india = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let timing = SnapshotTiming {
            daily_time: NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            ..SnapshotTiming::utc()
        };

        // 03:30 local on May 2nd
        assert_eq!(
            boundary_in(&india, &timing, SnapshotPeriod::Daily, utc(2024, 5, 1, 22, 0, 0)),
            Some(utc(2024, 5, 1, 21, 0, 0))
        );
        // 01:30 local on May 2nd, still before that day's boundary
        assert_eq!(
            boundary_in(&india, &timing, SnapshotPeriod::Daily, utc(2024, 5, 1, 20, 0, 0)),
            Some(utc(2024, 4, 30, 21, 0, 0))
        );
        // Local hours start on the half hour in UTC
        assert_eq!(
            boundary_in(&india, &timing, SnapshotPeriod::Hourly, utc(2024, 5, 1, 12, 45, 0)),
            Some(utc(2024, 5, 1, 12, 30, 0))
        );
    }

    /// UTC+1 until 2024-03-31 01:00 UTC, then UTC+2. Local 02:00 to 03:00
    /// on that day never happens.
    #[derive(Debug, Clone, Copy)]
    struct SpringForward;

    impl SpringForward {
        fn switch() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 31)
                .unwrap()
                .and_hms_opt(1, 0, 0)
                .unwrap()
        }

        fn winter() -> FixedOffset {
            FixedOffset::east_opt(3600).unwrap()
        }

        fn summer() -> FixedOffset {
            FixedOffset::east_opt(7200).unwrap()
        }
    }

    impl TimeZone for SpringForward {
        type Offset = FixedOffset;

        fn from_offset(_offset: &FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_time(NaiveTime::MIN))
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let before = *local - Duration::hours(1) < Self::switch();
            let after = *local - Duration::hours(2) >= Self::switch();
            match (before, after) {
                (true, false) => LocalResult::Single(Self::winter()),
                (false, true) => LocalResult::Single(Self::summer()),
                (true, true) => LocalResult::Ambiguous(Self::winter(), Self::summer()),
                (false, false) => LocalResult::None,
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_time(NaiveTime::MIN))
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if *utc < Self::switch() {
                Self::winter()
            } else {
                Self::summer()
            }
        }
    }

    #[test]
    fn test_wall_time_in_dst_gap_resolves_past_the_gap() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(
            resolve_local(&SpringForward, day.and_hms_opt(1, 30, 0).unwrap()),
            Some(utc(2024, 3, 31, 0, 30, 0))
        );
        // 02:30 is skipped; 03:30 summer time is 01:30 UTC
        assert_eq!(
            resolve_local(&SpringForward, day.and_hms_opt(2, 30, 0).unwrap()),
            Some(utc(2024, 3, 31, 1, 30, 0))
        );

        let timing = SnapshotTiming {
            daily_time: NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            ..SnapshotTiming::utc()
        };
        assert_eq!(
            boundary_in(&SpringForward, &timing, SnapshotPeriod::Daily, utc(2024, 3, 31, 6, 0, 0)),
            Some(utc(2024, 3, 31, 1, 30, 0))
        );
        assert_eq!(
            boundary_in(&SpringForward, &timing, SnapshotPeriod::Daily, utc(2024, 4, 1, 6, 0, 0)),
            Some(utc(2024, 4, 1, 0, 30, 0))
        );
    }

    #[test]
    fn test_weekly_keys_on_day_of_week() {
        let timing = SnapshotTiming {
            weekly_day: Weekday::Sun,
            ..SnapshotTiming::utc()
        };
        // 2024-05-01 is a Wednesday; the previous Sunday is 2024-04-28
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Weekly, utc(2024, 5, 1, 12, 0, 0)),
            Some(utc(2024, 4, 28, 0, 0, 0))
        );
        // On the Sunday itself the boundary is that midnight
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Weekly, utc(2024, 5, 5, 0, 0, 1)),
            Some(utc(2024, 5, 5, 0, 0, 0))
        );
    }

    #[test]
    fn test_weekly_before_time_on_the_day_falls_back_a_week() {
        let timing = SnapshotTiming {
            weekly_day: Weekday::Wed,
            weekly_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            ..SnapshotTiming::utc()
        };
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Weekly, utc(2024, 5, 1, 12, 0, 0)),
            Some(utc(2024, 4, 24, 18, 0, 0))
        );
    }

    #[test]
    fn test_monthly_day_clamps_to_month_length() {
        let timing = SnapshotTiming {
            monthly_day: 31,
            ..SnapshotTiming::utc()
        };
        // February 2024 has 29 days
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Monthly, utc(2024, 2, 29, 6, 0, 0)),
            Some(utc(2024, 2, 29, 0, 0, 0))
        );
        // Before April's clamped boundary (the 30th), March 31st applies
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Monthly, utc(2024, 4, 15, 0, 0, 0)),
            Some(utc(2024, 3, 31, 0, 0, 0))
        );
    }

    #[test]
    fn test_monthly_wraps_into_previous_year() {
        let timing = SnapshotTiming {
            monthly_day: 15,
            ..SnapshotTiming::utc()
        };
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Monthly, utc(2024, 1, 3, 0, 0, 0)),
            Some(utc(2023, 12, 15, 0, 0, 0))
        );
    }

    #[test]
    fn test_yearly_uses_month_and_clamped_day() {
        let timing = SnapshotTiming {
            yearly_month: 2,
            yearly_day: 30,
            ..SnapshotTiming::utc()
        };
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Yearly, utc(2023, 6, 1, 0, 0, 0)),
            Some(utc(2023, 2, 28, 0, 0, 0))
        );
        assert_eq!(
            most_recent_boundary(&timing, SnapshotPeriod::Yearly, utc(2024, 1, 1, 0, 0, 0)),
            Some(utc(2023, 2, 28, 0, 0, 0))
        );
    }

    #[test]
    fn test_never_snapshotted_is_due() {
        let node = node_with(&[]);
        assert!(is_snapshot_due(
            &node,
            &policy(),
            &SnapshotTiming::utc(),
            SnapshotPeriod::Daily,
            utc(2024, 5, 1, 0, 0, 0)
        ));
    }

    #[test]
    fn test_zero_retention_is_never_due() {
        let mut zero = policy();
        zero.retention.yearly = 0;
        let node = node_with(&[]);

        assert!(!is_snapshot_due(
            &node,
            &zero,
            &SnapshotTiming::utc(),
            SnapshotPeriod::Yearly,
            utc(2030, 1, 1, 0, 0, 0)
        ));
    }

    #[test]
    fn test_manual_is_never_due() {
        let node = node_with(&[]);
        assert!(!is_snapshot_due(
            &node,
            &policy(),
            &SnapshotTiming::utc(),
            SnapshotPeriod::Manual,
            utc(2024, 5, 1, 0, 0, 0)
        ));
    }

    #[test]
    fn test_due_periods_lists_every_due_kind() {
        let now = utc(2024, 5, 1, 0, 0, 0);
        let node = node_with(&[
            ("f", SnapshotPeriod::Frequent, now),
            ("h", SnapshotPeriod::Hourly, now),
        ]);

        let due = due_periods(&node, &policy(), &SnapshotTiming::utc(), now);
        assert_eq!(
            due,
            vec![
                SnapshotPeriod::Daily,
                SnapshotPeriod::Weekly,
                SnapshotPeriod::Monthly,
                SnapshotPeriod::Yearly
            ]
        );
    }

    #[test]
    fn test_prunes_oldest_beyond_retention() {
        let node = node_with(&[
            ("day1", SnapshotPeriod::Daily, utc(2024, 5, 1, 0, 0, 0)),
            ("day2", SnapshotPeriod::Daily, utc(2024, 5, 2, 0, 0, 0)),
            ("day3", SnapshotPeriod::Daily, utc(2024, 5, 3, 0, 0, 0)),
            ("day4", SnapshotPeriod::Daily, utc(2024, 5, 4, 0, 0, 0)),
        ]);

        let expired = snapshots_to_prune(&node, &policy(), SnapshotPeriod::Daily, &NoDeferral);
        let names: Vec<&str> = expired.iter().map(|s| s.short_name()).collect();
        assert_eq!(names, vec!["day1", "day2"]);
    }

    #[test]
    fn test_prune_count_is_excess_over_retention() {
        for count in 0..8u32 {
            let snapshots: Vec<(String, DateTime<Utc>)> = (0..count)
                .map(|i| (format!("s{i}"), utc(2024, 1, 1, i, 0, 0)))
                .collect();
            let refs: Vec<(&str, SnapshotPeriod, DateTime<Utc>)> = snapshots
                .iter()
                .map(|(n, ts)| (n.as_str(), SnapshotPeriod::Frequent, *ts))
                .collect();
            let node = node_with(&refs);

            let expired =
                snapshots_to_prune(&node, &policy(), SnapshotPeriod::Frequent, &NoDeferral);
            assert_eq!(expired.len(), (count as usize).saturating_sub(4));
            assert!(expired.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_manual_and_temporary_are_never_pruned() {
        let node = node_with(&[
            ("m1", SnapshotPeriod::Manual, utc(2020, 1, 1, 0, 0, 0)),
            ("m2", SnapshotPeriod::Manual, utc(2021, 1, 1, 0, 0, 0)),
            ("t1", SnapshotPeriod::Temporary, utc(2021, 1, 1, 0, 0, 0)),
        ]);

        assert!(snapshots_to_prune(&node, &policy(), SnapshotPeriod::Manual, &NoDeferral).is_empty());
        assert!(
            snapshots_to_prune(&node, &policy(), SnapshotPeriod::Temporary, &NoDeferral).is_empty()
        );
    }

    #[test]
    fn test_deferral_consulted_only_when_configured() {
        let node = node_with(&[
            ("day1", SnapshotPeriod::Daily, utc(2024, 5, 1, 0, 0, 0)),
            ("day2", SnapshotPeriod::Daily, utc(2024, 5, 2, 0, 0, 0)),
            ("day3", SnapshotPeriod::Daily, utc(2024, 5, 3, 0, 0, 0)),
        ]);

        let mut deferral = MockPruneDeferral::new();
        deferral.expect_should_defer().never();
        assert_eq!(
            snapshots_to_prune(&node, &policy(), SnapshotPeriod::Daily, &deferral).len(),
            1
        );

        let mut deferring = policy();
        deferring.prune_deferral = 80;
        let mut deferral = MockPruneDeferral::new();
        deferral
            .expect_should_defer()
            .withf(|_node, threshold| *threshold == 80)
            .times(1)
            .return_const(true);
        assert!(snapshots_to_prune(&node, &deferring, SnapshotPeriod::Daily, &deferral).is_empty());
    }

    #[test]
    fn test_pool_capacity_deferral() {
        let mut tree = DatasetTree::new();
        tree.insert(
            DatasetNode::new("pool1", DatasetKind::FileSystem)
                .unwrap()
                .with_capacity(300, 700),
        )
        .unwrap();
        tree.insert(DatasetNode::new("pool1/a", DatasetKind::FileSystem).unwrap())
            .unwrap();

        let deferral = PoolCapacityDeferral::from_tree(&tree);
        assert_eq!(deferral.used_percent("pool1"), Some(30));

        let child = tree.get("pool1/a").unwrap();
        assert!(deferral.should_defer(child, 50));
        assert!(!deferral.should_defer(child, 30));
        assert!(!deferral.should_defer(child, 10));
    }
}
