//! Billing cycle arithmetic.
//!
//! Pure functions shared by the phase state machine, the change
//! coordinator and the billing runner. All instants are UTC; the
//! subscription's timezone is presentation metadata only.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;

use crate::models::BillingPeriod;

/// Decimal places kept on proration factors so equal windows always
/// compare equal.
const FACTOR_SCALE: u32 = 9;

/// Boundaries of one billing cycle.
///
/// `proration_factor` is in `(0, 1]`: exactly one for a window that
/// starts on its anchor boundary and runs its full length, smaller
/// for a window that starts off-anchor or is clipped by a phase end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleWindow {
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub proration_factor: Decimal,
}

/// Computes the cycle beginning at `cycle_start`.
///
/// The cycle ends at the next anchor boundary after `cycle_start`:
/// the next `billing_cycle_start` day of month for monthly and yearly
/// periods (falling back to the last day of short months), the next
/// `billing_cycle_start` weekday for weekly periods (0 = Monday). A
/// start that is not on its anchor yields a short first window with a
/// proportionally reduced factor. Deterministic: the same inputs
/// always produce the same window.
pub fn compute_cycle(
    cycle_start: DateTime<Utc>,
    period: BillingPeriod,
    billing_cycle_start: i32,
    trial_days: Option<i32>,
    end_at: Option<DateTime<Utc>>,
) -> CycleWindow {
    let (aligned_start, natural_end) = anchor_window(cycle_start, period, billing_cycle_start);

    let mut cycle_end = natural_end;
    if let Some(end_at) = end_at {
        if end_at > cycle_start && end_at < cycle_end {
            cycle_end = end_at;
        }
    }

    let trial_ends_at = match trial_days {
        Some(days) if days > 0 => Some(cycle_start + Duration::days(days as i64)),
        _ => None,
    };

    CycleWindow {
        cycle_start,
        cycle_end,
        trial_ends_at,
        proration_factor: ratio(cycle_end - cycle_start, natural_end - aligned_start),
    }
}

/// Fraction of the cycle remaining at `at`: one at or before the
/// start, zero at or after the end, linear in between.
pub fn proration_factor(
    cycle_start: DateTime<Utc>,
    cycle_end: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Decimal {
    if at <= cycle_start {
        return Decimal::ONE;
    }
    if at >= cycle_end {
        return Decimal::ZERO;
    }
    ratio(cycle_end - at, cycle_end - cycle_start)
}

/// Start of the anchor-aligned cycle immediately before the one
/// beginning at `cycle_start`. Used to find the usage window already
/// completed when billing in advance.
pub fn previous_cycle_start(
    cycle_start: DateTime<Utc>,
    period: BillingPeriod,
    billing_cycle_start: i32,
) -> DateTime<Utc> {
    match period {
        BillingPeriod::Day => cycle_start - Duration::days(1),
        BillingPeriod::Week => cycle_start - Duration::days(7),
        BillingPeriod::Month => shift_anchored_months(cycle_start, -1, billing_cycle_start),
        BillingPeriod::Year => shift_anchored_months(cycle_start, -12, billing_cycle_start),
    }
}

/// The aligned window around `start`: the latest anchor boundary at or
/// before it and the earliest strictly after it.
fn anchor_window(
    start: DateTime<Utc>,
    period: BillingPeriod,
    billing_cycle_start: i32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match period {
        BillingPeriod::Day => (start, start + Duration::days(1)),
        BillingPeriod::Week => {
            let anchor = billing_cycle_start.rem_euclid(7) as i64;
            let weekday = start.weekday().num_days_from_monday() as i64;
            let mut ahead = (anchor - weekday).rem_euclid(7);
            if ahead == 0 {
                ahead = 7;
            }
            let end = start + Duration::days(ahead);
            (end - Duration::days(7), end)
        }
        BillingPeriod::Month => anchored_month_window(start, 1, billing_cycle_start),
        BillingPeriod::Year => anchored_month_window(start, 12, billing_cycle_start),
    }
}

fn anchored_month_window(
    start: DateTime<Utc>,
    step_months: i32,
    billing_cycle_start: i32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let candidate = anchored_day(start.year(), start.month(), billing_cycle_start, start.time());
    if candidate > start {
        let aligned = shift_anchored_months(candidate, -step_months, billing_cycle_start);
        (aligned, candidate)
    } else {
        let end = shift_anchored_months(candidate, step_months, billing_cycle_start);
        (candidate, end)
    }
}

/// Moves `at` by whole months and re-anchors the day of month, so a
/// boundary clamped by a short month snaps back when the calendar
/// allows (Feb 28 -> Mar 31 for anchor 31).
fn shift_anchored_months(at: DateTime<Utc>, months: i32, billing_cycle_start: i32) -> DateTime<Utc> {
    let total = at.year() * 12 + at.month() as i32 - 1 + months;
    let year = total.div_euclid(12);
    let month = (total.rem_euclid(12) + 1) as u32;
    anchored_day(year, month, billing_cycle_start, at.time())
}

/// The anchor day within one month, clamped to the month's length.
fn anchored_day(year: i32, month: u32, billing_cycle_start: i32, time: NaiveTime) -> DateTime<Utc> {
    let day = (billing_cycle_start.clamp(1, 31) as u32).min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or(NaiveDate::MIN)
        .and_time(time)
        .and_utc()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn ratio(numerator: Duration, denominator: Duration) -> Decimal {
    let num = numerator.num_seconds();
    let den = denominator.num_seconds();
    if den <= 0 || num >= den {
        return Decimal::ONE;
    }
    (Decimal::from(num) / Decimal::from(den)).round_dp(FACTOR_SCALE)
}
