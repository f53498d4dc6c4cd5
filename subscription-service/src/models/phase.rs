//! Subscription phase and item models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::subscription::{SubscriptionStatus, WhenToBill};

/// A bounded interval of a subscription's life under one plan version and one
/// billing configuration.
///
/// Phases are append-only: a plan change ends the live phase and inserts a new
/// one rather than rewriting it. At most one phase per subscription is live at
/// any instant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionPhase {
    pub phase_id: Uuid,
    pub subscription_id: Uuid,
    pub plan_version_id: Uuid,
    pub status: String,
    pub when_to_bill: String,
    /// Anchor day for cycle alignment (day-of-month, or weekday for weekly
    /// periods).
    pub billing_cycle_start: i32,
    pub grace_period_days: i32,
    pub trial_days: i32,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    /// Scheduled end of the phase, if bounded.
    pub end_at: Option<DateTime<Utc>>,
    /// Actual end, set when the phase leaves the live set.
    pub ended_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SubscriptionPhase {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    pub fn when_to_bill(&self) -> WhenToBill {
        WhenToBill::from_string(&self.when_to_bill)
    }
}

/// Configured quantity for one priced feature within a phase.
///
/// Usage-typed features carry no configured units; their quantity comes from
/// the usage reader at invoicing time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionItem {
    pub item_id: Uuid,
    pub subscription_id: Uuid,
    pub feature_plan_version_id: Uuid,
    pub units: Option<Decimal>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}
