//! Subscription aggregate model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription lifecycle status.
///
/// Also used for phases: the live phase always mirrors the subscription's
/// status, terminal phases keep the status they ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    TrialEnded,
    Active,
    PastDue,
    Changing,
    Canceled,
    Ended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::TrialEnded => "trial_ended",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Changing => "changing",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Ended => "ended",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "trial_ended" => SubscriptionStatus::TrialEnded,
            "past_due" => SubscriptionStatus::PastDue,
            "changing" => SubscriptionStatus::Changing,
            "canceled" => SubscriptionStatus::Canceled,
            "ended" => SubscriptionStatus::Ended,
            _ => SubscriptionStatus::Active,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled | SubscriptionStatus::Ended)
    }

    /// Statuses counted as the one live phase of a subscription.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Valid target statuses from this one. Transition guards layer event
    /// and timing checks on top; this table only rules out contradictory
    /// state pairs.
    pub fn allowed_transitions(&self) -> &'static [SubscriptionStatus] {
        use SubscriptionStatus::*;
        match self {
            Trialing => &[TrialEnded, Active, Changing, Canceled],
            TrialEnded => &[Active, PastDue, Changing, Canceled],
            Active => &[PastDue, Changing, Canceled, Ended],
            PastDue => &[Active, Ended, Canceled],
            Changing => &[Active, Canceled],
            Canceled => &[],
            Ended => &[],
        }
    }

    pub fn can_transition_to(&self, target: SubscriptionStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }
}

/// When a cycle is billed relative to its boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenToBill {
    /// Invoice at cycle start for the upcoming cycle.
    PayInAdvance,
    /// Invoice at cycle end for the completed cycle.
    PayInArrear,
}

impl WhenToBill {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhenToBill::PayInAdvance => "pay_in_advance",
            WhenToBill::PayInArrear => "pay_in_arrear",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pay_in_advance" => WhenToBill::PayInAdvance,
            _ => WhenToBill::PayInArrear,
        }
    }
}

/// Subscription aggregate root.
///
/// Never deleted; ends life in a terminal status. Mutated only by the phase
/// state machine and the change coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub status: String,
    pub plan_version_id: Uuid,
    pub current_cycle_start_at: DateTime<Utc>,
    pub current_cycle_end_at: DateTime<Utc>,
    /// Next instant at which an INVOICE attempt is expected to succeed.
    pub invoice_at: Option<DateTime<Utc>>,
    pub timezone: String,
    /// Fraction of the current cycle this subscription is billed for;
    /// 1 for anchor-aligned cycles, less for partial first windows.
    pub proration_factor: Decimal,
    /// Set when cancellation is deferred to the cycle end.
    pub cancel_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub plan_version_id: Uuid,
    pub when_to_bill: WhenToBill,
    /// Anchor day: day-of-month for month/year periods, weekday (0 = Monday)
    /// for week periods. Defaults to the start date's own day.
    pub billing_cycle_start: Option<i32>,
    /// Overrides the plan's trial_days when set.
    pub trial_days: Option<i32>,
    pub grace_period_days: i32,
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub status: Option<SubscriptionStatus>,
    pub customer_id: Option<Uuid>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_allow_nothing() {
        assert!(SubscriptionStatus::Canceled.allowed_transitions().is_empty());
        assert!(SubscriptionStatus::Ended.allowed_transitions().is_empty());
    }

    #[test]
    fn every_non_terminal_status_can_cancel() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::TrialEnded,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Changing,
        ] {
            assert!(
                status.can_transition_to(SubscriptionStatus::Canceled),
                "{} should be cancelable",
                status.as_str()
            );
        }
    }

    #[test]
    fn past_due_recovers_to_active() {
        assert!(SubscriptionStatus::PastDue.can_transition_to(SubscriptionStatus::Active));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::TrialEnded,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Changing,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Ended,
        ] {
            assert_eq!(SubscriptionStatus::from_string(status.as_str()), status);
        }
    }
}
