//! Plan change models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Direction of a plan change, classified by comparing the fixed price
/// of the target plan against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upgrade => "upgrade",
            ChangeType::Downgrade => "downgrade",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "downgrade" => ChangeType::Downgrade,
            _ => ChangeType::Upgrade,
        }
    }
}

/// Lifecycle of a staged plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Changing,
    Applied,
    Canceled,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Changing => "changing",
            ChangeStatus::Applied => "applied",
            ChangeStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "changing" => ChangeStatus::Changing,
            "applied" => ChangeStatus::Applied,
            "canceled" => ChangeStatus::Canceled,
            _ => ChangeStatus::Pending,
        }
    }

    pub fn is_applyable(&self) -> bool {
        matches!(self, ChangeStatus::Pending | ChangeStatus::Changing)
    }
}

/// Per-item effect of a plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemChangeType {
    Add,
    Update,
    Remove,
}

impl ItemChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemChangeType::Add => "add",
            ItemChangeType::Update => "update",
            ItemChangeType::Remove => "remove",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "add" => ItemChangeType::Add,
            "remove" => ItemChangeType::Remove,
            _ => ItemChangeType::Update,
        }
    }
}

/// A staged subscription plan change.
///
/// The item-level diff is computed and persisted at proposal time so
/// that applying the change later replays exactly what was reviewed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionChange {
    pub change_id: Uuid,
    pub subscription_id: Uuid,
    pub project_id: Uuid,
    pub previous_plan_version_id: Uuid,
    pub new_plan_version_id: Uuid,
    pub change_type: String,
    pub status: String,
    pub change_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SubscriptionChange {
    pub fn change_type(&self) -> ChangeType {
        ChangeType::from_string(&self.change_type)
    }

    pub fn status(&self) -> ChangeStatus {
        ChangeStatus::from_string(&self.status)
    }
}

/// One staged item mutation, keyed by feature slug so the diff stays
/// stable across plan versions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionItemChange {
    pub item_change_id: Uuid,
    pub change_id: Uuid,
    pub change_type: String,
    pub feature_slug: String,
    pub previous_feature_plan_version_id: Option<Uuid>,
    pub new_feature_plan_version_id: Option<Uuid>,
    pub previous_units: Option<Decimal>,
    pub new_units: Option<Decimal>,
    pub created_utc: DateTime<Utc>,
}

impl SubscriptionItemChange {
    pub fn change_type(&self) -> ItemChangeType {
        ItemChangeType::from_string(&self.change_type)
    }
}

/// Input for proposing a plan change.
#[derive(Debug, Clone)]
pub struct ProposeChange {
    pub project_id: Uuid,
    pub subscription_id: Uuid,
    pub new_plan_version_id: Uuid,
    /// When the change takes effect. Defaults to immediately.
    pub change_at: Option<DateTime<Utc>>,
    /// Configured quantity overrides for features of the target plan.
    pub items: Vec<ProposeItemUnits>,
}

/// Quantity override for one target-plan feature, keyed by slug.
#[derive(Debug, Clone)]
pub struct ProposeItemUnits {
    pub feature_slug: String,
    pub units: Decimal,
}
