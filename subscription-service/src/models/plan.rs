//! Plan version model.
//!
//! Plan versions are immutable once published; a pricing revision is a new
//! version, never an update in place. Each version carries an ordered list of
//! priced features whose pricing configuration is stored as JSON and resolved
//! to a tagged union by the price calculation engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing period for plan versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Day => "day",
            BillingPeriod::Week => "week",
            BillingPeriod::Month => "month",
            BillingPeriod::Year => "year",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "day" => BillingPeriod::Day,
            "week" => BillingPeriod::Week,
            "year" => BillingPeriod::Year,
            _ => BillingPeriod::Month,
        }
    }
}

/// Plan type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Recurring,
    OneOff,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Recurring => "recurring",
            PlanType::OneOff => "one_off",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "one_off" => PlanType::OneOff,
            _ => PlanType::Recurring,
        }
    }
}

/// Pricing model of a plan version feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Flat,
    Tier,
    Usage,
    Package,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Flat => "flat",
            FeatureType::Tier => "tier",
            FeatureType::Usage => "usage",
            FeatureType::Package => "package",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "tier" => FeatureType::Tier,
            "usage" => FeatureType::Usage,
            "package" => FeatureType::Package,
            _ => FeatureType::Flat,
        }
    }

    /// Usage-typed features are metered from the usage reader rather than
    /// carrying a configured quantity.
    pub fn is_usage(&self) -> bool {
        matches!(self, FeatureType::Usage)
    }
}

/// Plan version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanVersion {
    pub plan_version_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: i32,
    pub currency: String,
    pub billing_period: String,
    pub plan_type: String,
    pub trial_days: i32,
    pub created_utc: DateTime<Utc>,
}

impl PlanVersion {
    pub fn billing_period(&self) -> BillingPeriod {
        BillingPeriod::from_string(&self.billing_period)
    }

    pub fn plan_type(&self) -> PlanType {
        PlanType::from_string(&self.plan_type)
    }
}

/// Priced feature within a plan version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanVersionFeature {
    pub feature_id: Uuid,
    pub plan_version_id: Uuid,
    pub feature_slug: String,
    pub name: String,
    pub feature_type: String,
    /// Pricing configuration, shape depends on feature_type.
    pub pricing: serde_json::Value,
    /// Default configured quantity for non-usage features.
    pub default_units: Option<Decimal>,
    /// Hard consumption limit, if the entitlement is capped.
    pub usage_limit: Option<Decimal>,
    /// How metered events aggregate into a billable quantity (sum, max,
    /// count, last). Only meaningful for usage features.
    pub aggregation: Option<String>,
    pub position: i32,
    pub created_utc: DateTime<Utc>,
}

impl PlanVersionFeature {
    pub fn feature_type(&self) -> FeatureType {
        FeatureType::from_string(&self.feature_type)
    }
}

/// Input for publishing a plan version.
#[derive(Debug, Clone)]
pub struct CreatePlanVersion {
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: i32,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub plan_type: PlanType,
    pub trial_days: i32,
    pub features: Vec<CreatePlanVersionFeature>,
}

/// Input for one feature of a plan version.
#[derive(Debug, Clone)]
pub struct CreatePlanVersionFeature {
    pub feature_slug: String,
    pub name: String,
    pub feature_type: FeatureType,
    pub pricing: serde_json::Value,
    pub default_units: Option<Decimal>,
    pub usage_limit: Option<Decimal>,
    pub aggregation: Option<String>,
}

/// Filter parameters for listing plan versions.
#[derive(Debug, Clone, Default)]
pub struct ListPlanVersionsFilter {
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
