//! Request and response bodies for the HTTP API.
//!
//! Requests never carry a project id; that always comes from the
//! `x-project-id` header. Mutating endpoints accept an optional `as_of`
//! timestamp so operators and tests can drive billing time explicitly;
//! when absent, the server clock applies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    BillingPeriod, BillingRun, BillingRunResult, CreatePlanVersion, CreatePlanVersionFeature,
    CreateSubscription, FeatureType, Invoice, InvoiceLine, InvoiceStatus, Money, PlanType,
    PlanVersion, PlanVersionFeature, RunType, Subscription, SubscriptionChange, SubscriptionItem,
    SubscriptionItemChange, SubscriptionPhase, SubscriptionStatus, WhenToBill,
};
use crate::services::lifecycle::CancelEffective;

fn default_version() -> i32 {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_page_size() -> i32 {
    50
}

fn default_effective() -> CancelEffective {
    CancelEffective::EndOfCycle
}

fn default_run_type() -> RunType {
    RunType::Manual
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, message = "Plan name is required"))]
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_version")]
    #[validate(range(min = 1, message = "Version numbering starts at 1"))]
    pub version: i32,
    #[validate(length(min = 3, max = 3, message = "Currency must be a three-letter code"))]
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub plan_type: PlanType,
    #[serde(default)]
    #[validate(range(min = 0, message = "Trial days cannot be negative"))]
    pub trial_days: i32,
    #[validate(length(min = 1, message = "A plan needs at least one feature"))]
    pub features: Vec<CreatePlanFeatureRequest>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreatePlanFeatureRequest {
    pub feature_slug: String,
    pub name: String,
    pub feature_type: FeatureType,
    pub pricing: serde_json::Value,
    pub default_units: Option<Decimal>,
    pub usage_limit: Option<Decimal>,
    pub aggregation: Option<String>,
}

impl CreatePlanRequest {
    pub fn into_input(self, project_id: Uuid) -> CreatePlanVersion {
        CreatePlanVersion {
            project_id,
            name: self.name,
            description: self.description,
            version: self.version,
            currency: self.currency,
            billing_period: self.billing_period,
            plan_type: self.plan_type,
            trial_days: self.trial_days,
            features: self
                .features
                .into_iter()
                .map(|f| CreatePlanVersionFeature {
                    feature_slug: f.feature_slug,
                    name: f.name,
                    feature_type: f.feature_type,
                    pricing: f.pricing,
                    default_units: f.default_units,
                    usage_limit: f.usage_limit,
                    aggregation: f.aggregation,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub customer_id: Uuid,
    pub plan_version_id: Uuid,
    pub when_to_bill: WhenToBill,
    #[validate(range(min = 0, max = 31, message = "Cycle anchor is out of range"))]
    pub billing_cycle_start: Option<i32>,
    #[validate(range(min = 0, message = "Trial days cannot be negative"))]
    pub trial_days: Option<i32>,
    #[serde(default)]
    #[validate(range(min = 0, message = "Grace period cannot be negative"))]
    pub grace_period_days: i32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub as_of: Option<DateTime<Utc>>,
}

impl CreateSubscriptionRequest {
    pub fn into_input(self, project_id: Uuid) -> CreateSubscription {
        CreateSubscription {
            project_id,
            customer_id: self.customer_id,
            plan_version_id: self.plan_version_id,
            when_to_bill: self.when_to_bill,
            billing_cycle_start: self.billing_cycle_start,
            trial_days: self.trial_days,
            grace_period_days: self.grace_period_days,
            timezone: self.timezone,
            start_at: self.start_at,
            end_at: self.end_at,
        }
    }
}

/// Body for transitions that only need a point in time: end-trial,
/// invoice, renew and pay.
#[derive(Debug, Default, Deserialize)]
pub struct TransitionRequest {
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default = "default_effective")]
    pub effective: CancelEffective,
    pub as_of: Option<DateTime<Utc>>,
}

impl Default for CancelRequest {
    fn default() -> Self {
        Self {
            effective: default_effective(),
            as_of: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProposeChangeRequest {
    pub new_plan_version_id: Uuid,
    pub change_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<ProposeItemRequest>,
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ProposeItemRequest {
    pub feature_slug: String,
    pub units: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct RunBillingRequest {
    #[serde(default = "default_run_type")]
    pub run_type: RunType,
    pub as_of: Option<DateTime<Utc>>,
}

impl Default for RunBillingRequest {
    fn default() -> Self {
        Self {
            run_type: default_run_type(),
            as_of: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListPlansQuery {
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListSubscriptionsQuery {
    pub status: Option<SubscriptionStatus>,
    pub customer_id: Option<Uuid>,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub status: Option<InvoiceStatus>,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: PlanVersion,
    pub features: Vec<PlanVersionFeature>,
}

#[derive(Debug, Serialize)]
pub struct ListPlansResponse {
    pub plans: Vec<PlanVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<Uuid>,
}

/// Fixed price of a plan at default quantities. Usage charges are
/// unknowable ahead of consumption, so `has_usage` flags that the real
/// invoice may be higher.
#[derive(Debug, Serialize)]
pub struct PlanPriceResponse {
    pub plan_version_id: Uuid,
    pub total: Money,
    pub has_usage: bool,
}

/// A subscription with its live phase and configured items. Ended and
/// canceled subscriptions have no live phase.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Subscription,
    pub phase: Option<SubscriptionPhase>,
    pub items: Vec<SubscriptionItem>,
}

#[derive(Debug, Serialize)]
pub struct ListSubscriptionsResponse {
    pub subscriptions: Vec<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLine>,
}

#[derive(Debug, Serialize)]
pub struct ListInvoicesResponse {
    pub invoices: Vec<Invoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ChangeResponse {
    pub change: SubscriptionChange,
    pub item_changes: Vec<SubscriptionItemChange>,
}

#[derive(Debug, Serialize)]
pub struct ListChangesResponse {
    pub changes: Vec<SubscriptionChange>,
}

#[derive(Debug, Serialize)]
pub struct BillingRunResponse {
    pub run: BillingRun,
    pub results: Vec<BillingRunResult>,
}
