//! Invoice model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice type, fixed by the billing mode and item mix at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Flat,
    Usage,
    Hybrid,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Flat => "flat",
            InvoiceType::Usage => "usage",
            InvoiceType::Hybrid => "hybrid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "usage" => InvoiceType::Usage,
            "hybrid" => InvoiceType::Hybrid,
            _ => InvoiceType::Flat,
        }
    }
}

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    PastDue,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::PastDue => "past_due",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "open" => InvoiceStatus::Open,
            "paid" => InvoiceStatus::Paid,
            "past_due" => InvoiceStatus::PastDue,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }

    /// Non-void invoices count toward the one-invoice-per-cycle rule.
    pub fn counts_for_cycle(&self) -> bool {
        !matches!(self, InvoiceStatus::Void)
    }

    /// Whether a payment attempt is still meaningful.
    pub fn is_payable(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Draft | InvoiceStatus::Open | InvoiceStatus::PastDue
        )
    }
}

/// Invoice covering one billing cycle of a subscription.
///
/// At most one non-void invoice exists per (subscription, cycle start);
/// re-invoicing a covered cycle returns the existing row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub subscription_id: Uuid,
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub cycle_start_at: DateTime<Utc>,
    pub cycle_end_at: DateTime<Utc>,
    pub invoice_type: String,
    pub status: String,
    pub currency: String,
    pub total: Decimal,
    pub due_at: DateTime<Utc>,
    pub past_due_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn invoice_type(&self) -> InvoiceType {
        InvoiceType::from_string(&self.invoice_type)
    }

    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }
}

/// Kind of invoice line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Flat,
    Usage,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::Flat => "flat",
            LineType::Usage => "usage",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "usage" => LineType::Usage,
            _ => LineType::Flat,
        }
    }
}

/// One priced line of an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLine {
    pub line_id: Uuid,
    pub invoice_id: Uuid,
    pub feature_plan_version_id: Option<Uuid>,
    pub line_type: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub is_prorated: bool,
    pub proration_factor: Option<Decimal>,
    pub created_utc: DateTime<Utc>,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
