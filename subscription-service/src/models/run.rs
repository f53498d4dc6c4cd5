//! Billing run models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Scheduled,
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scheduled => "scheduled",
            RunType::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "scheduled" => RunType::Scheduled,
            _ => RunType::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// A sweep over due subscriptions. One row per invocation, with
/// aggregate counts filled in when the sweep finishes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingRun {
    pub run_id: Uuid,
    pub run_type: String,
    pub status: String,
    pub as_of: DateTime<Utc>,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub subscriptions_processed: i32,
    pub subscriptions_succeeded: i32,
    pub subscriptions_failed: i32,
    pub error_message: Option<String>,
}

impl BillingRun {
    pub fn run_type(&self) -> RunType {
        RunType::from_string(&self.run_type)
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_string(&self.status)
    }
}

/// Per-subscription outcome within a billing run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingRunResult {
    pub result_id: Uuid,
    pub run_id: Uuid,
    pub subscription_id: Uuid,
    pub status: String,
    pub action: String,
    pub invoice_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
}
