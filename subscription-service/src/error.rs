//! Billing error taxonomy and its mapping onto HTTP responses.

use anyhow::anyhow;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::services::pricing::PricingError;

/// Errors produced by billing operations.
///
/// Every fallible path in the lifecycle, change and pricing code
/// resolves to one of these variants before reaching a handler.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("cannot {attempted} subscription {subscription_id} while {current_status}: {reason}")]
    InvalidTransition {
        subscription_id: Uuid,
        attempted: &'static str,
        current_status: String,
        reason: String,
    },

    #[error("pricing configuration error: {0}")]
    Pricing(#[from] PricingError),

    #[error("subscription {0} is being modified by another request")]
    ConcurrentModification(Uuid),

    #[error("{service} request failed: {reason}")]
    ExternalService {
        service: &'static str,
        reason: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BillingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Label used by the error counter metric.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::Pricing(_) => "pricing",
            BillingError::ConcurrentModification(_) => "concurrent_modification",
            BillingError::ExternalService { .. } => "external_service",
            BillingError::NotFound { .. } => "not_found",
            BillingError::Storage(_) => "storage",
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidTransition { .. } => AppError::BadRequest(anyhow!("{err}")),
            BillingError::Pricing(_) => AppError::BadRequest(anyhow!("{err}")),
            BillingError::ConcurrentModification(_) => AppError::Conflict(anyhow!("{err}")),
            BillingError::ExternalService { .. } => AppError::BadGateway(err.to_string()),
            BillingError::NotFound { .. } => AppError::NotFound(anyhow!("{err}")),
            BillingError::Storage(source) => AppError::DatabaseError(source),
        }
    }
}
