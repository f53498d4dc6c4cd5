//! Billing run handler.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use service_core::error::AppError;

use crate::dtos::{BillingRunResponse, RunBillingRequest};
use crate::startup::AppState;

/// Sweeps every due subscription once: trials past their end, cycles
/// ready to invoice or renew, and open invoices past their grace
/// period. Operator-facing; not scoped to a project.
pub async fn run_billing(
    State(state): State<AppState>,
    body: Option<Json<RunBillingRequest>>,
) -> Result<Json<BillingRunResponse>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let as_of = request.as_of.unwrap_or_else(Utc::now);

    let (run, results) = state.runner.run(request.run_type, as_of).await?;

    Ok(Json(BillingRunResponse { run, results }))
}
