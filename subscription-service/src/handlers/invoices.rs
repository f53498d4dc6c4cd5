//! Invoicing and payment handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{InvoiceResponse, ListInvoicesQuery, ListInvoicesResponse, TransitionRequest};
use crate::middleware::ProjectContext;
use crate::models::ListInvoicesFilter;
use crate::startup::AppState;

use super::next_page_token;

/// Cuts the invoice for the subscription's current cycle. Invoicing is
/// idempotent per cycle: repeating the call returns the invoice already
/// on file.
pub async fn invoice_subscription(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
    body: Option<Json<TransitionRequest>>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    let now = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let invoice = state
        .machine
        .invoice(project.project_id, subscription_id, now)
        .await?;
    let lines = state.store.invoice_lines(invoice.invoice_id).await?;

    tracing::info!(
        invoice_id = %invoice.invoice_id,
        subscription_id = %subscription_id,
        total = %invoice.total,
        "Invoice issued"
    );

    Ok((StatusCode::CREATED, Json(InvoiceResponse { invoice, lines })))
}

pub async fn list_subscription_invoices(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<ListInvoicesResponse>, AppError> {
    let filter = ListInvoicesFilter {
        status: query.status,
        page_size: query.page_size,
        page_token: query.page_token,
    };
    let invoices = state
        .store
        .list_invoices(project.project_id, subscription_id, filter)
        .await?;
    let next = next_page_token(&invoices, query.page_size, |i| i.invoice_id);

    Ok(Json(ListInvoicesResponse {
        invoices,
        next_page_token: next,
    }))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state
        .store
        .get_invoice(project.project_id, invoice_id)
        .await?;
    let lines = state.store.invoice_lines(invoice.invoice_id).await?;

    Ok(Json(InvoiceResponse { invoice, lines }))
}

/// Collects an invoice through the payment provider. A decline leaves
/// the invoice open and is not an error; the response carries the
/// resulting invoice state either way.
pub async fn pay_invoice(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(invoice_id): Path<Uuid>,
    body: Option<Json<TransitionRequest>>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let now = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let invoice = state
        .machine
        .pay_invoice(project.project_id, invoice_id, now)
        .await?;
    let lines = state.store.invoice_lines(invoice.invoice_id).await?;

    Ok(Json(InvoiceResponse { invoice, lines }))
}
