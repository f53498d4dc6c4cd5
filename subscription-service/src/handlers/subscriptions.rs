//! Subscription lifecycle handlers.
//!
//! Each transition endpoint delegates to the state machine and returns
//! the subscription with its live phase and items. Terminal
//! subscriptions have no live phase, so the phase is optional in the
//! response.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    CancelRequest, CreateSubscriptionRequest, ListSubscriptionsQuery, ListSubscriptionsResponse,
    SubscriptionResponse, TransitionRequest,
};
use crate::error::BillingError;
use crate::middleware::ProjectContext;
use crate::models::{ListSubscriptionsFilter, Subscription};
use crate::startup::AppState;

use super::next_page_token;

async fn subscription_view(
    state: &AppState,
    subscription: Subscription,
) -> Result<SubscriptionResponse, AppError> {
    let phase = match state.store.live_phase(subscription.subscription_id).await {
        Ok(phase) => Some(phase),
        Err(BillingError::NotFound { .. }) => None,
        Err(e) => return Err(e.into()),
    };
    let items = state
        .store
        .subscription_items(subscription.subscription_id)
        .await?;

    Ok(SubscriptionResponse {
        subscription,
        phase,
        items,
    })
}

pub async fn create_subscription(
    State(state): State<AppState>,
    project: ProjectContext,
    Json(payload): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), AppError> {
    payload.validate()?;

    let now = payload.as_of.unwrap_or_else(Utc::now);
    let subscription = state
        .machine
        .create_subscription(payload.into_input(project.project_id), now)
        .await?;

    tracing::info!(
        subscription_id = %subscription.subscription_id,
        project_id = %project.project_id,
        status = %subscription.status,
        "Subscription created"
    );

    let view = subscription_view(&state, subscription).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state
        .store
        .get_subscription(project.project_id, subscription_id)
        .await?;

    let view = subscription_view(&state, subscription).await?;
    Ok(Json(view))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    project: ProjectContext,
    Query(query): Query<ListSubscriptionsQuery>,
) -> Result<Json<ListSubscriptionsResponse>, AppError> {
    let filter = ListSubscriptionsFilter {
        status: query.status,
        customer_id: query.customer_id,
        page_size: query.page_size,
        page_token: query.page_token,
    };
    let subscriptions = state
        .store
        .list_subscriptions(project.project_id, filter)
        .await?;
    let next = next_page_token(&subscriptions, query.page_size, |s| s.subscription_id);

    Ok(Json(ListSubscriptionsResponse {
        subscriptions,
        next_page_token: next,
    }))
}

pub async fn end_trial(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
    body: Option<Json<TransitionRequest>>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let now = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let subscription = state
        .machine
        .end_trial(project.project_id, subscription_id, now)
        .await?;

    let view = subscription_view(&state, subscription).await?;
    Ok(Json(view))
}

pub async fn renew(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
    body: Option<Json<TransitionRequest>>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let now = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let subscription = state
        .machine
        .renew(project.project_id, subscription_id, now)
        .await?;

    let view = subscription_view(&state, subscription).await?;
    Ok(Json(view))
}

pub async fn cancel(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let now = request.as_of.unwrap_or_else(Utc::now);
    let subscription = state
        .machine
        .cancel(project.project_id, subscription_id, request.effective, now)
        .await?;

    tracing::info!(
        subscription_id = %subscription.subscription_id,
        status = %subscription.status,
        cancel_at = ?subscription.cancel_at,
        "Cancellation recorded"
    );

    let view = subscription_view(&state, subscription).await?;
    Ok(Json(view))
}
