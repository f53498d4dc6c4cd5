//! Plan change handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{ChangeResponse, ListChangesResponse, ProposeChangeRequest, TransitionRequest};
use crate::middleware::ProjectContext;
use crate::models::{ProposeChange, ProposeItemUnits};
use crate::startup::AppState;

pub async fn propose_change(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<ProposeChangeRequest>,
) -> Result<(StatusCode, Json<ChangeResponse>), AppError> {
    let now = payload.as_of.unwrap_or_else(Utc::now);
    let input = ProposeChange {
        project_id: project.project_id,
        subscription_id,
        new_plan_version_id: payload.new_plan_version_id,
        change_at: payload.change_at,
        items: payload
            .items
            .into_iter()
            .map(|i| ProposeItemUnits {
                feature_slug: i.feature_slug,
                units: i.units,
            })
            .collect(),
    };

    let (change, item_changes) = state.coordinator.propose_change(input, now).await?;

    tracing::info!(
        change_id = %change.change_id,
        subscription_id = %subscription_id,
        change_type = %change.change_type,
        status = %change.status,
        "Plan change proposed"
    );

    Ok((
        StatusCode::CREATED,
        Json(ChangeResponse {
            change,
            item_changes,
        }),
    ))
}

pub async fn list_changes(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<ListChangesResponse>, AppError> {
    // Listing is keyed by subscription, so check project ownership first.
    state
        .store
        .get_subscription(project.project_id, subscription_id)
        .await?;
    let changes = state.store.list_changes(subscription_id).await?;

    Ok(Json(ListChangesResponse { changes }))
}

pub async fn apply_change(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(change_id): Path<Uuid>,
    body: Option<Json<TransitionRequest>>,
) -> Result<Json<ChangeResponse>, AppError> {
    let now = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let change = state
        .coordinator
        .apply_change(project.project_id, change_id, now)
        .await?;
    let item_changes = state.store.item_changes(change.change_id).await?;

    Ok(Json(ChangeResponse {
        change,
        item_changes,
    }))
}

pub async fn cancel_change(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(change_id): Path<Uuid>,
    body: Option<Json<TransitionRequest>>,
) -> Result<Json<ChangeResponse>, AppError> {
    let now = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let change = state
        .coordinator
        .cancel_change(project.project_id, change_id, now)
        .await?;
    let item_changes = state.store.item_changes(change.change_id).await?;

    Ok(Json(ChangeResponse {
        change,
        item_changes,
    }))
}
