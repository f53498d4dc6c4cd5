//! Plan catalog handlers.
//!
//! Plan versions are immutable once published; repricing means
//! publishing a new version and moving subscriptions over through the
//! change endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    CreatePlanRequest, ListPlansQuery, ListPlansResponse, PlanPriceResponse, PlanResponse,
};
use crate::error::BillingError;
use crate::middleware::ProjectContext;
use crate::models::ListPlanVersionsFilter;
use crate::services::pricing;
use crate::startup::AppState;

use super::next_page_token;

pub async fn create_plan(
    State(state): State<AppState>,
    project: ProjectContext,
    Json(payload): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), AppError> {
    payload.validate()?;

    let (plan, features) = state
        .store
        .create_plan_version(payload.into_input(project.project_id))
        .await?;

    tracing::info!(
        plan_version_id = %plan.plan_version_id,
        project_id = %project.project_id,
        "Plan version published"
    );

    Ok((StatusCode::CREATED, Json(PlanResponse { plan, features })))
}

pub async fn get_plan(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(plan_version_id): Path<Uuid>,
) -> Result<Json<PlanResponse>, AppError> {
    let plan = state
        .store
        .get_plan_version(project.project_id, plan_version_id)
        .await?;
    let features = state.store.plan_features(plan.plan_version_id).await?;

    Ok(Json(PlanResponse { plan, features }))
}

pub async fn list_plans(
    State(state): State<AppState>,
    project: ProjectContext,
    Query(query): Query<ListPlansQuery>,
) -> Result<Json<ListPlansResponse>, AppError> {
    let filter = ListPlanVersionsFilter {
        page_size: query.page_size,
        page_token: query.page_token,
    };
    let plans = state
        .store
        .list_plan_versions(project.project_id, filter)
        .await?;
    let next = next_page_token(&plans, query.page_size, |p| p.plan_version_id);

    Ok(Json(ListPlansResponse {
        plans,
        next_page_token: next,
    }))
}

/// Fixed price of the plan at default quantities, before any usage.
pub async fn get_plan_price(
    State(state): State<AppState>,
    project: ProjectContext,
    Path(plan_version_id): Path<Uuid>,
) -> Result<Json<PlanPriceResponse>, AppError> {
    let plan = state
        .store
        .get_plan_version(project.project_id, plan_version_id)
        .await?;
    let features = state.store.plan_features(plan.plan_version_id).await?;
    let price = pricing::total_price_plan(&plan, &features).map_err(BillingError::from)?;

    Ok(Json(PlanPriceResponse {
        plan_version_id: plan.plan_version_id,
        total: price.total,
        has_usage: price.has_usage,
    }))
}
