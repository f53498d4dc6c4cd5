//! HTTP handlers for subscription-service.

pub mod billing;
pub mod changes;
pub mod invoices;
pub mod plans;
pub mod subscriptions;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::services::get_metrics;
use crate::startup::AppState;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "subscription-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Cursor for the next page when the current one came back full.
pub(crate) fn next_page_token<T>(
    rows: &[T],
    page_size: i32,
    id: impl Fn(&T) -> Uuid,
) -> Option<Uuid> {
    if rows.len() < page_size.clamp(1, 100) as usize {
        return None;
    }
    rows.last().map(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_page_has_no_next_token() {
        let rows = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(next_page_token(&rows, 50, |id| *id), None);
    }

    #[test]
    fn full_page_points_at_its_last_row() {
        let rows = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(next_page_token(&rows, 3, |id| *id), Some(rows[2]));
    }
}
