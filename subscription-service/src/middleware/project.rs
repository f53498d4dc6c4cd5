//! Project context extraction.
//!
//! Every billing entity is scoped to a project. The gateway
//! authenticates the caller and forwards the owning project in the
//! `x-project-id` header; handlers receive it as a typed extractor and
//! never read the header themselves.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

/// Project scope for one request.
#[derive(Debug, Clone, Copy)]
pub struct ProjectContext {
    pub project_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for ProjectContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-project-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("Missing x-project-id header"))
            })?;

        let project_id = Uuid::parse_str(raw).map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("Invalid x-project-id header: {}", raw))
        })?;

        let span = tracing::Span::current();
        span.record("project_id", raw);

        Ok(ProjectContext { project_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn extracts_project_id_from_header() {
        let project_id = Uuid::new_v4();
        let request = Request::builder()
            .header("x-project-id", project_id.to_string())
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let context = ProjectContext::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(context.project_id, project_id);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let request = Request::builder().body(()).unwrap();
        let (mut parts, _) = request.into_parts();

        let result = ProjectContext::from_request_parts(&mut parts, &()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_header_is_rejected() {
        let request = Request::builder()
            .header("x-project-id", "not-a-uuid")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let result = ProjectContext::from_request_parts(&mut parts, &()).await;
        assert!(result.is_err());
    }
}
