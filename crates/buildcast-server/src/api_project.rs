//! Project trigger endpoint.

use crate::api::ApiError;
use crate::launcher::{LaunchError, LaunchRequest};
use crate::AppState;
use axum::{extract::rejection::JsonRejection, Extension, Json};
use buildcast_types::BuildId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Request body for `POST /project`.
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    #[serde(rename = "gitURL")]
    pub git_url: String,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateProjectResponse {
    pub status: &'static str,
    pub data: ProjectData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    pub project_slug: String,
    pub url: String,
}

/// Generates a short random project slug.
pub fn generate_slug() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Handler for `POST /project`.
///
/// Queues a build of `gitURL` under the given slug (or a generated one) and
/// returns where its preview will be served.
pub async fn create_project_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<Json<CreateProjectResponse>, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let git_url = payload.git_url.trim();
    if git_url.is_empty() {
        return Err(ApiError::BadRequest("gitURL must not be empty".to_string()));
    }

    let slug = payload
        .slug
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(generate_slug);
    let build_id = BuildId::new(slug).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let request = LaunchRequest {
        git_url: git_url.to_string(),
        build_id: build_id.clone(),
    };
    match state.launcher.launch(request).await {
        Ok(()) => {}
        Err(e @ LaunchError::AlreadyRunning(_)) => {
            tracing::warn!(build_id = %build_id, "rejected duplicate build");
            return Err(ApiError::Conflict(e.to_string()));
        }
        Err(e) => {
            tracing::error!(build_id = %build_id, "failed to start build: {}", e);
            return Err(ApiError::InternalServerError(
                "Failed to start build".to_string(),
            ));
        }
    }

    tracing::info!(build_id = %build_id, git_url = %git_url, "build queued");
    Ok(Json(CreateProjectResponse {
        status: "queued",
        data: ProjectData {
            url: format!("http://{}.{}", build_id, state.preview_domain),
            project_slug: build_id.to_string(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_slugs_are_short_hex() {
        let slug = generate_slug();
        assert_eq!(slug.len(), 8);
        assert!(slug.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(BuildId::new(slug).is_ok());
    }

    #[test]
    fn request_accepts_missing_slug() {
        let req: CreateProjectRequest =
            serde_json::from_str(r#"{"gitURL":"https://example.com/r.git"}"#).unwrap();
        assert_eq!(req.git_url, "https://example.com/r.git");
        assert!(req.slug.is_none());
    }
}
