//! Git credential endpoints: upsert, list, delete (guarded by the
//! referencing-version invariant) and standalone validation.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{user_id, ApiError, ApiResult, App, Envelope};
use crate::domain::GitCredential;
use crate::error::Error;
use crate::infrastructure::git;

pub fn routes() -> Router<Arc<App>> {
    Router::new()
        .route("/git-create", post(git_create))
        .route("/git-list", get(git_list))
        .route("/git-delete", delete(git_delete))
        .route("/git_validation", post(git_validation))
}

#[derive(Debug, Deserialize)]
pub struct GitCredentialRequest {
    #[serde(default)]
    pub target_id: Option<String>,
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub access_token: String,
}

async fn git_create(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<GitCredentialRequest>,
) -> ApiResult {
    let deps = app.deps();
    let user = user_id(&headers);
    let now = Utc::now();

    let credential = match &request.target_id {
        Some(target_id) => {
            let existing = deps
                .stores
                .credentials
                .fetch(target_id)?
                .ok_or_else(|| Error::NotFound(format!("git target {target_id}")))?;
            GitCredential {
                id: existing.id,
                name: request.name,
                base_url: request.base_url,
                username: request.username,
                access_token: request.access_token,
                created_by: existing.created_by,
                created_at: existing.created_at,
                updated_at: Some(now),
            }
        }
        None => {
            if deps.stores.credentials.name_in_use(&request.name, "")? {
                return Err(ApiError(Error::AlreadyExists(format!(
                    "A git target named {} already exists",
                    request.name
                ))));
            }
            GitCredential {
                id: uuid::Uuid::new_v4().simple().to_string(),
                name: request.name,
                base_url: request.base_url,
                username: request.username,
                access_token: request.access_token,
                created_by: Some(user),
                created_at: Some(now),
                updated_at: None,
            }
        }
    };

    let saved = deps.stores.credentials.upsert(&credential)?;
    Ok(Envelope::success(
        "Git target saved",
        Some(serde_json::to_value(saved.masked())?),
    ))
}

async fn git_list(State(app): State<Arc<App>>) -> ApiResult {
    let deps = app.deps();
    let body: Vec<_> = deps
        .stores
        .credentials
        .list()?
        .into_iter()
        .map(|c| c.masked())
        .collect();
    Ok(Envelope::success(
        "Git targets listed",
        Some(serde_json::to_value(body)?),
    ))
}

#[derive(Debug, Deserialize)]
pub struct GitDeleteRequest {
    pub target_id: String,
}

async fn git_delete(
    State(app): State<Arc<App>>,
    Json(request): Json<GitDeleteRequest>,
) -> ApiResult {
    let deps = app.deps();
    if deps
        .stores
        .credentials
        .fetch(&request.target_id)?
        .is_none()
    {
        return Err(ApiError(Error::NotFound(format!(
            "git target {}",
            request.target_id
        ))));
    }
    // The delete-credential invariant: a target still referenced by any
    // plugin version cannot be removed.
    if let Some(plugin_id) = deps
        .stores
        .plugins
        .referenced_by_credential(&request.target_id)?
    {
        return Err(ApiError(Error::BadRequest(format!(
            "This git target is still associated with plugin {plugin_id}; delete the related plugins first"
        ))));
    }
    deps.stores.credentials.delete(&request.target_id)?;
    Ok(Envelope::success("Git target deleted", None))
}

#[derive(Debug, Deserialize)]
pub struct GitValidationRequest {
    pub username: String,
    pub access_token: String,
    pub url: String,
}

async fn git_validation(
    State(app): State<Arc<App>>,
    Json(request): Json<GitValidationRequest>,
) -> ApiResult {
    let deps = app.deps();
    git::verify_credentials(
        &deps.http,
        &request.username,
        &request.access_token,
        &request.url,
    )
    .await?;
    Ok(Envelope::success(
        "Credentials verified",
        Some(json!({ "valid": true })),
    ))
}
