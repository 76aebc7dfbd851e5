//! Plugin endpoints: save/deploy/list/fetch, lifecycle toggles, bundle
//! upload/download and report surfaces.

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{user_id, ApiError, ApiResult, App, Envelope};
use crate::domain::{
    DeploymentStatus, EnvVar, PluginType, PluginVersion, ResourceBudget, ScanChecks, Source,
    Version, RUN_FIELD_LABEL, SECRET_MASK,
};
use crate::error::Error;
use crate::infrastructure::artifact_store::{bundle_key, content_type_for};
use crate::pipeline::download_bundle_path;
use crate::store::{disabled_actions, unmask_env, ListRequest};

pub fn routes() -> Router<Arc<App>> {
    Router::new()
        .route("/save", post(save))
        .route("/deploy", post(deploy_plugin))
        .route("/list", post(list))
        .route("/fetch", get(fetch))
        .route("/delete", delete(delete_plugins))
        .route("/plugin-state", post(plugin_state))
        .route("/bundle-upload", post(bundle_upload))
        .route("/v2/bundle-upload", post(bundle_upload_chunk))
        .route("/finalize-upload", post(finalize_upload))
        .route("/bundle-download", get(bundle_download))
        .route("/plugin-logs", get(plugin_logs))
        .route("/plugin-report", get(plugin_report))
        .route("/initiate-download", post(initiate_download))
        .route("/download-docker-file", get(download_docker_file))
        .route("/fetch-versions", get(fetch_versions))
        .route("/env-options", get(env_options))
        .route("/secrets", post(create_secret).delete(delete_secret))
        .route("/run-status", get(run_status))
}

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub plugin_id: Option<String>,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub current_version: Option<Version>,
    pub name: String,
    pub plugin_type: PluginType,
    #[serde(flatten)]
    pub source: Source,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub information: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub industry: Option<Vec<String>>,
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default)]
    pub resources: Option<ResourceBudget>,
    #[serde(default)]
    pub portal: Option<bool>,
}

/// Merge an incoming source over the stored one. A mask-valued token keeps
/// the stored token; the returned flag reports whether the git credentials
/// actually changed (which forces a redeploy).
fn merge_source(mut incoming: Source, existing: Option<&Source>) -> (Source, bool) {
    match (&mut incoming, existing) {
        (
            Source::Git {
                target_ref,
                username,
                access_token,
                ..
            },
            Some(Source::Git {
                target_ref: prev_ref,
                username: prev_user,
                access_token: prev_token,
                ..
            }),
        ) => {
            let mut changed = target_ref != prev_ref || username != prev_user;
            if access_token.as_deref() == Some(SECRET_MASK) {
                *access_token = prev_token.clone();
            } else if access_token != prev_token {
                changed = true;
            }
            (incoming, changed)
        }
        (Source::Git { access_token, .. }, _) => {
            if access_token.as_deref() == Some(SECRET_MASK) {
                *access_token = None;
            }
            (incoming, true)
        }
        (_, Some(prev)) => {
            if incoming.blob_key().is_none() {
                if let Some(key) = prev.blob_key() {
                    incoming.set_blob_key(key.to_string());
                }
            }
            (incoming, false)
        }
        (_, None) => (incoming, false),
    }
}

/// A pipeline can only run once its source locator is satisfiable: git
/// registrations always are, uploads need their bundle first.
fn source_runnable(source: &Source) -> bool {
    match source {
        Source::Git { .. } => true,
        other => other.blob_key().is_some(),
    }
}

async fn save(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<SaveRequest>,
) -> ApiResult {
    let deps = app.deps();
    let user = user_id(&headers);
    let version = request.version.unwrap_or(Version(1.0));

    if let Some(resources) = &request.resources {
        deps.settings.resource_ranges.check(resources)?;
    }

    let plugin_id = request
        .plugin_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let existing = deps.stores.plugins.fetch(&plugin_id, version)?;
    let is_new = existing.is_none();
    if is_new && deps.stores.plugins.name_in_use(&request.name, &plugin_id)? {
        return Err(ApiError(Error::AlreadyExists(format!(
            "A plugin named {} already exists under a different plugin id",
            request.name
        ))));
    }

    let mut redeploy = is_new;
    let record = match existing {
        Some(existing) => {
            let (source, creds_changed) = merge_source(request.source, Some(&existing.source));
            redeploy |= creds_changed;

            let resources = request
                .resources
                .unwrap_or_else(|| existing.resources.clone());
            if resources != existing.resources {
                redeploy = true;
            }

            let mut env = request.env.unwrap_or_else(|| existing.env.clone());
            unmask_env(&mut env, &existing.env);

            PluginVersion {
                plugin_id: plugin_id.clone(),
                version,
                current_version: request.current_version.or(existing.current_version),
                name: request.name,
                plugin_type: request.plugin_type,
                source,
                project_id: request.project_id.unwrap_or(existing.project_id),
                information: request.information.unwrap_or(existing.information),
                industry: request.industry.unwrap_or(existing.industry),
                container_port: request.container_port.unwrap_or(existing.container_port),
                env,
                resources,
                portal: request.portal.unwrap_or(existing.portal),
                deployment_status: if redeploy {
                    DeploymentStatus::Pending
                } else {
                    existing.deployment_status
                },
                scan_checks: existing.scan_checks,
                errors: existing.errors,
                deployed_by: existing.deployed_by,
                deployed_at: existing.deployed_at,
                proxy_path: existing.proxy_path,
                additional_fields: existing.additional_fields,
            }
        }
        None => {
            let (source, _) = merge_source(request.source, None);
            PluginVersion {
                plugin_id: plugin_id.clone(),
                version,
                current_version: request.current_version,
                name: request.name,
                plugin_type: request.plugin_type,
                source,
                project_id: request
                    .project_id
                    .unwrap_or_else(|| deps.settings.service.project_id.clone()),
                information: request.information.unwrap_or_default(),
                industry: request.industry.unwrap_or_default(),
                container_port: request.container_port.unwrap_or(80),
                env: request.env.unwrap_or_default(),
                resources: request.resources.unwrap_or_default(),
                portal: request.portal.unwrap_or(false),
                deployment_status: DeploymentStatus::Pending,
                scan_checks: ScanChecks::default(),
                errors: vec![],
                deployed_by: None,
                deployed_at: None,
                proxy_path: None,
                additional_fields: vec![],
            }
        }
    };

    deps.stores.plugins.upsert(&record)?;

    // Current-version designation: explicit wins; a plugin's only version is
    // current by construction.
    if let Some(current) = record.current_version {
        deps.stores.plugins.set_current_version(&plugin_id, current)?;
    } else if is_new && deps.stores.plugins.versions(&plugin_id)?.len() == 1 {
        deps.stores.plugins.set_current_version(&plugin_id, version)?;
    }

    let mut enqueued = false;
    if redeploy && source_runnable(&record.source) {
        deps.stores
            .plugins
            .update_with(&plugin_id, version, |row| {
                row.deployed_by = Some(user.clone());
                row.deployed_at = Some(Utc::now());
            })?;
        enqueued = app
            .pipelines
            .spawn_deploy(plugin_id.clone(), version, user);
    }

    Ok(Envelope::success(
        "Plugin saved",
        Some(json!({
            "plugin_id": plugin_id,
            "version": version,
            "pipeline_enqueued": enqueued,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub plugin_id: String,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub portal: Option<bool>,
}

async fn deploy_plugin(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> ApiResult {
    let deps = app.deps();
    let user = user_id(&headers);
    let record = match request.version {
        Some(version) => deps.stores.plugins.fetch(&request.plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(&request.plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {}", request.plugin_id)))?;

    // Duplicate deploys for the same key coalesce: report the in-flight
    // state instead of starting a second pipeline.
    if app.pipelines.is_running(&record.plugin_id, record.version) {
        return Ok(Envelope::success(
            "Deployment already in progress",
            Some(json!({ "deployment_status": record.deployment_status })),
        ));
    }

    deps.stores
        .plugins
        .update_with(&record.plugin_id, record.version, |row| {
            row.deployed_by = Some(user.clone());
            row.deployed_at = Some(Utc::now());
            if let Some(portal) = request.portal {
                row.portal = portal;
            }
        })?;
    app.pipelines
        .spawn_deploy(record.plugin_id.clone(), record.version, user);

    Ok(Envelope::success(
        format!("Deployment started for {}", record.name),
        Some(json!({ "plugin_id": record.plugin_id, "version": record.version })),
    ))
}

async fn list(State(app): State<Arc<App>>, Json(request): Json<ListRequest>) -> ApiResult {
    let deps = app.deps();
    let (rows, total) = deps.stores.plugins.list_page(&request)?;
    let mut body = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut value = serde_json::to_value(row.masked())?;
        value["disabledActions"] =
            json!(disabled_actions(row.deployment_status, row.plugin_type));
        body.push(value);
    }
    let end_of_records = request.start_row + rows.len() >= total;
    Ok(Envelope::success(
        "Plugins listed",
        Some(json!({
            "bodyContent": body,
            "total_no": total,
            "endOfRecords": end_of_records,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub plugin_id: String,
    #[serde(default)]
    pub version: Option<Version>,
}

async fn fetch(State(app): State<Arc<App>>, Query(query): Query<FetchQuery>) -> ApiResult {
    let deps = app.deps();
    let record = match query.version {
        Some(version) => deps.stores.plugins.fetch(&query.plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(&query.plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {}", query.plugin_id)))?;

    let mut masked = record.masked();
    if masked.current_version.is_none() {
        masked.current_version = Some(masked.version);
    }
    Ok(Envelope::success(
        "Plugin fetched",
        Some(serde_json::to_value(masked)?),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub plugin_ids: Vec<String>,
}

async fn delete_plugins(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> ApiResult {
    let deps = app.deps();
    if request.plugin_ids.is_empty() {
        return Err(ApiError(Error::BadRequest(
            "plugin_ids must not be empty".to_string(),
        )));
    }
    for plugin_id in &request.plugin_ids {
        if deps.stores.plugins.versions(plugin_id)?.is_empty() {
            return Err(ApiError(Error::NotFound(format!("plugin {plugin_id}"))));
        }
    }
    app.pipelines
        .spawn_delete(request.plugin_ids.clone(), user_id(&headers));
    Ok(Envelope::success(
        format!("Deletion started for {} plugin(s)", request.plugin_ids.len()),
        None,
    ))
}

#[derive(Debug, Deserialize)]
pub struct StateRequest {
    pub plugin_ids: Vec<String>,
}

async fn plugin_state(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<StateRequest>,
) -> ApiResult {
    let user = user_id(&headers);
    let mut results = Vec::new();
    for plugin_id in &request.plugin_ids {
        match app.pipelines.toggle_state(plugin_id, &user).await {
            Ok(message) => results.push(json!({ "plugin_id": plugin_id, "message": message })),
            Err(e) => results.push(json!({ "plugin_id": plugin_id, "error": e.to_string() })),
        }
    }
    Ok(Envelope::success("State toggled", Some(json!(results))))
}

async fn bundle_upload(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult {
    let deps = app.deps();
    let user = user_id(&headers);
    let mut plugin_id: Option<String> = None;
    let mut version: Option<Version> = None;
    let mut stored: Option<(PathBuf, String)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("plugin_id") => {
                plugin_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| Error::BadRequest(e.to_string()))?,
                )
            }
            Some("version") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| Error::BadRequest(e.to_string()))?;
                version = Some(
                    raw.parse()
                        .map_err(|_| Error::BadRequest(format!("Bad version: {raw}")))?,
                );
            }
            Some("file") => {
                let filename = field
                    .file_name()
                    .unwrap_or("bundle.zip")
                    .rsplit('/')
                    .next()
                    .unwrap_or("bundle.zip")
                    .to_string();
                content_type_for(&filename)?;
                let dir = deps.settings.service.work_root.join("uploads");
                tokio::fs::create_dir_all(&dir).await?;
                let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4().simple(), filename));
                let mut file = tokio::fs::File::create(&path).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| Error::BadRequest(format!("Upload interrupted: {e}")))?
                {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                stored = Some((path, filename));
            }
            _ => {}
        }
    }

    let plugin_id =
        plugin_id.ok_or_else(|| Error::BadRequest("plugin_id is required".to_string()))?;
    let (path, filename) =
        stored.ok_or_else(|| Error::BadRequest("No file in the upload".to_string()))?;

    let result = attach_bundle(&app, &plugin_id, version, &path, &filename, &user).await;
    tokio::fs::remove_file(&path).await.ok();
    let key = result?;
    Ok(Envelope::success(
        "Bundle uploaded",
        Some(json!({ "file_path": key })),
    ))
}

/// Push a staged archive into the artifact store and attach it to the
/// version record.
async fn attach_bundle(
    app: &Arc<App>,
    plugin_id: &str,
    version: Option<Version>,
    path: &std::path::Path,
    filename: &str,
    user: &str,
) -> Result<String, Error> {
    let deps = app.deps();
    let record = match version {
        Some(version) => deps.stores.plugins.fetch(plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {plugin_id}")))?;

    let content_type = content_type_for(filename)?;
    let key = bundle_key(plugin_id, filename);
    deps.artifacts.put_file(&key, path, content_type).await?;
    deps.stores
        .plugins
        .update_with(plugin_id, record.version, |row| {
            row.source.set_blob_key(key.clone());
        })?;

    deps.notifier
        .publish(
            user,
            &record.project_id,
            &crate::infrastructure::notifier::Notification::uploaded(
                &record.name,
                record.plugin_type,
            ),
        )
        .await;
    Ok(key)
}

/// Chunked upload: append each part to a temp file named after the upload;
/// `finalize-upload` promotes it to the artifact store.
async fn bundle_upload_chunk(
    State(app): State<Arc<App>>,
    mut multipart: Multipart,
) -> ApiResult {
    let deps = app.deps();
    let mut appended = 0usize;
    let mut file_name = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .ok_or_else(|| Error::BadRequest("Chunk carries no file name".to_string()))?
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let dir = deps.settings.service.work_root.join("uploads");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&filename);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| Error::BadRequest(format!("Upload interrupted: {e}")))?
        {
            appended += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file_name = Some(filename);
    }

    let file_name =
        file_name.ok_or_else(|| Error::BadRequest("No file chunk in the upload".to_string()))?;
    Ok(Envelope::success(
        "Chunk stored",
        Some(json!({ "file_name": file_name, "bytes": appended })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub plugin_id: String,
    pub file_name: String,
    #[serde(default)]
    pub version: Option<Version>,
}

async fn finalize_upload(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<FinalizeRequest>,
) -> ApiResult {
    let deps = app.deps();
    let user = user_id(&headers);
    let file_name = request
        .file_name
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let staged = deps.settings.service.work_root.join("uploads").join(&file_name);
    if !staged.exists() {
        return Err(ApiError(Error::NotFound(format!(
            "staged upload {file_name}"
        ))));
    }
    let result = attach_bundle(
        &app,
        &request.plugin_id,
        request.version,
        &staged,
        &file_name,
        &user,
    )
    .await;
    tokio::fs::remove_file(&staged).await.ok();
    let key = result?;
    Ok(Envelope::success(
        "Bundle uploaded",
        Some(json!({ "file_path": key })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PluginQuery {
    pub plugin_id: String,
    #[serde(default)]
    pub version: Option<Version>,
}

async fn bundle_download(
    State(app): State<Arc<App>>,
    Query(query): Query<PluginQuery>,
) -> Result<Response, ApiError> {
    let deps = app.deps();
    let record = match query.version {
        Some(version) => deps.stores.plugins.fetch(&query.plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(&query.plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {}", query.plugin_id)))?;

    let key = record
        .source
        .blob_key()
        .ok_or_else(|| Error::NotFound(format!("bundle for plugin {}", query.plugin_id)))?;
    let filename = key.rsplit('/').next().unwrap_or("bundle.zip").to_string();
    let content_type = content_type_for(&filename)?;

    let upstream = deps.artifacts.get(key).await?;
    let body = Body::from_stream(upstream.bytes_stream());
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={filename}"),
        )
        .body(body)
        .map_err(|e| ApiError(Error::Internal(anyhow::anyhow!(e))))
}

async fn plugin_logs(
    State(app): State<Arc<App>>,
    Query(query): Query<PluginQuery>,
) -> ApiResult {
    let deps = app.deps();
    let record = match query.version {
        Some(version) => deps.stores.plugins.fetch(&query.plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(&query.plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {}", query.plugin_id)))?;

    let mut lines = record.errors.clone();
    if record.plugin_type.is_workload() && !record.portal {
        match deps.reconciler.logs(&record.workload_name(), 100).await {
            Ok(log) if !log.is_empty() => lines.push(log),
            Ok(_) => {}
            Err(e) => lines.push(format!("<runtime logs unavailable: {e}>")),
        }
    }
    Ok(Envelope::success(
        "Logs fetched",
        Some(json!(lines.join("\n"))),
    ))
}

async fn plugin_report(
    State(app): State<Arc<App>>,
    Query(query): Query<PluginQuery>,
) -> ApiResult {
    let deps = app.deps();
    let report = deps
        .stores
        .reports
        .fetch(&query.plugin_id)?
        .ok_or_else(|| Error::NotFound(format!("scan report for {}", query.plugin_id)))?;
    Ok(Envelope::success(
        "Report fetched",
        Some(serde_json::to_value(report)?),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub plugin_ids: Vec<String>,
    #[serde(default)]
    pub version: Option<Version>,
}

async fn initiate_download(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<DownloadRequest>,
) -> ApiResult {
    let deps = app.deps();
    if !deps.settings.features.download_enabled {
        return Err(ApiError(Error::BadRequest(
            "Artifact download is disabled".to_string(),
        )));
    }
    app.pipelines
        .spawn_download(request.plugin_ids, request.version, user_id(&headers));
    Ok(Envelope::success("Download preparation started", None))
}

async fn download_docker_file(
    State(app): State<Arc<App>>,
    Query(query): Query<PluginQuery>,
) -> Result<Response, ApiError> {
    let deps = app.deps();
    let record = match query.version {
        Some(version) => deps.stores.plugins.fetch(&query.plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(&query.plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {}", query.plugin_id)))?;

    let zip_path = download_bundle_path(&deps.settings.service.bundle_dir, &record.slug());
    if !zip_path.exists() {
        return Err(ApiError(Error::NotFound(format!(
            "prepared bundle for {}",
            record.name
        ))));
    }
    let file = tokio::fs::File::open(&zip_path).await.map_err(Error::from)?;
    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}.zip", record.slug()),
        )
        .body(body)
        .map_err(|e| ApiError(Error::Internal(anyhow::anyhow!(e))))
}

async fn fetch_versions(
    State(app): State<Arc<App>>,
    Query(query): Query<PluginQuery>,
) -> ApiResult {
    let deps = app.deps();
    let versions = deps.stores.plugins.versions(&query.plugin_id)?;
    if versions.is_empty() {
        return Err(ApiError(Error::NotFound(format!(
            "plugin {}",
            query.plugin_id
        ))));
    }
    let body: Vec<Value> = versions
        .iter()
        .map(|v| json!({ "label": v.to_string(), "value": v }))
        .collect();
    Ok(Envelope::success("Versions listed", Some(json!(body))))
}

/// Env kinds the config editor offers, with the referenceable orchestrator
/// secrets as options for the secret-ref kind.
async fn env_options(State(app): State<Arc<App>>) -> ApiResult {
    let deps = app.deps();
    let mut options = vec![
        json!({ "label": "Text", "value": "plain", "options": Value::Null }),
        json!({ "label": "Secure", "value": "secure", "options": Value::Null }),
    ];
    match deps.reconciler.list_user_secrets().await {
        Ok(secrets) if !secrets.is_empty() => {
            options.push(json!({
                "label": "Kubernetes Secrets",
                "value": "secret_ref",
                "options": secrets
                    .iter()
                    .map(|s| json!({ "label": s, "value": s.to_lowercase() }))
                    .collect::<Vec<_>>(),
            }));
        }
        Ok(_) => {}
        Err(e) => return Err(ApiError(e)),
    }
    Ok(Envelope::success("Env options listed", Some(json!(options))))
}

#[derive(Debug, Deserialize)]
pub struct SecretCreateRequest {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

async fn create_secret(
    State(app): State<Arc<App>>,
    Json(request): Json<SecretCreateRequest>,
) -> ApiResult {
    if request.name.trim().is_empty() || request.data.is_empty() {
        return Err(ApiError(Error::BadRequest(
            "A secret needs a name and at least one entry".to_string(),
        )));
    }
    app.deps()
        .reconciler
        .create_secret(&request.name, request.data)
        .await?;
    Ok(Envelope::success(
        format!("Secret {} created", request.name),
        None,
    ))
}

#[derive(Debug, Deserialize)]
pub struct SecretDeleteRequest {
    pub name: String,
}

async fn delete_secret(
    State(app): State<Arc<App>>,
    Json(request): Json<SecretDeleteRequest>,
) -> ApiResult {
    app.deps().reconciler.delete_secret(&request.name).await?;
    Ok(Envelope::success(
        format!("Secret {} deleted", request.name),
        None,
    ))
}

/// Latest state of a kubeflow plugin's pipeline run.
async fn run_status(
    State(app): State<Arc<App>>,
    Query(query): Query<PluginQuery>,
) -> ApiResult {
    let deps = app.deps();
    let record = match query.version {
        Some(version) => deps.stores.plugins.fetch(&query.plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(&query.plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {}", query.plugin_id)))?;

    let run_id = record
        .field(RUN_FIELD_LABEL)
        .ok_or_else(|| Error::NotFound(format!("pipeline run for {}", record.name)))?;
    let state = deps.ml_pipelines.run_state(run_id).await?;
    Ok(Envelope::success(
        "Run status fetched",
        Some(json!({ "run_id": run_id, "state": state })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_source(token: Option<&str>) -> Source {
        Source::Git {
            target_ref: None,
            url: Some("https://github.com/acme/wx".into()),
            username: Some("bot".into()),
            access_token: token.map(str::to_string),
            repository: None,
            branch: "main".into(),
        }
    }

    #[test]
    fn test_merge_source_mask_keeps_token() {
        let stored = git_source(Some("ghp_real"));
        let (merged, changed) = merge_source(git_source(Some(SECRET_MASK)), Some(&stored));
        assert!(!changed);
        match merged {
            Source::Git { access_token, .. } => {
                assert_eq!(access_token.as_deref(), Some("ghp_real"))
            }
            _ => panic!("expected git source"),
        }
    }

    #[test]
    fn test_merge_source_detects_credential_change() {
        let stored = git_source(Some("ghp_real"));
        let (_, changed) = merge_source(git_source(Some("ghp_new")), Some(&stored));
        assert!(changed);

        let mut other_user = git_source(Some(SECRET_MASK));
        if let Source::Git { username, .. } = &mut other_user {
            *username = Some("other".into());
        }
        let (_, changed) = merge_source(other_user, Some(&stored));
        assert!(changed);
    }

    #[test]
    fn test_merge_source_preserves_blob_key() {
        let stored = Source::ArchiveUpload {
            blob_key: Some("uploads/p1/zip/bundle.zip".into()),
        };
        let (merged, changed) =
            merge_source(Source::ArchiveUpload { blob_key: None }, Some(&stored));
        assert!(!changed);
        assert_eq!(merged.blob_key(), Some("uploads/p1/zip/bundle.zip"));
    }

    #[test]
    fn test_source_runnable() {
        assert!(source_runnable(&git_source(None)));
        assert!(!source_runnable(&Source::ImageUpload { blob_key: None }));
        assert!(source_runnable(&Source::ImageUpload {
            blob_key: Some("uploads/p1/zip/img.zip".into())
        }));
    }
}
