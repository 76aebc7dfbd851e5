//! The per-registration state machine.
//!
//! pending -> scanning -> deploying -> (apply | catalog | pipeline run),
//! with `failed` reachable from every stage. Stage outcomes, not upstream
//! exception types, decide every transition; each transition is persisted
//! before the next stage starts so the UI can follow progress.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{acquire, PipelineController};
use crate::domain::{
    DeploymentStatus, PluginType, PluginVersion, RegistrationType, ScanChecks, Version,
    RUN_FIELD_LABEL,
};
use crate::error::Error;
use crate::infrastructure::container::ContainerEngine;
use crate::infrastructure::notifier::Notification;
use crate::orchestrator::pipelines::{self, PIPELINE_SPEC_FILENAME};
use crate::store::WidgetRecord;

/// How a pipeline run ended, short of an error.
enum Conclusion {
    /// Apply issued; the status follower decides the terminal state.
    Applied,
    /// Portal registration: published and scanned, nothing applied.
    Catalog,
    /// ML pipeline run started; no follower needed.
    PipelineStarted,
    /// A scan verdict failed; errors and verdicts are already persisted.
    Failed,
    /// Cancelled by a delete; leave the record alone.
    Cancelled,
}

pub(super) async fn run_pipeline(
    controller: Arc<PipelineController>,
    plugin_id: String,
    version: Version,
    user_id: String,
    token: CancellationToken,
) {
    let deps = Arc::clone(controller.deps());
    let mut record = match deps.stores.plugins.fetch(&plugin_id, version) {
        Ok(Some(record)) => record,
        Ok(None) => {
            error!(plugin_id, %version, "pipeline started for a missing version");
            return;
        }
        Err(e) => {
            error!(plugin_id, %version, error = %e, "pipeline could not load the version");
            return;
        }
    };

    // Fresh run: previous errors, verdicts and findings are replaced.
    record.deployment_status = DeploymentStatus::Pending;
    record.errors.clear();
    record.scan_checks = ScanChecks::default();
    if persist(&deps, &record).is_err() {
        return;
    }
    if let Err(e) = deps.stores.reports.reset(&plugin_id) {
        error!(plugin_id, error = %e, "scan report reset failed");
    }

    info!(plugin_id, %version, name = %record.name, "pipeline started");
    let outcome = execute(&deps, &mut record, &token).await;

    match outcome {
        Ok(Conclusion::Applied) => {
            controller.spawn_follower(plugin_id, version, user_id);
        }
        Ok(Conclusion::Catalog) => {
            record.deployment_status = DeploymentStatus::ScanSucceeded;
            let _ = persist(&deps, &record);
            deps.notifier
                .publish(
                    &user_id,
                    &record.project_id,
                    &Notification::scan_succeeded(
                        &record.name,
                        record.plugin_type,
                        &record.plugin_id,
                    ),
                )
                .await;
        }
        Ok(Conclusion::PipelineStarted) => {
            record.deployment_status = DeploymentStatus::Running;
            let _ = persist(&deps, &record);
            deps.notifier
                .publish(
                    &user_id,
                    &record.project_id,
                    &Notification::deployed(&record.name, record.plugin_type, &record.plugin_id),
                )
                .await;
        }
        Ok(Conclusion::Failed) => {
            record.deployment_status = DeploymentStatus::Failed;
            let _ = persist(&deps, &record);
            deps.notifier
                .publish(
                    &user_id,
                    &record.project_id,
                    &Notification::failed(&record.name, record.plugin_type),
                )
                .await;
        }
        Ok(Conclusion::Cancelled) => {
            info!(plugin_id = %record.plugin_id, "pipeline cancelled");
        }
        Err(e) => {
            error!(plugin_id = %record.plugin_id, error = %e, "pipeline failed");
            record.errors.push(e.pipeline_message());
            record.deployment_status = DeploymentStatus::Failed;
            let _ = persist(&deps, &record);
            deps.notifier
                .publish(
                    &user_id,
                    &record.project_id,
                    &Notification::failed(&record.name, record.plugin_type),
                )
                .await;
        }
    }
}

fn persist(deps: &super::Deps, record: &PluginVersion) -> Result<(), Error> {
    deps.stores
        .plugins
        .upsert(record)
        .map_err(|e| {
            error!(plugin_id = %record.plugin_id, error = %e, "version persist failed");
            Error::Internal(e)
        })
}

async fn execute(
    deps: &super::Deps,
    record: &mut PluginVersion,
    token: &CancellationToken,
) -> Result<Conclusion, Error> {
    let registration = record.source.registration_type();
    let work = acquire::acquire(deps, record).await?;
    if token.is_cancelled() {
        return Ok(Conclusion::Cancelled);
    }

    if record.plugin_type == PluginType::Kubeflow {
        return deploy_ml_pipeline(deps, record, work.tree()).await;
    }

    // Source scans run before any build; an image bundle skips them and the
    // image scan speaks for all three.
    if registration != RegistrationType::ImageUpload {
        record.deployment_status = DeploymentStatus::Scanning;
        persist(deps, record)?;
        match source_scans(deps, record, work.tree()).await? {
            ScanStage::Passed => {}
            ScanStage::Failed => return Ok(Conclusion::Failed),
        }
        if token.is_cancelled() {
            return Ok(Conclusion::Cancelled);
        }
    }

    record.deployment_status = DeploymentStatus::Deploying;
    persist(deps, record)?;

    let image = publish_image(deps, record, work.tree(), registration).await?;
    record.record_image(&image);
    persist(deps, record)?;
    if token.is_cancelled() {
        return Ok(Conclusion::Cancelled);
    }

    match image_scan(deps, record, &image, registration).await? {
        ScanStage::Passed => {}
        ScanStage::Failed => return Ok(Conclusion::Failed),
    }
    if token.is_cancelled() {
        return Ok(Conclusion::Cancelled);
    }

    if record.portal {
        return Ok(Conclusion::Catalog);
    }

    let proxy = deps.reconciler.apply(record, &image).await?;
    record.proxy_path = Some(proxy.clone());
    persist(deps, record)?;

    if record.plugin_type == PluginType::Widget {
        let chart_type = record
            .information
            .get("chart_type")
            .and_then(|v| v.as_str())
            .unwrap_or(&record.name)
            .to_string();
        deps.stores.widgets.upsert(&WidgetRecord {
            plugin_id: record.plugin_id.clone(),
            chart_type,
            version: record.version,
            project_id: record.project_id.clone(),
            proxy,
            meta: serde_json::json!({}),
        })?;
    }

    Ok(Conclusion::Applied)
}

enum ScanStage {
    Passed,
    Failed,
}

/// Antivirus then static analysis over the working tree, fail-fast, verdicts
/// written in scan order. A scanner that cannot run is a failed scan.
async fn source_scans(
    deps: &super::Deps,
    record: &mut PluginVersion,
    workdir: &Path,
) -> Result<ScanStage, Error> {
    if !deps.scanner.settings().antivirus_enabled {
        record.scan_checks.antivirus = Some(true);
        persist(deps, record)?;
    } else {
        match deps.scanner.antivirus(workdir).await {
            Ok(outcome) => {
                deps.stores
                    .reports
                    .record_antivirus(&record.plugin_id, outcome.summary.clone())?;
                if outcome.passed() {
                    record.scan_checks.antivirus = Some(true);
                    persist(deps, record)?;
                } else {
                    record.scan_checks.antivirus = Some(false);
                    record
                        .errors
                        .push("Infected files found in the plugin".to_string());
                    persist(deps, record)?;
                    return Ok(ScanStage::Failed);
                }
            }
            Err(e) => {
                record.scan_checks.antivirus = Some(false);
                record.errors.push(e.pipeline_message());
                persist(deps, record)?;
                return Ok(ScanStage::Failed);
            }
        }
    }

    if !deps.scanner.settings().sast_enabled {
        record.scan_checks.sast = Some(true);
        persist(deps, record)?;
        return Ok(ScanStage::Passed);
    }
    match deps.scanner.sast(workdir, &record.slug()).await {
        Ok(outcome) => {
            deps.stores
                .reports
                .record_sast(&record.plugin_id, outcome.findings.clone())?;
            if outcome.passed {
                record.scan_checks.sast = Some(true);
                persist(deps, record)?;
                Ok(ScanStage::Passed)
            } else {
                record.scan_checks.sast = Some(false);
                record
                    .errors
                    .push("Static analysis findings exceed the configured thresholds".to_string());
                persist(deps, record)?;
                Ok(ScanStage::Failed)
            }
        }
        Err(e) => {
            record.scan_checks.sast = Some(false);
            record.errors.push(e.pipeline_message());
            persist(deps, record)?;
            Ok(ScanStage::Failed)
        }
    }
}

/// Build (git/archive) or verify-and-load (image bundle), push the canonical
/// tag and sign the registry digest. Returns the published image reference.
async fn publish_image(
    deps: &super::Deps,
    record: &PluginVersion,
    workdir: &Path,
    registration: RegistrationType,
) -> Result<String, Error> {
    let image = record.image_tag(deps.engine.registry_url());

    match registration {
        RegistrationType::Git | RegistrationType::ArchiveUpload => {
            if !ContainerEngine::has_recipe(workdir) {
                ContainerEngine::render_default_recipe(workdir).await?;
            }
            deps.engine.build(workdir, &image).await?;
        }
        RegistrationType::ImageUpload => {
            let tar = workdir.join("plugin.tar");
            if !tar.exists() {
                return Err(Error::BadRequest(
                    "The uploaded bundle carries no plugin.tar".to_string(),
                ));
            }
            deps.signer
                .verify_blob(&tar, &workdir.join("signature"))
                .await?;
            let loaded = deps.engine.load(&tar).await?;
            deps.engine.tag(&loaded, &image).await?;
        }
    }

    push_with_timeout(deps, &image).await?;
    sign_published(deps, &image).await?;
    Ok(image)
}

async fn push_with_timeout(deps: &super::Deps, image: &str) -> Result<(), Error> {
    let push_timeout = Duration::from_secs(deps.settings.timeouts.push_secs);
    match tokio::time::timeout(push_timeout, deps.engine.push(image)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Internal(anyhow::anyhow!(
            "Registry push timed out after {}s",
            deps.settings.timeouts.push_secs
        ))),
    }
}

/// Sign the digest the registry resolved for the pushed tag, falling back to
/// the tag itself when the registry will not disclose one.
async fn sign_published(deps: &super::Deps, image: &str) -> Result<(), Error> {
    let digest_ref = match deps.registry.resolve_digest(image).await {
        Ok(digest_ref) => digest_ref,
        Err(_) => image.to_string(),
    };
    deps.signer.sign_image(&digest_ref).await
}

/// Vulnerability scan of the pushed image. For image bundles a pass implies
/// the source verdicts as well.
async fn image_scan(
    deps: &super::Deps,
    record: &mut PluginVersion,
    image: &str,
    registration: RegistrationType,
) -> Result<ScanStage, Error> {
    if !deps.scanner.settings().vulnerability_enabled {
        record.scan_checks.vulnerability = Some(true);
    } else {
        match deps.scanner.vulnerabilities(image).await {
            Ok(outcome) => {
                deps.stores
                    .reports
                    .record_vulnerabilities(&record.plugin_id, outcome.findings.clone())?;
                if outcome.passed() {
                    record.scan_checks.vulnerability = Some(true);
                } else {
                    record.scan_checks.vulnerability = Some(false);
                    record.errors.push(
                        "Vulnerabilities found in the image at the configured severities"
                            .to_string(),
                    );
                    persist(deps, record)?;
                    return Ok(ScanStage::Failed);
                }
            }
            Err(e) => {
                record.scan_checks.vulnerability = Some(false);
                record.errors.push(e.pipeline_message());
                persist(deps, record)?;
                return Ok(ScanStage::Failed);
            }
        }
    }

    if registration == RegistrationType::ImageUpload
        && record.scan_checks.vulnerability == Some(true)
    {
        record.scan_checks.antivirus = Some(true);
        record.scan_checks.sast = Some(true);
    }
    persist(deps, record)?;
    Ok(ScanStage::Passed)
}

/// Kubeflow flow: optional image bundle publish, spec rewrite, upload,
/// experiment, schedule.
async fn deploy_ml_pipeline(
    deps: &super::Deps,
    record: &mut PluginVersion,
    workdir: &Path,
) -> Result<Conclusion, Error> {
    record.deployment_status = DeploymentStatus::Deploying;
    persist(deps, record)?;

    let spec_name = record
        .env
        .iter()
        .find(|e| e.key == "deployment_yaml")
        .map(|e| e.value.clone())
        .unwrap_or_else(|| PIPELINE_SPEC_FILENAME.to_string());
    let spec_path = workdir.join(&spec_name);
    if !spec_path.exists() {
        return Err(Error::PipelineConfigMissing(format!(
            "{} not found in the bundle",
            spec_name
        )));
    }

    // An image bundle alongside the spec: verify, publish, and point every
    // executor at the canonical tag.
    let tar = workdir.join("kubeflow.tar");
    if tar.exists() {
        deps.signer
            .verify_blob(&tar, &workdir.join("signature"))
            .await?;
        let loaded = deps.engine.load(&tar).await?;
        let image = record.image_tag(deps.engine.registry_url());
        deps.engine.tag(&loaded, &image).await?;
        push_with_timeout(deps, &image).await?;
        sign_published(deps, &image).await?;
        record.record_image(&image);
        persist(deps, record)?;

        let raw = tokio::fs::read_to_string(&spec_path).await?;
        let mut docs = pipelines::read_documents(&raw)?;
        pipelines::rewrite_executor_images(&mut docs, &image);
        pipelines::inject_image_pull_secret(&mut docs, deps.ml_pipelines.image_pull_secret());
        tokio::fs::write(&spec_path, pipelines::write_documents(&docs)?).await?;
    }

    if record.portal {
        return Ok(Conclusion::Catalog);
    }

    let schedule = pipelines::schedule_from_env(&record.env)?;
    let variables_path = workdir.join("variables.yml");
    let overrides = if variables_path.exists() {
        pipelines::variable_overrides(&tokio::fs::read_to_string(&variables_path).await?)
    } else {
        Default::default()
    };
    let params = pipelines::pipeline_params(&record.env, overrides);

    let namespace = deps.ml_pipelines.namespace(&record.project_id);
    let version_name = format!("{}-{}", record.name, record.version);
    let (pipeline_id, version_id) = match deps
        .ml_pipelines
        .find_pipeline_id(&record.name, &namespace)
        .await?
    {
        Some(pipeline_id) => {
            let version_id = deps
                .ml_pipelines
                .upload_pipeline_version(&spec_path, &version_name, &pipeline_id)
                .await?;
            (pipeline_id, version_id)
        }
        None => {
            deps.ml_pipelines
                .upload_pipeline(&spec_path, &record.name, &namespace)
                .await?
        }
    };

    let experiment_id = deps
        .ml_pipelines
        .ensure_experiment(&record.name, &namespace)
        .await?;
    deps.ml_pipelines
        .disable_stale_recurring_runs(&experiment_id, &record.name)
        .await?;

    let run_id = match &schedule {
        Some(schedule) => {
            deps.ml_pipelines
                .create_recurring_run(
                    &experiment_id,
                    &record.name,
                    &pipeline_id,
                    &version_id,
                    schedule,
                    &params,
                )
                .await?
        }
        None => {
            deps.ml_pipelines
                .create_run(&experiment_id, &record.name, &pipeline_id, &version_id, &params)
                .await?
        }
    };
    info!(plugin_id = %record.plugin_id, run_id, "pipeline run started");
    if !run_id.is_empty() {
        record.set_field(RUN_FIELD_LABEL, &run_id);
        persist(deps, record)?;
    }

    Ok(Conclusion::PipelineStarted)
}
