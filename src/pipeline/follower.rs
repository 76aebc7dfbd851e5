//! Post-apply status following.
//!
//! Polls the orchestrator until the workload is ready or broken. No hard
//! deadline: the orchestrator is the source of truth and callers cancel by
//! deleting the version.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::PipelineController;
use crate::domain::{DeploymentStatus, PluginType, Version};
use crate::infrastructure::notifier::Notification;
use crate::orchestrator::WorkloadPhase;

pub(super) async fn follow(
    controller: Arc<PipelineController>,
    plugin_id: String,
    version: Version,
    user_id: String,
    token: CancellationToken,
) {
    let deps = Arc::clone(controller.deps());
    let interval = Duration::from_secs(deps.settings.timeouts.poll_interval_secs.max(1));
    tokio::time::sleep(Duration::from_secs(
        deps.settings.timeouts.poll_initial_delay_secs,
    ))
    .await;

    let record = match deps.stores.plugins.fetch(&plugin_id, version) {
        Ok(Some(record)) => record,
        _ => return,
    };
    let workload = record.workload_name();

    loop {
        if token.is_cancelled() {
            return;
        }
        let status = match deps.reconciler.status(&workload).await {
            Ok(status) => status,
            Err(e) => {
                // Transient orchestrator error: keep polling, the next read
                // decides.
                warn!(workload, error = %e, "status poll failed");
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        match status.phase {
            WorkloadPhase::InProgress => {
                tokio::time::sleep(interval).await;
            }
            WorkloadPhase::Completed => {
                info!(workload, "deployment ready");
                let _ = deps
                    .stores
                    .plugins
                    .update_with(&plugin_id, version, |row| {
                        row.deployment_status = DeploymentStatus::Running;
                    });
                if record.plugin_type == PluginType::Widget {
                    cache_widget_styles(&deps, &plugin_id).await;
                }
                deps.notifier
                    .publish(
                        &user_id,
                        &record.project_id,
                        &Notification::deployed(&record.name, record.plugin_type, &plugin_id),
                    )
                    .await;
                return;
            }
            WorkloadPhase::Error | WorkloadPhase::NotFound => {
                let mut reasons = Vec::new();
                for pod in &status.pods {
                    for container in &pod.containers {
                        if container.status == "error" {
                            reasons.push(format!(
                                "{} {}",
                                container.reason.clone().unwrap_or_default(),
                                container.message.clone().unwrap_or_default()
                            ));
                        }
                    }
                }
                if status.phase == WorkloadPhase::NotFound {
                    reasons.push("Deployment disappeared while waiting for readiness".to_string());
                }
                warn!(workload, ?reasons, "deployment failed");
                let _ = deps
                    .stores
                    .plugins
                    .update_with(&plugin_id, version, |row| {
                        row.errors.extend(reasons.iter().cloned());
                        row.deployment_status = DeploymentStatus::Failed;
                    });
                deps.reconciler.teardown(&workload).await;
                deps.notifier
                    .publish(
                        &user_id,
                        &record.project_id,
                        &Notification::failed(&record.name, record.plugin_type),
                    )
                    .await;
                return;
            }
        }
    }
}

/// Widget post-deploy hook: fetch the plugin's style manifest through the
/// gateway and cache it on the widget record.
async fn cache_widget_styles(deps: &super::Deps, plugin_id: &str) {
    let Some(home_link) = &deps.settings.service.home_link else {
        return;
    };
    let Ok(Some(record)) = deps.stores.plugins.fetch_current(plugin_id) else {
        return;
    };
    let Some(proxy) = &record.proxy_path else {
        return;
    };
    let url = format!(
        "{}{}widget/load_styles",
        home_link.trim_end_matches('/'),
        proxy
    );
    match deps.http.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            if let Ok(body) = response.json::<serde_json::Value>().await {
                if body.get("status").and_then(|s| s.as_str()) == Some("success") {
                    if let Some(data) = body.get("data") {
                        if let Err(e) = deps.stores.widgets.cache_styles(plugin_id, data.clone()) {
                            warn!(plugin_id, error = %e, "style cache write failed");
                        }
                    }
                }
            }
        }
        Ok(response) => {
            warn!(plugin_id, status = %response.status(), "style fetch rejected");
        }
        Err(e) => {
            warn!(plugin_id, error = %e, "style fetch failed");
        }
    }
}
