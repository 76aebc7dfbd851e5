//! The registration/deployment pipeline: a background state machine per
//! `(pluginID, version)` plus the follower and maintenance tasks around it.
//!
//! At most one pipeline runs per key; a second request for the same key is a
//! duplicate and observes the first's outcome. Deleting a version cancels its
//! running tasks at the next suspension point.

mod acquire;
mod download;
mod follower;
mod run;

pub use acquire::WorkTree;
pub use download::bundle_zip_path as download_bundle_path;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::{PluginType, Version};
use crate::error::Error;
use crate::infrastructure::artifact_store::ArtifactStore;
use crate::infrastructure::container::ContainerEngine;
use crate::infrastructure::notifier::Notifier;
use crate::infrastructure::registry::RegistryClient;
use crate::infrastructure::scanner::ScanRunner;
use crate::infrastructure::signer::Signer;
use crate::orchestrator::pipelines::MlPipelineClient;
use crate::orchestrator::Reconciler;
use crate::store::Stores;

/// Process-wide handles, initialized once at startup and passed into
/// components by construction so tests can substitute fakes.
pub struct Deps {
    pub settings: Settings,
    pub stores: Stores,
    pub engine: ContainerEngine,
    pub registry: RegistryClient,
    pub signer: Signer,
    pub scanner: ScanRunner,
    pub artifacts: ArtifactStore,
    pub notifier: Notifier,
    pub reconciler: Reconciler,
    pub ml_pipelines: MlPipelineClient,
    pub http: reqwest::Client,
}

pub struct PipelineController {
    deps: Arc<Deps>,
    running: DashMap<String, CancellationToken>,
}

fn task_key(plugin_id: &str, version: Version) -> String {
    format!("{}|{}", plugin_id, version)
}

impl PipelineController {
    pub fn new(deps: Arc<Deps>) -> Self {
        PipelineController {
            deps,
            running: DashMap::new(),
        }
    }

    pub fn deps(&self) -> &Arc<Deps> {
        &self.deps
    }

    pub fn is_running(&self, plugin_id: &str, version: Version) -> bool {
        self.running.contains_key(&task_key(plugin_id, version))
    }

    /// Enqueue the deployment pipeline for a version. Returns false when a
    /// pipeline for the same key is already in flight, and the caller reports
    /// the in-progress state instead of starting a second run.
    pub fn spawn_deploy(
        self: &Arc<Self>,
        plugin_id: String,
        version: Version,
        user_id: String,
    ) -> bool {
        let key = task_key(&plugin_id, version);
        let token = match self.running.entry(key.clone()) {
            Entry::Occupied(_) => {
                info!(plugin_id, %version, "pipeline already in flight, coalescing");
                return false;
            }
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                token
            }
        };

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            run::run_pipeline(Arc::clone(&controller), plugin_id, version, user_id, token).await;
            controller.running.remove(&key);
        });
        true
    }

    /// Start the status follower for a version whose apply already succeeded.
    pub fn spawn_follower(self: &Arc<Self>, plugin_id: String, version: Version, user_id: String) {
        let key = format!("follow:{}", task_key(&plugin_id, version));
        let token = match self.running.entry(key.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                token
            }
        };
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            follower::follow(Arc::clone(&controller), plugin_id, version, user_id, token).await;
            controller.running.remove(&key);
        });
    }

    /// Background teardown of whole plugins: orchestrator objects, blobs,
    /// specialization rows and finally the metadata itself.
    pub fn spawn_delete(self: &Arc<Self>, plugin_ids: Vec<String>, user_id: String) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            for plugin_id in plugin_ids {
                if let Err(e) = controller.delete_plugin(&plugin_id, &user_id).await {
                    warn!(plugin_id, error = %e, "plugin delete incomplete");
                }
            }
        });
    }

    /// Background artifact-download preparation: pull, export, sign, zip,
    /// notify.
    pub fn spawn_download(
        self: &Arc<Self>,
        plugin_ids: Vec<String>,
        version: Option<Version>,
        user_id: String,
    ) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            for plugin_id in plugin_ids {
                if let Err(e) =
                    download::prepare_download(&controller.deps, &plugin_id, version, &user_id)
                        .await
                {
                    warn!(plugin_id, error = %e, "artifact download preparation failed");
                }
            }
        });
    }

    /// Signal every task running for a plugin to stop at its next suspension
    /// point. Advisory: mid-build work finishes and its outputs are orphaned.
    pub fn cancel_plugin_tasks(&self, plugin_id: &str) {
        let prefix = format!("{}|", plugin_id);
        let follow_prefix = format!("follow:{}|", plugin_id);
        for entry in self.running.iter() {
            if entry.key().starts_with(&prefix) || entry.key().starts_with(&follow_prefix) {
                entry.value().cancel();
            }
        }
    }

    async fn delete_plugin(&self, plugin_id: &str, user_id: &str) -> Result<(), Error> {
        let deps = &self.deps;
        self.cancel_plugin_tasks(plugin_id);

        let rows = deps.stores.plugins.versions_of(plugin_id)?;
        if rows.is_empty() {
            return Err(Error::NotFound(format!("plugin {plugin_id}")));
        }
        let representative = deps
            .stores
            .plugins
            .fetch_current(plugin_id)?
            .unwrap_or_else(|| rows[0].clone());

        if representative.plugin_type.is_workload() {
            deps.reconciler
                .teardown(&representative.workload_name())
                .await;
        }
        if representative.plugin_type == PluginType::Kubeflow {
            if let Err(e) = deps
                .ml_pipelines
                .delete_pipeline(&representative.name, &representative.project_id)
                .await
            {
                warn!(plugin_id, error = %e, "pipeline platform cleanup failed");
            }
        }

        // Blob reclamation is best-effort; the metadata delete always runs.
        for row in &rows {
            if let Some(key) = row.source.blob_key() {
                if let Err(e) = deps.artifacts.delete(key).await {
                    warn!(plugin_id, key, error = %e, "blob delete failed");
                }
            }
        }

        deps.stores.widgets.delete(plugin_id)?;
        deps.stores.reports.delete(plugin_id)?;
        let removed = deps.stores.plugins.delete_all(plugin_id)?;
        info!(plugin_id, removed, user_id, "plugin deleted");
        Ok(())
    }

    /// Toggle a plugin between stopped (replicas zero) and running (saved
    /// replica count). Start goes through the follower for readiness.
    pub async fn toggle_state(self: &Arc<Self>, plugin_id: &str, user_id: &str) -> Result<String, Error> {
        let deps = &self.deps;
        let record = deps
            .stores
            .plugins
            .fetch_current(plugin_id)?
            .ok_or_else(|| Error::NotFound(format!("plugin {plugin_id}")))?;

        if record.plugin_type.start_stop_unsupported() {
            return Err(Error::BadRequest(format!(
                "{} plugins cannot be started or stopped",
                record.plugin_type
            )));
        }
        let workload = record.workload_name();

        use crate::domain::DeploymentStatus::*;
        match record.deployment_status {
            Running => {
                deps.reconciler.scale(&workload, 0).await?;
                deps.stores
                    .plugins
                    .update_with(plugin_id, record.version, |row| {
                        row.deployment_status = Stopped;
                    })?;
                Ok(format!("Plugin {} stopped", record.name))
            }
            Stopped => {
                let replicas = record.resources.replicas.max(1);
                deps.reconciler.scale(&workload, replicas).await?;
                deps.stores
                    .plugins
                    .update_with(plugin_id, record.version, |row| {
                        row.deployment_status = Deploying;
                    })?;
                self.spawn_follower(
                    plugin_id.to_string(),
                    record.version,
                    user_id.to_string(),
                );
                Ok(format!("Plugin {} starting", record.name))
            }
            other => Err(Error::BadRequest(format!(
                "Plugin {} is {other}; only running or stopped plugins can be toggled",
                record.name
            ))),
        }
    }
}
