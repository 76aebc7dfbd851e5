//! Create-or-update reconciliation of a plugin's orchestrator objects.
//!
//! Every operation is declarative: `apply` converges the three objects on the
//! version record, `scale` only touches replicas, `teardown` removes whatever
//! of the three still exists. Actual state is observed, never assumed.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::resources;
use crate::config::OrchestratorSettings;
use crate::domain::{slugify, PluginVersion};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    Completed,
    InProgress,
    Error,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    pub container_name: String,
    pub image: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodReport {
    pub pod_name: String,
    pub containers: Vec<ContainerReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    pub replicas: i32,
    pub pods: Vec<PodReport>,
}

pub struct Reconciler {
    client: Client,
    settings: OrchestratorSettings,
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

impl Reconciler {
    pub fn new(client: Client, settings: OrchestratorSettings) -> Self {
        Reconciler { client, settings }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn routes(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("networking.istio.io", "v1alpha3", "VirtualService");
        let resource = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), &self.settings.namespace, &resource)
    }

    /// Converge the workload on the version record. Returns the proxy path
    /// the route now serves.
    pub async fn apply(&self, version: &PluginVersion, image: &str) -> Result<String, Error> {
        let name = version.workload_name();
        let now = chrono::Utc::now().timestamp_millis();
        let deployments = self.deployments();

        match deployments.get(&name).await {
            Ok(_) => {
                info!(workload = %name, image, "patching existing deployment");
                let patch = resources::deployment_patch(version, image, &self.settings, now);
                deployments
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(|e| Error::DeploymentFailed(e.to_string()))?;

                let service_patch = json!({
                    "spec": {
                        "ports": [{
                            "protocol": "TCP",
                            "port": version.container_port,
                            "targetPort": version.container_port,
                        }],
                    },
                });
                self.services()
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&service_patch))
                    .await
                    .map_err(|e| Error::ServiceFailed(e.to_string()))?;
            }
            Err(e) if is_not_found(&e) => {
                info!(workload = %name, image, "creating workload objects");
                let manifest: Deployment = serde_json::from_value(
                    resources::deployment_manifest(version, image, &self.settings, now),
                )?;
                deployments
                    .create(&PostParams::default(), &manifest)
                    .await
                    .map_err(|e| Error::DeploymentFailed(e.to_string()))?;

                let service: Service =
                    serde_json::from_value(resources::service_manifest(version, &self.settings))?;
                self.services()
                    .create(&PostParams::default(), &service)
                    .await
                    .map_err(|e| Error::ServiceFailed(e.to_string()))?;

                let route: DynamicObject = serde_json::from_value(
                    resources::virtual_route_manifest(version, &self.settings),
                )?;
                self.routes()
                    .create(&PostParams::default(), &route)
                    .await
                    .map_err(|e| Error::RouteFailed(e.to_string()))?;
            }
            Err(e) => return Err(Error::DeploymentFailed(e.to_string())),
        }

        Ok(version.derived_proxy_path())
    }

    /// Patch the replica count only.
    pub async fn scale(&self, workload: &str, replicas: i32) -> Result<(), Error> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(workload, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Error::NotFound(format!("deployment {workload}"))
                } else {
                    Error::DeploymentFailed(e.to_string())
                }
            })?;
        Ok(())
    }

    /// Delete the three objects. Missing objects are fine; real failures are
    /// logged and the remaining objects are still attempted.
    pub async fn teardown(&self, workload: &str) {
        let dp = DeleteParams::default();
        if let Err(e) = self.deployments().delete(workload, &dp).await {
            if !is_not_found(&e) {
                warn!(workload, error = %e, "failed to delete deployment");
            }
        }
        if let Err(e) = self.services().delete(workload, &dp).await {
            if !is_not_found(&e) {
                warn!(workload, error = %e, "failed to delete service");
            }
        }
        if let Err(e) = self.routes().delete(workload, &dp).await {
            if !is_not_found(&e) {
                warn!(workload, error = %e, "failed to delete virtual route");
            }
        }
        info!(workload, "teardown complete");
    }

    /// Observed readiness of the workload, aggregated across pod containers.
    pub async fn status(&self, workload: &str) -> Result<WorkloadStatus, Error> {
        let deployment = match self.deployments().get(workload).await {
            Ok(d) => d,
            Err(e) if is_not_found(&e) => {
                return Ok(WorkloadStatus {
                    phase: WorkloadPhase::NotFound,
                    replicas: 0,
                    pods: vec![],
                })
            }
            Err(e) => return Err(Error::DeploymentFailed(e.to_string())),
        };
        let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);

        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("app={workload}")))
            .await
            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;

        let mut reports = Vec::new();
        let mut statuses = Vec::new();
        for pod in pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let mut containers = Vec::new();
            for cs in pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .into_iter()
                .flatten()
            {
                let (status, reason, message) = container_state(cs);
                statuses.push(status);
                containers.push(ContainerReport {
                    container_name: cs.name.clone(),
                    image: cs.image.clone(),
                    status,
                    reason,
                    message,
                });
            }
            reports.push(PodReport {
                pod_name,
                containers,
            });
        }

        Ok(WorkloadStatus {
            phase: aggregate_phase(&statuses),
            replicas,
            pods: reports,
        })
    }

    /// Tail of every replica's log, prefixed per replica.
    pub async fn logs(&self, workload: &str, lines: i64) -> Result<String, Error> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("app={workload}")))
            .await
            .map_err(|e| Error::DeploymentFailed(e.to_string()))?;

        let params = LogParams {
            tail_lines: Some(lines),
            ..Default::default()
        };
        let mut aggregated = String::new();
        for (index, pod) in pods.iter().enumerate() {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let log = self
                .pods()
                .logs(pod_name, &params)
                .await
                .unwrap_or_else(|e| format!("<log fetch failed: {e}>"));
            for line in log.lines() {
                aggregated.push_str(&format!("replica-{} | {}\n", index + 1, line));
            }
        }
        Ok(aggregated)
    }

    /// Namespace secrets a user may reference, minus system types and the
    /// configured blocklist. Names are upper-cased for the env picker.
    pub async fn list_user_secrets(&self) -> Result<Vec<String>, Error> {
        let selector = self
            .settings
            .ignored_secret_types
            .iter()
            .map(|t| format!("type!={t}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.fields(&selector);
        }
        let secrets = self
            .secrets()
            .list(&params)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to list secrets: {e}")))?;
        let mut names: Vec<String> = secrets
            .iter()
            .filter_map(|s| s.metadata.name.clone())
            .map(|n| n.to_uppercase())
            .filter(|n| !self.settings.ignored_secrets.contains(n))
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn create_secret(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let secret: Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": slugify(name), "namespace": self.settings.namespace },
            "type": "Opaque",
            "stringData": data,
        }))?;
        self.secrets()
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to create secret {name}: {e}")))?;
        Ok(())
    }

    pub async fn delete_secret(&self, name: &str) -> Result<(), Error> {
        match self
            .secrets()
            .delete(&slugify(name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::Internal(anyhow::anyhow!(
                "Failed to delete secret {name}: {e}"
            ))),
        }
    }
}

/// Derive a container status string from its reported state.
pub fn container_state(cs: &ContainerStatus) -> (&'static str, Option<String>, Option<String>) {
    let Some(state) = &cs.state else {
        return ("unknown", None, None);
    };
    if state.running.is_some() {
        ("running", None, None)
    } else if let Some(waiting) = &state.waiting {
        if waiting.reason.as_deref() == Some("ContainerCreating") {
            ("in_progress", None, None)
        } else {
            ("error", waiting.reason.clone(), waiting.message.clone())
        }
    } else if let Some(terminated) = &state.terminated {
        (
            "terminated",
            terminated.reason.clone(),
            terminated.message.clone(),
        )
    } else {
        ("unknown", None, None)
    }
}

/// Aggregate container statuses into the workload phase: all running is
/// complete, any in-progress keeps polling, any error fails the rollout.
pub fn aggregate_phase(statuses: &[&'static str]) -> WorkloadPhase {
    if !statuses.is_empty() && statuses.iter().all(|s| *s == "running") {
        WorkloadPhase::Completed
    } else if statuses.iter().any(|s| *s == "in_progress") {
        WorkloadPhase::InProgress
    } else if statuses.iter().any(|s| *s == "error") {
        WorkloadPhase::Error
    } else {
        WorkloadPhase::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    };

    fn status_with(state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: "c".into(),
            image: "img".into(),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_state_derivation() {
        let running = status_with(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        });
        assert_eq!(container_state(&running).0, "running");

        let creating = status_with(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ContainerCreating".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(container_state(&creating).0, "in_progress");

        let crashed = status_with(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoopBackOff".into()),
                message: Some("back-off 5m".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let (status, reason, message) = container_state(&crashed);
        assert_eq!(status, "error");
        assert_eq!(reason.as_deref(), Some("CrashLoopBackOff"));
        assert_eq!(message.as_deref(), Some("back-off 5m"));

        let terminated = status_with(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some("OOMKilled".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(container_state(&terminated).0, "terminated");
    }

    #[test]
    fn test_phase_aggregation() {
        assert_eq!(
            aggregate_phase(&["running", "running"]),
            WorkloadPhase::Completed
        );
        assert_eq!(
            aggregate_phase(&["running", "in_progress"]),
            WorkloadPhase::InProgress
        );
        assert_eq!(
            aggregate_phase(&["running", "error"]),
            WorkloadPhase::Error
        );
        // In-progress wins over error: the rollout is still moving.
        assert_eq!(
            aggregate_phase(&["error", "in_progress"]),
            WorkloadPhase::InProgress
        );
        assert_eq!(aggregate_phase(&[]), WorkloadPhase::InProgress);
    }
}
