//! Manifest builders for the three objects every plugin owns: Deployment,
//! Service and VirtualRoute. Pure functions over the version record so the
//! shapes can be tested without a cluster.

use serde_json::{json, Value};

use crate::config::OrchestratorSettings;
use crate::domain::{slugify, EnvVar, EnvVarKind, PluginVersion, ResourceBudget};

/// Render a CPU quantity in cores.
pub fn cpu_quantity(cores: f64) -> String {
    if cores.fract() == 0.0 {
        format!("{}", cores as i64)
    } else {
        format!("{cores}")
    }
}

/// Render a memory quantity, GiB in, Mi out.
pub fn memory_quantity(gib: f64) -> String {
    format!("{}Mi", (gib * 1024.0).round() as i64)
}

/// Requests/limits block from a budget; absent fields are filled by
/// normalization (limit <- request, request <- 0).
pub fn resources_json(budget: &ResourceBudget) -> Value {
    let budget = budget.normalized();
    let mut requests = serde_json::Map::new();
    let mut limits = serde_json::Map::new();
    if let Some(cpu) = budget.cpu_request {
        requests.insert("cpu".into(), Value::String(cpu_quantity(cpu)));
    }
    if let Some(cpu) = budget.cpu_limit {
        limits.insert("cpu".into(), Value::String(cpu_quantity(cpu)));
    }
    if let Some(mem) = budget.memory_request {
        requests.insert("memory".into(), Value::String(memory_quantity(mem)));
    }
    if let Some(mem) = budget.memory_limit {
        limits.insert("memory".into(), Value::String(memory_quantity(mem)));
    }
    json!({ "requests": requests, "limits": limits })
}

/// Container env from the version's list. `secret_ref` entries resolve to
/// orchestrator secret references by name; a PORT entry is guaranteed and the
/// gateway prefix is always injected as PROXY.
pub fn build_env(env: &[EnvVar], proxy_path: &str, container_port: u16) -> Vec<Value> {
    let mut out = Vec::new();
    for entry in env {
        match entry.kind {
            EnvVarKind::SecretRef => out.push(json!({
                "name": entry.key,
                "valueFrom": {
                    "secretKeyRef": {
                        "name": slugify(&entry.key),
                        "key": entry.value.to_uppercase().replace('-', "_"),
                    }
                }
            })),
            EnvVarKind::Plain | EnvVarKind::Secure => out.push(json!({
                "name": entry.key,
                "value": entry.value,
            })),
        }
    }
    if !env.iter().any(|e| e.key.eq_ignore_ascii_case("port")) {
        out.push(json!({ "name": "PORT", "value": container_port.to_string() }));
    }
    out.push(json!({
        "name": "PROXY",
        "value": proxy_path.trim_end_matches('/'),
    }));
    out
}

/// The container block shared by create and patch paths.
pub fn container_json(
    version: &PluginVersion,
    image: &str,
    settings: &OrchestratorSettings,
) -> Value {
    let name = version.workload_name();
    json!({
        "name": name,
        "image": image,
        "imagePullPolicy": "Always",
        "ports": [{ "containerPort": version.container_port }],
        "env": build_env(&version.env, &version.derived_proxy_path(), version.container_port),
        "resources": resources_json(&version.resources),
        "volumeMounts": [{
            "name": settings.shared_volume,
            "mountPath": settings.shared_mount_path,
            "subPath": settings.shared_volume,
        }],
    })
}

pub fn deployment_manifest(
    version: &PluginVersion,
    image: &str,
    settings: &OrchestratorSettings,
    deployed_at_millis: i64,
) -> Value {
    let name = version.workload_name();
    let labels = json!({ "app": name });
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": settings.namespace, "labels": labels },
        "spec": {
            "replicas": version.resources.replicas,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": {
                    "labels": labels,
                    "annotations": { "deployed.timestamp": deployed_at_millis.to_string() },
                },
                "spec": {
                    "containers": [container_json(version, image, settings)],
                    "imagePullSecrets": [{ "name": settings.image_pull_secret }],
                    "volumes": [{
                        "name": settings.shared_volume,
                        "persistentVolumeClaim": { "claimName": settings.shared_volume },
                    }],
                },
            },
        },
    })
}

/// Patch applied when the deployment already exists: image, env, resources,
/// replicas and a fresh rollout annotation so an unchanged tag still rolls.
pub fn deployment_patch(
    version: &PluginVersion,
    image: &str,
    settings: &OrchestratorSettings,
    deployed_at_millis: i64,
) -> Value {
    json!({
        "spec": {
            "replicas": version.resources.replicas,
            "template": {
                "metadata": {
                    "annotations": { "deployed.timestamp": deployed_at_millis.to_string() },
                },
                "spec": {
                    "containers": [container_json(version, image, settings)],
                },
            },
        },
    })
}

pub fn service_manifest(version: &PluginVersion, settings: &OrchestratorSettings) -> Value {
    let name = version.workload_name();
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": settings.namespace },
        "spec": {
            "selector": { "app": name },
            "ports": [{
                "protocol": "TCP",
                "port": version.container_port,
                "targetPort": version.container_port,
            }],
        },
    })
}

pub fn service_host(workload: &str, namespace: &str) -> String {
    format!("{workload}.{namespace}.svc.cluster.local")
}

/// VirtualRoute: bind the gateway prefix to the Service, rewriting to `/`.
pub fn virtual_route_manifest(version: &PluginVersion, settings: &OrchestratorSettings) -> Value {
    let name = version.workload_name();
    json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": "VirtualService",
        "metadata": { "name": name, "namespace": settings.namespace },
        "spec": {
            "gateways": [settings.gateway],
            "hosts": ["*"],
            "http": [{
                "match": [{ "uri": { "prefix": version.derived_proxy_path() } }],
                "rewrite": { "uri": "/" },
                "route": [{
                    "destination": {
                        "host": service_host(&name, &settings.namespace),
                        "port": { "number": version.container_port },
                    }
                }],
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DeploymentStatus, PluginType, ScanChecks, Source, Version,
    };
    use std::collections::BTreeMap;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            namespace: "plugins".into(),
            image_pull_secret: "registry-credentials".into(),
            gateway: "istio-system/gateway".into(),
            shared_volume: "core-volumes".into(),
            shared_mount_path: "/code/data".into(),
            ignored_secret_types: vec![],
            ignored_secrets: vec![],
        }
    }

    fn version() -> PluginVersion {
        PluginVersion {
            plugin_id: "p1".into(),
            version: Version(1.0),
            current_version: None,
            name: "wx".into(),
            plugin_type: PluginType::Widget,
            source: Source::ArchiveUpload { blob_key: None },
            project_id: "proj1".into(),
            information: BTreeMap::new(),
            industry: vec![],
            container_port: 8080,
            env: vec![
                EnvVar::plain("MODE", "prod"),
                EnvVar {
                    key: "DB_PASSWORD".into(),
                    value: "db-password".into(),
                    kind: EnvVarKind::SecretRef,
                },
            ],
            resources: ResourceBudget {
                replicas: 3,
                cpu_request: Some(0.5),
                cpu_limit: None,
                memory_request: Some(1.0),
                memory_limit: Some(2.0),
            },
            portal: false,
            deployment_status: DeploymentStatus::Deploying,
            scan_checks: ScanChecks::default(),
            errors: vec![],
            deployed_by: None,
            deployed_at: None,
            proxy_path: None,
            additional_fields: vec![],
        }
    }

    #[test]
    fn test_quantities() {
        assert_eq!(cpu_quantity(0.5), "0.5");
        assert_eq!(cpu_quantity(2.0), "2");
        assert_eq!(memory_quantity(1.0), "1024Mi");
        assert_eq!(memory_quantity(0.5), "512Mi");
    }

    #[test]
    fn test_env_resolution() {
        let env = build_env(&version().env, "/gateway/plugin/proj1/wx/api/", 8080);
        assert_eq!(env[0]["name"], "MODE");
        assert_eq!(env[0]["value"], "prod");
        assert_eq!(
            env[1]["valueFrom"]["secretKeyRef"]["name"],
            "db-password"
        );
        assert_eq!(env[1]["valueFrom"]["secretKeyRef"]["key"], "DB_PASSWORD");
        // PORT synthesized, PROXY appended without the trailing slash.
        assert_eq!(env[2]["name"], "PORT");
        assert_eq!(env[2]["value"], "8080");
        assert_eq!(env[3]["name"], "PROXY");
        assert_eq!(env[3]["value"], "/gateway/plugin/proj1/wx/api");
    }

    #[test]
    fn test_port_not_duplicated() {
        let env = vec![EnvVar::plain("PORT", "9000")];
        let built = build_env(&env, "/gateway/plugin/proj1/wx/api/", 8080);
        let ports: Vec<_> = built.iter().filter(|e| e["name"] == "PORT").collect();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0]["value"], "9000");
    }

    #[test]
    fn test_deployment_manifest_shape() {
        let manifest = deployment_manifest(&version(), "registry/wx-widget:1.0", &settings(), 1234);
        assert_eq!(manifest["metadata"]["name"], "wx-p1");
        assert_eq!(manifest["spec"]["replicas"], 3);
        let template = &manifest["spec"]["template"];
        assert_eq!(
            template["metadata"]["annotations"]["deployed.timestamp"],
            "1234"
        );
        let container = &template["spec"]["containers"][0];
        assert_eq!(container["image"], "registry/wx-widget:1.0");
        assert_eq!(container["imagePullPolicy"], "Always");
        assert_eq!(container["resources"]["requests"]["cpu"], "0.5");
        // Missing cpu limit defaults to the request.
        assert_eq!(container["resources"]["limits"]["cpu"], "0.5");
        assert_eq!(container["resources"]["limits"]["memory"], "2048Mi");

        // The manifest deserializes into the typed API object.
        let typed: k8s_openapi::api::apps::v1::Deployment =
            serde_json::from_value(manifest).unwrap();
        assert_eq!(typed.metadata.name.as_deref(), Some("wx-p1"));
    }

    #[test]
    fn test_service_and_route_manifests() {
        let svc = service_manifest(&version(), &settings());
        assert_eq!(svc["spec"]["selector"]["app"], "wx-p1");
        assert_eq!(svc["spec"]["ports"][0]["port"], 8080);
        let typed: k8s_openapi::api::core::v1::Service = serde_json::from_value(svc).unwrap();
        assert_eq!(typed.metadata.name.as_deref(), Some("wx-p1"));

        let route = virtual_route_manifest(&version(), &settings());
        assert_eq!(
            route["spec"]["http"][0]["match"][0]["uri"]["prefix"],
            "/gateway/plugin/proj1/wx/api/"
        );
        assert_eq!(route["spec"]["http"][0]["rewrite"]["uri"], "/");
        assert_eq!(
            route["spec"]["http"][0]["route"][0]["destination"]["host"],
            "wx-p1.plugins.svc.cluster.local"
        );
    }
}
