//! Environment-backed configuration for plugin-pilot
//!
//! Every section is a serde struct with explicit defaults and a `validate()`
//! method so a bad deployment fails at startup, not mid-pipeline. Values come
//! from the process environment; the CLI can override the service section.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::ResourceBudget;
use crate::error::Error;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
    /// Project scope used in proxy paths when a request does not carry one.
    pub project_id: String,
    /// Base URL of the shared gateway, used by post-deploy hooks.
    pub home_link: Option<String>,
    /// Metadata store directory.
    pub data_dir: PathBuf,
    /// Root for per-pipeline working trees.
    pub work_root: PathBuf,
    /// Directory for prepared artifact-download bundles.
    pub bundle_dir: PathBuf,
}

impl ServiceSettings {
    fn from_env() -> Self {
        ServiceSettings {
            host: env_or("SERVICE_HOST", "0.0.0.0"),
            port: env_parse("SERVICE_PORT", 6789),
            project_id: env_or("PROJECT_ID", "default"),
            home_link: env_opt("HOME_LINK"),
            data_dir: PathBuf::from(env_or("DATA_DIR", "/code/data/plugin-pilot")),
            work_root: PathBuf::from(env_or("WORK_ROOT", "/code/temp/code_store")),
            bundle_dir: PathBuf::from(env_or("BUNDLE_DIR", "/code/data/plugin-artifacts")),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("SERVICE_PORT cannot be 0");
        }
        Ok(())
    }
}

// =============================================================================
// Container registry
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Extra build args handed to every image build, JSON object in the env.
    pub build_args: BTreeMap<String, String>,
}

impl RegistrySettings {
    fn from_env() -> Self {
        let build_args = env_opt("REGISTRY_BUILD_ARGS")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        RegistrySettings {
            url: env_or("REGISTRY_URL", ""),
            username: env_or("REGISTRY_USERNAME", ""),
            password: env_or("REGISTRY_PASSWORD", ""),
            build_args,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            anyhow::bail!("REGISTRY_URL is required");
        }
        Ok(())
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub namespace: String,
    pub image_pull_secret: String,
    /// Gateway object VirtualRoutes are bound to.
    pub gateway: String,
    /// Shared data volume mounted into every plugin container.
    pub shared_volume: String,
    pub shared_mount_path: String,
    /// Secret types never surfaced to users.
    pub ignored_secret_types: Vec<String>,
    /// Individual system secrets excluded from listings.
    pub ignored_secrets: Vec<String>,
}

impl OrchestratorSettings {
    fn from_env() -> Self {
        OrchestratorSettings {
            namespace: env_or("ORCHESTRATOR_NAMESPACE", "plugins"),
            image_pull_secret: env_or("IMAGE_PULL_SECRET", "registry-credentials"),
            gateway: env_or("ISTIO_GATEWAY", "istio-system/gateway"),
            shared_volume: env_or("SHARED_VOLUME", "core-volumes"),
            shared_mount_path: env_or("SHARED_MOUNT_PATH", "/code/data"),
            ignored_secret_types: vec![
                "kubernetes.io/service-account-token".to_string(),
                "kubernetes.io/dockerconfigjson".to_string(),
                "kubernetes.io/tls".to_string(),
                "helm.sh/release.v1".to_string(),
            ],
            ignored_secrets: env_opt("IGNORED_SECRETS")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        }
    }
}

// =============================================================================
// Scanners
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    pub antivirus_enabled: bool,
    pub sast_enabled: bool,
    pub vulnerability_enabled: bool,
    /// Severities the image scan reports on, comma separated.
    pub vulnerability_severity: String,
    pub antivirus_image: String,
    pub sast_scanner_image: String,
    pub vulnerability_image: String,
    pub sast_url: Option<String>,
    pub sast_token: Option<String>,
    pub code_smell_threshold: u64,
    pub bug_threshold: u64,
    pub vulnerability_threshold: u64,
    pub sast_severities: String,
    pub scan_timeout_secs: u64,
}

impl ScanSettings {
    fn from_env() -> Self {
        ScanSettings {
            antivirus_enabled: env_bool("AV_SCAN_ENABLED", true),
            sast_enabled: env_bool("SAST_ENABLED", true),
            vulnerability_enabled: env_bool("VULN_SCAN_ENABLED", true),
            vulnerability_severity: env_or("VULN_SCAN_SEVERITY", "CRITICAL,HIGH"),
            antivirus_image: env_or("AV_SCANNER_IMAGE", "clamav/clamav:1.2"),
            sast_scanner_image: env_or("SAST_SCANNER_IMAGE", "sonarsource/sonar-scanner-cli:5"),
            vulnerability_image: env_or("VULN_SCANNER_IMAGE", "aquasec/trivy:0.44.1"),
            sast_url: env_opt("SAST_URL"),
            sast_token: env_opt("SAST_TOKEN"),
            code_smell_threshold: env_parse("SAST_CODE_SMELL_THRESHOLD", 100),
            bug_threshold: env_parse("SAST_BUG_THRESHOLD", 0),
            vulnerability_threshold: env_parse("SAST_VULNERABILITY_THRESHOLD", 0),
            sast_severities: env_or("SAST_SEVERITIES", "MAJOR,CRITICAL,BLOCKER"),
            scan_timeout_secs: env_parse("SCAN_TIMEOUT_SECS", 600),
        }
    }
}

// =============================================================================
// Signing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningSettings {
    pub enabled: bool,
    pub key_path: String,
    pub public_key_path: String,
    pub password: Option<String>,
    pub allow_insecure_registry: bool,
    pub allow_http_registry: bool,
}

impl SigningSettings {
    fn from_env() -> Self {
        SigningSettings {
            enabled: env_bool("SIGNING_ENABLED", true),
            key_path: env_or("SIGNING_KEY_PATH", "/code/cosign/cosign.key"),
            public_key_path: env_or("SIGNING_PUB_PATH", "/code/cosign/cosign.pub"),
            password: env_opt("COSIGN_PASSWORD"),
            allow_insecure_registry: env_bool("ALLOW_INSECURE_REGISTRY", false),
            allow_http_registry: env_bool("ALLOW_HTTP_REGISTRY", false),
        }
    }
}

// =============================================================================
// Artifact store
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStoreSettings {
    pub endpoint: String,
    pub bucket: String,
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl ArtifactStoreSettings {
    fn from_env() -> Self {
        ArtifactStoreSettings {
            endpoint: env_or("ARTIFACT_STORE_ENDPOINT", "http://artifact-store:9000"),
            bucket: env_or("ARTIFACT_STORE_BUCKET", "plugins"),
            token: env_opt("ARTIFACT_STORE_TOKEN"),
            request_timeout_secs: env_parse("ARTIFACT_STORE_TIMEOUT_SECS", 300),
        }
    }
}

// =============================================================================
// ML pipelines
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlPipelineSettings {
    pub url: Option<String>,
    pub multi_user: bool,
    pub image_pull_secret: String,
}

impl MlPipelineSettings {
    fn from_env() -> Self {
        MlPipelineSettings {
            url: env_opt("KUBEFLOW_URL"),
            multi_user: env_bool("KUBEFLOW_MULTI_USER", false),
            image_pull_secret: env_or("KUBEFLOW_IMAGE_PULL_SECRET", "registry-credentials"),
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    /// Platform notification endpoint. Absent means notifications are dropped.
    pub endpoint: Option<String>,
}

impl NotifierSettings {
    fn from_env() -> Self {
        NotifierSettings {
            endpoint: env_opt("NOTIFICATION_URL"),
        }
    }
}

// =============================================================================
// Resource ranges
// =============================================================================

/// Configured bounds every resource budget must fall inside. CPU in cores,
/// memory in GiB, replicas as a plain count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRanges {
    pub cpu_min: f64,
    pub cpu_max: f64,
    pub memory_min: f64,
    pub memory_max: f64,
    pub replicas_min: i32,
    pub replicas_max: i32,
}

impl ResourceRanges {
    fn from_env() -> Self {
        ResourceRanges {
            cpu_min: env_parse("CPU_LOWER_BOUND", 0.0),
            cpu_max: env_parse("CPU_UPPER_BOUND", 8.0),
            memory_min: env_parse("MEMORY_LOWER_BOUND", 0.0),
            memory_max: env_parse("MEMORY_UPPER_BOUND", 16.0),
            replicas_min: env_parse("REPLICA_LOWER_BOUND", 0),
            replicas_max: env_parse("REPLICA_UPPER_BOUND", 5),
        }
    }

    /// Reject budgets outside the configured ranges or with request > limit.
    pub fn check(&self, budget: &ResourceBudget) -> Result<(), Error> {
        if budget.replicas < self.replicas_min || budget.replicas > self.replicas_max {
            return Err(Error::BadRequest(format!(
                "replicas must be within {}..={}",
                self.replicas_min, self.replicas_max
            )));
        }
        for (label, value) in [
            ("cpu_request", budget.cpu_request),
            ("cpu_limit", budget.cpu_limit),
        ]
        .into_iter()
        .flat_map(|(l, v)| v.map(|v| (l, v)))
        {
            if value < self.cpu_min || value > self.cpu_max {
                return Err(Error::BadRequest(format!(
                    "{label} must be within {}..={} cores",
                    self.cpu_min, self.cpu_max
                )));
            }
        }
        for (label, value) in [
            ("memory_request", budget.memory_request),
            ("memory_limit", budget.memory_limit),
        ]
        .into_iter()
        .flat_map(|(l, v)| v.map(|v| (l, v)))
        {
            if value < self.memory_min || value > self.memory_max {
                return Err(Error::BadRequest(format!(
                    "{label} must be within {}..={} GiB",
                    self.memory_min, self.memory_max
                )));
            }
        }
        if let (Some(req), Some(limit)) = (budget.cpu_request, budget.cpu_limit) {
            if req > limit {
                return Err(Error::BadRequest(
                    "cpu_request must not exceed cpu_limit".to_string(),
                ));
            }
        }
        if let (Some(req), Some(limit)) = (budget.memory_request, budget.memory_limit) {
            if req > limit {
                return Err(Error::BadRequest(
                    "memory_request must not exceed memory_limit".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Timeouts & flags
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub fetch_secs: u64,
    pub push_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_initial_delay_secs: u64,
}

impl TimeoutSettings {
    fn from_env() -> Self {
        TimeoutSettings {
            fetch_secs: env_parse("FETCH_TIMEOUT_SECS", 300),
            push_secs: env_parse("PUSH_TIMEOUT_SECS", 600),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", 3),
            poll_initial_delay_secs: env_parse("POLL_INITIAL_DELAY_SECS", 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub download_enabled: bool,
}

impl FeatureFlags {
    fn from_env() -> Self {
        FeatureFlags {
            download_enabled: env_bool("DOWNLOAD_ENABLED", false),
        }
    }
}

// =============================================================================
// Aggregate
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub service: ServiceSettings,
    pub registry: RegistrySettings,
    pub orchestrator: OrchestratorSettings,
    pub scan: ScanSettings,
    pub signing: SigningSettings,
    pub artifact_store: ArtifactStoreSettings,
    pub ml_pipelines: MlPipelineSettings,
    pub notifier: NotifierSettings,
    pub resource_ranges: ResourceRanges,
    pub timeouts: TimeoutSettings,
    pub features: FeatureFlags,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            service: ServiceSettings::from_env(),
            registry: RegistrySettings::from_env(),
            orchestrator: OrchestratorSettings::from_env(),
            scan: ScanSettings::from_env(),
            signing: SigningSettings::from_env(),
            artifact_store: ArtifactStoreSettings::from_env(),
            ml_pipelines: MlPipelineSettings::from_env(),
            notifier: NotifierSettings::from_env(),
            resource_ranges: ResourceRanges::from_env(),
            timeouts: TimeoutSettings::from_env(),
            features: FeatureFlags::from_env(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.registry.validate()?;
        if self.resource_ranges.cpu_min > self.resource_ranges.cpu_max {
            anyhow::bail!("CPU_LOWER_BOUND exceeds CPU_UPPER_BOUND");
        }
        if self.resource_ranges.memory_min > self.resource_ranges.memory_max {
            anyhow::bail!("MEMORY_LOWER_BOUND exceeds MEMORY_UPPER_BOUND");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges() -> ResourceRanges {
        ResourceRanges {
            cpu_min: 0.0,
            cpu_max: 8.0,
            memory_min: 0.0,
            memory_max: 16.0,
            replicas_min: 0,
            replicas_max: 5,
        }
    }

    #[test]
    fn test_budget_at_bounds_passes() {
        let budget = ResourceBudget {
            replicas: 5,
            cpu_request: Some(0.0),
            cpu_limit: Some(8.0),
            memory_request: Some(0.0),
            memory_limit: Some(16.0),
        };
        assert!(ranges().check(&budget).is_ok());
    }

    #[test]
    fn test_budget_outside_bounds_fails() {
        let budget = ResourceBudget {
            replicas: 6,
            ..Default::default()
        };
        assert!(matches!(
            ranges().check(&budget),
            Err(Error::BadRequest(_))
        ));

        let budget = ResourceBudget {
            replicas: 1,
            cpu_limit: Some(8.5),
            ..Default::default()
        };
        assert!(ranges().check(&budget).is_err());
    }

    #[test]
    fn test_request_above_limit_fails() {
        let budget = ResourceBudget {
            replicas: 1,
            memory_request: Some(4.0),
            memory_limit: Some(2.0),
            ..Default::default()
        };
        assert!(ranges().check(&budget).is_err());
    }
}
