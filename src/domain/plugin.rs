//! The central PluginVersion entity and its value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sentinel returned in place of any secret value on read paths. A write that
/// submits this exact string means "keep the stored value"; the mask is never
/// persisted.
pub const SECRET_MASK: &str = "********************";

/// Label under which the final image reference is kept in `additional_fields`.
pub const IMAGE_FIELD_LABEL: &str = "Image";

/// Label under which an ML pipeline's run id is kept in `additional_fields`.
pub const RUN_FIELD_LABEL: &str = "Run ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Widget,
    Microservice,
    CustomApp,
    FormioComponent,
    Kubeflow,
    Protocol,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Widget => "widget",
            PluginType::Microservice => "microservice",
            PluginType::CustomApp => "custom_app",
            PluginType::FormioComponent => "formio_component",
            PluginType::Kubeflow => "kubeflow",
            PluginType::Protocol => "protocol",
        }
    }

    /// Types deployed as long-running workloads behind the gateway.
    pub fn is_workload(&self) -> bool {
        matches!(
            self,
            PluginType::Widget
                | PluginType::Microservice
                | PluginType::CustomApp
                | PluginType::FormioComponent
        )
    }

    /// Protocols and ML pipelines can never be started or stopped from the UI.
    pub fn start_stop_unsupported(&self) -> bool {
        matches!(self, PluginType::Kubeflow | PluginType::Protocol)
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationType {
    Git,
    ArchiveUpload,
    ImageUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Scanning,
    Deploying,
    Running,
    Stopped,
    Failed,
    /// Terminal state for portal (catalog-only) registrations: scans passed,
    /// image published, nothing applied to the orchestrator.
    ScanSucceeded,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Scanning => "scanning",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::ScanSucceeded => "scan_succeeded",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin version number. Decimal, compared and sorted numerically, but
/// rendered canonically (`1` renders as `1.0`) so blob keys, image tags and
/// store keys stay stable.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub f64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Version {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<f64>().map(Version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvVarKind {
    #[default]
    Plain,
    Secure,
    /// Resolved to an orchestrator secret reference at deploy time.
    SecretRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub kind: EnvVarKind,
}

impl EnvVar {
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        EnvVar {
            key: key.into(),
            value: value.into(),
            kind: EnvVarKind::Plain,
        }
    }

    /// Read-path representation: secure values are replaced by the mask.
    pub fn masked(&self) -> EnvVar {
        match self.kind {
            EnvVarKind::Secure => EnvVar {
                key: self.key.clone(),
                value: SECRET_MASK.to_string(),
                kind: self.kind,
            },
            _ => self.clone(),
        }
    }
}

/// Resource budget for the deployed workload. CPU in cores, memory in GiB;
/// rendering to orchestrator quantities happens at manifest-building time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default)]
    pub cpu_request: Option<f64>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub memory_request: Option<f64>,
    #[serde(default)]
    pub memory_limit: Option<f64>,
}

fn default_replicas() -> i32 {
    1
}

impl Default for ResourceBudget {
    fn default() -> Self {
        ResourceBudget {
            replicas: default_replicas(),
            cpu_request: None,
            cpu_limit: None,
            memory_request: None,
            memory_limit: None,
        }
    }
}

impl ResourceBudget {
    /// Fill derivable fields: a missing limit defaults to the request, a
    /// missing request (with a limit set) defaults to zero.
    pub fn normalized(&self) -> ResourceBudget {
        let mut out = self.clone();
        if out.cpu_limit.is_none() {
            out.cpu_limit = out.cpu_request;
        }
        if out.memory_limit.is_none() {
            out.memory_limit = out.memory_request;
        }
        if out.cpu_request.is_none() && out.cpu_limit.is_some() {
            out.cpu_request = Some(0.0);
        }
        if out.memory_request.is_none() && out.memory_limit.is_some() {
            out.memory_request = Some(0.0);
        }
        out
    }
}

/// Tri-state scan verdicts: absent = not run, true = passed, false = failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScanChecks {
    #[serde(default)]
    pub antivirus: Option<bool>,
    #[serde(default)]
    pub sast: Option<bool>,
    #[serde(default)]
    pub vulnerability: Option<bool>,
}

impl ScanChecks {
    pub fn any_failed(&self) -> bool {
        self.antivirus == Some(false)
            || self.sast == Some(false)
            || self.vulnerability == Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub label: String,
    pub value: String,
}

/// Exactly one source locator per version, discriminated by the registration
/// type the request carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "registration_type", rename_all = "snake_case")]
pub enum Source {
    Git {
        /// Reference to a stored GitCredential; inline fields are the fallback.
        #[serde(default)]
        target_ref: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        access_token: Option<String>,
        /// Repository path appended to the credential's base URL.
        #[serde(default)]
        repository: Option<String>,
        branch: String,
    },
    ArchiveUpload {
        #[serde(default)]
        blob_key: Option<String>,
    },
    ImageUpload {
        #[serde(default)]
        blob_key: Option<String>,
    },
}

impl Source {
    pub fn registration_type(&self) -> RegistrationType {
        match self {
            Source::Git { .. } => RegistrationType::Git,
            Source::ArchiveUpload { .. } => RegistrationType::ArchiveUpload,
            Source::ImageUpload { .. } => RegistrationType::ImageUpload,
        }
    }

    pub fn blob_key(&self) -> Option<&str> {
        match self {
            Source::ArchiveUpload { blob_key } | Source::ImageUpload { blob_key } => {
                blob_key.as_deref()
            }
            Source::Git { .. } => None,
        }
    }

    pub fn set_blob_key(&mut self, key: String) {
        if let Source::ArchiveUpload { blob_key } | Source::ImageUpload { blob_key } = self {
            *blob_key = Some(key);
        }
    }

    /// Read-path representation: the inline access token is masked.
    pub fn masked(&self) -> Source {
        match self {
            Source::Git {
                target_ref,
                url,
                username,
                access_token,
                repository,
                branch,
            } => Source::Git {
                target_ref: target_ref.clone(),
                url: url.clone(),
                username: username.clone(),
                access_token: access_token.as_ref().map(|_| SECRET_MASK.to_string()),
                repository: repository.clone(),
                branch: branch.clone(),
            },
            other => other.clone(),
        }
    }
}

/// The central entity: one immutable revision of a plugin, plus the mutable
/// lifecycle state the pipeline and follower write as they progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginVersion {
    pub plugin_id: String,
    pub version: Version,
    /// The version designated as current for this plugin id, if any.
    #[serde(default)]
    pub current_version: Option<Version>,
    pub name: String,
    pub plugin_type: PluginType,
    #[serde(flatten)]
    pub source: Source,
    pub project_id: String,
    #[serde(default)]
    pub information: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub industry: Vec<String>,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: ResourceBudget,
    /// Catalog-only registration: scans and publish run, orchestrator apply
    /// is skipped and the terminal state is `scan_succeeded`.
    #[serde(default)]
    pub portal: bool,
    #[serde(default)]
    pub deployment_status: DeploymentStatus,
    #[serde(default)]
    pub scan_checks: ScanChecks,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub deployed_by: Option<String>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub proxy_path: Option<String>,
    #[serde(default)]
    pub additional_fields: Vec<AdditionalField>,
}

fn default_container_port() -> u16 {
    80
}

impl PluginVersion {
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Workload object name, used as the `app` label everywhere.
    pub fn workload_name(&self) -> String {
        format!("{}-{}", self.slug(), slugify(&self.plugin_id))
    }

    /// Gateway prefix that routes external traffic to this plugin.
    pub fn derived_proxy_path(&self) -> String {
        format!(
            "/gateway/plugin/{}/{}/api/",
            slugify(&self.project_id),
            self.slug()
        )
    }

    /// Canonical image tag: `{registry}/{nameSlug}-{type}:{version}`.
    pub fn image_tag(&self, registry: &str) -> String {
        format!(
            "{}/{}-{}:{}",
            registry.trim_end_matches('/'),
            self.slug(),
            slugify(self.plugin_type.as_str()),
            self.version
        )
    }

    pub fn field(&self, label: &str) -> Option<&str> {
        self.additional_fields
            .iter()
            .find(|f| f.label == label)
            .map(|f| f.value.as_str())
    }

    pub fn set_field(&mut self, label: &str, value: &str) {
        match self.additional_fields.iter_mut().find(|f| f.label == label) {
            Some(field) => field.value = value.to_string(),
            None => self.additional_fields.push(AdditionalField {
                label: label.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn image(&self) -> Option<&str> {
        self.field(IMAGE_FIELD_LABEL)
    }

    pub fn record_image(&mut self, image: &str) {
        self.set_field(IMAGE_FIELD_LABEL, image);
    }

    /// Read-path representation: every secret is masked.
    pub fn masked(&self) -> PluginVersion {
        let mut out = self.clone();
        out.source = self.source.masked();
        out.env = self.env.iter().map(EnvVar::masked).collect();
        out
    }
}

/// Lowercase and map whitespace and underscores to dashes. Used for workload
/// names, image tags and proxy paths alike.
pub fn slugify(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '_' {
                '-'
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget(name: &str) -> PluginVersion {
        PluginVersion {
            plugin_id: "p1".into(),
            version: Version(1.0),
            current_version: None,
            name: name.into(),
            plugin_type: PluginType::Widget,
            source: Source::Git {
                target_ref: None,
                url: Some("https://github.com/acme/wx".into()),
                username: Some("acme".into()),
                access_token: Some("tok".into()),
                repository: None,
                branch: "main".into(),
            },
            project_id: "proj1".into(),
            information: BTreeMap::new(),
            industry: vec![],
            container_port: 80,
            env: vec![],
            resources: ResourceBudget::default(),
            portal: false,
            deployment_status: DeploymentStatus::Pending,
            scan_checks: ScanChecks::default(),
            errors: vec![],
            deployed_by: None,
            deployed_at: None,
            proxy_path: None,
            additional_fields: vec![],
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My_Widget Name"), "my-widget-name");
        assert_eq!(slugify("wx"), "wx");
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version(1.0).to_string(), "1.0");
        assert_eq!(Version(2.0).to_string(), "2.0");
        assert_eq!(Version(1.25).to_string(), "1.25");
        assert_eq!("1.5".parse::<Version>().unwrap(), Version(1.5));
    }

    #[test]
    fn test_proxy_path_derivation() {
        let v = widget("wx");
        assert_eq!(v.derived_proxy_path(), "/gateway/plugin/proj1/wx/api/");
        let v = widget("My_Widget");
        assert_eq!(
            v.derived_proxy_path(),
            "/gateway/plugin/proj1/my-widget/api/"
        );
    }

    #[test]
    fn test_canonical_image_tag() {
        let v = widget("wx");
        assert_eq!(v.image_tag("registry"), "registry/wx-widget:1.0");
        assert_eq!(v.image_tag("registry/"), "registry/wx-widget:1.0");
    }

    #[test]
    fn test_record_image_is_idempotent() {
        let mut v = widget("wx");
        v.record_image("registry/wx-widget:1.0");
        v.record_image("registry/wx-widget:2.0");
        assert_eq!(v.image(), Some("registry/wx-widget:2.0"));
        assert_eq!(v.additional_fields.len(), 1);
    }

    #[test]
    fn test_masked_hides_secrets() {
        let mut v = widget("wx");
        v.env = vec![
            EnvVar::plain("PORT", "80"),
            EnvVar {
                key: "API_KEY".into(),
                value: "hunter2".into(),
                kind: EnvVarKind::Secure,
            },
        ];
        let masked = v.masked();
        assert_eq!(masked.env[0].value, "80");
        assert_eq!(masked.env[1].value, SECRET_MASK);
        match masked.source {
            Source::Git { access_token, .. } => {
                assert_eq!(access_token.as_deref(), Some(SECRET_MASK))
            }
            _ => panic!("expected git source"),
        }
    }

    #[test]
    fn test_budget_normalization() {
        let budget = ResourceBudget {
            replicas: 2,
            cpu_request: Some(0.5),
            cpu_limit: None,
            memory_request: None,
            memory_limit: Some(2.0),
        };
        let norm = budget.normalized();
        assert_eq!(norm.cpu_limit, Some(0.5));
        assert_eq!(norm.memory_request, Some(0.0));
    }

    #[test]
    fn test_source_registration_type_round_trip() {
        let v = widget("wx");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["registration_type"], "git");
        let back: PluginVersion = serde_json::from_value(json).unwrap();
        assert_eq!(back.source.registration_type(), RegistrationType::Git);
    }
}
