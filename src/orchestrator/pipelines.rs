//! ML pipeline deployment for `kubeflow`-type plugins.
//!
//! Talks to the pipeline platform's REST API: upload the spec (as a new
//! version when the pipeline already exists), ensure the experiment, then
//! start either a recurring run bound to exactly one of cron/interval or a
//! single run. Executor images inside the spec are rewritten to the canonical
//! tag before upload.

use reqwest::multipart::{Form, Part};
use serde::de::Deserialize as _;
use serde_json::{json, Value};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::config::MlPipelineSettings;
use crate::domain::{slugify, EnvVar, EnvVarKind};
use crate::error::Error;

pub const PIPELINE_SPEC_FILENAME: &str = "pipeline.yml";

/// Env keys that control scheduling instead of parameterizing the pipeline.
const CONTROL_KEYS: [&str; 3] = ["RECURRING_RUN", "CRON_EXPRESSION", "INTERVAL_SECONDS"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(String),
    IntervalSeconds(u64),
}

/// Derive the run schedule from the version's plain env entries. A recurring
/// run needs exactly one of cron expression / interval seconds.
pub fn schedule_from_env(env: &[EnvVar]) -> Result<Option<Schedule>, Error> {
    let lookup = |key: &str| {
        env.iter()
            .find(|e| e.kind == EnvVarKind::Plain && e.key == key)
            .map(|e| e.value.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let recurring = lookup("RECURRING_RUN")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false);
    if !recurring {
        return Ok(None);
    }
    let cron = lookup("CRON_EXPRESSION");
    let interval = lookup("INTERVAL_SECONDS");
    match (cron, interval) {
        (Some(_), Some(_)) => Err(Error::BadSchedule(
            "Set either CRON_EXPRESSION or INTERVAL_SECONDS for a recurring run, not both"
                .to_string(),
        )),
        (Some(cron), None) => Ok(Some(Schedule::Cron(cron))),
        (None, Some(interval)) => interval
            .parse()
            .map(|secs| Some(Schedule::IntervalSeconds(secs)))
            .map_err(|_| Error::BadSchedule(format!("INTERVAL_SECONDS is not a number: {interval}"))),
        (None, None) => Err(Error::BadSchedule(
            "A recurring run needs a CRON_EXPRESSION or INTERVAL_SECONDS".to_string(),
        )),
    }
}

/// Pipeline parameters: every plain env entry except the schedule controls,
/// merged over overrides declared in the spec bundle's `variables.yml`.
pub fn pipeline_params(
    env: &[EnvVar],
    variable_overrides: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut params = variable_overrides;
    for entry in env {
        if entry.kind == EnvVarKind::Plain && !CONTROL_KEYS.contains(&entry.key.as_str()) {
            params.insert(entry.key.clone(), entry.value.clone());
        }
    }
    params
}

/// Parse a multi-document YAML file.
pub fn read_documents(raw: &str) -> Result<Vec<YamlValue>, Error> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(raw) {
        docs.push(
            YamlValue::deserialize(document)
                .map_err(|e| Error::PipelineConfigMissing(format!("Malformed pipeline spec: {e}")))?,
        );
    }
    Ok(docs)
}

pub fn write_documents(docs: &[YamlValue]) -> Result<String, Error> {
    let mut out = String::new();
    for (index, doc) in docs.iter().enumerate() {
        if index > 0 {
            out.push_str("---\n");
        }
        out.push_str(
            &serde_yaml::to_string(doc)
                .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to render spec: {e}")))?,
        );
    }
    Ok(out)
}

/// Rewrite every executor's container image to the canonical tag.
pub fn rewrite_executor_images(docs: &mut [YamlValue], image: &str) {
    for doc in docs.iter_mut() {
        let Some(executors) = doc
            .get_mut("deploymentSpec")
            .and_then(|d| d.get_mut("executors"))
            .and_then(YamlValue::as_mapping_mut)
        else {
            continue;
        };
        for (_, executor) in executors.iter_mut() {
            if let Some(container_image) = executor
                .get_mut("container")
                .and_then(|c| c.get_mut("image"))
            {
                *container_image = YamlValue::String(image.to_string());
            }
        }
    }
}

/// Inject the image-pull secret into each executor's platform config,
/// creating the platforms section when the spec has none.
pub fn inject_image_pull_secret(docs: &mut Vec<YamlValue>, secret: &str) {
    let mut secret_map = serde_yaml::Mapping::new();
    secret_map.insert(
        YamlValue::String("secretName".to_string()),
        YamlValue::String(secret.to_string()),
    );
    let secret_entry = YamlValue::Sequence(vec![YamlValue::Mapping(secret_map)]);

    let mut injected = false;
    for doc in docs.iter_mut() {
        let Some(executors) = doc
            .get_mut("platforms")
            .and_then(|p| p.get_mut("kubernetes"))
            .and_then(|k| k.get_mut("deploymentSpec"))
            .and_then(|d| d.get_mut("executors"))
            .and_then(YamlValue::as_mapping_mut)
        else {
            continue;
        };
        for (_, executor) in executors.iter_mut() {
            if let Some(mapping) = executor.as_mapping_mut() {
                mapping.insert(
                    YamlValue::String("imagePullSecret".to_string()),
                    secret_entry.clone(),
                );
                injected = true;
            }
        }
    }
    if injected {
        return;
    }

    // No platforms section: derive one from the executor labels.
    let mut executors = serde_yaml::Mapping::new();
    for doc in docs.iter() {
        let Some(components) = doc.get("components").and_then(YamlValue::as_mapping) else {
            continue;
        };
        for (_, component) in components {
            if let Some(label) = component.get("executorLabel").and_then(YamlValue::as_str) {
                let mut executor = serde_yaml::Mapping::new();
                executor.insert(
                    YamlValue::String("imagePullSecret".to_string()),
                    secret_entry.clone(),
                );
                executors.insert(
                    YamlValue::String(label.to_string()),
                    YamlValue::Mapping(executor),
                );
            }
        }
    }
    if !executors.is_empty() {
        let mut deployment_spec = serde_yaml::Mapping::new();
        deployment_spec.insert(
            YamlValue::String("executors".to_string()),
            YamlValue::Mapping(executors),
        );
        let mut kubernetes = serde_yaml::Mapping::new();
        kubernetes.insert(
            YamlValue::String("deploymentSpec".to_string()),
            YamlValue::Mapping(deployment_spec),
        );
        let mut platforms = serde_yaml::Mapping::new();
        platforms.insert(
            YamlValue::String("kubernetes".to_string()),
            YamlValue::Mapping(kubernetes),
        );
        let mut doc = serde_yaml::Mapping::new();
        doc.insert(
            YamlValue::String("platforms".to_string()),
            YamlValue::Mapping(platforms),
        );
        docs.push(YamlValue::Mapping(doc));
    }
}

/// Parameter overrides from `variables.yml`: `deployment.environmentVar`
/// entries that carry a literal value.
pub fn variable_overrides(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Ok(doc) = serde_yaml::from_str::<YamlValue>(raw) else {
        return out;
    };
    let Some(entries) = doc
        .get("deployment")
        .and_then(|d| d.get("environmentVar"))
        .and_then(YamlValue::as_sequence)
    else {
        return out;
    };
    for entry in entries {
        if entry.get("valueFrom").is_some() {
            continue;
        }
        if let (Some(name), Some(value)) = (
            entry.get("name").and_then(YamlValue::as_str),
            entry.get("value").and_then(YamlValue::as_str),
        ) {
            out.insert(name.to_string(), value.to_string());
        }
    }
    out
}

pub struct MlPipelineClient {
    http: reqwest::Client,
    settings: MlPipelineSettings,
}

impl MlPipelineClient {
    pub fn new(settings: MlPipelineSettings, http: reqwest::Client) -> Self {
        MlPipelineClient { http, settings }
    }

    pub fn image_pull_secret(&self) -> &str {
        &self.settings.image_pull_secret
    }

    fn base(&self) -> Result<&str, Error> {
        self.settings
            .url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .ok_or_else(|| {
                Error::PipelineConfigMissing("Pipeline platform URL is not configured".to_string())
            })
    }

    /// Namespace runs land in: the project in multi-user mode, the platform
    /// default otherwise.
    pub fn namespace(&self, project_id: &str) -> String {
        if self.settings.multi_user {
            slugify(project_id)
        } else {
            "kubeflow".to_string()
        }
    }

    async fn get_json(&self, url: String, query: &[(&str, String)]) -> Result<Value, Error> {
        let response = self.http.get(url).query(query).send().await?;
        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Pipeline API returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    pub async fn find_pipeline_id(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<String>, Error> {
        let filter = json!({
            "predicates": [{
                "operation": "EQUALS",
                "key": "display_name",
                "stringValue": name,
            }]
        })
        .to_string();
        let body = self
            .get_json(
                format!("{}/apis/v2beta1/pipelines", self.base()?),
                &[
                    ("namespace", namespace.to_string()),
                    ("filter", filter),
                ],
            )
            .await?;
        Ok(body
            .pointer("/pipelines/0/pipeline_id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn upload(
        &self,
        path: &Path,
        query: Vec<(&'static str, String)>,
    ) -> Result<Value, Error> {
        let spec = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| PIPELINE_SPEC_FILENAME.to_string());
        let form = Form::new().part("uploadfile", Part::bytes(spec).file_name(filename));
        let response = self
            .http
            .post(format!("{}/apis/v2beta1/pipelines/upload", self.base()?))
            .query(&query)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Pipeline upload failed: {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Upload the spec as a new pipeline, returning `(pipeline_id, version_id)`.
    pub async fn upload_pipeline(
        &self,
        path: &Path,
        name: &str,
        namespace: &str,
    ) -> Result<(String, String), Error> {
        let body = self
            .upload(
                path,
                vec![
                    ("name", name.to_string()),
                    ("namespace", namespace.to_string()),
                ],
            )
            .await?;
        let pipeline_id = body
            .get("pipeline_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("Upload returned no pipeline id")))?
            .to_string();
        let versions = self.list_versions(&pipeline_id).await?;
        let version_id = versions
            .first()
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("Uploaded pipeline has no version")))?;
        Ok((pipeline_id, version_id))
    }

    /// Upload the spec as a new version of an existing pipeline, deleting any
    /// same-named prior version first. Returns the new version id.
    pub async fn upload_pipeline_version(
        &self,
        path: &Path,
        version_name: &str,
        pipeline_id: &str,
    ) -> Result<String, Error> {
        for (version_id, display_name) in self.list_versions(pipeline_id).await? {
            if display_name == version_name {
                self.delete_version(pipeline_id, &version_id).await?;
            }
        }
        let body = self
            .upload(
                path,
                vec![
                    ("name", version_name.to_string()),
                    ("pipelineid", pipeline_id.to_string()),
                ],
            )
            .await?;
        body.get("pipeline_version_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("Upload returned no version id")))
    }

    pub async fn list_versions(&self, pipeline_id: &str) -> Result<Vec<(String, String)>, Error> {
        let body = self
            .get_json(
                format!(
                    "{}/apis/v2beta1/pipelines/{pipeline_id}/versions",
                    self.base()?
                ),
                &[("page_size", "100".to_string())],
            )
            .await?;
        Ok(body
            .get("pipeline_versions")
            .and_then(Value::as_array)
            .map(|versions| {
                versions
                    .iter()
                    .filter_map(|v| {
                        Some((
                            v.get("pipeline_version_id")?.as_str()?.to_string(),
                            v.get("display_name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn delete_version(&self, pipeline_id: &str, version_id: &str) -> Result<(), Error> {
        let response = self
            .http
            .delete(format!(
                "{}/apis/v2beta1/pipelines/{pipeline_id}/versions/{version_id}",
                self.base()?
            ))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(pipeline_id, version_id, status = %response.status(), "version delete rejected");
        }
        Ok(())
    }

    /// Ensure the experiment exists, returning its id.
    pub async fn ensure_experiment(&self, name: &str, namespace: &str) -> Result<String, Error> {
        let body = self
            .get_json(
                format!("{}/apis/v2beta1/experiments", self.base()?),
                &[("namespace", namespace.to_string())],
            )
            .await?;
        if let Some(existing) = body
            .get("experiments")
            .and_then(Value::as_array)
            .and_then(|experiments| {
                experiments.iter().find(|e| {
                    e.get("display_name").and_then(Value::as_str) == Some(name)
                })
            })
            .and_then(|e| e.get("experiment_id"))
            .and_then(Value::as_str)
        {
            return Ok(existing.to_string());
        }

        let response = self
            .http
            .post(format!("{}/apis/v2beta1/experiments", self.base()?))
            .json(&json!({ "display_name": name, "namespace": namespace }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Experiment creation failed: {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        body.get("experiment_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("Experiment creation returned no id")))
    }

    /// Disable any recurring run already registered under the plugin's name.
    pub async fn disable_stale_recurring_runs(
        &self,
        experiment_id: &str,
        name: &str,
    ) -> Result<(), Error> {
        let body = self
            .get_json(
                format!("{}/apis/v2beta1/recurringruns", self.base()?),
                &[
                    ("experiment_id", experiment_id.to_string()),
                    ("page_size", "100".to_string()),
                ],
            )
            .await?;
        let runs = body
            .get("recurringRuns")
            .or_else(|| body.get("recurring_runs"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for run in runs {
            if run.get("display_name").and_then(Value::as_str) != Some(name) {
                continue;
            }
            if let Some(id) = run.get("recurring_run_id").and_then(Value::as_str) {
                info!(id, name, "disabling stale recurring run");
                let response = self
                    .http
                    .post(format!(
                        "{}/apis/v2beta1/recurringruns/{id}:disable",
                        self.base()?
                    ))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    warn!(id, status = %response.status(), "disable rejected");
                }
            }
        }
        Ok(())
    }

    /// Start a recurring run bound to the schedule. Returns the run id.
    pub async fn create_recurring_run(
        &self,
        experiment_id: &str,
        name: &str,
        pipeline_id: &str,
        version_id: &str,
        schedule: &Schedule,
        params: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let trigger = match schedule {
            Schedule::Cron(cron) => json!({ "cron_schedule": { "cron": cron } }),
            Schedule::IntervalSeconds(secs) => {
                json!({ "periodic_schedule": { "interval_second": secs.to_string() } })
            }
        };
        let response = self
            .http
            .post(format!("{}/apis/v2beta1/recurringruns", self.base()?))
            .json(&json!({
                "display_name": name,
                "experiment_id": experiment_id,
                "pipeline_version_reference": {
                    "pipeline_id": pipeline_id,
                    "pipeline_version_id": version_id,
                },
                "trigger": trigger,
                "runtime_config": { "parameters": params },
                "mode": "ENABLE",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Recurring run creation failed: {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        Ok(body
            .get("recurring_run_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Start a single run. Returns the run id.
    pub async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        pipeline_id: &str,
        version_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let response = self
            .http
            .post(format!("{}/apis/v2beta1/runs", self.base()?))
            .json(&json!({
                "display_name": name,
                "experiment_id": experiment_id,
                "pipeline_version_reference": {
                    "pipeline_id": pipeline_id,
                    "pipeline_version_id": version_id,
                },
                "runtime_config": { "parameters": params },
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Run creation failed: {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        Ok(body
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Current state of a run, for the run-status follower.
    pub async fn run_state(&self, run_id: &str) -> Result<Option<String>, Error> {
        let body = self
            .get_json(
                format!("{}/apis/v2beta1/runs/{run_id}", self.base()?),
                &[],
            )
            .await?;
        Ok(body.get("state").and_then(Value::as_str).map(str::to_string))
    }

    /// Delete the pipeline with all versions after disabling its runs.
    pub async fn delete_pipeline(&self, name: &str, project_id: &str) -> Result<(), Error> {
        let namespace = self.namespace(project_id);
        let Some(pipeline_id) = self.find_pipeline_id(name, &namespace).await? else {
            return Ok(());
        };
        for (version_id, _) in self.list_versions(&pipeline_id).await? {
            self.delete_version(&pipeline_id, &version_id).await?;
        }
        let response = self
            .http
            .delete(format!(
                "{}/apis/v2beta1/pipelines/{pipeline_id}",
                self.base()?
            ))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(pipeline_id, status = %response.status(), "pipeline delete rejected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(key: &str, value: &str) -> EnvVar {
        EnvVar::plain(key, value)
    }

    #[test]
    fn test_schedule_requires_exactly_one_trigger() {
        let env = vec![plain("RECURRING_RUN", "true"), plain("CRON_EXPRESSION", "0 * * * *")];
        assert_eq!(
            schedule_from_env(&env).unwrap(),
            Some(Schedule::Cron("0 * * * *".into()))
        );

        let env = vec![plain("RECURRING_RUN", "true"), plain("INTERVAL_SECONDS", "300")];
        assert_eq!(
            schedule_from_env(&env).unwrap(),
            Some(Schedule::IntervalSeconds(300))
        );

        let env = vec![
            plain("RECURRING_RUN", "true"),
            plain("CRON_EXPRESSION", "0 * * * *"),
            plain("INTERVAL_SECONDS", "300"),
        ];
        assert!(matches!(
            schedule_from_env(&env),
            Err(Error::BadSchedule(_))
        ));

        let env = vec![plain("RECURRING_RUN", "true")];
        assert!(matches!(
            schedule_from_env(&env),
            Err(Error::BadSchedule(_))
        ));

        assert_eq!(schedule_from_env(&[plain("A", "b")]).unwrap(), None);
    }

    #[test]
    fn test_pipeline_params_exclude_control_keys() {
        let env = vec![
            plain("RECURRING_RUN", "true"),
            plain("CRON_EXPRESSION", "0 * * * *"),
            plain("BATCH_SIZE", "16"),
            EnvVar {
                key: "TOKEN".into(),
                value: "secret".into(),
                kind: EnvVarKind::Secure,
            },
        ];
        let params = pipeline_params(&env, BTreeMap::from([("LR".to_string(), "0.1".to_string())]));
        assert_eq!(params.get("BATCH_SIZE").unwrap(), "16");
        assert_eq!(params.get("LR").unwrap(), "0.1");
        assert!(!params.contains_key("RECURRING_RUN"));
        assert!(!params.contains_key("CRON_EXPRESSION"));
        assert!(!params.contains_key("TOKEN"));
    }

    #[test]
    fn test_rewrite_executor_images() {
        let raw = "\
deploymentSpec:
  executors:
    exec-train:
      container:
        image: old/image:1
    exec-eval:
      container:
        image: old/image:2
";
        let mut docs = read_documents(raw).unwrap();
        rewrite_executor_images(&mut docs, "registry/pipe-kubeflow:1.0");
        let rendered = write_documents(&docs).unwrap();
        assert_eq!(rendered.matches("registry/pipe-kubeflow:1.0").count(), 2);
        assert!(!rendered.contains("old/image"));
    }

    #[test]
    fn test_inject_pull_secret_creates_platforms_section() {
        let raw = "\
components:
  comp-train:
    executorLabel: exec-train
";
        let mut docs = read_documents(raw).unwrap();
        inject_image_pull_secret(&mut docs, "registry-credentials");
        let rendered = write_documents(&docs).unwrap();
        assert!(rendered.contains("imagePullSecret"));
        assert!(rendered.contains("registry-credentials"));
        assert!(rendered.contains("exec-train"));
    }

    #[test]
    fn test_variable_overrides_skip_value_from() {
        let raw = "\
deployment:
  environmentVar:
    - name: LR
      value: '0.01'
    - name: SECRET
      valueFrom:
        secretKeyRef:
          name: x
";
        let overrides = variable_overrides(raw);
        assert_eq!(overrides.get("LR").unwrap(), "0.01");
        assert!(!overrides.contains_key("SECRET"));
    }
}
