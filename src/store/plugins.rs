//! Plugin version records.
//!
//! Keyed `{pluginID}|{version}`; one JSON document per version. The upsert is
//! the single write primitive: callers never choose between insert and
//! update.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::{
    DeploymentStatus, EnvVar, EnvVarKind, PluginType, PluginVersion, Source, Version, SECRET_MASK,
};

pub struct PluginStore {
    tree: sled::Tree,
}

fn key(plugin_id: &str, version: Version) -> String {
    format!("{}|{}", plugin_id, version)
}

fn prefix(plugin_id: &str) -> String {
    format!("{}|", plugin_id)
}

impl PluginStore {
    pub fn new(tree: sled::Tree) -> Self {
        PluginStore { tree }
    }

    /// Keyed create-or-update. The only write path for version documents.
    pub fn upsert(&self, version: &PluginVersion) -> Result<()> {
        let doc = serde_json::to_vec(version).context("Failed to serialize plugin version")?;
        self.tree
            .insert(key(&version.plugin_id, version.version), doc)
            .context("Failed to write plugin version")?;
        Ok(())
    }

    pub fn fetch(&self, plugin_id: &str, version: Version) -> Result<Option<PluginVersion>> {
        let Some(raw) = self
            .tree
            .get(key(plugin_id, version))
            .context("Failed to read plugin version")?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// All version rows for a plugin, ascending by version number.
    pub fn versions_of(&self, plugin_id: &str) -> Result<Vec<PluginVersion>> {
        let mut rows = Vec::new();
        for item in self.tree.scan_prefix(prefix(plugin_id)) {
            let (_, raw) = item.context("Failed to scan plugin versions")?;
            rows.push(serde_json::from_slice::<PluginVersion>(&raw)?);
        }
        rows.sort_by(|a, b| {
            a.version
                .0
                .partial_cmp(&b.version.0)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }

    pub fn versions(&self, plugin_id: &str) -> Result<Vec<Version>> {
        Ok(self
            .versions_of(plugin_id)?
            .into_iter()
            .map(|v| v.version)
            .collect())
    }

    /// The row a plugin collapses to: the one whose version matches
    /// `current_version`, falling back to the first row when the designation
    /// is absent (older records never carried one).
    pub fn fetch_current(&self, plugin_id: &str) -> Result<Option<PluginVersion>> {
        let rows = self.versions_of(plugin_id)?;
        Ok(collapse(rows))
    }

    pub fn list_all(&self) -> Result<Vec<PluginVersion>> {
        let mut rows = Vec::new();
        for item in self.tree.iter() {
            let (_, raw) = item.context("Failed to scan plugin versions")?;
            rows.push(serde_json::from_slice::<PluginVersion>(&raw)?);
        }
        Ok(rows)
    }

    /// One row per plugin id, collapsed to the current version.
    pub fn list_collapsed(&self) -> Result<Vec<PluginVersion>> {
        let mut by_plugin: std::collections::BTreeMap<String, Vec<PluginVersion>> =
            std::collections::BTreeMap::new();
        for row in self.list_all()? {
            by_plugin.entry(row.plugin_id.clone()).or_default().push(row);
        }
        Ok(by_plugin.into_values().filter_map(collapse).collect())
    }

    pub fn delete_version(&self, plugin_id: &str, version: Version) -> Result<bool> {
        Ok(self
            .tree
            .remove(key(plugin_id, version))
            .context("Failed to delete plugin version")?
            .is_some())
    }

    pub fn delete_all(&self, plugin_id: &str) -> Result<usize> {
        let mut removed = 0;
        let keys: Vec<_> = self
            .tree
            .scan_prefix(prefix(plugin_id))
            .keys()
            .collect::<Result<_, _>>()
            .context("Failed to scan plugin versions")?;
        for k in keys {
            if self.tree.remove(k)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Propagate the `current` designation to every version row of a plugin,
    /// keeping the one-current-per-plugin invariant by construction.
    pub fn set_current_version(&self, plugin_id: &str, current: Version) -> Result<()> {
        for mut row in self.versions_of(plugin_id)? {
            row.current_version = Some(current);
            self.upsert(&row)?;
        }
        Ok(())
    }

    /// Does any version still reference this stored credential? Backs the
    /// delete-credential invariant.
    pub fn referenced_by_credential(&self, target_ref: &str) -> Result<Option<String>> {
        for row in self.list_all()? {
            if let Source::Git {
                target_ref: Some(r),
                ..
            } = &row.source
            {
                if r == target_ref {
                    return Ok(Some(row.plugin_id));
                }
            }
        }
        Ok(None)
    }

    /// Name collision check for create: same name under a different plugin id.
    pub fn name_in_use(&self, name: &str, exclude_plugin_id: &str) -> Result<bool> {
        for row in self.list_all()? {
            if row.name == name && row.plugin_id != exclude_plugin_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fetch-modify-upsert. Pipeline serialization makes this safe without a
    /// store-level transaction.
    pub fn update_with<F>(
        &self,
        plugin_id: &str,
        version: Version,
        mutate: F,
    ) -> Result<Option<PluginVersion>>
    where
        F: FnOnce(&mut PluginVersion),
    {
        let Some(mut row) = self.fetch(plugin_id, version)? else {
            return Ok(None);
        };
        mutate(&mut row);
        self.upsert(&row)?;
        Ok(Some(row))
    }

    /// Filtered, sorted, paginated listing over collapsed rows. Returns the
    /// page and the total count the same filter produces without pagination.
    pub fn list_page(&self, request: &ListRequest) -> Result<(Vec<PluginVersion>, usize)> {
        let mut rows = self.list_collapsed()?;
        if let Some(filter) = &request.filter {
            rows.retain(|row| filter.matches(row));
        }
        match request.sort.as_deref() {
            Some("name") => rows.sort_by(|a, b| a.name.cmp(&b.name)),
            Some("deployment_status") => rows.sort_by(|a, b| {
                a.deployment_status
                    .as_str()
                    .cmp(b.deployment_status.as_str())
            }),
            // Newest deployment first, the default ordering of the table.
            _ => rows.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at)),
        }
        if request.descending && request.sort.is_some() {
            rows.reverse();
        }
        let total = rows.len();
        let page = rows
            .into_iter()
            .skip(request.start_row)
            .take(request.records.max(1))
            .collect();
        Ok((page, total))
    }
}

fn collapse(rows: Vec<PluginVersion>) -> Option<PluginVersion> {
    if rows.is_empty() {
        return None;
    }
    let current = rows
        .iter()
        .find(|row| matches!(row.current_version, Some(c) if c == row.version))
        .cloned();
    current.or_else(|| rows.into_iter().next())
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListRequest {
    #[serde(default)]
    pub start_row: usize,
    #[serde(default = "default_records")]
    pub records: usize,
    #[serde(default)]
    pub filter: Option<ListFilter>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub descending: bool,
}

fn default_records() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListFilter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub plugin_type: Option<String>,
    #[serde(default)]
    pub deployment_status: Option<String>,
}

impl ListFilter {
    fn matches(&self, row: &PluginVersion) -> bool {
        let name_ok = self
            .name
            .as_ref()
            .map(|n| row.name.to_lowercase().contains(&n.to_lowercase()))
            .unwrap_or(true);
        let type_ok = self
            .plugin_type
            .as_ref()
            .map(|t| row.plugin_type.as_str() == t)
            .unwrap_or(true);
        let status_ok = self
            .deployment_status
            .as_ref()
            .map(|s| row.deployment_status.as_str() == s)
            .unwrap_or(true);
        name_ok && type_ok && status_ok
    }
}

/// Actions the UI must grey out for a row, synthesized from the collapsed
/// row's status and type.
pub fn disabled_actions(status: DeploymentStatus, plugin_type: PluginType) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    let mut add = |action: &'static str| {
        if !out.contains(&action) {
            out.push(action);
        }
    };

    if !matches!(
        status,
        DeploymentStatus::Deploying | DeploymentStatus::Running
    ) {
        add("artifact_download");
    }
    match status {
        DeploymentStatus::Running => add("start"),
        DeploymentStatus::Pending
        | DeploymentStatus::Deploying
        | DeploymentStatus::Scanning
        | DeploymentStatus::Failed
        | DeploymentStatus::ScanSucceeded => {
            add("start");
            add("stop");
        }
        DeploymentStatus::Stopped => {
            add("stop");
            add("logs");
        }
    }
    if plugin_type.start_stop_unsupported() {
        add("start");
        add("stop");
    }
    out
}

/// Secure env write-back: any incoming secure entry whose value equals the
/// mask keeps the stored value. Returns true when a secure value actually
/// changed.
pub fn unmask_env(incoming: &mut [EnvVar], stored: &[EnvVar]) -> bool {
    let mut changed = false;
    for entry in incoming.iter_mut() {
        if entry.kind != EnvVarKind::Secure {
            continue;
        }
        let previous = stored
            .iter()
            .find(|s| s.key == entry.key && s.kind == EnvVarKind::Secure);
        if entry.value == SECRET_MASK {
            if let Some(previous) = previous {
                entry.value = previous.value.clone();
            }
        } else if previous.map(|p| p.value != entry.value).unwrap_or(true) {
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ResourceBudget, ScanChecks};
    use std::collections::BTreeMap;

    fn store() -> PluginStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        PluginStore::new(db.open_tree("plugins").unwrap())
    }

    fn version(plugin_id: &str, name: &str, v: f64) -> PluginVersion {
        PluginVersion {
            plugin_id: plugin_id.into(),
            version: Version(v),
            current_version: None,
            name: name.into(),
            plugin_type: PluginType::Microservice,
            source: Source::ArchiveUpload { blob_key: None },
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
    fn test_upsert_round_trip() {
        let store = store();
        let v = version("p1", "svc", 1.0);
        store.upsert(&v).unwrap();
        let fetched = store.fetch("p1", Version(1.0)).unwrap().unwrap();
        assert_eq!(fetched.name, "svc");

        // Upsert again with a mutation: same document, updated in place.
        let mut v2 = fetched;
        v2.deployment_status = DeploymentStatus::Running;
        store.upsert(&v2).unwrap();
        assert_eq!(store.versions("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_collapse_prefers_current_version() {
        let store = store();
        let mut a = version("p1", "svc", 1.0);
        let mut b = version("p1", "svc", 2.0);
        a.current_version = Some(Version(2.0));
        b.current_version = Some(Version(2.0));
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();
        let current = store.fetch_current("p1").unwrap().unwrap();
        assert_eq!(current.version, Version(2.0));
    }

    #[test]
    fn test_collapse_falls_back_to_first() {
        let store = store();
        store.upsert(&version("p1", "svc", 1.0)).unwrap();
        store.upsert(&version("p1", "svc", 2.0)).unwrap();
        let current = store.fetch_current("p1").unwrap().unwrap();
        assert_eq!(current.version, Version(1.0));
    }

    #[test]
    fn test_versions_sorted_numerically() {
        let store = store();
        for v in [10.0, 2.0, 1.5] {
            store.upsert(&version("p1", "svc", v)).unwrap();
        }
        let versions = store.versions("p1").unwrap();
        assert_eq!(versions, vec![Version(1.5), Version(2.0), Version(10.0)]);
    }

    #[test]
    fn test_credential_reference_lookup() {
        let store = store();
        let mut v = version("p1", "svc", 1.0);
        v.source = Source::Git {
            target_ref: Some("c1".into()),
            url: None,
            username: None,
            access_token: None,
            repository: Some("svc".into()),
            branch: "main".into(),
        };
        store.upsert(&v).unwrap();
        assert_eq!(
            store.referenced_by_credential("c1").unwrap(),
            Some("p1".to_string())
        );
        assert_eq!(store.referenced_by_credential("c2").unwrap(), None);

        store.delete_all("p1").unwrap();
        assert_eq!(store.referenced_by_credential("c1").unwrap(), None);
    }

    #[test]
    fn test_disabled_actions_by_status() {
        use DeploymentStatus::*;
        assert_eq!(
            disabled_actions(Running, PluginType::Microservice),
            vec!["start"]
        );
        assert_eq!(
            disabled_actions(Failed, PluginType::Microservice),
            vec!["artifact_download", "start", "stop"]
        );
        assert_eq!(
            disabled_actions(Stopped, PluginType::Microservice),
            vec!["artifact_download", "stop", "logs"]
        );
        // Pipelines and protocols can never be toggled.
        assert_eq!(
            disabled_actions(Running, PluginType::Kubeflow),
            vec!["start", "stop"]
        );
        assert!(disabled_actions(Running, PluginType::Protocol).contains(&"stop"));
    }

    #[test]
    fn test_unmask_env_keeps_stored_value() {
        let stored = vec![EnvVar {
            key: "API_KEY".into(),
            value: "hunter2".into(),
            kind: EnvVarKind::Secure,
        }];
        let mut incoming = vec![EnvVar {
            key: "API_KEY".into(),
            value: SECRET_MASK.into(),
            kind: EnvVarKind::Secure,
        }];
        let changed = unmask_env(&mut incoming, &stored);
        assert!(!changed);
        assert_eq!(incoming[0].value, "hunter2");
    }

    #[test]
    fn test_unmask_env_detects_real_change() {
        let stored = vec![EnvVar {
            key: "API_KEY".into(),
            value: "hunter2".into(),
            kind: EnvVarKind::Secure,
        }];
        let mut incoming = vec![EnvVar {
            key: "API_KEY".into(),
            value: "hunter3".into(),
            kind: EnvVarKind::Secure,
        }];
        assert!(unmask_env(&mut incoming, &stored));
        assert_eq!(incoming[0].value, "hunter3");
    }

    #[test]
    fn test_list_page_filters_and_counts() {
        let store = store();
        store.upsert(&version("p1", "alpha", 1.0)).unwrap();
        store.upsert(&version("p2", "beta", 1.0)).unwrap();
        store.upsert(&version("p3", "alphabet", 1.0)).unwrap();

        let request = ListRequest {
            start_row: 0,
            records: 10,
            filter: Some(ListFilter {
                name: Some("alpha".into()),
                ..Default::default()
            }),
            sort: Some("name".into()),
            descending: false,
        };
        let (rows, total) = store.list_page(&request).unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].name, "alpha");
        assert_eq!(rows[1].name, "alphabet");
    }
}
