//! Widget specialization records: per-widget chart metadata and the cached
//! style manifest the post-deploy hook fetches.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::Version;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetRecord {
    pub plugin_id: String,
    pub chart_type: String,
    pub version: Version,
    pub project_id: String,
    pub proxy: String,
    /// Widget metadata; `files` carries the cached style manifest.
    #[serde(default)]
    pub meta: serde_json::Value,
}

pub struct WidgetStore {
    tree: sled::Tree,
}

impl WidgetStore {
    pub fn new(tree: sled::Tree) -> Self {
        WidgetStore { tree }
    }

    pub fn upsert(&self, record: &WidgetRecord) -> Result<()> {
        self.tree
            .insert(record.plugin_id.as_bytes(), serde_json::to_vec(record)?)
            .context("Failed to write widget record")?;
        Ok(())
    }

    pub fn fetch(&self, plugin_id: &str) -> Result<Option<WidgetRecord>> {
        let Some(raw) = self
            .tree
            .get(plugin_id.as_bytes())
            .context("Failed to read widget record")?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Widget lookup by chart type within a project, the specialized read
    /// path the chart catalog uses.
    pub fn fetch_by_chart(
        &self,
        chart_type: &str,
        version: Version,
        project_id: &str,
    ) -> Result<Option<WidgetRecord>> {
        for item in self.tree.iter() {
            let (_, raw) = item.context("Failed to scan widget records")?;
            let record: WidgetRecord = serde_json::from_slice(&raw)?;
            if record.chart_type == chart_type
                && record.version == version
                && record.project_id == project_id
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Cache the fetched style manifest under `meta.files`.
    pub fn cache_styles(&self, plugin_id: &str, files: serde_json::Value) -> Result<()> {
        if let Some(mut record) = self.fetch(plugin_id)? {
            if let serde_json::Value::Object(meta) = &mut record.meta {
                meta.insert("files".to_string(), files);
            } else {
                record.meta = serde_json::json!({ "files": files });
            }
            self.upsert(&record)?;
        }
        Ok(())
    }

    pub fn delete(&self, plugin_id: &str) -> Result<()> {
        self.tree
            .remove(plugin_id.as_bytes())
            .context("Failed to delete widget record")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_lookup_and_style_cache() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = WidgetStore::new(db.open_tree("widget_plugins").unwrap());

        store
            .upsert(&WidgetRecord {
                plugin_id: "p1".into(),
                chart_type: "timeseries".into(),
                version: Version(1.0),
                project_id: "proj1".into(),
                proxy: "/gateway/plugin/proj1/wx/api/".into(),
                meta: serde_json::json!({}),
            })
            .unwrap();

        let found = store
            .fetch_by_chart("timeseries", Version(1.0), "proj1")
            .unwrap();
        assert!(found.is_some());
        assert!(store
            .fetch_by_chart("timeseries", Version(2.0), "proj1")
            .unwrap()
            .is_none());

        store
            .cache_styles("p1", serde_json::json!(["main.js", "main.css"]))
            .unwrap();
        let record = store.fetch("p1").unwrap().unwrap();
        assert_eq!(record.meta["files"][0], "main.js");
    }
}
