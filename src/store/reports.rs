//! Scan reports, one document per plugin, overwritten per run.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use crate::domain::{SastFinding, ScanReport, VulnFinding};

pub struct ReportStore {
    tree: sled::Tree,
}

impl ReportStore {
    pub fn new(tree: sled::Tree) -> Self {
        ReportStore { tree }
    }

    pub fn fetch(&self, plugin_id: &str) -> Result<Option<ScanReport>> {
        let Some(raw) = self
            .tree
            .get(plugin_id.as_bytes())
            .context("Failed to read scan report")?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn put(&self, report: &ScanReport) -> Result<()> {
        self.tree
            .insert(report.plugin_id.as_bytes(), serde_json::to_vec(report)?)
            .context("Failed to write scan report")?;
        Ok(())
    }

    /// Replace the whole report at the start of a pipeline run.
    pub fn reset(&self, plugin_id: &str) -> Result<()> {
        self.put(&ScanReport::new(plugin_id))
    }

    pub fn record_antivirus(
        &self,
        plugin_id: &str,
        summary: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut report = self.fetch(plugin_id)?.unwrap_or_else(|| ScanReport::new(plugin_id));
        report.antivirus = summary;
        self.put(&report)
    }

    pub fn record_sast(&self, plugin_id: &str, findings: Vec<SastFinding>) -> Result<()> {
        let mut report = self.fetch(plugin_id)?.unwrap_or_else(|| ScanReport::new(plugin_id));
        report.sast = findings;
        self.put(&report)
    }

    pub fn record_vulnerabilities(
        &self,
        plugin_id: &str,
        findings: Vec<VulnFinding>,
    ) -> Result<()> {
        let mut report = self.fetch(plugin_id)?.unwrap_or_else(|| ScanReport::new(plugin_id));
        report.vulnerability = findings;
        self.put(&report)
    }

    pub fn delete(&self, plugin_id: &str) -> Result<()> {
        self.tree
            .remove(plugin_id.as_bytes())
            .context("Failed to delete scan report")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_accumulate_and_reset() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = ReportStore::new(db.open_tree("scan_reports").unwrap());

        let mut summary = BTreeMap::new();
        summary.insert("Infected files".to_string(), "1".to_string());
        store.record_antivirus("p1", summary).unwrap();
        store
            .record_sast(
                "p1",
                vec![SastFinding {
                    kind: "BUG".into(),
                    file: Some("main.py".into()),
                    severity: Some("MAJOR".into()),
                    line: Some(10),
                    message: Some("bug".into()),
                    rule: Some("python:S100".into()),
                }],
            )
            .unwrap();

        let report = store.fetch("p1").unwrap().unwrap();
        assert_eq!(report.antivirus.get("Infected files").unwrap(), "1");
        assert_eq!(report.sast.len(), 1);

        store.reset("p1").unwrap();
        let report = store.fetch("p1").unwrap().unwrap();
        assert!(report.antivirus.is_empty());
        assert!(report.sast.is_empty());
    }
}
