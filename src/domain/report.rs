//! Scan findings persisted per plugin, overwritten on every run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SastFinding {
    /// Rule type: CODE_SMELL, VULNERABILITY or BUG.
    #[serde(rename = "type")]
    pub kind: String,
    pub file: Option<String>,
    pub severity: Option<String>,
    pub line: Option<u32>,
    pub message: Option<String>,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VulnFinding {
    pub package: String,
    pub package_type: Option<String>,
    pub path: Option<String>,
    pub installed_version: Option<String>,
    pub fixed_version: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanReport {
    pub plugin_id: String,
    /// Parsed antivirus summary (e.g. "Infected files" -> "1").
    #[serde(default)]
    pub antivirus: BTreeMap<String, String>,
    #[serde(default)]
    pub sast: Vec<SastFinding>,
    #[serde(default)]
    pub vulnerability: Vec<VulnFinding>,
}

impl ScanReport {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        ScanReport {
            plugin_id: plugin_id.into(),
            ..Default::default()
        }
    }
}
