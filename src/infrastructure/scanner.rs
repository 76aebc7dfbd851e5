//! Scan fan-out: antivirus and static analysis over working trees, image
//! vulnerability scanning after publish.
//!
//! Scanners run as throwaway containers on the shared engine; the SAST
//! verdict additionally queries the analysis server's issue API. A scanner
//! that crashes or times out is a failed scan, never a pass.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ScanSettings;
use crate::domain::{SastFinding, VulnFinding};
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntivirusOutcome {
    pub infected: u64,
    pub summary: BTreeMap<String, String>,
}

impl AntivirusOutcome {
    pub fn passed(&self) -> bool {
        self.infected == 0
    }
}

#[derive(Debug, Clone)]
pub struct SastOutcome {
    pub passed: bool,
    pub findings: Vec<SastFinding>,
}

#[derive(Debug, Clone)]
pub struct VulnOutcome {
    pub findings: Vec<VulnFinding>,
}

impl VulnOutcome {
    pub fn passed(&self) -> bool {
        self.findings.is_empty()
    }
}

pub struct ScanRunner {
    settings: ScanSettings,
    http: reqwest::Client,
    engine_binary: String,
}

impl ScanRunner {
    pub fn new(settings: ScanSettings, http: reqwest::Client) -> Self {
        ScanRunner {
            settings,
            http,
            engine_binary: std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    async fn run_scanner(&self, args: Vec<String>) -> Result<std::process::Output, Error> {
        let timeout = Duration::from_secs(self.settings.scan_timeout_secs);
        let future = Command::new(&self.engine_binary).args(&args).output();
        match tokio::time::timeout(timeout, future).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::ScanInfraFailure(format!(
                "Failed to launch scanner container: {e}"
            ))),
            Err(_) => Err(Error::ScanInfraFailure(format!(
                "Scanner timed out after {}s",
                self.settings.scan_timeout_secs
            ))),
        }
    }

    /// Antivirus scan over a working tree.
    pub async fn antivirus(&self, workdir: &Path) -> Result<AntivirusOutcome, Error> {
        info!(workdir = %workdir.display(), "antivirus scan");
        let output = self
            .run_scanner(vec![
                "run".into(),
                "--rm".into(),
                "-v".into(),
                format!("{}:/scandir:ro", workdir.display()),
                self.settings.antivirus_image.clone(),
                "clamscan".into(),
                "-r".into(),
                "/scandir".into(),
            ])
            .await?;

        // clamscan exits 1 when infected files were found; that is a verdict,
        // not an infrastructure failure.
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ => {
                return Err(Error::ScanInfraFailure(format!(
                    "Antivirus scanner failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }

        let summary = parse_clamscan_summary(&String::from_utf8_lossy(&output.stdout));
        let infected = summary
            .get("Infected files")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                Error::ScanInfraFailure("Antivirus report carried no summary".to_string())
            })?;
        Ok(AntivirusOutcome { infected, summary })
    }

    /// Static analysis over a working tree: run the scanner container, then
    /// pull per-rule-type issues from the analysis server and apply the
    /// configured thresholds.
    pub async fn sast(&self, workdir: &Path, project_key: &str) -> Result<SastOutcome, Error> {
        let (Some(url), Some(token)) = (&self.settings.sast_url, &self.settings.sast_token) else {
            return Err(Error::ScanInfraFailure(
                "Static analysis server is not configured".to_string(),
            ));
        };

        info!(workdir = %workdir.display(), project_key, "static analysis scan");
        let output = self
            .run_scanner(vec![
                "run".into(),
                "--rm".into(),
                "--network".into(),
                "host".into(),
                "-v".into(),
                format!("{}:/usr/src", workdir.display()),
                self.settings.sast_scanner_image.clone(),
                "sonar-scanner".into(),
                format!("-Dsonar.projectKey={project_key}"),
                "-Dsonar.sources=.".into(),
                format!("-Dsonar.host.url={url}"),
                format!("-Dsonar.token={token}"),
            ])
            .await?;
        if !output.status.success() {
            return Err(Error::ScanInfraFailure(format!(
                "Static analysis scanner failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut findings = Vec::new();
        let mut passed = true;
        for (kind, threshold) in [
            ("CODE_SMELL", self.settings.code_smell_threshold),
            ("VULNERABILITY", self.settings.vulnerability_threshold),
            ("BUG", self.settings.bug_threshold),
        ] {
            let (total, issues) = self.fetch_issues(url, token, project_key, kind).await?;
            if total > threshold {
                warn!(kind, total, threshold, "static analysis threshold exceeded");
                passed = false;
                findings.extend(issues);
            }
        }
        Ok(SastOutcome { passed, findings })
    }

    async fn fetch_issues(
        &self,
        url: &str,
        token: &str,
        project_key: &str,
        kind: &str,
    ) -> Result<(u64, Vec<SastFinding>), Error> {
        let response = self
            .http
            .get(format!("{}/api/issues/search", url.trim_end_matches('/')))
            .basic_auth(token, Option::<&str>::None)
            .query(&[
                ("componentKeys", project_key),
                ("types", kind),
                ("statuses", "OPEN,CONFIRMED,REOPENED"),
                ("severities", &self.settings.sast_severities),
            ])
            .send()
            .await
            .map_err(|e| Error::ScanInfraFailure(format!("Issue API unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ScanInfraFailure(format!(
                "Issue API returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::ScanInfraFailure(format!("Malformed issue API response: {e}")))?;
        Ok(parse_sast_issues(&body, kind))
    }

    /// Vulnerability scan of a pushed image at the configured severities.
    pub async fn vulnerabilities(&self, image: &str) -> Result<VulnOutcome, Error> {
        info!(image, "vulnerability scan");
        let output = self
            .run_scanner(vec![
                "run".into(),
                "--rm".into(),
                "--network".into(),
                "host".into(),
                "-v".into(),
                "/var/run/docker.sock:/var/run/docker.sock".into(),
                self.settings.vulnerability_image.clone(),
                "image".into(),
                "--ignore-unfixed".into(),
                "--scanners".into(),
                "vuln".into(),
                "--severity".into(),
                self.settings.vulnerability_severity.clone(),
                "--format".into(),
                "json".into(),
                image.into(),
            ])
            .await?;
        if !output.status.success() {
            return Err(Error::ScanInfraFailure(format!(
                "Vulnerability scanner failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let report: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::ScanInfraFailure(format!("Malformed vulnerability report: {e}"))
        })?;
        Ok(VulnOutcome {
            findings: parse_vulnerability_report(&report),
        })
    }
}

/// Parse the key/value summary block clamscan prints after its scan
/// (`Infected files: 0`, `Scanned files: 123`, ...).
pub fn parse_clamscan_summary(stdout: &str) -> BTreeMap<String, String> {
    let mut summary = BTreeMap::new();
    for line in stdout.lines() {
        if line.trim().is_empty() || line.contains("-----") {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            summary.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    summary
}

/// Pull total + findings out of an issue search response for one rule type.
pub fn parse_sast_issues(body: &Value, kind: &str) -> (u64, Vec<SastFinding>) {
    let total = body.get("total").and_then(Value::as_u64).unwrap_or(0);
    let findings = body
        .get("issues")
        .and_then(Value::as_array)
        .map(|issues| {
            issues
                .iter()
                .map(|issue| SastFinding {
                    kind: kind.to_string(),
                    file: issue
                        .get("component")
                        .and_then(Value::as_str)
                        .map(|c| c.split(':').next_back().unwrap_or(c).to_string()),
                    severity: issue
                        .get("severity")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    line: issue.get("line").and_then(Value::as_u64).map(|l| l as u32),
                    message: issue
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    rule: issue
                        .get("rule")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default();
    (total, findings)
}

/// Flatten a trivy JSON report into findings.
pub fn parse_vulnerability_report(report: &Value) -> Vec<VulnFinding> {
    let mut findings = Vec::new();
    let Some(results) = report.get("Results").and_then(Value::as_array) else {
        return findings;
    };
    for target in results {
        let package_type = target
            .get("Type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(vulns) = target.get("Vulnerabilities").and_then(Value::as_array) else {
            continue;
        };
        for vuln in vulns {
            findings.push(VulnFinding {
                package: vuln
                    .get("PkgName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                package_type: package_type.clone(),
                path: vuln
                    .get("PkgPath")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                installed_version: vuln
                    .get("InstalledVersion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                fixed_version: vuln
                    .get("FixedVersion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                severity: vuln
                    .get("Severity")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                description: vuln
                    .get("Description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_clamscan_summary() {
        let stdout = "\
/scandir/eicar.txt: Win.Test.EICAR_HDB-1 FOUND

----------- SCAN SUMMARY -----------
Known viruses: 8676434
Scanned files: 12
Infected files: 1
Time: 10.5 sec (0 m 10 s)
";
        let summary = parse_clamscan_summary(stdout);
        assert_eq!(summary.get("Infected files").unwrap(), "1");
        assert_eq!(summary.get("Scanned files").unwrap(), "12");
    }

    #[test]
    fn test_parse_sast_issues() {
        let body = json!({
            "total": 2,
            "issues": [
                {
                    "component": "wx:src/main.py",
                    "severity": "CRITICAL",
                    "line": 42,
                    "message": "SQL injection",
                    "rule": "python:S3649"
                },
                { "component": "wx:src/app.py" }
            ]
        });
        let (total, findings) = parse_sast_issues(&body, "VULNERABILITY");
        assert_eq!(total, 2);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].file.as_deref(), Some("src/main.py"));
        assert_eq!(findings[0].kind, "VULNERABILITY");
        assert_eq!(findings[0].line, Some(42));
    }

    #[test]
    fn test_parse_vulnerability_report() {
        let report = json!({
            "Results": [
                {
                    "Type": "python-pkg",
                    "Vulnerabilities": [
                        {
                            "PkgName": "flask",
                            "InstalledVersion": "0.12",
                            "FixedVersion": "2.2.5",
                            "Severity": "HIGH",
                            "Description": "cookie parsing"
                        }
                    ]
                },
                { "Type": "os-pkg" }
            ]
        });
        let findings = parse_vulnerability_report(&report);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].package, "flask");
        assert_eq!(findings[0].severity.as_deref(), Some("HIGH"));
    }

    #[test]
    fn test_empty_report_passes() {
        let outcome = VulnOutcome { findings: vec![] };
        assert!(outcome.passed());
    }
}
