//! Trivy JSON reports.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::{json_artifacts, Finding, ParseError, ParserId, Severity};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Report {
    #[serde(default)]
    results: Vec<TargetResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetResult {
    #[serde(default)]
    target: String,
    #[serde(default)]
    vulnerabilities: Vec<Vulnerability>,
}

#[derive(Debug, Deserialize)]
struct Vulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "PkgName", default)]
    package: String,
    #[serde(rename = "InstalledVersion", default)]
    installed: String,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "Title", default)]
    title: Option<String>,
}

/// Reads the first `*.json` artifact; trivy writes a single report.
pub fn parse(output: &Path) -> Result<Vec<Finding>, ParseError> {
    let artifacts = json_artifacts(output)?;
    let artifact = artifacts.first().ok_or_else(|| ParseError::MissingArtifacts {
        parser: ParserId::Trivy,
        dir: output.to_path_buf(),
    })?;

    let content = fs::read_to_string(artifact)?;
    let report: Report = serde_json::from_str(&content).map_err(|e| ParseError::InvalidPayload {
        parser: ParserId::Trivy,
        artifact: artifact.clone(),
        reason: e.to_string(),
    })?;

    let mut findings = vec![];
    for result in report.results {
        for vuln in result.vulnerabilities {
            let message = match vuln.title {
                Some(title) => format!("{} {}: {}", vuln.package, vuln.installed, title),
                None => format!("{} {}", vuln.package, vuln.installed),
            };
            findings.push(Finding {
                rule: vuln.id,
                severity: Severity::from_label(&vuln.severity),
                message,
                location: Some(result.target.clone()),
            });
        }
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_vulnerabilities_across_targets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("scan.json"),
            r#"{
                "SchemaVersion": 2,
                "Results": [
                    {"Target": "alpine:3.20 (alpine 3.20.0)", "Vulnerabilities": [
                        {"VulnerabilityID": "CVE-2024-0001", "PkgName": "openssl", "InstalledVersion": "3.3.0", "Severity": "CRITICAL", "Title": "overflow"}
                    ]},
                    {"Target": "usr/lib/python3", "Vulnerabilities": [
                        {"VulnerabilityID": "CVE-2024-0002", "PkgName": "urllib3", "InstalledVersion": "1.26.0", "Severity": "LOW"}
                    ]},
                    {"Target": "etc/passwd"}
                ]
            }"#,
        )
        .unwrap();

        let findings = parse(dir.path()).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].message, "openssl 3.3.0: overflow");
        assert_eq!(findings[1].severity, Severity::Low);
        assert_eq!(findings[1].location.as_deref(), Some("usr/lib/python3"));
    }

    #[test]
    fn test_clean_report_has_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("scan.json"), r#"{"Results": []}"#).unwrap();
        assert!(parse(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_array_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("scan.json"), "[]").unwrap();
        assert!(matches!(parse(dir.path()), Err(ParseError::InvalidPayload { .. })));
    }
}
