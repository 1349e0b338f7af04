//! Hadolint JSON reports.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::{json_artifacts, Finding, ParseError, ParserId, Severity};

#[derive(Debug, Deserialize)]
struct Violation {
    code: String,
    level: String,
    message: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u64>,
}

impl Violation {
    fn severity(&self) -> Severity {
        match self.level.as_str() {
            "error" => Severity::High,
            "warning" => Severity::Medium,
            "info" => Severity::Low,
            _ => Severity::Info,
        }
    }

    fn into_finding(self) -> Finding {
        let severity = self.severity();
        let location = match (self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{file}:{line}")),
            (Some(file), None) => Some(file),
            (None, Some(line)) => Some(format!("line {line}")),
            (None, None) => None,
        };
        Finding {
            rule: self.code,
            severity,
            message: self.message,
            location,
        }
    }
}

/// Every `*.json` artifact must be an array of violations.
pub fn parse(output: &Path) -> Result<Vec<Finding>, ParseError> {
    let artifacts = json_artifacts(output)?;
    if artifacts.is_empty() {
        return Err(ParseError::MissingArtifacts {
            parser: ParserId::Hadolint,
            dir: output.to_path_buf(),
        });
    }

    let mut findings = vec![];
    for artifact in artifacts {
        let content = fs::read_to_string(&artifact)?;
        let violations: Vec<Violation> =
            serde_json::from_str(&content).map_err(|e| ParseError::InvalidPayload {
                parser: ParserId::Hadolint,
                artifact: artifact.clone(),
                reason: e.to_string(),
            })?;
        findings.extend(violations.into_iter().map(Violation::into_finding));
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_violations_with_levels() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hadolint.json"),
            r#"[
                {"code":"DL3008","column":1,"file":"/inputs/Dockerfile","level":"warning","line":3,"message":"Pin versions in apt get install"},
                {"code":"DL3002","column":1,"file":"/inputs/Dockerfile","level":"error","line":9,"message":"Last USER should not be root"}
            ]"#,
        )
        .unwrap();

        let findings = parse(dir.path()).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].rule, "DL3008");
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[0].location.as_deref(), Some("/inputs/Dockerfile:3"));
        assert_eq!(findings[1].severity, Severity::High);
    }

    #[test]
    fn test_object_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hadolint.json"), r#"{"not":"a list"}"#).unwrap();
        assert!(matches!(parse(dir.path()), Err(ParseError::InvalidPayload { .. })));
    }

    #[test]
    fn test_empty_workspace_has_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(parse(dir.path()), Err(ParseError::MissingArtifacts { .. })));
    }
}
