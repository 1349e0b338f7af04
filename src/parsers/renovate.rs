//! Renovate (refurbish) logs.
//!
//! Renovate emits line-delimited JSON. Updates appear in three shapes:
//! `branchesInformation[].upgrades[]`, `updates[]`, or a bare record with
//! a `depName`. Each update becomes an informational finding.

use std::fs;
use std::path::Path;

use serde_json::Value;

use super::{all_artifacts, Finding, ParseError, ParserId, Severity};

pub const UPDATE_RULE: &str = "dependency-update";

pub fn parse(output: &Path) -> Result<Vec<Finding>, ParseError> {
    let artifacts = all_artifacts(output)?;
    if artifacts.is_empty() {
        return Err(ParseError::MissingArtifacts {
            parser: ParserId::Renovate,
            dir: output.to_path_buf(),
        });
    }

    let mut updates = vec![];
    for artifact in artifacts {
        let content = fs::read_to_string(&artifact)?;
        updates.extend(collect_updates(&content));
    }
    Ok(updates.iter().map(update_finding).collect())
}

/// Pull update records out of a renovate log. Lines that are not JSON
/// objects are skipped.
pub fn collect_updates(log: &str) -> Vec<Value> {
    let mut updates = vec![];
    for line in log.lines().map(str::trim) {
        if !line.starts_with('{') {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(branches) = record.get("branchesInformation").and_then(Value::as_array) {
            for branch in branches {
                if let Some(upgrades) = branch.get("upgrades").and_then(Value::as_array) {
                    updates.extend(upgrades.iter().filter(|u| u.is_object()).cloned());
                }
            }
        } else if let Some(list) = record.get("updates").and_then(Value::as_array) {
            updates.extend(list.iter().filter(|u| u.is_object()).cloned());
        } else if record.get("depName").is_some() {
            updates.push(record);
        }
    }
    updates
}

fn field<'a>(update: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| update.get(*name).and_then(Value::as_str))
}

fn update_finding(update: &Value) -> Finding {
    let dep = field(update, &["depName", "packageName"]).unwrap_or("unknown dependency");
    let message = match field(update, &["newValue", "newVersion"]) {
        Some(new) => format!("{dep}: {new}"),
        None => dep.to_string(),
    };
    Finding {
        rule: UPDATE_RULE.to_string(),
        severity: Severity::Info,
        message,
        location: field(update, &["packageFile"]).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_all_update_shapes() {
        let log = [
            r#"{"depName": "ghcr.io/astral-sh/uv", "newVersion": "0.9.1"}"#,
            r#"{"updates": [{"depName": "ghcr.io/prefix-dev/pixi", "newVersion": "0.63.2"}]}"#,
            r#"{"branchesInformation": [{"upgrades": [{"depName": "python", "newValue": "3.13.2"}]}]}"#,
            "plain text line",
            "{ broken json",
        ]
        .join("\n");

        let updates = collect_updates(&log);
        let names: Vec<_> = updates.iter().filter_map(|u| u["depName"].as_str()).collect();
        assert_eq!(names, vec!["ghcr.io/astral-sh/uv", "ghcr.io/prefix-dev/pixi", "python"]);
    }

    #[test]
    fn test_updates_are_informational() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("refurbish.log"),
            r#"{"depName": "python", "newValue": "3.13.2", "packageFile": "Dockerfile"}"#,
        )
        .unwrap();

        let findings = parse(dir.path()).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Info);
        assert_eq!(findings[0].message, "python: 3.13.2");
        assert_eq!(findings[0].location.as_deref(), Some("Dockerfile"));
    }
}
