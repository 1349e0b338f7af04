//! Generic JSON findings for curate, provenance and push tools.
//!
//! Each `*.json` artifact is either an array of findings or an object with
//! a `findings` array. An object without `findings` is a status record and
//! contributes nothing.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use super::{json_artifacts, Finding, ParseError, ParserId, Severity};

#[derive(Debug, Deserialize)]
struct RawFinding {
    id: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    location: Option<String>,
}

impl From<RawFinding> for Finding {
    fn from(raw: RawFinding) -> Self {
        Finding {
            rule: raw.id,
            severity: raw.severity.as_deref().map_or(Severity::Info, Severity::from_label),
            message: raw.message,
            location: raw.location,
        }
    }
}

pub fn parse(parser: ParserId, output: &Path) -> Result<Vec<Finding>, ParseError> {
    let artifacts = json_artifacts(output)?;
    if artifacts.is_empty() {
        return Err(ParseError::MissingArtifacts {
            parser,
            dir: output.to_path_buf(),
        });
    }

    let mut findings = vec![];
    for artifact in artifacts {
        let payload: Value = serde_json::from_str(&fs::read_to_string(&artifact)?)?;
        let list = match payload {
            Value::Array(items) => Value::Array(items),
            Value::Object(mut map) => map.remove("findings").unwrap_or(Value::Array(vec![])),
            _ => {
                return Err(ParseError::InvalidPayload {
                    parser,
                    artifact,
                    reason: "expected an array or an object".to_string(),
                })
            }
        };
        let raw: Vec<RawFinding> =
            serde_json::from_value(list).map_err(|e| ParseError::InvalidPayload {
                parser,
                artifact: artifact.clone(),
                reason: e.to_string(),
            })?;
        findings.extend(raw.into_iter().map(Finding::from));
    }
    Ok(findings)
}
