//! Tool Catalog - Tools, Inputs and CLI Wiring
//!
//! `config.tools` declares containerized tools, `config.cli` maps logical
//! command names onto tool ids. Both are checked together: ids are unique
//! and every CLI target exists.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parsers::ParserId;
use crate::render::{self, RenderError};

/// Fixed in-container directory every tool writes its artifacts to.
pub const CONTAINER_OUTPUTS_PATH: &str = "/outputs/";
pub const DEFAULT_SOURCE: &str = "default";

static TOOL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("tool id pattern is a valid regex")
});

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Tool ids must be unique in config.tools: {0} is declared more than once")]
    DuplicateToolId(String),

    #[error("CLI mapping references unknown tool id: {command} -> {tool_id}")]
    DanglingCliReference { command: String, tool_id: String },

    #[error("Unknown tool command mapping: {0}")]
    UnknownCommand(String),

    #[error("Invalid tool id: {0:?}")]
    InvalidToolId(String),

    #[error("Tool {tool_id}: input {input} destination must be an absolute container path, got {destination:?}")]
    RelativeDestination {
        tool_id: String,
        input: String,
        destination: String,
    },

    #[error("Tool {tool_id}: outputs is fixed to /outputs/, got {actual:?}")]
    InvalidOutputs { tool_id: String, actual: String },

    #[error("Tool {0}: command must contain at least one token")]
    EmptyCommand(String),

    #[error("Tool {0}: image must not be empty")]
    EmptyImage(String),

    #[error("Tool {tool_id}: {source}")]
    Token {
        tool_id: String,
        #[source]
        source: RenderError,
    },
}

/// Where a tool input comes from on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InputSource {
    /// Packaged built-in file shipped with this crate.
    Default,
    /// Host file, relative paths are taken from the manifest directory.
    Path(PathBuf),
}

impl From<String> for InputSource {
    fn from(value: String) -> Self {
        if value == DEFAULT_SOURCE {
            InputSource::Default
        } else {
            InputSource::Path(PathBuf::from(value))
        }
    }
}

impl From<InputSource> for String {
    fn from(value: InputSource) -> Self {
        match value {
            InputSource::Default => DEFAULT_SOURCE.to_string(),
            InputSource::Path(path) => path.to_string_lossy().into_owned(),
        }
    }
}

impl InputSource {
    /// Host path for a non-default source, anchored at `base` when relative.
    pub fn host_path(&self, base: &Path) -> Option<PathBuf> {
        match self {
            InputSource::Default => None,
            InputSource::Path(p) if p.is_absolute() => Some(p.clone()),
            InputSource::Path(p) => Some(base.join(p)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolInput {
    pub source: InputSource,
    pub destination: String,
}

impl ToolInput {
    pub fn packaged(destination: impl Into<String>) -> Self {
        Self {
            source: InputSource::Default,
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tool {
    pub id: String,
    pub parser: ParserId,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, ToolInput>,
    pub socket: bool,
    pub outputs: String,
}

impl Tool {
    pub fn validate(&self) -> Result<(), CatalogError> {
        if !TOOL_ID_PATTERN.is_match(&self.id) {
            return Err(CatalogError::InvalidToolId(self.id.clone()));
        }
        if self.image.trim().is_empty() {
            return Err(CatalogError::EmptyImage(self.id.clone()));
        }
        if self.command.is_empty() {
            return Err(CatalogError::EmptyCommand(self.id.clone()));
        }
        if self.outputs != CONTAINER_OUTPUTS_PATH {
            return Err(CatalogError::InvalidOutputs {
                tool_id: self.id.clone(),
                actual: self.outputs.clone(),
            });
        }
        for (key, input) in &self.inputs {
            if !input.destination.starts_with('/') {
                return Err(CatalogError::RelativeDestination {
                    tool_id: self.id.clone(),
                    input: key.clone(),
                    destination: input.destination.clone(),
                });
            }
        }
        render::check_tokens(&self.command, &self.inputs).map_err(|source| {
            CatalogError::Token {
                tool_id: self.id.clone(),
                source,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    #[default]
    Warn,
    Strict,
}

/// `config` block of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub policy: String,
    pub conflicts: ConflictMode,
    pub tools: Vec<Tool>,
    pub cli: BTreeMap<String, String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), CatalogError> {
        validate_catalog(&self.tools, &self.cli)
    }

    /// Two-step lookup: `cli[command] -> tool id -> tools[]`.
    pub fn resolve(&self, command: &str) -> Result<&Tool, CatalogError> {
        lookup(&self.tools, &self.cli, command)
    }
}

/// Check every tool, id uniqueness (case-sensitive) and CLI targets.
pub fn validate_catalog(tools: &[Tool], cli: &BTreeMap<String, String>) -> Result<(), CatalogError> {
    let mut ids = BTreeSet::new();
    for tool in tools {
        tool.validate()?;
        if !ids.insert(tool.id.as_str()) {
            return Err(CatalogError::DuplicateToolId(tool.id.clone()));
        }
    }

    for (command, tool_id) in cli {
        if !ids.contains(tool_id.as_str()) {
            return Err(CatalogError::DanglingCliReference {
                command: command.clone(),
                tool_id: tool_id.clone(),
            });
        }
    }
    Ok(())
}

pub fn lookup<'a>(
    tools: &'a [Tool],
    cli: &BTreeMap<String, String>,
    command: &str,
) -> Result<&'a Tool, CatalogError> {
    let tool_id = cli
        .get(command)
        .ok_or_else(|| CatalogError::UnknownCommand(command.to_string()))?;

    let mut matches = tools.iter().filter(|t| &t.id == tool_id);
    let tool = matches.next().ok_or_else(|| CatalogError::DanglingCliReference {
        command: command.to_string(),
        tool_id: tool_id.clone(),
    })?;
    if matches.next().is_some() {
        return Err(CatalogError::DuplicateToolId(tool_id.clone()));
    }
    Ok(tool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(id: &str) -> Tool {
        Tool {
            id: id.to_string(),
            parser: ParserId::Trivy,
            image: "docker.io/aquasec/trivy:latest".to_string(),
            command: vec!["trivy".into(), "image".into(), "{{image.reference}}".into()],
            env: BTreeMap::new(),
            inputs: BTreeMap::new(),
            socket: false,
            outputs: CONTAINER_OUTPUTS_PATH.to_string(),
        }
    }

    fn cli(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_resolves_command_to_tool() {
        let tools = vec![tool("default-scanner"), tool("default-linter")];
        let found = lookup(&tools, &cli(&[("scan", "default-scanner")]), "scan").unwrap();
        assert_eq!(found.id, "default-scanner");
    }

    #[test]
    fn test_unknown_command() {
        let tools = vec![tool("default-linter")];
        let err = lookup(&tools, &cli(&[("lint", "default-linter")]), "scan").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownCommand(c) if c == "scan"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = validate_catalog(&[tool("x"), tool("x")], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateToolId(id) if id == "x"));
    }

    #[test]
    fn test_ids_are_case_sensitive() {
        assert!(validate_catalog(&[tool("x"), tool("X")], &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_dangling_cli_reference_rejected() {
        let err = validate_catalog(&[tool("x")], &cli(&[("lint", "ghost")])).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::DanglingCliReference { command, tool_id } if command == "lint" && tool_id == "ghost"
        ));
    }

    #[test]
    fn test_invalid_tool_id_rejected() {
        for bad in ["", "-scanner", ".hidden", "has space"] {
            assert!(matches!(tool(bad).validate(), Err(CatalogError::InvalidToolId(_))), "{bad}");
        }
    }

    #[test]
    fn test_relative_destination_rejected() {
        let mut t = tool("scanner");
        t.inputs.insert("cfg".into(), ToolInput::packaged("config.yaml"));
        assert!(matches!(t.validate(), Err(CatalogError::RelativeDestination { .. })));
    }

    #[test]
    fn test_outputs_is_fixed() {
        let mut t = tool("scanner");
        t.outputs = "/results/".into();
        assert!(matches!(t.validate(), Err(CatalogError::InvalidOutputs { .. })));
    }

    #[test]
    fn test_undeclared_input_token_rejected() {
        let mut t = tool("scanner");
        t.command.push("{{inputs.trivy}}".into());
        assert!(matches!(
            t.validate(),
            Err(CatalogError::Token { source: RenderError::UnknownToken { .. }, .. })
        ));
    }

    #[test]
    fn test_input_source_serde() {
        let input: ToolInput =
            serde_yaml::from_str("source: default\ndestination: /inputs/a.yaml\n").unwrap();
        assert_eq!(input.source, InputSource::Default);

        let input: ToolInput =
            serde_yaml::from_str("source: ./custom.yaml\ndestination: /inputs/a.yaml\n").unwrap();
        assert_eq!(input.source, InputSource::Path(PathBuf::from("./custom.yaml")));
        assert_eq!(
            input.source.host_path(Path::new("/repo")),
            Some(PathBuf::from("/repo/./custom.yaml"))
        );
    }
}
