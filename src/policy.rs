//! Policy Resolver - Layered Tool Configuration
//!
//! Layers are applied in a fixed order of authority:
//! profile bundle, repository policy, manifest, tool config file, CLI flags.
//! A layer that supplies `tools`/`cli` replaces the previous pair wholesale.
//! Nothing is deep-merged.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{self, CatalogError, Config, ConflictMode, Tool};
use crate::defaults::DefaultBundle;
use crate::hashing;
use crate::parsers::FailOn;
use crate::ENGINE_VERSION;

pub const POLICY_FILENAME: &str = ".library.policy.yaml";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Unknown policy profile: {0}")]
    UnknownProfile(String),

    #[error("{0} override requires both tools and cli")]
    PartialOverride(ConfigAuthority),

    #[error("{authority} redefines tool {tool_id} while conflicts are strict")]
    Conflict {
        authority: ConfigAuthority,
        tool_id: String,
    },

    #[error("Policy requires engine {required}, current is {current}")]
    EngineVersion { required: String, current: String },

    #[error("Invalid {authority} layer: {source}")]
    Catalog {
        authority: ConfigAuthority,
        #[source]
        source: CatalogError,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy document {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// Which layer an effective value came from, lowest authority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAuthority {
    /// Packaged profile bundle
    Profile,
    /// Repository policy file
    Repository,
    /// Manifest `config` block
    Manifest,
    /// Tool-specific config file
    ToolConfig,
    /// Command-line flags
    Cli,
}

impl fmt::Display for ConfigAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigAuthority::Profile => "profile",
            ConfigAuthority::Repository => "repository policy",
            ConfigAuthority::Manifest => "manifest",
            ConfigAuthority::ToolConfig => "tool config",
            ConfigAuthority::Cli => "cli",
        })
    }
}

/// One override layer. Empty blocks mean "no opinion".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Layer {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub cli: BTreeMap<String, String>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, FailOn>,
}

impl Layer {
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        read_yaml(path)
    }

    fn catalog(&self, authority: ConfigAuthority) -> Result<Option<(&[Tool], &BTreeMap<String, String>)>, PolicyError> {
        match (self.tools.is_empty(), self.cli.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => Ok(Some((&self.tools, &self.cli))),
            _ => Err(PolicyError::PartialOverride(authority)),
        }
    }
}

impl From<&Config> for Layer {
    fn from(config: &Config) -> Self {
        Self {
            tools: config.tools.clone(),
            cli: config.cli.clone(),
            thresholds: BTreeMap::new(),
        }
    }
}

/// Repository policy file (`.library.policy.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub min_version: Option<semver::VersionReq>,
    /// Repository-specific profiles, consulted before the built-in names.
    #[serde(default)]
    pub profiles: BTreeMap<String, Layer>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub cli: BTreeMap<String, String>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, FailOn>,
}

impl PolicyFile {
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        read_yaml(path)
    }

    /// Look for `.library.policy.yaml` in `dir`.
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        let candidate = dir.join(POLICY_FILENAME);
        candidate.is_file().then_some(candidate)
    }

    pub fn layer(&self) -> Layer {
        Layer {
            tools: self.tools.clone(),
            cli: self.cli.clone(),
            thresholds: self.thresholds.clone(),
        }
    }

    fn check_engine_version(&self) -> Result<(), PolicyError> {
        let Some(required) = &self.min_version else {
            return Ok(());
        };
        let current = semver::Version::parse(ENGINE_VERSION).map_err(|_| PolicyError::EngineVersion {
            required: required.to_string(),
            current: ENGINE_VERSION.to_string(),
        })?;
        if !required.matches(&current) {
            return Err(PolicyError::EngineVersion {
                required: required.to_string(),
                current: ENGINE_VERSION.to_string(),
            });
        }
        Ok(())
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PolicyError> {
    let content = fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| PolicyError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub profile: Option<String>,
    /// Threshold for the tool behind the command being run.
    pub fail_on: Option<FailOn>,
}

/// Everything the resolver reads. Override files are loaded by the caller.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs<'a> {
    pub bundle: &'a DefaultBundle,
    pub manifest: &'a Config,
    pub repository: Option<&'a PolicyFile>,
    pub tool_config: Option<&'a Layer>,
    pub overrides: &'a CliOverrides,
}

/// Fully resolved tool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub profile: String,
    pub conflicts: ConflictMode,
    pub tools: Vec<Tool>,
    pub cli: BTreeMap<String, String>,
    pub thresholds: BTreeMap<String, FailOn>,
    /// Layer that supplied `tools`/`cli`.
    pub catalog_authority: ConfigAuthority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_on_override: Option<FailOn>,
}

/// Effective record for one logical command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTool {
    pub command: String,
    pub tool: Tool,
    pub fail_on: FailOn,
}

impl EffectiveConfig {
    pub fn for_command(&self, command: &str) -> Result<ResolvedTool, CatalogError> {
        let tool = catalog::lookup(&self.tools, &self.cli, command)?.clone();
        let fail_on = self
            .fail_on_override
            .unwrap_or_else(|| self.thresholds.get(&tool.id).copied().unwrap_or_default());
        Ok(ResolvedTool {
            command: command.to_string(),
            tool,
            fail_on,
        })
    }

    /// SHA-256 over the canonical JSON form, for audit logs.
    pub fn fingerprint(&self) -> Result<String, PolicyError> {
        Ok(hashing::compute_digest(self)?)
    }
}

struct Accumulator {
    tools: Vec<Tool>,
    cli: BTreeMap<String, String>,
    thresholds: BTreeMap<String, FailOn>,
    authority: ConfigAuthority,
    conflicts: ConflictMode,
}

impl Accumulator {
    fn apply(&mut self, layer: &Layer, authority: ConfigAuthority) -> Result<(), PolicyError> {
        if let Some((tools, cli)) = layer.catalog(authority)? {
            catalog::validate_catalog(tools, cli)
                .map_err(|source| PolicyError::Catalog { authority, source })?;
            self.check_conflicts(tools, authority)?;
            tracing::debug!(
                authority = %authority,
                replaced = %self.authority,
                tools = tools.len(),
                "tool catalog replaced"
            );
            self.tools = tools.to_vec();
            self.cli = cli.clone();
            self.authority = authority;
        }
        if !layer.thresholds.is_empty() {
            self.thresholds = layer.thresholds.clone();
        }
        Ok(())
    }

    fn check_conflicts(&self, incoming: &[Tool], authority: ConfigAuthority) -> Result<(), PolicyError> {
        for tool in incoming {
            let Some(previous) = self.tools.iter().find(|t| t.id == tool.id) else {
                continue;
            };
            if previous == tool {
                continue;
            }
            match self.conflicts {
                ConflictMode::Strict => {
                    return Err(PolicyError::Conflict {
                        authority,
                        tool_id: tool.id.clone(),
                    })
                }
                ConflictMode::Warn => tracing::warn!(
                    tool_id = tool.id.as_str(),
                    authority = %authority,
                    previous = %self.authority,
                    "tool definition overridden"
                ),
            }
        }
        Ok(())
    }
}

/// Resolve the effective configuration. Pure over its inputs.
pub fn resolve(inputs: &PolicyInputs<'_>) -> Result<EffectiveConfig, PolicyError> {
    if let Some(repository) = inputs.repository {
        repository.check_engine_version()?;
    }

    let profile = inputs
        .overrides
        .profile
        .clone()
        .or_else(|| inputs.repository.and_then(|r| r.profile.clone()))
        .unwrap_or_else(|| inputs.manifest.policy.clone());

    let base = inputs
        .repository
        .and_then(|r| r.profiles.get(&profile).cloned())
        .or_else(|| inputs.bundle.profile(&profile))
        .ok_or_else(|| PolicyError::UnknownProfile(profile.clone()))?;

    let mut acc = Accumulator {
        tools: vec![],
        cli: BTreeMap::new(),
        thresholds: BTreeMap::new(),
        authority: ConfigAuthority::Profile,
        conflicts: inputs.manifest.conflicts,
    };
    acc.apply(&base, ConfigAuthority::Profile)?;
    if let Some(repository) = inputs.repository {
        acc.apply(&repository.layer(), ConfigAuthority::Repository)?;
    }
    acc.apply(&Layer::from(inputs.manifest), ConfigAuthority::Manifest)?;
    if let Some(tool_config) = inputs.tool_config {
        acc.apply(tool_config, ConfigAuthority::ToolConfig)?;
    }
    if let Some(fail_on) = inputs.overrides.fail_on {
        tracing::debug!(authority = %ConfigAuthority::Cli, ?fail_on, "threshold overridden");
    }

    Ok(EffectiveConfig {
        profile,
        conflicts: acc.conflicts,
        tools: acc.tools,
        cli: acc.cli,
        thresholds: acc.thresholds,
        catalog_authority: acc.authority,
        fail_on_override: inputs.overrides.fail_on,
    })
}
