//! Packaged Defaults - Built-in Tools, Profiles and Config Files
//!
//! The bundle is immutable and versioned with the crate. It is handed to
//! the policy resolver and run director explicitly; nothing here is global
//! mutable state.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::{Config, ConflictMode, Tool, ToolInput, CONTAINER_OUTPUTS_PATH};
use crate::parsers::{FailOn, ParserId};
use crate::policy::Layer;
use crate::workspace;
use crate::ENGINE_VERSION;

pub const DEFAULT_PROFILE: &str = "default";
pub const STRICT_PROFILE: &str = "strict";
pub const EXPERT_PROFILE: &str = "expert";
pub const BUILTIN_PROFILES: [&str; 3] = [DEFAULT_PROFILE, STRICT_PROFILE, EXPERT_PROFILE];

pub const LINTER_ID: &str = "default-linter";
pub const SCANNER_ID: &str = "default-scanner";
pub const REFURBISHER_ID: &str = "default-refurbisher";

/// Input key that resolves to the manifest's own Dockerfile.
pub const DOCKERFILE_INPUT: &str = "dockerfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackagedFile {
    pub key: &'static str,
    pub filename: &'static str,
    pub contents: &'static str,
}

const PACKAGED_FILES: [PackagedFile; 3] = [
    PackagedFile {
        key: "hadolint",
        filename: ".hadolint.yaml",
        contents: include_str!("../assets/hadolint.yaml"),
    },
    PackagedFile {
        key: "trivy",
        filename: "trivy.yaml",
        contents: include_str!("../assets/trivy.yaml"),
    },
    PackagedFile {
        key: "renovate",
        filename: "renovate.json5",
        contents: include_str!("../assets/renovate.json5"),
    },
];

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

pub fn linter() -> Tool {
    Tool {
        id: LINTER_ID.to_string(),
        parser: ParserId::Hadolint,
        image: "docker.io/hadolint/hadolint:latest".to_string(),
        command: argv(&[
            "hadolint",
            "--config",
            "{{inputs.hadolint}}",
            "--format",
            "json",
            "{{inputs.dockerfile}}",
        ]),
        env: BTreeMap::new(),
        inputs: BTreeMap::from([
            ("hadolint".to_string(), ToolInput::packaged("/inputs/.hadolint.yaml")),
            (DOCKERFILE_INPUT.to_string(), ToolInput::packaged("/inputs/Dockerfile")),
        ]),
        socket: false,
        outputs: CONTAINER_OUTPUTS_PATH.to_string(),
    }
}

pub fn scanner() -> Tool {
    Tool {
        id: SCANNER_ID.to_string(),
        parser: ParserId::Trivy,
        image: "docker.io/aquasec/trivy:latest".to_string(),
        command: argv(&[
            "trivy",
            "image",
            "--config",
            "{{inputs.trivy}}",
            "--format",
            "json",
            "--output",
            "/outputs/scan.json",
            "{{image.reference}}",
        ]),
        env: BTreeMap::new(),
        inputs: BTreeMap::from([("trivy".to_string(), ToolInput::packaged("/inputs/trivy.yaml"))]),
        socket: true,
        outputs: CONTAINER_OUTPUTS_PATH.to_string(),
    }
}

pub fn refurbisher() -> Tool {
    Tool {
        id: REFURBISHER_ID.to_string(),
        parser: ParserId::Renovate,
        image: "docker.io/renovate/renovate:latest".to_string(),
        command: argv(&[
            "renovate",
            "--platform=local",
            "--require-config=ignored",
            "--dry-run=full",
        ]),
        env: BTreeMap::from([
            ("LOG_FORMAT".to_string(), "json".to_string()),
            ("LOG_LEVEL".to_string(), "debug".to_string()),
            ("RENOVATE_CONFIG_FILE".to_string(), "/inputs/renovate.json5".to_string()),
        ]),
        inputs: BTreeMap::from([
            ("renovate".to_string(), ToolInput::packaged("/inputs/renovate.json5")),
            (DOCKERFILE_INPUT.to_string(), ToolInput::packaged("/usr/src/app/Dockerfile")),
        ]),
        socket: false,
        outputs: CONTAINER_OUTPUTS_PATH.to_string(),
    }
}

pub fn default_tools() -> Vec<Tool> {
    vec![linter(), scanner(), refurbisher()]
}

pub fn default_cli() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("lint".to_string(), LINTER_ID.to_string()),
        ("scan".to_string(), SCANNER_ID.to_string()),
        ("refurbish".to_string(), REFURBISHER_ID.to_string()),
    ])
}

/// Fully materialized `config` block written by `init`.
pub fn default_config() -> Config {
    Config {
        policy: DEFAULT_PROFILE.to_string(),
        conflicts: ConflictMode::Warn,
        tools: default_tools(),
        cli: default_cli(),
    }
}

fn profile_layer(linter: FailOn, scanner: FailOn) -> Layer {
    Layer {
        tools: default_tools(),
        cli: default_cli(),
        thresholds: BTreeMap::from([
            (LINTER_ID.to_string(), linter),
            (SCANNER_ID.to_string(), scanner),
            (REFURBISHER_ID.to_string(), FailOn::None),
        ]),
    }
}

/// Read-only resource bundle of built-in profiles and config files.
#[derive(Debug, Clone, Copy)]
pub struct DefaultBundle {
    version: &'static str,
    files: &'static [PackagedFile],
}

impl DefaultBundle {
    pub fn packaged() -> Self {
        Self {
            version: ENGINE_VERSION,
            files: &PACKAGED_FILES,
        }
    }

    pub fn profile(&self, name: &str) -> Option<Layer> {
        match name {
            DEFAULT_PROFILE => Some(profile_layer(FailOn::High, FailOn::High)),
            STRICT_PROFILE => Some(profile_layer(FailOn::Medium, FailOn::Medium)),
            EXPERT_PROFILE => Some(profile_layer(FailOn::None, FailOn::Critical)),
            _ => None,
        }
    }

    /// Packaged file for a tool input: by input key first, then by parser.
    pub fn file_for(&self, input_key: &str, parser: ParserId) -> Option<&PackagedFile> {
        self.files
            .iter()
            .find(|f| f.key == input_key)
            .or_else(|| self.files.iter().find(|f| f.key == parser.as_str()))
    }

    pub fn path_for(&self, file: &PackagedFile, root: &Path) -> PathBuf {
        workspace::defaults_root(root).join(self.version).join(file.filename)
    }

    /// Write `file` under `root` so it can be bind-mounted. Existing copies
    /// with identical contents are reused.
    pub fn materialize(&self, file: &PackagedFile, root: &Path) -> io::Result<PathBuf> {
        let path = self.path_for(file, root);
        if fs::read_to_string(&path).is_ok_and(|current| current == file.contents) {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension(format!("{}.partial", std::process::id()));
        fs::write(&staging, file.contents)?;
        fs::rename(&staging, &path)?;
        Ok(path)
    }
}

impl Default for DefaultBundle {
    fn default() -> Self {
        Self::packaged()
    }
}
