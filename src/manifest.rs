//! Manifest Model - Closed, Versioned Document
//!
//! Readers never fill in defaults. A manifest on disk is expected to be
//! fully materialized; only `scaffold` and `save` produce defaults.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::catalog::{CatalogError, Config};
use crate::defaults;
use crate::hashing;

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILENAME: &str = ".library.manifest.yaml";
pub const MANIFEST_FILENAME_ALT: &str = ".library.manifest.yml";
pub const UNKNOWN_REVISION: &str = "unknown";
pub const MAX_DESCRIPTION_LEN: usize = 255;

/// buildx flags owned by the manifest; `build.options` may not repeat them.
const RESERVED_BUILD_FLAGS: [&str; 9] = [
    "--file",
    "-f",
    "--tag",
    "-t",
    "--platform",
    "--label",
    "--annotation",
    "--output",
    "-o",
];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("No manifest provided and none found in {}. Expected ./{MANIFEST_FILENAME}", .0.display())]
    NotDiscovered(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest schema error: {0}")]
    Schema(String),

    #[error("Invalid tool configuration: {0}")]
    Catalog(#[from] CatalogError),

    #[error("build options cannot include {0}")]
    BuildOptionOverlap(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Digest error: {0}")]
    Digest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: u32,
    pub registry: Registry,
    pub build: Build,
    pub metadata: Metadata,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registry {
    pub host: String,
    pub project: String,
    pub image: String,
}

impl Registry {
    pub fn repository(&self) -> String {
        format!("{}/{}/{}", self.host, self.project, self.image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Build {
    pub context: String,
    pub file: String,
    pub platforms: Vec<String>,
    pub tags: Vec<String>,
    pub output: String,
    pub options: String,
}

impl Build {
    pub fn new(tags: Vec<String>) -> Self {
        Self {
            context: ".".to_string(),
            file: "Dockerfile".to_string(),
            platforms: vec!["linux/amd64".to_string()],
            tags,
            output: "type=docker".to_string(),
            options: String::new(),
        }
    }

    /// `options` split with POSIX shell quoting.
    pub fn option_tokens(&self) -> Result<Vec<String>, ManifestError> {
        shlex::split(&self.options).ok_or_else(|| {
            ManifestError::Schema(format!("build.options has unbalanced quoting: {}", self.options))
        })
    }

    /// Build context on the host.
    pub fn context_path(&self, manifest_dir: &Path) -> PathBuf {
        manifest_dir.join(&self.context)
    }

    /// Dockerfile on the host; relative files live inside the context.
    pub fn dockerfile_path(&self, manifest_dir: &Path) -> PathBuf {
        let file = Path::new(&self.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.context_path(manifest_dir).join(file)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub discovery: Discovery,
}

/// Optional value whose key must still be written out, as `null` if unset.
fn explicit<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Notebook,
    Headless,
    Carta,
    Firefly,
    Contributed,
    Desktop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Author {
    pub name: String,
    pub email: String,
    pub role: String,
    #[serde(deserialize_with = "explicit")]
    pub github: Option<String>,
    #[serde(deserialize_with = "explicit")]
    pub gitlab: Option<String>,
    #[serde(deserialize_with = "explicit")]
    pub orcid: Option<String>,
    #[serde(deserialize_with = "explicit")]
    pub affiliation: Option<String>,
}

impl Author {
    pub fn maintainer(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            role: "maintainer".to_string(),
            github: None,
            gitlab: None,
            orcid: None,
            affiliation: None,
        }
    }
}

/// Discovery metadata, mapped onto OCI labels at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Discovery {
    pub title: String,
    pub description: String,
    pub source: String,
    #[serde(deserialize_with = "explicit")]
    pub url: Option<String>,
    #[serde(deserialize_with = "explicit")]
    pub documentation: Option<String>,
    pub version: String,
    pub revision: String,
    pub created: DateTime<Utc>,
    pub authors: Vec<Author>,
    /// SPDX license expression.
    pub licenses: String,
    pub keywords: Vec<String>,
    pub domain: Vec<String>,
    pub kind: Vec<Kind>,
    pub tools: Vec<String>,
    pub deprecated: bool,
}

/// Values imported from elsewhere (git, registries). They only fill gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataSuggestions {
    pub revision: Option<String>,
    pub url: Option<String>,
    pub documentation: Option<String>,
    pub keywords: Vec<String>,
    pub tools: Vec<String>,
}

impl Discovery {
    /// Manifest values are canonical. A suggestion is used only where the
    /// manifest still holds a placeholder.
    pub fn with_suggestions(mut self, suggestions: MetadataSuggestions) -> Self {
        if self.revision == UNKNOWN_REVISION {
            if let Some(revision) = suggestions.revision {
                self.revision = revision;
            }
        }
        if self.url.is_none() {
            self.url = suggestions.url;
        }
        if self.documentation.is_none() {
            self.documentation = suggestions.documentation;
        }
        if self.keywords.is_empty() {
            self.keywords = suggestions.keywords;
        }
        if self.tools.is_empty() {
            self.tools = suggestions.tools;
        }
        self
    }

    fn validate(&self) -> Result<(), ManifestError> {
        require_text("metadata.discovery.title", &self.title)?;
        require_text("metadata.discovery.version", &self.version)?;
        require_text("metadata.discovery.licenses", &self.licenses)?;
        let len = self.description.chars().count();
        if len == 0 || len > MAX_DESCRIPTION_LEN {
            return Err(ManifestError::Schema(format!(
                "metadata.discovery.description must be 1..={MAX_DESCRIPTION_LEN} characters, got {len}"
            )));
        }
        require_url("metadata.discovery.source", &self.source)?;
        if let Some(url) = &self.url {
            require_url("metadata.discovery.url", url)?;
        }
        if let Some(documentation) = &self.documentation {
            require_url("metadata.discovery.documentation", documentation)?;
        }
        require_non_empty("metadata.discovery.authors", &self.authors)?;
        require_non_empty("metadata.discovery.kind", &self.kind)?;
        require_non_empty("metadata.discovery.domain", &self.domain)?;
        for author in &self.authors {
            require_text("metadata.discovery.authors[].name", &author.name)?;
            require_text("metadata.discovery.authors[].email", &author.email)?;
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> Result<(), ManifestError> {
    if value.trim().is_empty() {
        return Err(ManifestError::Schema(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_non_empty<T>(field: &str, values: &[T]) -> Result<(), ManifestError> {
    if values.is_empty() {
        return Err(ManifestError::Schema(format!("{field} must contain at least one entry")));
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> Result<(), ManifestError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ManifestError::Schema(format!("{field} is not a valid URL ({value}): {e}")))
}

impl Manifest {
    /// Placeholder manifest for `init`, with the default tool catalog.
    pub fn scaffold(registry: Registry, created: DateTime<Utc>) -> Self {
        let discovery = Discovery {
            title: registry.image.clone(),
            description: format!("Container image for {}.", registry.image),
            source: format!("https://github.com/{}/{}", registry.project, registry.image),
            url: None,
            documentation: None,
            version: "0.1.0".to_string(),
            revision: UNKNOWN_REVISION.to_string(),
            created,
            authors: vec![Author::maintainer("Library Maintainer", "maintainer@example.com")],
            licenses: "MIT".to_string(),
            keywords: vec![],
            domain: vec!["astronomy".to_string()],
            kind: vec![Kind::Headless],
            tools: vec![],
            deprecated: false,
        };
        Self {
            version: MANIFEST_VERSION,
            registry,
            build: Build::new(vec!["latest".to_string()]),
            metadata: Metadata { discovery },
            config: defaults::default_config(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ManifestError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| ManifestError::Schema(e.to_string()))?;
        if !value.is_mapping() {
            return Err(ManifestError::Schema("Manifest must be a mapping".to_string()));
        }
        let manifest: Manifest =
            serde_yaml::from_value(value).map_err(|e| ManifestError::Schema(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.is_file() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write every field, optional ones included, so readers never need
    /// defaults.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::Schema(format!(
                "version must be {MANIFEST_VERSION}, got {}",
                self.version
            )));
        }
        require_text("registry.host", &self.registry.host)?;
        require_text("registry.project", &self.registry.project)?;
        require_text("registry.image", &self.registry.image)?;
        require_non_empty("build.tags", &self.build.tags)?;
        require_non_empty("build.platforms", &self.build.platforms)?;
        self.build.option_tokens()?;
        self.metadata.discovery.validate()?;
        self.config.validate()?;
        Ok(())
    }

    /// Look for `.library.manifest.yaml` then `.library.manifest.yml`.
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        [MANIFEST_FILENAME, MANIFEST_FILENAME_ALT]
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Explicit path (relative to `cwd`) if given, otherwise discovery in `cwd`.
    pub fn locate(explicit: Option<&Path>, cwd: &Path) -> Result<PathBuf, ManifestError> {
        match explicit {
            Some(path) if cwd.join(path).is_file() => Ok(cwd.join(path)),
            Some(path) => Err(ManifestError::NotFound(cwd.join(path))),
            None => Self::discover(cwd).ok_or_else(|| ManifestError::NotDiscovered(cwd.to_path_buf())),
        }
    }

    /// Tags qualified with the registry; references that already carry a
    /// registry, tag or digest are kept as written.
    pub fn image_tags(&self) -> Vec<String> {
        let repository = self.registry.repository();
        self.build
            .tags
            .iter()
            .map(|tag| {
                if tag.contains(['/', ':', '@']) {
                    tag.clone()
                } else {
                    format!("{repository}:{tag}")
                }
            })
            .collect()
    }

    /// `docker buildx build` argv for this manifest.
    pub fn build_command(
        &self,
        manifest_dir: &Path,
        extra_args: &[String],
    ) -> Result<Vec<String>, ManifestError> {
        let mut options = self.build.option_tokens()?;
        options.extend(extra_args.iter().cloned());
        if let Some(flag) = reserved_flag(&options) {
            return Err(ManifestError::BuildOptionOverlap(flag));
        }

        let mut cmd = vec!["docker".to_string(), "buildx".to_string(), "build".to_string()];
        cmd.push("--file".to_string());
        cmd.push(self.build.dockerfile_path(manifest_dir).to_string_lossy().into_owned());
        for tag in self.image_tags() {
            cmd.push("--tag".to_string());
            cmd.push(tag);
        }
        for platform in &self.build.platforms {
            cmd.push("--platform".to_string());
            cmd.push(platform.clone());
        }
        cmd.push("--output".to_string());
        cmd.push(self.build.output.clone());
        cmd.extend(options);
        cmd.push(self.build.context_path(manifest_dir).to_string_lossy().into_owned());
        Ok(cmd)
    }

    pub fn digest(&self) -> Result<String, ManifestError> {
        Ok(hashing::compute_digest(self)?)
    }
}

fn reserved_flag(tokens: &[String]) -> Option<String> {
    tokens.iter().find_map(|token| {
        let flag = token.split_once('=').map_or(token.as_str(), |(flag, _)| flag);
        RESERVED_BUILD_FLAGS.contains(&flag).then(|| flag.to_string())
    })
}
