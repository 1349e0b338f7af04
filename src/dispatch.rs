//! Command Dispatch - Shared Flow Behind Tool-Backed Commands
//!
//! Every tool-backed command runs the same way:
//! resolve policy -> ensure images -> Run Director -> Parser Registry.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::defaults::DefaultBundle;
use crate::manifest::{Manifest, ManifestError, MetadataSuggestions, Registry, UNKNOWN_REVISION};
use crate::parsers::{self, FailOn, Finding, ParseError, ParserId, Verdict};
use crate::policy::{self, CliOverrides, EffectiveConfig, Layer, PolicyError, PolicyFile, PolicyInputs};
use crate::render;
use crate::runner::{self, ContainerRuntime, RunDirector, RunError, RuntimeError, ToolRunContext};

pub const PUSH_IMAGE_COMMAND: &str = "push";
pub const PUSH_METADATA_COMMAND: &str = "push-metadata";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{} already exists, pass --force to overwrite", .0.display())]
    AlreadyExists(PathBuf),
}

/// Where to find the manifest and its override files.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub manifest: Option<PathBuf>,
    pub policy: Option<PathBuf>,
    pub tools: Option<PathBuf>,
    pub overrides: CliOverrides,
}

/// A loaded manifest with its effective tool configuration.
#[derive(Debug, Clone)]
pub struct Session {
    pub manifest_path: PathBuf,
    pub manifest_dir: PathBuf,
    pub manifest: Manifest,
    pub effective: EffectiveConfig,
}

impl Session {
    pub fn load(options: &SessionOptions, cwd: &Path, bundle: &DefaultBundle) -> Result<Self, DispatchError> {
        // Bind mounts need absolute host paths, so anchor everything here.
        let manifest_path = Manifest::locate(options.manifest.as_deref(), cwd)?
            .canonicalize()
            .map_err(ManifestError::from)?;
        let manifest = Manifest::load(&manifest_path)?;
        let manifest_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ManifestError::NotFound(manifest_path.clone()))?;
        tracing::debug!(manifest = %manifest_path.display(), "manifest loaded");

        let repository = match &options.policy {
            Some(path) => Some(PolicyFile::load(path)?),
            None => PolicyFile::discover(&manifest_dir)
                .map(|path| PolicyFile::load(&path))
                .transpose()?,
        };
        let tool_config = options.tools.as_deref().map(Layer::load).transpose()?;

        let effective = policy::resolve(&PolicyInputs {
            bundle,
            manifest: &manifest.config,
            repository: repository.as_ref(),
            tool_config: tool_config.as_ref(),
            overrides: &options.overrides,
        })?;

        Ok(Self {
            manifest_path,
            manifest_dir,
            manifest,
            effective,
        })
    }

    /// Reference passed to `{{image.reference}}`: the explicit subject, the
    /// manifest's first tag when the tool needs one, otherwise a placeholder.
    fn image_reference(&self, command: &str, uses_image: bool, subject: Option<&str>) -> String {
        match subject {
            Some(image) => image.to_string(),
            None if uses_image => self
                .manifest
                .image_tags()
                .into_iter()
                .next()
                .unwrap_or_else(|| format!("unused-for-{command}")),
            None => format!("unused-for-{command}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub tool: String,
    pub parser: ParserId,
    pub image_reference: String,
    pub workspace: PathBuf,
    pub exit_code: i32,
    pub fail_on: FailOn,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    pub manifest_digest: String,
    pub config_fingerprint: String,
}

impl CommandReport {
    /// Process exit code for this report.
    pub fn status(&self) -> u8 {
        self.verdict.exit_code()
    }
}

/// Run the tool mapped to `command` and interpret its artifacts.
pub fn run_tool_command(
    session: &Session,
    command: &str,
    subject: Option<&str>,
    runtime: &dyn ContainerRuntime,
    bundle: &DefaultBundle,
) -> Result<CommandReport, DispatchError> {
    let resolved = session.effective.for_command(command)?;
    let tool = &resolved.tool;
    tracing::info!(command, tool_id = tool.id.as_str(), fail_on = ?resolved.fail_on, "command resolved");

    runner::ensure_image(runtime, &tool.image)?;
    let uses_image = render::uses_image_reference(&tool.command);
    let image_reference = session.image_reference(command, uses_image, subject);
    if uses_image {
        runner::ensure_image(runtime, &image_reference)?;
    }

    let context = ToolRunContext::for_manifest(&session.manifest, &session.manifest_dir, image_reference.clone());
    let result = RunDirector::new(runtime, bundle).run(tool, &context)?;
    let (findings, verdict) = parsers::assess(tool.parser, &result, resolved.fail_on)?;
    tracing::info!(command, tool_id = tool.id.as_str(), ?verdict, findings = findings.len(), "command finished");

    Ok(CommandReport {
        command: command.to_string(),
        tool: tool.id.clone(),
        parser: tool.parser,
        image_reference,
        workspace: result.output,
        exit_code: result.exit_code,
        fail_on: resolved.fail_on,
        verdict,
        findings,
        manifest_digest: session.manifest.digest()?,
        config_fingerprint: session.effective.fingerprint()?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPhase {
    Image,
    Metadata,
    All,
}

impl PushPhase {
    pub fn commands(&self) -> &'static [&'static str] {
        match self {
            PushPhase::Image => &[PUSH_IMAGE_COMMAND],
            PushPhase::Metadata => &[PUSH_METADATA_COMMAND],
            PushPhase::All => &[PUSH_IMAGE_COMMAND, PUSH_METADATA_COMMAND],
        }
    }
}

/// Run each phase in turn, stopping at the first that does not pass.
pub fn run_push(
    session: &Session,
    phase: PushPhase,
    runtime: &dyn ContainerRuntime,
    bundle: &DefaultBundle,
) -> Result<Vec<CommandReport>, DispatchError> {
    let mut reports = Vec::new();
    for command in phase.commands() {
        let report = run_tool_command(session, command, None, runtime, bundle)?;
        let passed = report.verdict.passed();
        reports.push(report);
        if !passed {
            tracing::warn!(command, "push phase did not pass, skipping remaining phases");
            break;
        }
    }
    Ok(reports)
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub argv: Vec<String>,
    pub tags: Vec<String>,
    pub exit_code: i32,
}

/// `docker buildx build` on the host with inherited stdio.
pub fn run_build(session: &Session, extra_args: &[String]) -> Result<BuildReport, DispatchError> {
    let argv = session.manifest.build_command(&session.manifest_dir, extra_args)?;
    tracing::info!(argv = %argv.join(" "), "building image");
    let exit_code = runner::run_host(&argv)?;
    Ok(BuildReport {
        argv,
        tags: session.manifest.image_tags(),
        exit_code,
    })
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub path: PathBuf,
    pub registry: Registry,
    pub title: Option<String>,
    pub force: bool,
}

/// Write a fully materialized manifest with the default tool catalog.
pub fn init(options: &InitOptions, created: DateTime<Utc>) -> Result<Manifest, DispatchError> {
    if options.path.exists() && !options.force {
        return Err(DispatchError::AlreadyExists(options.path.clone()));
    }
    let mut manifest = Manifest::scaffold(options.registry.clone(), created);
    if let Some(title) = &options.title {
        manifest.metadata.discovery.title = title.clone();
    }
    let dir = options
        .path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let suggestions = MetadataSuggestions {
        revision: git_revision(dir),
        ..MetadataSuggestions::default()
    };
    manifest.metadata.discovery = manifest.metadata.discovery.with_suggestions(suggestions);
    manifest.save(&options.path)?;
    tracing::info!(path = %options.path.display(), "manifest written");
    Ok(manifest)
}

/// HEAD revision of the git checkout containing `dir`, if any.
pub fn git_revision(dir: &Path) -> Option<String> {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|rev| !rev.is_empty() && rev != UNKNOWN_REVISION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn init_options(dir: &Path) -> InitOptions {
        InitOptions {
            path: dir.join(crate::manifest::MANIFEST_FILENAME),
            registry: Registry {
                host: "images.canfar.net".into(),
                project: "library".into(),
                image: "sample-image".into(),
            },
            title: Some("Sample".into()),
            force: false,
        }
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let options = init_options(dir.path());
        let created = Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap();

        let manifest = init(&options, created).unwrap();
        assert_eq!(manifest.metadata.discovery.title, "Sample");
        assert_eq!(Manifest::load(&options.path).unwrap(), manifest);

        assert!(matches!(init(&options, created), Err(DispatchError::AlreadyExists(_))));
        let forced = InitOptions { force: true, ..options };
        assert!(init(&forced, created).is_ok());
    }

    #[test]
    fn test_push_phases() {
        assert_eq!(PushPhase::Image.commands(), &["push"]);
        assert_eq!(PushPhase::Metadata.commands(), &["push-metadata"]);
        assert_eq!(PushPhase::All.commands(), &["push", "push-metadata"]);
    }

    #[test]
    fn test_session_discovers_manifest_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let created = Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap();
        init(&init_options(dir.path()), created).unwrap();
        std::fs::write(
            dir.path().join(crate::policy::POLICY_FILENAME),
            "profile: strict\n",
        )
        .unwrap();

        let bundle = DefaultBundle::packaged();
        let session = Session::load(&SessionOptions::default(), dir.path(), &bundle).unwrap();
        assert_eq!(session.manifest_dir, dir.path().canonicalize().unwrap());
        assert_eq!(session.effective.profile, "strict");
    }

    #[test]
    fn test_placeholder_image_reference() {
        let dir = tempfile::tempdir().unwrap();
        let created = Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap();
        init(&init_options(dir.path()), created).unwrap();
        let bundle = DefaultBundle::packaged();
        let session = Session::load(&SessionOptions::default(), dir.path(), &bundle).unwrap();

        assert_eq!(session.image_reference("lint", false, None), "unused-for-lint");
        assert_eq!(
            session.image_reference("scan", true, None),
            "images.canfar.net/library/sample-image:latest"
        );
        assert_eq!(session.image_reference("scan", true, Some("alpine:3.20")), "alpine:3.20");
    }
}
