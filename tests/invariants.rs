//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{Duration, TimeZone, Utc};

use librarytools_core::{
    catalog::{CatalogError, Config, ConflictMode, Tool, ToolInput, CONTAINER_OUTPUTS_PATH},
    defaults::{self, DefaultBundle},
    dispatch::{self, Session, SessionOptions},
    manifest::{Manifest, ManifestError, Registry, MANIFEST_FILENAME},
    parsers::{self, FailOn, Finding, ParserId, Severity, Verdict},
    render::{self, RenderError},
    runner::{
        self, ContainerRuntime, ContainerSpec, MountMode, ProcessOutput, RunDirector, RuntimeError,
        ToolRunContext, DOCKER_SOCKET_PATH,
    },
    workspace,
};

const ALPINE: &str = "docker.io/library/alpine:3.20";

const CRITICAL_REPORT: &str = r#"{
  "Results": [
    {
      "Target": "alpine:3.20 (alpine 3.20.0)",
      "Vulnerabilities": [
        {
          "VulnerabilityID": "CVE-2024-5535",
          "PkgName": "libssl3",
          "InstalledVersion": "3.3.0-r2",
          "Severity": "CRITICAL",
          "Title": "openssl: SSL_select_next_proto buffer overread"
        }
      ]
    }
  ]
}"#;

/// Records every container it is asked to start and writes `artifact`
/// into the mounted workspace, the way a real tool would.
#[derive(Default)]
struct FakeRuntime {
    artifact: Option<(&'static str, &'static str)>,
    exit_code: i32,
    pulled: RefCell<Vec<String>>,
    runs: RefCell<Vec<ContainerSpec>>,
}

impl FakeRuntime {
    fn writing(filename: &'static str, contents: &'static str) -> Self {
        Self {
            artifact: Some((filename, contents)),
            ..Self::default()
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        Ok(reference != ALPINE)
    }

    fn pull(&self, reference: &str) -> Result<(), RuntimeError> {
        self.pulled.borrow_mut().push(reference.to_string());
        Ok(())
    }

    fn run(&self, spec: &ContainerSpec) -> Result<ProcessOutput, RuntimeError> {
        self.runs.borrow_mut().push(spec.clone());
        if let Some((filename, contents)) = self.artifact {
            let outputs = spec
                .mounts
                .iter()
                .find(|m| m.container == CONTAINER_OUTPUTS_PATH)
                .expect("workspace is always mounted");
            fs::write(outputs.host.join(filename), contents).unwrap();
        }
        Ok(ProcessOutput {
            exit_code: self.exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn scenario_scanner() -> Tool {
    Tool {
        id: "default-scanner".to_string(),
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

fn scenario_manifest() -> Manifest {
    let mut manifest = Manifest::scaffold(
        Registry {
            host: "images.canfar.net".to_string(),
            project: "library".to_string(),
            image: "sample-image".to_string(),
        },
        Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap(),
    );
    manifest.config = Config {
        policy: "default".to_string(),
        conflicts: ConflictMode::Warn,
        tools: vec![scenario_scanner()],
        cli: BTreeMap::from([("scan".to_string(), "default-scanner".to_string())]),
    };
    manifest
}

/// Serialize without validating, then read back through the loader.
fn reload(manifest: &Manifest) -> Result<Manifest, ManifestError> {
    Manifest::from_yaml_str(&manifest.to_yaml_string().unwrap())
}

fn write_manifest(dir: &Path, manifest: &Manifest) {
    manifest.save(&dir.join(MANIFEST_FILENAME)).unwrap();
}

#[test]
fn invariant_manifest_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(MANIFEST_FILENAME);

    for manifest in [scenario_manifest(), {
        let mut m = scenario_manifest();
        m.config = defaults::default_config();
        m.metadata.discovery.url = Some("https://example.org/sample".to_string());
        m
    }] {
        manifest.save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), manifest);
    }
}

#[test]
fn invariant_duplicate_tool_ids_rejected_at_load() {
    let mut manifest = scenario_manifest();
    manifest.config.tools = vec![scenario_scanner(), scenario_scanner()];
    for tool in &mut manifest.config.tools {
        tool.id = "x".to_string();
    }
    manifest.config.cli.clear();

    let err = reload(&manifest).unwrap_err();
    assert!(matches!(err, ManifestError::Catalog(CatalogError::DuplicateToolId(id)) if id == "x"));
}

#[test]
fn invariant_dangling_cli_reference_rejected_at_load() {
    let mut manifest = scenario_manifest();
    manifest.config.cli = BTreeMap::from([("lint".to_string(), "ghost".to_string())]);

    let err = reload(&manifest).unwrap_err();
    assert!(matches!(
        err,
        ManifestError::Catalog(CatalogError::DanglingCliReference { tool_id, .. }) if tool_id == "ghost"
    ));
}

#[test]
fn invariant_undeclared_input_token_rejected_at_load() {
    let mut manifest = scenario_manifest();
    manifest.config.tools[0].command.push("{{inputs.missing}}".to_string());

    let err = reload(&manifest).unwrap_err();
    assert!(matches!(
        err,
        ManifestError::Catalog(CatalogError::Token {
            source: RenderError::UnknownToken { ref token },
            ..
        }) if token == "inputs.missing"
    ));
}

#[test]
fn invariant_unknown_parser_rejected_at_load() {
    let yaml = scenario_manifest()
        .to_yaml_string()
        .unwrap()
        .replace("parser: trivy", "parser: grype");
    assert!(matches!(Manifest::from_yaml_str(&yaml), Err(ManifestError::Schema(_))));
}

#[test]
fn invariant_render_is_idempotent() {
    let tool = scenario_scanner();
    let once = render::render(&tool, ALPINE).unwrap();
    let values = render::TokenValues::for_tool(&tool, ALPINE);
    assert_eq!(render::render_argv(&once, &values).unwrap(), once);
}

#[test]
fn invariant_workspaces_never_collide() {
    let dir = tempfile::tempdir().unwrap();
    let first = Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap();
    let second = first + Duration::nanoseconds(1);

    let a = workspace::create(dir.path(), "default-scanner", &first).unwrap();
    let b = workspace::create(dir.path(), "default-scanner", &second).unwrap();
    assert_ne!(a, b);
    assert!(a < b);
    assert!(a.starts_with(dir.path().join("outputs").join("default-scanner")));
}

#[test]
fn invariant_socket_mounted_only_on_request() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Dockerfile"), "FROM alpine:3.20\n").unwrap();
    let runtime = FakeRuntime::default();
    let bundle = DefaultBundle::packaged();
    let director = RunDirector::new(&runtime, &bundle);
    let context = ToolRunContext {
        manifest_dir: dir.path().to_path_buf(),
        dockerfile: dir.path().join("Dockerfile"),
        image_reference: ALPINE.to_string(),
        run_time: Utc::now(),
    };

    let mut tool = scenario_scanner();
    tool.socket = false;
    director.run(&tool, &context).unwrap();
    director.run(&defaults::linter(), &context).unwrap();

    for spec in runtime.runs.borrow().iter() {
        assert!(spec.mounts.iter().all(|m| m.container != DOCKER_SOCKET_PATH
            && m.host != Path::new(DOCKER_SOCKET_PATH)));
        for mount in &spec.mounts {
            let expected = if mount.container == CONTAINER_OUTPUTS_PATH {
                MountMode::ReadWrite
            } else {
                MountMode::ReadOnly
            };
            assert_eq!(mount.mode, expected, "{}", mount.container);
        }
    }
}

#[test]
fn invariant_scan_scenario() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), &scenario_manifest());
    let bundle = DefaultBundle::packaged();
    let session = Session::load(&SessionOptions::default(), dir.path(), &bundle).unwrap();
    let runtime = FakeRuntime::writing("scan.json", CRITICAL_REPORT);

    let report = dispatch::run_tool_command(&session, "scan", Some(ALPINE), &runtime, &bundle).unwrap();

    let runs = runtime.runs.borrow();
    let spec = &runs[0];
    assert_eq!(spec.image, "docker.io/aquasec/trivy:latest");
    assert_eq!(spec.argv.last().map(String::as_str), Some(ALPINE));
    assert!(spec.argv.windows(2).any(|w| w == ["--format", "json"]));
    assert!(spec.argv.contains(&"/inputs/trivy.yaml".to_string()));

    let config = spec
        .mounts
        .iter()
        .find(|m| m.container == "/inputs/trivy.yaml")
        .unwrap();
    assert_eq!(config.mode, MountMode::ReadOnly);
    assert_eq!(fs::read_to_string(&config.host).unwrap(), include_str!("../assets/trivy.yaml"));
    assert!(spec.mounts.iter().any(|m| m.container == DOCKER_SOCKET_PATH));
    assert_eq!(*runtime.pulled.borrow(), vec![ALPINE.to_string()]);

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].severity, Severity::Critical);
    assert_eq!(report.verdict, Verdict::Blocked { blocking: 1, fail_on: FailOn::High });
    assert_ne!(report.status(), 0);
    assert!(report.workspace.join("scan.json").is_file());
}

#[test]
fn invariant_mount_sources_are_absolute() {
    let dir = tempfile::tempdir_in(".").unwrap();
    let relative = dir.path().strip_prefix(".").unwrap_or(dir.path()).to_path_buf();
    assert!(relative.is_relative());
    write_manifest(&relative, &scenario_manifest());

    let bundle = DefaultBundle::packaged();
    let options = SessionOptions {
        manifest: Some(MANIFEST_FILENAME.into()),
        ..SessionOptions::default()
    };
    let session = Session::load(&options, &relative, &bundle).unwrap();
    assert!(session.manifest_dir.is_absolute());

    let runtime = FakeRuntime::writing("scan.json", CRITICAL_REPORT);
    let report = dispatch::run_tool_command(&session, "scan", Some(ALPINE), &runtime, &bundle).unwrap();
    assert!(report.workspace.is_absolute());

    let runs = runtime.runs.borrow();
    assert!(!runs[0].mounts.is_empty());
    for mount in &runs[0].mounts {
        assert!(mount.host.is_absolute(), "{}", mount.host.display());
    }
}

#[test]
fn invariant_thresholds_come_from_policy() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), &scenario_manifest());
    fs::write(
        dir.path().join(".library.policy.yaml"),
        "thresholds:\n  default-scanner: none\n",
    )
    .unwrap();
    let bundle = DefaultBundle::packaged();
    let session = Session::load(&SessionOptions::default(), dir.path(), &bundle).unwrap();
    let runtime = FakeRuntime::writing("scan.json", CRITICAL_REPORT);

    let report = dispatch::run_tool_command(&session, "scan", Some(ALPINE), &runtime, &bundle).unwrap();
    assert_eq!(report.findings.len(), 1);
    assert!(report.verdict.passed());
    assert_eq!(report.status(), 0);
}

#[test]
fn invariant_unknown_command_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), &scenario_manifest());
    let bundle = DefaultBundle::packaged();
    let session = Session::load(&SessionOptions::default(), dir.path(), &bundle).unwrap();
    let runtime = FakeRuntime::default();

    let err = dispatch::run_tool_command(&session, "lint", None, &runtime, &bundle).unwrap_err();
    assert!(matches!(
        err,
        dispatch::DispatchError::Catalog(CatalogError::UnknownCommand(c)) if c == "lint"
    ));
    assert!(runtime.runs.borrow().is_empty());
}

#[test]
fn invariant_tool_crash_is_not_a_finding() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), &scenario_manifest());
    let bundle = DefaultBundle::packaged();
    let session = Session::load(&SessionOptions::default(), dir.path(), &bundle).unwrap();
    let runtime = FakeRuntime {
        exit_code: 125,
        ..FakeRuntime::default()
    };

    let report = dispatch::run_tool_command(&session, "scan", Some(ALPINE), &runtime, &bundle).unwrap();
    assert_eq!(report.verdict, Verdict::ToolFailed { exit_code: 125 });
    assert_eq!(report.status(), 3);
}

#[test]
fn invariant_report_severity_policy() {
    let finding = |severity| Finding {
        rule: "rule".to_string(),
        severity,
        message: "message".to_string(),
        location: None,
    };
    assert_ne!(parsers::report(&[finding(Severity::Critical)], FailOn::High).exit_code(), 0);
    assert_eq!(
        parsers::report(&[finding(Severity::Medium), finding(Severity::Info)], FailOn::High).exit_code(),
        0
    );
    assert_eq!(parsers::report(&[], FailOn::High).exit_code(), 0);
}

#[test]
fn invariant_ensure_image_pulls_only_missing() {
    let runtime = FakeRuntime::default();
    runner::ensure_image(&runtime, "docker.io/aquasec/trivy:latest").unwrap();
    runner::ensure_image(&runtime, ALPINE).unwrap();
    assert_eq!(*runtime.pulled.borrow(), vec![ALPINE.to_string()]);
}
