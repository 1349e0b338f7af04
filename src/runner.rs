//! Run Director - One Containerized Tool Invocation
//!
//! PENDING -> WORKSPACE_STAGED -> INPUTS_RESOLVED -> CONTAINER_RUNNING -> COMPLETED | FAILED
//!
//! COMPLETED means the process ran to termination; its exit code is not
//! interpreted here. FAILED means the container runtime could not be invoked.
//! Nothing is retried.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::{CatalogError, InputSource, Tool, CONTAINER_OUTPUTS_PATH};
use crate::defaults::{DefaultBundle, DOCKERFILE_INPUT};
use crate::manifest::Manifest;
use crate::render::{self, RenderError};
use crate::workspace;

pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

const RUNTIME_PROGRAMS: [&str; 2] = ["docker", "podman"];

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to invoke {program}: {source}. Install Docker or Podman and make sure the daemon is running")]
    Unavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to pull {reference}: {stderr}. Check the image reference and registry credentials")]
    Pull { reference: String, stderr: String },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to create workspace {}: {source}", path.display())]
    WorkspaceCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool {tool_id}: input {input} could not be resolved: {reason}")]
    MissingInput {
        tool_id: String,
        input: String,
        reason: String,
    },

    #[error("Invalid tool: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Container invocation failed: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    WorkspaceStaged,
    InputsResolved,
    ContainerRunning,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Pending => "PENDING",
            RunState::WorkspaceStaged => "WORKSPACE_STAGED",
            RunState::InputsResolved => "INPUTS_RESOLVED",
            RunState::ContainerRunning => "CONTAINER_RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        })
    }
}

struct StateTrace<'a> {
    tool_id: &'a str,
    state: Cell<RunState>,
}

impl<'a> StateTrace<'a> {
    fn new(tool_id: &'a str) -> Self {
        tracing::debug!(tool_id, state = %RunState::Pending, "run started");
        Self {
            tool_id,
            state: Cell::new(RunState::Pending),
        }
    }

    fn advance(&self, next: RunState) {
        tracing::debug!(tool_id = self.tool_id, from = %self.state.get(), to = %next, "run state");
        self.state.set(next);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub mode: MountMode,
}

impl Mount {
    /// `--mount` value for the Docker CLI.
    pub fn to_arg(&self) -> String {
        let mut arg = format!(
            "type=bind,source={},target={}",
            self.host.display(),
            self.container
        );
        if self.mode == MountMode::ReadOnly {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// Everything a runtime needs to start one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub image: String,
    pub argv: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Host container runtime. Calls block until the process terminates.
pub trait ContainerRuntime {
    fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;
    fn pull(&self, reference: &str) -> Result<(), RuntimeError>;
    fn run(&self, spec: &ContainerSpec) -> Result<ProcessOutput, RuntimeError>;
}

/// Pull `reference` unless the runtime already has it.
pub fn ensure_image(runtime: &dyn ContainerRuntime, reference: &str) -> Result<(), RuntimeError> {
    if runtime.image_exists(reference)? {
        return Ok(());
    }
    tracing::info!(image = reference, "pulling image");
    runtime.pull(reference)
}

/// Docker-compatible CLI (`docker` or `podman`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// First available of `docker`, `podman`; falls back to `docker` so the
    /// invocation error names the usual program.
    pub fn detect() -> Self {
        let program = RUNTIME_PROGRAMS
            .iter()
            .find(|p| command_exists(p))
            .unwrap_or(&RUNTIME_PROGRAMS[0]);
        Self::new(*program)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `run --rm` arguments for `spec`, without the program name.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for mount in &spec.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_arg());
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.argv.iter().cloned());
        args
    }

    fn output(&self, args: &[String]) -> Result<ProcessOutput, RuntimeError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| RuntimeError::Unavailable {
                program: self.program.clone(),
                source,
            })?;
        Ok(ProcessOutput {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        let args = ["image".to_string(), "inspect".to_string(), reference.to_string()];
        Ok(self.output(&args)?.exit_code == 0)
    }

    fn pull(&self, reference: &str) -> Result<(), RuntimeError> {
        let output = self.output(&["pull".to_string(), reference.to_string()])?;
        if output.exit_code != 0 {
            return Err(RuntimeError::Pull {
                reference: reference.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn run(&self, spec: &ContainerSpec) -> Result<ProcessOutput, RuntimeError> {
        self.output(&Self::run_args(spec))
    }
}

fn command_exists(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Signals have no exit code; report them as -1.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Run a host command with inherited stdio and return its exit code.
pub fn run_host(argv: &[String]) -> Result<i32, RuntimeError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(0);
    };
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| RuntimeError::Unavailable {
            program: program.clone(),
            source,
        })?;
    Ok(exit_code(status))
}

/// Per-invocation values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRunContext {
    /// Anchor for relative inputs and for `outputs/`.
    pub manifest_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub image_reference: String,
    pub run_time: DateTime<Utc>,
}

impl ToolRunContext {
    pub fn for_manifest(manifest: &Manifest, manifest_dir: &Path, image_reference: impl Into<String>) -> Self {
        Self {
            manifest_dir: manifest_dir.to_path_buf(),
            dockerfile: manifest.build.dockerfile_path(manifest_dir),
            image_reference: image_reference.into(),
            run_time: Utc::now(),
        }
    }

    pub fn at(mut self, run_time: DateTime<Utc>) -> Self {
        self.run_time = run_time;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub key: String,
    pub host: PathBuf,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolRunResult {
    pub tool: String,
    /// Host workspace directory.
    pub output: PathBuf,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Inputs read-only, workspace read-write at `/outputs/`, socket only on request.
pub fn mount_table(tool: &Tool, inputs: &[ResolvedInput], workspace: &Path) -> Vec<Mount> {
    let mut mounts: Vec<Mount> = inputs
        .iter()
        .map(|input| Mount {
            host: input.host.clone(),
            container: input.destination.clone(),
            mode: MountMode::ReadOnly,
        })
        .collect();
    mounts.push(Mount {
        host: workspace.to_path_buf(),
        container: CONTAINER_OUTPUTS_PATH.to_string(),
        mode: MountMode::ReadWrite,
    });
    if tool.socket {
        mounts.push(Mount {
            host: PathBuf::from(DOCKER_SOCKET_PATH),
            container: DOCKER_SOCKET_PATH.to_string(),
            mode: MountMode::ReadWrite,
        });
    }
    mounts
}

pub struct RunDirector<'a> {
    runtime: &'a dyn ContainerRuntime,
    bundle: &'a DefaultBundle,
}

impl<'a> RunDirector<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, bundle: &'a DefaultBundle) -> Self {
        Self { runtime, bundle }
    }

    pub fn run(&self, tool: &Tool, context: &ToolRunContext) -> Result<ToolRunResult, RunError> {
        tool.validate()?;
        let trace = StateTrace::new(&tool.id);

        let workspace = workspace::create(&context.manifest_dir, &tool.id, &context.run_time)
            .map_err(|source| RunError::WorkspaceCreation {
                path: workspace::run_path(&context.manifest_dir, &tool.id, &context.run_time),
                source,
            })?;
        trace.advance(RunState::WorkspaceStaged);

        let inputs = self.resolve_inputs(tool, context)?;
        trace.advance(RunState::InputsResolved);

        let spec = ContainerSpec {
            image: tool.image.clone(),
            argv: render::render(tool, &context.image_reference)?,
            mounts: mount_table(tool, &inputs, &workspace),
            env: tool.env.clone(),
        };
        trace.advance(RunState::ContainerRunning);
        tracing::info!(
            tool_id = tool.id.as_str(),
            image = spec.image.as_str(),
            workspace = %workspace.display(),
            "running tool"
        );

        match self.runtime.run(&spec) {
            Ok(output) => {
                trace.advance(RunState::Completed);
                Ok(ToolRunResult {
                    tool: tool.id.clone(),
                    output: workspace,
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Err(e) => {
                trace.advance(RunState::Failed);
                Err(e.into())
            }
        }
    }

    pub fn resolve_inputs(&self, tool: &Tool, context: &ToolRunContext) -> Result<Vec<ResolvedInput>, RunError> {
        tool.inputs
            .iter()
            .map(|(key, input)| -> Result<ResolvedInput, RunError> {
                let host = match &input.source {
                    InputSource::Path(path) => {
                        let host = if path.is_absolute() {
                            path.clone()
                        } else {
                            context.manifest_dir.join(path)
                        };
                        require_file(tool, key, host)?
                    }
                    InputSource::Default if key == DOCKERFILE_INPUT => {
                        require_file(tool, key, context.dockerfile.clone())?
                    }
                    InputSource::Default => self.packaged_input(tool, key, context)?,
                };
                Ok(ResolvedInput {
                    key: key.clone(),
                    host,
                    destination: input.destination.clone(),
                })
            })
            .collect()
    }

    fn packaged_input(&self, tool: &Tool, key: &str, context: &ToolRunContext) -> Result<PathBuf, RunError> {
        let file = self
            .bundle
            .file_for(key, tool.parser)
            .ok_or_else(|| RunError::MissingInput {
                tool_id: tool.id.clone(),
                input: key.to_string(),
                reason: format!("no packaged default for input {key} or parser {}", tool.parser),
            })?;
        self.bundle
            .materialize(file, &context.manifest_dir)
            .map_err(|e| RunError::MissingInput {
                tool_id: tool.id.clone(),
                input: key.to_string(),
                reason: format!("failed to stage packaged {}: {e}", file.filename),
            })
    }
}

fn require_file(tool: &Tool, key: &str, path: PathBuf) -> Result<PathBuf, RunError> {
    if !path.is_file() {
        return Err(RunError::MissingInput {
            tool_id: tool.id.clone(),
            input: key.to_string(),
            reason: format!("{} is not a file", path.display()),
        });
    }
    Ok(path)
}
