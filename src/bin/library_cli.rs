//! Library CLI - Manifest-Driven Container Tooling
//!
//! Commands: init, validate, resolve, build, lint, scan, refurbish, curate, push
//! Outputs JSON to stdout, logs to stderr
//! Exit codes: 0 pass, 1 error, 2 blocking findings, 3 tool failure

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use librarytools_core::{
    dispatch::{self, InitOptions},
    manifest::{Registry, MANIFEST_FILENAME},
    CliOverrides, DefaultBundle, DispatchError, DockerCli, FailOn, Manifest, ManifestError,
    PushPhase, Session, SessionOptions,
};

const TOOL_FAILED: u8 = 3;

#[derive(Parser)]
#[command(name = "library")]
#[command(about = "Library - build, lint, scan and publish container images from a manifest")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Args, Clone, Default)]
struct SessionArgs {
    /// Manifest path (default: ./.library.manifest.yaml or .yml)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Repository policy file (default: .library.policy.yaml beside the manifest)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Tool config file overriding tools/cli/thresholds
    #[arg(long)]
    tools: Option<PathBuf>,

    /// Policy profile (default, strict, expert or a repository profile)
    #[arg(long)]
    profile: Option<String>,

    /// Minimum blocking severity for this command's tool (or none)
    #[arg(long)]
    fail_on: Option<FailOn>,
}

impl SessionArgs {
    fn options(&self) -> SessionOptions {
        SessionOptions {
            manifest: self.manifest.clone(),
            policy: self.policy.clone(),
            tools: self.tools.clone(),
            overrides: CliOverrides {
                profile: self.profile.clone(),
                fail_on: self.fail_on,
            },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PushTarget {
    Image,
    Metadata,
    All,
}

impl From<PushTarget> for PushPhase {
    fn from(target: PushTarget) -> Self {
        match target {
            PushTarget::Image => PushPhase::Image,
            PushTarget::Metadata => PushPhase::Metadata,
            PushTarget::All => PushPhase::All,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fully materialized manifest
    Init {
        /// Output path
        #[arg(short, long, default_value = MANIFEST_FILENAME)]
        output: PathBuf,

        /// Overwrite an existing manifest
        #[arg(long)]
        force: bool,

        #[arg(long, default_value = "images.canfar.net")]
        host: String,

        #[arg(long, default_value = "library")]
        project: String,

        /// Image name
        #[arg(long)]
        image: String,

        #[arg(long)]
        title: Option<String>,
    },

    /// Validate a manifest
    Validate {
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Show the effective tool for a logical command
    Resolve {
        #[command(flatten)]
        session: SessionArgs,

        /// Logical command name (lint, scan, refurbish, ...)
        command: String,
    },

    /// Build the image with docker buildx
    Build {
        #[command(flatten)]
        session: SessionArgs,

        /// Extra buildx arguments
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Lint the Dockerfile
    Lint {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Scan an image for vulnerabilities
    Scan {
        #[command(flatten)]
        session: SessionArgs,

        /// Image reference (default: first manifest tag)
        image: Option<String>,
    },

    /// Propose dependency updates
    Refurbish {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Curate image metadata
    Curate {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Publish the image and/or its metadata
    Push {
        #[arg(value_enum)]
        target: PushTarget,

        #[command(flatten)]
        session: SessionArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            emit(&serde_json::json!({
                "success": false,
                "error": e.to_string(),
            }));
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<ExitCode, DispatchError> {
    let cwd = std::env::current_dir().map_err(ManifestError::from)?;
    let bundle = DefaultBundle::packaged();

    match command {
        Commands::Init { output, force, host, project, image, title } => {
            let options = InitOptions {
                path: output,
                registry: Registry { host, project, image },
                title,
                force,
            };
            let manifest = dispatch::init(&options, chrono::Utc::now())?;
            emit(&serde_json::json!({
                "success": true,
                "manifest": options.path,
                "digest": manifest.digest()?,
            }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate { manifest } => {
            let path = Manifest::locate(manifest.as_deref(), &cwd)?;
            let loaded = Manifest::load(&path)?;
            emit(&serde_json::json!({
                "valid": true,
                "manifest": path,
                "digest": loaded.digest()?,
            }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Resolve { session, command } => {
            let session = Session::load(&session.options(), &cwd, &bundle)?;
            let resolved = session.effective.for_command(&command)?;
            emit(&serde_json::json!({
                "profile": session.effective.profile,
                "authority": session.effective.catalog_authority,
                "resolved": resolved,
                "fingerprint": session.effective.fingerprint()?,
            }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Build { session, extra } => {
            let session = Session::load(&session.options(), &cwd, &bundle)?;
            let report = dispatch::run_build(&session, &extra)?;
            emit(&report);
            Ok(if report.exit_code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(TOOL_FAILED)
            })
        }

        Commands::Lint { session } => tool_command(&session, "lint", None, &cwd, &bundle),
        Commands::Scan { session, image } => tool_command(&session, "scan", image.as_deref(), &cwd, &bundle),
        Commands::Refurbish { session } => tool_command(&session, "refurbish", None, &cwd, &bundle),
        Commands::Curate { session } => tool_command(&session, "curate", None, &cwd, &bundle),

        Commands::Push { target, session } => {
            let session = Session::load(&session.options(), &cwd, &bundle)?;
            let runtime = DockerCli::detect();
            let reports = dispatch::run_push(&session, target.into(), &runtime, &bundle)?;
            emit(&reports);
            let status = reports.iter().map(|r| r.status()).find(|s| *s != 0).unwrap_or(0);
            Ok(ExitCode::from(status))
        }
    }
}

fn tool_command(
    args: &SessionArgs,
    command: &str,
    subject: Option<&str>,
    cwd: &Path,
    bundle: &DefaultBundle,
) -> Result<ExitCode, DispatchError> {
    let session = Session::load(&args.options(), cwd, bundle)?;
    let runtime = DockerCli::detect();
    tracing::debug!(program = runtime.program(), "container runtime selected");
    let report = dispatch::run_tool_command(&session, command, subject, &runtime, bundle)?;
    emit(&report);
    Ok(ExitCode::from(report.status()))
}

fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!(r#"{{"error": "Failed to serialize output: {e}"}}"#),
    }
}
