//! Library Tools Core - Manifest-Driven Container Tooling
//!
//! # Ground Rules
//! 1. The manifest is the single source of truth
//! 2. Readers never apply defaults; only `init`/`save` do
//! 3. Override layers replace, never merge
//! 4. Tools only write to their own run workspace
//! 5. A tool crash is not a finding

pub mod catalog;
pub mod defaults;
pub mod dispatch;
pub mod hashing;
pub mod manifest;
pub mod parsers;
pub mod policy;
pub mod render;
pub mod runner;
pub mod workspace;

pub use catalog::{CatalogError, Config, ConflictMode, InputSource, Tool, ToolInput};
pub use defaults::DefaultBundle;
pub use dispatch::{CommandReport, DispatchError, PushPhase, Session, SessionOptions};
pub use hashing::{canonical_json, compute_digest};
pub use manifest::{Manifest, ManifestError};
pub use parsers::{FailOn, Finding, ParseError, ParserId, Severity, Verdict};
pub use policy::{CliOverrides, EffectiveConfig, PolicyError, ResolvedTool};
pub use render::RenderError;
pub use runner::{ContainerRuntime, ContainerSpec, DockerCli, Mount, RunDirector, RunError, RuntimeError, ToolRunResult};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
