//! Parser Registry - Tool Artifacts to Findings
//!
//! Parsers produce normalized findings.
//! Thresholds map findings to a verdict.

pub mod artifacts;
pub mod hadolint;
pub mod renovate;
pub mod trivy;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::ToolRunResult;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unknown parser: {0}")]
    UnknownParser(String),

    #[error("No {parser} artifacts found under: {}", dir.display())]
    MissingArtifacts { parser: ParserId, dir: PathBuf },

    #[error("Invalid {parser} payload in artifact {}: {reason}", artifact.display())]
    InvalidPayload {
        parser: ParserId,
        artifact: PathBuf,
        reason: String,
    },

    #[error("I/O error reading artifacts: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error in artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed set of output interpreters. A tool names one of these in its
/// `parser` field; anything else is rejected when the manifest is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserId {
    Hadolint,
    Trivy,
    Renovate,
    Curate,
    Provenance,
    Push,
}

impl ParserId {
    pub const ALL: [ParserId; 6] = [
        ParserId::Hadolint,
        ParserId::Trivy,
        ParserId::Renovate,
        ParserId::Curate,
        ParserId::Provenance,
        ParserId::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParserId::Hadolint => "hadolint",
            ParserId::Trivy => "trivy",
            ParserId::Renovate => "renovate",
            ParserId::Curate => "curate",
            ParserId::Provenance => "provenance",
            ParserId::Push => "push",
        }
    }
}

impl fmt::Display for ParserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParserId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ParseError::UnknownParser(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lenient mapping for the free-form severity strings tools emit.
    pub fn from_label(label: &str) -> Severity {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" | "error" => Severity::High,
            "medium" | "warning" | "moderate" => Severity::Medium,
            "low" | "unknown" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

/// Minimum severity that blocks, or `None` to never block on findings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailOn {
    None,
    Info,
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

impl FailOn {
    pub fn threshold(&self) -> Option<Severity> {
        match self {
            FailOn::None => None,
            FailOn::Info => Some(Severity::Info),
            FailOn::Low => Some(Severity::Low),
            FailOn::Medium => Some(Severity::Medium),
            FailOn::High => Some(Severity::High),
            FailOn::Critical => Some(Severity::Critical),
        }
    }

    pub fn blocks(&self, severity: Severity) -> bool {
        self.threshold().is_some_and(|t| severity >= t)
    }
}

impl FromStr for FailOn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(FailOn::None),
            "info" => Ok(FailOn::Info),
            "low" => Ok(FailOn::Low),
            "medium" => Ok(FailOn::Medium),
            "high" => Ok(FailOn::High),
            "critical" => Ok(FailOn::Critical),
            other => Err(format!("unknown severity threshold: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass { findings: usize },
    Blocked { blocking: usize, fail_on: FailOn },
    /// The tool exited nonzero and left nothing to interpret.
    ToolFailed { exit_code: i32 },
}

impl Verdict {
    pub fn exit_code(&self) -> u8 {
        match self {
            Verdict::Pass { .. } => 0,
            Verdict::Blocked { .. } => 2,
            Verdict::ToolFailed { .. } => 3,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass { .. })
    }
}

/// Interpret a workspace with the parser registered for `parser`.
pub fn parse(parser: ParserId, output: &Path) -> Result<Vec<Finding>, ParseError> {
    match parser {
        ParserId::Hadolint => hadolint::parse(output),
        ParserId::Trivy => trivy::parse(output),
        ParserId::Renovate => renovate::parse(output),
        ParserId::Curate | ParserId::Provenance | ParserId::Push => {
            artifacts::parse(parser, output)
        }
    }
}

/// String-keyed entry point; fails loudly for ids outside the registry.
pub fn parse_named(parser: &str, output: &Path) -> Result<Vec<Finding>, ParseError> {
    parse(parser.parse()?, output)
}

/// Apply a severity threshold to findings.
pub fn report(findings: &[Finding], fail_on: FailOn) -> Verdict {
    let blocking = findings.iter().filter(|f| fail_on.blocks(f.severity)).count();
    if blocking > 0 {
        Verdict::Blocked { blocking, fail_on }
    } else {
        Verdict::Pass { findings: findings.len() }
    }
}

/// Some tools only print their report. Capture stdout as an artifact when
/// the workspace is otherwise empty.
pub fn ensure_artifacts(parser: ParserId, output: &Path, stdout: &str) -> Result<(), ParseError> {
    let filename = match parser {
        ParserId::Hadolint if json_artifacts(output)?.is_empty() => "hadolint.json",
        ParserId::Renovate if all_artifacts(output)?.is_empty() => "refurbish.log",
        _ => return Ok(()),
    };
    let captured = stdout.trim();
    if captured.is_empty() {
        return Ok(());
    }
    fs::write(output.join(filename), captured)?;
    Ok(())
}

/// Parse a finished run and decide its verdict.
///
/// A nonzero exit whose workspace has no artifacts is reported as a tool
/// failure rather than as findings.
pub fn assess(
    parser: ParserId,
    result: &ToolRunResult,
    fail_on: FailOn,
) -> Result<(Vec<Finding>, Verdict), ParseError> {
    ensure_artifacts(parser, &result.output, &result.stdout)?;
    match parse(parser, &result.output) {
        Ok(findings) => {
            let verdict = report(&findings, fail_on);
            Ok((findings, verdict))
        }
        Err(ParseError::MissingArtifacts { .. }) if result.exit_code != 0 => Ok((
            Vec::new(),
            Verdict::ToolFailed { exit_code: result.exit_code },
        )),
        Err(e) => Err(e),
    }
}

pub(crate) fn json_artifacts(dir: &Path) -> Result<Vec<PathBuf>, ParseError> {
    Ok(all_artifacts(dir)?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect())
}

pub(crate) fn all_artifacts(dir: &Path) -> Result<Vec<PathBuf>, ParseError> {
    let mut files = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
