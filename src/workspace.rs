//! Run Workspaces - Deterministic Output Paths
//!
//! Every run writes to `outputs/{tool-id}/{UTC timestamp}/` under the
//! manifest directory. The timestamp keeps nanoseconds at a fixed width so
//! paths sort chronologically and distinct instants never share a directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

pub const OUTPUT_ROOT_DIRNAME: &str = "outputs";
pub const RUN_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

/// Packaged defaults live beside the per-tool directories. Tool ids must
/// start with an alphanumeric, so this name cannot collide with one.
pub const DEFAULTS_DIRNAME: &str = ".defaults";

pub fn format_run_time(run_time: &DateTime<Utc>) -> String {
    run_time.format(RUN_TIME_FORMAT).to_string()
}

pub fn output_root(root: &Path) -> PathBuf {
    root.join(OUTPUT_ROOT_DIRNAME)
}

pub fn defaults_root(root: &Path) -> PathBuf {
    output_root(root).join(DEFAULTS_DIRNAME)
}

pub fn run_path(root: &Path, tool_id: &str, run_time: &DateTime<Utc>) -> PathBuf {
    output_root(root).join(tool_id).join(format_run_time(run_time))
}

/// Create the run directory. The leaf must not already exist.
pub fn create(root: &Path, tool_id: &str, run_time: &DateTime<Utc>) -> io::Result<PathBuf> {
    let run_dir = run_path(root, tool_id, run_time);
    if let Some(parent) = run_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir(&run_dir)?;
    Ok(run_dir)
}
