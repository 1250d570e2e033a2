//! CLI surface for the worker binary.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use drill_domain::assignment::WorkerAssignment;
use drill_domain::config::SystemPolicy;

#[derive(Parser)]
#[command(name = "mcpdrill-worker", about = "MCPDrill load-generation worker", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a run configuration against the system policy.
    Validate {
        /// Run configuration (JSON).
        #[arg(long)]
        config: PathBuf,
        /// System policy (JSON). Defaults to a closed policy.
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Validate, then execute one assignment against the target.
    Run {
        /// Run configuration (JSON).
        #[arg(long)]
        config: PathBuf,
        /// System policy (JSON). Defaults to a closed policy.
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Worker assignment (JSON).
        #[arg(long)]
        assignment: PathBuf,
        /// Telemetry sink (JSON Lines). Defaults to stdout.
        #[arg(long)]
        telemetry: Option<PathBuf>,
    },
}

pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

pub fn load_policy(path: Option<&PathBuf>) -> anyhow::Result<SystemPolicy> {
    match path {
        Some(path) => load_json(path),
        None => Ok(SystemPolicy::default()),
    }
}

pub fn load_assignment(path: &Path) -> anyhow::Result<WorkerAssignment> {
    load_json(path)
}
