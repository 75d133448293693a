//! CLI command implementations.
//!
//! - `check`: launch servers, wait for the handshake, report and tear down
//! - `plan`: print the launch specification of a server
//! - `version`: print version information

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use toolprobe_sandbox::HarnessConfig;

pub mod check;
pub mod plan;
pub mod version;

/// File name of the per-user configuration.
const CONFIG_FILE: &str = "config.toml";

/// toolprobe - Sandboxed tool-server harness
#[derive(Parser)]
#[command(name = "toolprobe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML, or JSON with an `mcpServers` table)
    ///
    /// Defaults to ~/.config/toolprobe/config.toml when present.
    #[arg(long, short, global = true, env = "TOOLPROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Launch servers and check that they complete the handshake
    Check(check::CheckArgs),

    /// Show how a server would be launched
    Plan(plan::PlanArgs),

    /// Show version information
    Version,
}

/// Returns the per-user configuration path.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("toolprobe").join(CONFIG_FILE))
}

/// Loads the harness configuration.
///
/// An explicit path must exist; otherwise the per-user file is used when
/// present, and defaults plus environment otherwise.
pub fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let path = match path {
        Some(path) => {
            anyhow::ensure!(path.is_file(), "config file not found: {}", path.display());
            Some(path.to_path_buf())
        }
        None => default_config_path().filter(|path| path.is_file()),
    };

    match path {
        Some(path) => HarnessConfig::load_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => HarnessConfig::load().context("failed to load config"),
    }
}
