//! Command-line interface definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::manifest::Mode;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "azdo-reconcile",
    version,
    about = "Reconcile Azure DevOps resources declared in a TOML manifest"
)]
pub struct Cli {
    /// Provider configuration file (defaults to the XDG config location)
    #[arg(long, global = true, help_heading = "Configuration")]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error or off
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_level: Option<String>,

    /// Log format: text or json
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_format: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Read remote state and report outputs without changing anything
    Preview {
        /// Resource manifest
        manifest: PathBuf,
    },
    /// Create or update every declared resource
    Apply {
        /// Resource manifest
        manifest: PathBuf,
    },
}

impl Command {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Preview { .. } => Mode::Preview,
            Self::Apply { .. } => Mode::Apply,
        }
    }

    pub fn manifest(&self) -> &PathBuf {
        match self {
            Self::Preview { manifest } | Self::Apply { manifest } => manifest,
        }
    }
}
