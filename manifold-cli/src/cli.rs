//! Command-line definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "manifold",
    version,
    about = "Multi-tenant hub and gateway for the Model Context Protocol"
)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "manifold_hub=debug".
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub server.
    Serve,

    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Check that the configuration file loads and validates.
    Validate,

    /// Print a sample configuration to stdout.
    Generate,
}
