//! CLI command definitions and dispatch.

mod build;
mod version;

use clap::{Parser, Subcommand};
use rootmerge_core::LogFormat;

/// rootmerge: merge rootfs directories into OCI image layers.
#[derive(Parser)]
#[command(name = "rootmerge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log output format (text, json)
    #[arg(long, global = true, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Import a base image and append layers built from a list of rootfses
    Build(build::BuildArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
