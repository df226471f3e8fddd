//! CLI definitions for the `statepack` binary.
//!
//! The CLI is a thin collaborator: it assembles an
//! [`InvokeRequest`](crate::orchestrator::InvokeRequest) from flags and
//! hands it to the orchestrator. All engine behaviour lives behind that
//! boundary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI entry point for the state capture/restore engine.
#[derive(Parser, Debug)]
#[command(
    name = "statepack",
    about = "Template-driven machine state capture and restore",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    /// Subcommand to run.
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    /// Options shared across subcommands.
    pub global: GlobalOpts,
}

/// Options shared across all subcommands.
#[derive(Parser, Debug, Clone)]
pub struct GlobalOpts {
    /// Template document to execute
    #[arg(short, long, global = true, default_value = "statepack.toml")]
    pub template: PathBuf,

    /// Directory containing machine override templates
    #[arg(long, global = true)]
    pub machine_templates: Option<PathBuf>,

    /// Root directory holding per-run artifact directories
    #[arg(short, long, global = true, default_value = "artifacts")]
    pub artifacts: PathBuf,

    /// Passphrase for encrypted artifacts
    #[arg(long, global = true)]
    pub passphrase: Option<String>,

    /// Extra machine tags for selector matching (repeatable)
    #[arg(long = "tag", global = true)]
    pub tags: Vec<String>,

    /// Preview changes without applying
    #[arg(short = 'd', long, global = true)]
    pub dry_run: bool,

    /// Timeout in seconds for external commands
    #[arg(long, global = true, default_value_t = 120)]
    pub timeout: u64,

    /// Upper bound on concurrently processed resources
    #[arg(long, global = true, default_value_t = 4)]
    pub workers: usize,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture machine state into a fresh artifact directory
    Backup(BackupOpts),
    /// Re-apply a previously captured artifact directory
    Restore(RestoreOpts),
    /// Print version information
    Version,
}

/// Options for the `backup` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct BackupOpts {
    /// Run identifier; defaults to `<template-name>-<unix-timestamp>`
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Options for the `restore` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RestoreOpts {
    /// Run identifier of the artifact directory to restore
    #[arg(long)]
    pub run_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_backup_defaults() {
        let cli = Cli::parse_from(["statepack", "backup"]);
        assert!(matches!(cli.command, Command::Backup(_)));
        assert_eq!(cli.global.template, PathBuf::from("statepack.toml"));
        assert_eq!(cli.global.workers, 4);
        assert!(!cli.global.dry_run);
    }

    #[test]
    fn parse_restore_requires_run_id() {
        assert!(Cli::try_parse_from(["statepack", "restore"]).is_err());
        let cli = Cli::parse_from(["statepack", "restore", "--run-id", "ws-17"]);
        let Command::Restore(opts) = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(opts.run_id, "ws-17");
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "statepack", "backup", "--template", "ws.toml", "--tag", "ci", "--tag", "gpu",
            "--dry-run",
        ]);
        assert_eq!(cli.global.template, PathBuf::from("ws.toml"));
        assert_eq!(cli.global.tags, vec!["ci", "gpu"]);
        assert!(cli.global.dry_run);
    }

    #[test]
    fn parse_timeout_and_workers() {
        let cli = Cli::parse_from(["statepack", "backup", "--timeout", "30", "--workers", "8"]);
        assert_eq!(cli.global.timeout, 30);
        assert_eq!(cli.global.workers, 8);
    }
}
