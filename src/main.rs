//! `statepack` binary: thin CLI over the orchestrator.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser as _;

use statepack_cli::cli::{Cli, Command, GlobalOpts};
use statepack_cli::context::Operation;
use statepack_cli::exec::SystemExecutor;
use statepack_cli::facts::MachineFacts;
use statepack_cli::orchestrator::{InvokeRequest, Orchestrator, RunResult};
use statepack_cli::state::OutcomeStatus;
use statepack_cli::state::registry::SystemKeyStore;
use statepack_cli::{logging, template};

fn main() -> ExitCode {
    let args = Cli::parse();
    logging::init(args.verbose);

    let (operation, run_id) = match &args.command {
        Command::Backup(opts) => (Operation::Backup, opts.run_id.clone()),
        Command::Restore(opts) => (Operation::Restore, Some(opts.run_id.clone())),
        Command::Version => {
            let version = option_env!("STATEPACK_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
            println!("statepack {version}");
            return ExitCode::SUCCESS;
        }
    };

    match run(&args.global, operation, run_id) {
        Ok(result) => {
            print_result(&result);
            if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(
    global: &GlobalOpts,
    operation: Operation,
    run_id: Option<String>,
) -> anyhow::Result<RunResult> {
    let facts = Arc::new(MachineFacts::detect(global.tags.iter().cloned()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&facts),
        Arc::new(SystemExecutor),
        Arc::new(SystemKeyStore),
    );

    let cancel = orchestrator.cancel_flag();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, finishing in-flight resources");
        cancel.store(true, Ordering::SeqCst);
    })?;

    let run_id = match run_id {
        Some(id) => id,
        None => default_run_id(&global.template)?,
    };

    let mut request = InvokeRequest::new(
        &global.template,
        operation,
        global.artifacts.join(run_id),
    );
    request.override_paths = override_paths(global.machine_templates.as_deref())?;
    request.passphrase = global.passphrase.clone();
    request.vars = std::env::vars().collect();
    request.dry_run = global.dry_run;
    request.timeout = Duration::from_secs(global.timeout);
    request.worker_limit = global.workers;

    Ok(orchestrator.invoke(request)?)
}

/// `<template-name>-<unix-timestamp>`: fresh directory per backup run.
fn default_run_id(template_path: &std::path::Path) -> anyhow::Result<String> {
    let template = template::load(template_path)?;
    let seconds = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    Ok(format!("{}-{seconds}", template.display_name()))
}

/// Every `.toml` in the machine templates directory, in name order.
fn override_paths(dir: Option<&std::path::Path>) -> anyhow::Result<Vec<PathBuf>> {
    let Some(dir) = dir else {
        return Ok(Vec::new());
    };
    let mut paths = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let path = item?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn print_result(result: &RunResult) {
    println!("{}", result.summary());
    for outcome in &result.outcomes {
        let marker = match outcome.status {
            OutcomeStatus::Succeeded => "ok",
            OutcomeStatus::Warned => "warn",
            OutcomeStatus::Failed => "FAIL",
            OutcomeStatus::DryRun => "dry",
        };
        match &outcome.message {
            Some(message) => {
                println!("  [{marker}] {}/{}: {message}", outcome.kind, outcome.key);
            }
            None => println!("  [{marker}] {}/{}", outcome.kind, outcome.key),
        }
    }
    for warning in result.prereq_warnings.iter().chain(&result.stage_warnings) {
        println!("  [warn] {warning}");
    }
}
