//! The engine entry point: sequences loading, merging, gating, dispatch,
//! and stages for one template invocation.
//!
//! Sequence: load → merge overrides → `prereqs` stage → prerequisite gate →
//! (restore only) `preupdate` stage → per-resource dispatch through the
//! kind → manager table → (restore only) `postupdate` stage → `cleanup`
//! stage, which always runs, even on failure.
//!
//! Resources are independent by construction, so dispatch runs on a bounded
//! worker pool; stage scripts run sequentially. Cancellation stops dispatch
//! of new resources immediately while in-flight operations finish, so no
//! artifact is left half-written.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rayon::prelude::*;

use crate::artifact::{ManifestEntry, RunManifest};
use crate::context::{Operation, RunContext};
use crate::error::EngineError;
use crate::exec::Executor;
use crate::facts::MachineFacts;
use crate::paths::ResolveContext;
use crate::state::registry::KeyValueStore;
use crate::state::{
    OutcomeStatus, ResourceKind, ResourceOutcome, StateManager, managers,
};
use crate::template::{StageStep, Template, should_apply};
use crate::{prereq, template};

/// Default timeout for external commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default bound on concurrently processed resources.
pub const DEFAULT_WORKERS: usize = 4;

/// Parameters of one template invocation.
#[derive(Clone)]
pub struct InvokeRequest {
    /// Path of the default template document.
    pub template_path: PathBuf,
    /// Machine override template paths, in precedence-free order.
    pub override_paths: Vec<PathBuf>,
    /// Backup or restore.
    pub operation: Operation,
    /// Run-scoped artifact directory; created for backup, read for restore.
    pub artifact_dir: PathBuf,
    /// Passphrase for encrypted artifacts.
    pub passphrase: Option<String>,
    /// Home directory for address resolution.
    pub home: PathBuf,
    /// Variable substitution map for address resolution.
    pub vars: BTreeMap<String, String>,
    /// Secondary environment mounts for address resolution.
    pub subsys_mounts: BTreeMap<String, PathBuf>,
    /// Preview without mutating.
    pub dry_run: bool,
    /// Timeout for every external command.
    pub timeout: Duration,
    /// Bound on concurrently processed resources.
    pub worker_limit: usize,
}

impl std::fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("template_path", &self.template_path)
            .field("override_paths", &self.override_paths)
            .field("operation", &self.operation)
            .field("artifact_dir", &self.artifact_dir)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("home", &self.home)
            .field("dry_run", &self.dry_run)
            .field("timeout", &self.timeout)
            .field("worker_limit", &self.worker_limit)
            .finish_non_exhaustive()
    }
}

impl InvokeRequest {
    /// A request with defaults: home from the process environment, no
    /// overrides, no passphrase, default timeout and worker bound.
    #[must_use]
    pub fn new(
        template_path: impl Into<PathBuf>,
        operation: Operation,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_or_else(|_| PathBuf::from("/"), PathBuf::from);
        Self {
            template_path: template_path.into(),
            override_paths: Vec::new(),
            operation,
            artifact_dir: artifact_dir.into(),
            passphrase: None,
            home,
            vars: BTreeMap::new(),
            subsys_mounts: BTreeMap::new(),
            dry_run: false,
            timeout: DEFAULT_TIMEOUT,
            worker_limit: DEFAULT_WORKERS,
        }
    }
}

/// Aggregated result of one template invocation.
#[derive(Debug)]
pub struct RunResult {
    /// The operation that ran.
    pub operation: Operation,
    /// Display name of the (merged) template.
    pub template: String,
    /// One outcome per dispatched resource.
    pub outcomes: Vec<ResourceOutcome>,
    /// Failed `warn`-policy prerequisite descriptions.
    pub prereq_warnings: Vec<String>,
    /// Non-fatal stage failures (`postupdate`, `cleanup`).
    pub stage_warnings: Vec<String>,
}

impl RunResult {
    /// Resources that completed cleanly (including dry-run evaluations).
    #[must_use]
    pub fn succeeded(&self) -> Vec<&ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Succeeded | OutcomeStatus::DryRun))
            .collect()
    }

    /// Resources that completed with a recoverable condition.
    #[must_use]
    pub fn warned(&self) -> Vec<&ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Warned)
            .collect()
    }

    /// Resources that failed.
    #[must_use]
    pub fn failed(&self) -> Vec<&ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .collect()
    }

    /// Whether the run completed without resource failures.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    /// One-line summary for the caller.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} '{}': {} succeeded, {} warned, {} failed",
            self.operation,
            self.template,
            self.succeeded().len(),
            self.warned().len(),
            self.failed().len()
        )
    }
}

/// The engine facade consumed by the CLI.
pub struct Orchestrator {
    managers: HashMap<ResourceKind, Box<dyn StateManager>>,
    facts: Arc<MachineFacts>,
    executor: Arc<dyn Executor>,
    key_store: Arc<dyn KeyValueStore>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("facts", &self.facts)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator over the given capabilities.
    #[must_use]
    pub fn new(
        facts: Arc<MachineFacts>,
        executor: Arc<dyn Executor>,
        key_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            managers: managers(),
            facts,
            executor,
            key_store,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The cooperative cancellation flag for this orchestrator.
    ///
    /// Setting it stops dispatch of not-yet-started resources; in-flight
    /// operations finish.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run one template invocation.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] for failures that stop the run before
    /// resource mutation: template load/validation, merge conflicts, a
    /// missing restore manifest, hard stage failures, and gating
    /// prerequisites. Per-resource failures never surface here; they are
    /// collected into the returned [`RunResult`].
    pub fn invoke(&self, request: InvokeRequest) -> Result<RunResult, EngineError> {
        let merged = self.load_and_merge(&request)?;
        let ctx = self.build_context(&request, Arc::new(merged));

        let result = self.run_gated(&ctx);

        // Cleanup always runs, even when the run aborted earlier.
        let cleanup_warnings = self.run_stage_soft(&ctx, "cleanup", &ctx.template.stages.cleanup);
        match result {
            Ok(mut run) => {
                run.stage_warnings.extend(cleanup_warnings);
                tracing::info!("{}", run.summary());
                Ok(run)
            }
            Err(e) => {
                for warning in cleanup_warnings {
                    tracing::warn!("{warning}");
                }
                Err(e)
            }
        }
    }

    fn load_and_merge(&self, request: &InvokeRequest) -> Result<Template, EngineError> {
        let default = template::load(&request.template_path)?;
        let overrides = request
            .override_paths
            .iter()
            .map(|path| template::loader::load_override(path))
            .collect::<Result<Vec<_>, _>>()?;
        let (merged, report) = template::merge(&default, &overrides, &self.facts)?;
        tracing::debug!(template = %merged.display_name(), "merge: {}", report.describe());
        Ok(merged)
    }

    fn build_context(&self, request: &InvokeRequest, template: Arc<Template>) -> RunContext {
        let base_dir = request
            .template_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut resolve = ResolveContext::new(request.home.clone(), base_dir);
        resolve.vars = request.vars.clone();
        resolve.subsys_mounts = request.subsys_mounts.clone();

        RunContext {
            template,
            operation: request.operation,
            artifact_dir: request.artifact_dir.clone(),
            facts: Arc::clone(&self.facts),
            executor: Arc::clone(&self.executor),
            key_store: Arc::clone(&self.key_store),
            resolve,
            passphrase: request.passphrase.clone(),
            timeout: request.timeout,
            dry_run: request.dry_run,
            worker_limit: request.worker_limit.max(1),
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Everything between load and cleanup: the gated portion of the run.
    fn run_gated(&self, ctx: &RunContext) -> Result<RunResult, EngineError> {
        self.run_stage_hard(ctx, "prereqs", &ctx.template.stages.prereqs)?;

        let report = prereq::check_all(&ctx.template.prerequisites, ctx);
        prereq::gate(&report, ctx.operation)?;
        let prereq_warnings: Vec<String> = report
            .warnings
            .iter()
            .chain(&report.failures)
            .map(|w| format!("prerequisite '{}': {}", w.check, w.detail))
            .collect();
        for warning in &prereq_warnings {
            tracing::warn!("{warning}");
        }

        let manifest = match ctx.operation {
            Operation::Backup => {
                if !ctx.dry_run {
                    std::fs::create_dir_all(&ctx.artifact_dir).map_err(|source| EngineError::Io {
                        path: ctx.artifact_dir.display().to_string(),
                        source,
                    })?;
                }
                RunManifest::for_template(&ctx.template)
            }
            Operation::Restore => RunManifest::load(&ctx.artifact_dir)?,
        };

        if ctx.operation == Operation::Restore {
            self.run_stage_hard(ctx, "preupdate", &ctx.template.stages.preupdate)?;
        }

        let work = self.work_list(ctx);
        let (outcomes, entries) = self.process_resources(ctx, &manifest, work);

        if ctx.operation == Operation::Backup && !ctx.dry_run {
            let mut manifest = manifest;
            manifest.entries = entries;
            manifest.entries.sort_by(|a, b| a.path.cmp(&b.path));
            manifest.save(&ctx.artifact_dir)?;
        }

        let mut stage_warnings = Vec::new();
        if ctx.operation == Operation::Restore {
            stage_warnings =
                self.run_stage_soft(ctx, "postupdate", &ctx.template.stages.postupdate);
        }

        Ok(RunResult {
            operation: ctx.operation,
            template: ctx.template.display_name(),
            outcomes,
            prereq_warnings,
            stage_warnings,
        })
    }

    /// Resources whose condition holds, in section order.
    fn work_list(&self, ctx: &RunContext) -> Vec<(ResourceKind, String)> {
        let mut work = Vec::new();
        for (key, entry) in &ctx.template.files {
            if should_apply(entry.condition.as_ref(), &ctx.facts, &ctx.resolve) {
                work.push((ResourceKind::File, key.clone()));
            } else {
                tracing::debug!(resource = %key, "condition not met, skipping");
            }
        }
        for (key, entry) in &ctx.template.registry {
            if should_apply(entry.condition.as_ref(), &ctx.facts, &ctx.resolve) {
                work.push((ResourceKind::Registry, key.clone()));
            } else {
                tracing::debug!(resource = %key, "condition not met, skipping");
            }
        }
        for (key, group) in &ctx.template.applications {
            if should_apply(group.condition.as_ref(), &ctx.facts, &ctx.resolve) {
                work.push((ResourceKind::Application, key.clone()));
            } else {
                tracing::debug!(resource = %key, "condition not met, skipping");
            }
        }
        work
    }

    /// Dispatch resources on a bounded pool, collecting outcomes and (for
    /// backup) manifest entries.
    fn process_resources(
        &self,
        ctx: &RunContext,
        manifest: &RunManifest,
        work: Vec<(ResourceKind, String)>,
    ) -> (Vec<ResourceOutcome>, Vec<ManifestEntry>) {
        let outcomes = Mutex::new(Vec::new());
        let entries = Mutex::new(Vec::new());

        let run_one = |kind: ResourceKind, key: &str| {
            let outcome = self.process_single(ctx, manifest, kind, key, &entries);
            outcomes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(outcome);
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.worker_limit)
            .build();
        match pool {
            Ok(pool) => pool.install(|| {
                work.par_iter().for_each(|(kind, key)| run_one(*kind, key));
            }),
            // Degraded but correct: process sequentially.
            Err(_) => work.iter().for_each(|(kind, key)| run_one(*kind, key)),
        }

        let mut outcomes = outcomes
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        outcomes.sort_by_key(|o| (o.kind, o.key.clone()));
        let entries = entries
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (outcomes, entries)
    }

    fn process_single(
        &self,
        ctx: &RunContext,
        manifest: &RunManifest,
        kind: ResourceKind,
        key: &str,
        entries: &Mutex<Vec<ManifestEntry>>,
    ) -> ResourceOutcome {
        if ctx.is_cancelled() {
            return ResourceOutcome {
                kind,
                key: key.to_string(),
                status: OutcomeStatus::Warned,
                message: Some("cancelled before dispatch".to_string()),
            };
        }
        let Some(manager) = self.managers.get(&kind) else {
            return ResourceOutcome {
                kind,
                key: key.to_string(),
                status: OutcomeStatus::Failed,
                message: Some(format!("no state manager registered for kind '{kind}'")),
            };
        };

        let result = match ctx.operation {
            Operation::Backup => manager.capture(ctx, key).map(|output| {
                if let Some(entry) = output.entry {
                    entries
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(entry);
                }
                output.warning
            }),
            Operation::Restore => manager.apply(ctx, key, manifest).map(|output| output.warning),
        };

        match result {
            Ok(warning) => {
                let status = if ctx.dry_run {
                    OutcomeStatus::DryRun
                } else if warning.is_some() {
                    OutcomeStatus::Warned
                } else {
                    OutcomeStatus::Succeeded
                };
                ResourceOutcome {
                    kind,
                    key: key.to_string(),
                    status,
                    message: warning,
                }
            }
            Err(e) => {
                tracing::error!(resource = %key, kind = %kind, "{e}");
                ResourceOutcome {
                    kind,
                    key: key.to_string(),
                    status: OutcomeStatus::Failed,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Run a gating stage sequentially; the first failure aborts the run.
    fn run_stage_hard(
        &self,
        ctx: &RunContext,
        name: &str,
        steps: &[StageStep],
    ) -> Result<(), EngineError> {
        match self.run_stage(ctx, name, steps).into_iter().next() {
            Some(failure) => Err(EngineError::StageFailed {
                stage: name.to_string(),
                detail: failure,
            }),
            None => Ok(()),
        }
    }

    /// Run a non-gating stage sequentially, collecting failures as warnings.
    fn run_stage_soft(&self, ctx: &RunContext, name: &str, steps: &[StageStep]) -> Vec<String> {
        self.run_stage(ctx, name, steps)
            .into_iter()
            .map(|failure| format!("stage '{name}': {failure}"))
            .collect()
    }

    /// Execute a stage's steps in order, returning failure descriptions.
    fn run_stage(&self, ctx: &RunContext, name: &str, steps: &[StageStep]) -> Vec<String> {
        let mut failures = Vec::new();
        if steps.is_empty() {
            return failures;
        }
        if ctx.dry_run {
            tracing::info!(stage = name, "dry-run: skipping {} step(s)", steps.len());
            return failures;
        }
        for step in steps {
            let command = match (&step.run, &step.script) {
                (Some(run), _) => run.clone(),
                (None, Some(script)) => ctx
                    .resolve
                    .base_dir
                    .join(script)
                    .display()
                    .to_string(),
                (None, None) => continue,
            };
            tracing::debug!(stage = name, "running: {command}");
            match ctx.executor.run_shell(&command, ctx.timeout) {
                Ok(result) if result.success => {}
                Ok(result) => failures.push(format!(
                    "'{command}' exited with {:?}: {}",
                    result.code,
                    result.stderr.trim()
                )),
                Err(e) => failures.push(e.to_string()),
            }
        }
        failures
    }
}
