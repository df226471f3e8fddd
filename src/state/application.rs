//! Application inventory state management.
//!
//! Capture runs the group's discovery command, optionally pipes the raw
//! output through a parse script, and records the canonical inventory
//! (`name version source` per line) as the artifact. Empty discovery output
//! is an empty inventory, not an error.
//!
//! Apply re-runs the install script — once per entry or once with the full
//! list, per the template — and collects per-item failures instead of
//! aborting on the first: application restore is inherently partial-success,
//! since some packages may be unavailable on the target machine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::{self, ManifestEntry, RunManifest};
use crate::context::RunContext;
use crate::error::ResourceError;
use crate::state::{ApplyOutput, CaptureOutput, ResourceKind, StateManager};
use crate::template::{ApplicationGroup, InstallMode, effective_state_path};

/// One application in a captured inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    /// Application or package name.
    pub name: String,
    /// Version, when discovery reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Origin label (e.g., the package manager name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Additional discovery metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// On-disk artifact payload for one application group.
#[derive(Debug, Serialize, Deserialize)]
struct ApplicationArtifact {
    /// The canonical inventory.
    applications: Vec<AppRecord>,
}

/// State manager for application inventory resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplicationStateManager;

impl ApplicationStateManager {
    fn entry<'t>(ctx: &'t RunContext, key: &str) -> Result<&'t ApplicationGroup, ResourceError> {
        ctx.template.applications.get(key).ok_or_else(|| {
            ResourceError::Payload(format!("unknown application resource '{key}'"))
        })
    }
}

impl StateManager for ApplicationStateManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Application
    }

    fn capture(&self, ctx: &RunContext, key: &str) -> Result<CaptureOutput, ResourceError> {
        let group = Self::entry(ctx, key)?;

        let discovered = ctx
            .executor
            .run_shell(&group.discovery, ctx.timeout)?
            .require_success(&group.discovery)?
            .stdout;

        let canonical = match &group.parse {
            Some(parse) => {
                ctx.executor
                    .run_shell_with_stdin(parse, &discovered, ctx.timeout)?
                    .require_success(parse)?
                    .stdout
            }
            None => discovered,
        };

        let applications = parse_inventory(&canonical, group.source.as_deref());
        tracing::debug!(resource = key, count = applications.len(), "discovered inventory");

        if ctx.dry_run {
            return Ok(CaptureOutput::default());
        }

        let payload = serde_json::to_vec_pretty(&ApplicationArtifact { applications })
            .map_err(|e| ResourceError::Payload(e.to_string()))?;

        let state_path = effective_state_path("applications", key, group.state_path.as_deref());
        let stored = artifact::write_payload(
            &ctx.artifact_dir,
            &state_path,
            &payload,
            group.encrypt,
            ctx.passphrase.as_deref(),
        )?;

        Ok(CaptureOutput {
            entry: Some(ManifestEntry {
                key: key.to_string(),
                kind: ResourceKind::Application,
                path: stored.rel_path,
                encrypted: stored.encrypted,
                checksum: stored.checksum,
            }),
            warning: None,
        })
    }

    fn apply(
        &self,
        ctx: &RunContext,
        key: &str,
        manifest: &RunManifest,
    ) -> Result<ApplyOutput, ResourceError> {
        let group = Self::entry(ctx, key)?;

        let Some(man_entry) = manifest.entry(ResourceKind::Application, key) else {
            return Ok(ApplyOutput {
                warning: Some("no captured artifact; skipped".to_string()),
            });
        };

        let payload =
            artifact::read_payload(&ctx.artifact_dir, man_entry, ctx.passphrase.as_deref())?;
        let parsed: ApplicationArtifact =
            serde_json::from_slice(&payload).map_err(|e| ResourceError::Payload(e.to_string()))?;

        if parsed.applications.is_empty() {
            return Ok(ApplyOutput::default());
        }
        let Some(install) = &group.install else {
            return Ok(ApplyOutput {
                warning: Some("no install script declared; skipped".to_string()),
            });
        };
        if ctx.dry_run {
            return Ok(ApplyOutput::default());
        }

        match group.install_mode() {
            InstallMode::List => install_list(ctx, install, &parsed.applications),
            InstallMode::PerItem => install_per_item(ctx, install, &parsed.applications),
        }
    }
}

/// Parse canonical inventory lines: `name [version [source]]` per line.
fn parse_inventory(output: &str, default_source: Option<&str>) -> Vec<AppRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            Some(AppRecord {
                name: name.to_string(),
                version: fields.next().map(ToString::to_string),
                source: fields
                    .next()
                    .map(ToString::to_string)
                    .or_else(|| default_source.map(ToString::to_string)),
                metadata: BTreeMap::new(),
            })
        })
        .collect()
}

/// Run the install script once with every name appended.
fn install_list(
    ctx: &RunContext,
    install: &str,
    applications: &[AppRecord],
) -> Result<ApplyOutput, ResourceError> {
    let names: Vec<&str> = applications.iter().map(|a| a.name.as_str()).collect();
    let command = format!("{install} {}", names.join(" "));
    ctx.executor
        .run_shell(&command, ctx.timeout)?
        .require_success(install)?;
    Ok(ApplyOutput::default())
}

/// Run the install script once per entry, collecting failures.
fn install_per_item(
    ctx: &RunContext,
    install: &str,
    applications: &[AppRecord],
) -> Result<ApplyOutput, ResourceError> {
    let mut failed = Vec::new();
    for app in applications {
        let command = install
            .replace("{name}", &app.name)
            .replace("{version}", app.version.as_deref().unwrap_or(""));
        let ok = match ctx.executor.run_shell(&command, ctx.timeout) {
            Ok(result) => result.success,
            Err(e) => {
                tracing::warn!(application = %app.name, "install failed: {e}");
                false
            }
        };
        if !ok {
            failed.push(app.name.clone());
        }
    }

    if failed.is_empty() {
        Ok(ApplyOutput::default())
    } else if failed.len() < applications.len() {
        Ok(ApplyOutput {
            warning: Some(format!(
                "{} of {} install(s) failed: {}",
                failed.len(),
                applications.len(),
                failed.join(", ")
            )),
        })
    } else {
        Err(ResourceError::CommandFailed {
            command: install.to_string(),
            code: None,
            stderr: format!("all {} install(s) failed", applications.len()),
        })
    }
}
