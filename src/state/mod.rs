//! Per-kind state managers (`capture` + `apply` pattern).
//!
//! Each resource kind — file, registry, application — has one manager
//! implementing the [`StateManager`] capability. The orchestrator holds a
//! kind → manager lookup table and dispatches through it; no resource-kind
//! switching happens anywhere else.

pub mod application;
pub mod file;
pub mod registry;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::{ManifestEntry, RunManifest};
use crate::context::RunContext;
use crate::error::ResourceError;

/// The kind of a declared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A file or directory resource.
    File,
    /// A hierarchical key-value resource.
    Registry,
    /// An application inventory resource.
    Application,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Registry => write!(f, "registry"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Final status of one resource within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// The resource was captured or applied successfully.
    Succeeded,
    /// The resource completed with a recoverable condition (e.g., missing
    /// optional source, partial application install).
    Warned,
    /// The resource failed; the error is recorded in the outcome message.
    Failed,
    /// Dry-run mode: the resource was evaluated but nothing was mutated.
    DryRun,
}

/// Per-resource result collected into the run result.
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource key within its section.
    pub key: String,
    /// Final status.
    pub status: OutcomeStatus,
    /// Detail: warning text or the failure's error message.
    pub message: Option<String>,
}

/// What a capture produced.
#[derive(Debug, Default)]
pub struct CaptureOutput {
    /// Manifest entry for the written artifact; `None` in dry-run mode or
    /// when the source was absent and nothing was captured.
    pub entry: Option<ManifestEntry>,
    /// Recoverable condition worth surfacing (missing optional source).
    pub warning: Option<String>,
}

/// What an apply produced.
#[derive(Debug, Default)]
pub struct ApplyOutput {
    /// Recoverable condition worth surfacing (drift, partial installs).
    pub warning: Option<String>,
}

/// Capture/apply capability implemented once per resource kind.
///
/// Managers are stateless: every input arrives through the [`RunContext`]
/// and the resource key, so one manager instance serves concurrent
/// resources.
pub trait StateManager: Send + Sync {
    /// The resource kind this manager owns.
    fn kind(&self) -> ResourceKind;

    /// Capture the resource's current machine state into the artifact
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] scoped to this resource; sibling
    /// resources are unaffected.
    fn capture(&self, ctx: &RunContext, key: &str) -> Result<CaptureOutput, ResourceError>;

    /// Apply the resource's captured state to the machine.
    ///
    /// Must be idempotent: re-running with unchanged artifacts produces the
    /// same end state and no error.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] scoped to this resource; sibling
    /// resources are unaffected.
    fn apply(
        &self,
        ctx: &RunContext,
        key: &str,
        manifest: &RunManifest,
    ) -> Result<ApplyOutput, ResourceError>;
}

/// The kind → manager lookup table used by the orchestrator.
#[must_use]
pub fn managers() -> HashMap<ResourceKind, Box<dyn StateManager>> {
    let list: Vec<Box<dyn StateManager>> = vec![
        Box::new(file::FileStateManager),
        Box::new(registry::RegistryStateManager),
        Box::new(application::ApplicationStateManager),
    ];
    list.into_iter().map(|m| (m.kind(), m)).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_display() {
        assert_eq!(ResourceKind::File.to_string(), "file");
        assert_eq!(ResourceKind::Registry.to_string(), "registry");
        assert_eq!(ResourceKind::Application.to_string(), "application");
    }

    #[test]
    fn resource_kind_serde_spelling() {
        assert_eq!(
            serde_json::to_string(&ResourceKind::Application).unwrap(),
            "\"application\""
        );
        let kind: ResourceKind = serde_json::from_str("\"registry\"").unwrap();
        assert_eq!(kind, ResourceKind::Registry);
    }

    #[test]
    fn lookup_table_covers_every_kind() {
        let table = managers();
        assert_eq!(table.len(), 3);
        for kind in [
            ResourceKind::File,
            ResourceKind::Registry,
            ResourceKind::Application,
        ] {
            let manager = table.get(&kind).expect("manager registered");
            assert_eq!(manager.kind(), kind);
        }
    }
}
