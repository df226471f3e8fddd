//! Shared run context threaded through the engine.
//!
//! All ambient inputs — machine facts, the command executor, the key-value
//! store, the resolve context, the passphrase — travel in one explicit
//! [`RunContext`] instead of global state, so every collaborator is
//! injectable in tests and a run's behaviour is fully determined by its
//! context.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::exec::Executor;
use crate::facts::MachineFacts;
use crate::paths::ResolveContext;
use crate::state::registry::KeyValueStore;
use crate::template::Template;

/// The operation a template invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Capture machine state into the artifact directory.
    Backup,
    /// Re-apply previously captured artifacts to the machine.
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// Everything a state manager needs to perform one run.
pub struct RunContext {
    /// The merged template being executed.
    pub template: Arc<Template>,
    /// Backup or restore.
    pub operation: Operation,
    /// Run-scoped artifact directory (exclusive to this run).
    pub artifact_dir: PathBuf,
    /// Facts about the current machine.
    pub facts: Arc<MachineFacts>,
    /// External command execution capability.
    pub executor: Arc<dyn Executor>,
    /// Hierarchical key-value store capability.
    pub key_store: Arc<dyn KeyValueStore>,
    /// Address resolution context (home, vars, mounts).
    pub resolve: ResolveContext,
    /// Passphrase for encrypted artifacts, when supplied by the caller.
    pub passphrase: Option<String>,
    /// Timeout applied to every external command.
    pub timeout: Duration,
    /// Preview mode: report what would change without mutating anything.
    pub dry_run: bool,
    /// Upper bound on concurrently processed resources.
    pub worker_limit: usize,
    /// Cooperative cancellation flag; set by the caller on user abort.
    pub cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("template", &self.template.display_name())
            .field("operation", &self.operation)
            .field("artifact_dir", &self.artifact_dir)
            .field("facts", &self.facts)
            .field("executor", &"<dyn Executor>")
            .field("key_store", &"<dyn KeyValueStore>")
            .field("resolve", &self.resolve)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("dry_run", &self.dry_run)
            .field("worker_limit", &self.worker_limit)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Whether the caller has requested cancellation.
    ///
    /// Dispatch of new resources stops once this returns true; in-flight
    /// operations are allowed to finish so no artifact is left half-written.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_display() {
        assert_eq!(Operation::Backup.to_string(), "backup");
        assert_eq!(Operation::Restore.to_string(), "restore");
    }

    #[test]
    fn debug_redacts_passphrase() {
        let ctx = crate::state::test_helpers::context_builder()
            .passphrase("super-secret")
            .build();
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn cancellation_flag_round_trip() {
        let ctx = crate::state::test_helpers::context_builder().build();
        assert!(!ctx.is_cancelled());
        ctx.cancelled.store(true, Ordering::SeqCst);
        assert!(ctx.is_cancelled());
    }
}
