//! Typed error taxonomy for the engine.
//!
//! Two tiers, matching the engine's propagation policy:
//!
//! ```text
//! EngineError       — fatal to the whole invocation, raised before any
//!                     resource mutation (schema, merge conflicts, hard
//!                     prerequisites, stage failures)
//! ResourceError     — scoped to one resource, recorded in the run result
//!                     without aborting sibling resources
//! ```
//!
//! Operations inside a resource use [`anyhow`] with context internally and
//! convert to a [`ResourceError`] at the manager boundary; the orchestrator
//! never sees an untyped error for a per-resource failure.

use std::fmt;

use thiserror::Error;

/// A single problem found while validating a template document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Template section the problem was found in (e.g., "metadata", "files").
    pub section: String,
    /// The specific entry or field that triggered the violation.
    pub item: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl Violation {
    /// Build a violation from anything string-like.
    #[must_use]
    pub fn new(
        section: impl Into<String>,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            section: section.into(),
            item: item.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.section, self.item, self.message)
    }
}

/// Aggregated template validation failure.
///
/// Templates are authored by end users, so validation collects every problem
/// in one pass instead of failing on the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolations {
    /// Every violation found, in document order.
    pub violations: Vec<Violation>,
}

impl SchemaViolations {
    /// Wrap a list of violations. The list must be non-empty to be meaningful.
    #[must_use]
    pub const fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }
}

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "template validation failed with {} violation(s):",
            self.violations.len()
        )?;
        for v in &self.violations {
            writeln!(f, "  - {v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaViolations {}

/// Fatal errors that stop a template invocation before resource mutation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The template document failed schema validation.
    #[error(transparent)]
    Schema(#[from] SchemaViolations),

    /// Two override templates matching the same machine define the same
    /// resource key. There is no implicit precedence between overrides.
    #[error("conflicting overrides for resource '{key}': defined by both '{first}' and '{second}'")]
    MergeConflict {
        /// Section-qualified resource key (e.g., "files/app_conf").
        key: String,
        /// Name of the first override template defining the key.
        first: String,
        /// Name of the second override template defining the key.
        second: String,
    },

    /// A hard prerequisite failed for the current operation.
    #[error("prerequisite '{check}' failed: {detail}")]
    PrerequisiteFailed {
        /// The prerequisite's check expression.
        check: String,
        /// Why the prerequisite did not pass.
        detail: String,
    },

    /// A stage script that gates execution (`prereqs`, `preupdate`) failed.
    #[error("stage '{stage}' failed: {detail}")]
    StageFailed {
        /// Stage name.
        stage: String,
        /// Failure detail from the script runner.
        detail: String,
    },

    /// The artifact manifest is missing or unreadable.
    #[error("artifact manifest error: {0}")]
    Manifest(String),

    /// An I/O error outside any single resource (e.g., creating the
    /// artifact directory).
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors scoped to a single resource.
///
/// Recorded in `RunResult.failed` for the owning resource; sibling resources
/// in the same run are unaffected.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The address could not be resolved to a supported path form.
    #[error("unresolvable address '{address}': {reason}")]
    UnresolvableAddress {
        /// The raw address as written in the template.
        address: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Decryption failed: wrong passphrase or corrupted ciphertext.
    #[error("decryption failed: wrong passphrase or corrupted artifact")]
    DecryptionFailed,

    /// An artifact is marked encrypted but no passphrase was supplied.
    #[error("artifact is encrypted but no passphrase was supplied")]
    PassphraseMissing,

    /// A restore target's parent key or directory cannot be created.
    #[error("destination unavailable: {target}")]
    DestinationUnavailable {
        /// The target that could not be created.
        target: String,
    },

    /// An external command exceeded the caller-supplied timeout.
    #[error("command '{command}' timed out after {timeout_secs}s")]
    CommandTimeout {
        /// The command that timed out.
        command: String,
        /// The timeout that was exceeded, in seconds.
        timeout_secs: u64,
    },

    /// An external command exited unsuccessfully.
    #[error("command '{command}' failed (exit {code:?}): {stderr}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Exit code, if the process terminated normally.
        code: Option<i32>,
        /// Trimmed stderr output.
        stderr: String,
    },

    /// A stored artifact's checksum does not match the manifest.
    #[error("artifact checksum mismatch for '{path}'")]
    ChecksumMismatch {
        /// Artifact path relative to the artifact directory.
        path: String,
    },

    /// The manifest references an artifact that does not exist on disk.
    #[error("artifact missing at '{path}'")]
    ArtifactMissing {
        /// Artifact path relative to the artifact directory.
        path: String,
    },

    /// An artifact exists but its payload cannot be decoded.
    #[error("invalid artifact payload: {0}")]
    Payload(String),

    /// An I/O error while reading or writing resource state.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ResourceError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
