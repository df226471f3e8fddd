//! Template documents: data model, loading, validation, merging, and
//! conditional evaluation.
//!
//! A template is a declarative TOML document describing the machine state to
//! capture or restore: metadata, prerequisites, file resources, registry
//! resources, application inventories, and stage scripts. Templates are
//! loaded fresh per invocation and never mutated in place — merging a
//! default template with machine overrides produces a new template.
//!
//! Enumeration-like fields (`action`, prerequisite `kind`/`on_missing`,
//! `install_mode`) are stored as written and checked by the validator, so a
//! single load reports every authoring problem at once instead of failing on
//! the first bad enum value.

pub mod condition;
pub mod loader;
pub mod merge;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

pub use condition::should_apply;
pub use loader::load;
pub use merge::{MergeReport, merge};

/// A parsed template document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Template {
    /// Template metadata. Name and version are required by validation.
    #[serde(default)]
    pub metadata: Metadata,
    /// Preconditions checked before any resource is touched.
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    /// File resources, keyed by resource name.
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    /// Registry resources, keyed by resource name.
    #[serde(default)]
    pub registry: BTreeMap<String, RegistryEntry>,
    /// Application inventory groups, keyed by resource name.
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationGroup>,
    /// Stage scripts.
    #[serde(default)]
    pub stages: Stages,
    /// Machine selector; present only in override templates.
    #[serde(default)]
    pub selector: Option<MachineSelector>,
    /// Path the template was loaded from. Part of the template's identity,
    /// together with the metadata name.
    #[serde(skip)]
    pub source: PathBuf,
}

impl Template {
    /// Display identity: metadata name, falling back to the source filename.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.metadata.name.is_empty() {
            self.source
                .file_stem()
                .map_or_else(|| "<unnamed>".to_string(), |s| s.to_string_lossy().into_owned())
        } else {
            self.metadata.name.clone()
        }
    }
}

/// Template metadata.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Metadata {
    /// Template name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Template version string.
    #[serde(default)]
    pub version: String,
}

/// What to do when a prerequisite is not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissing {
    /// Record a warning and continue.
    Warn,
    /// Abort backup runs before any capture starts.
    FailBackup,
    /// Abort restore runs before any apply starts.
    FailRestore,
}

impl OnMissing {
    /// Parse the template spelling of an `on_missing` policy.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(Self::Warn),
            "fail_backup" => Some(Self::FailBackup),
            "fail_restore" => Some(Self::FailRestore),
            _ => None,
        }
    }
}

/// The kind of check a prerequisite performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereqKind {
    /// Run a check command and compare its output.
    Application,
    /// Read a registry address and compare the value.
    Registry,
    /// Run a script and compare its output.
    Script,
}

impl PrereqKind {
    /// Parse the template spelling of a prerequisite kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "application" => Some(Self::Application),
            "registry" => Some(Self::Registry),
            "script" => Some(Self::Script),
            _ => None,
        }
    }
}

/// A precondition gating template execution.
#[derive(Debug, Clone, Deserialize)]
pub struct Prerequisite {
    /// Check kind: `application`, `registry`, or `script`.
    pub kind: String,
    /// The check expression: a command line, a registry value address, or a
    /// script invocation, depending on `kind`.
    pub check: String,
    /// Expected output or value: exact string, or anchored regex pattern.
    /// Absent means "the check merely has to succeed".
    #[serde(default)]
    pub expected: Option<String>,
    /// Policy when the check fails; defaults to `warn`.
    #[serde(default)]
    pub on_missing: Option<String>,
}

impl Prerequisite {
    /// The validated check kind.
    #[must_use]
    pub fn kind(&self) -> Option<PrereqKind> {
        PrereqKind::parse(&self.kind)
    }

    /// The validated failure policy, defaulting to [`OnMissing::Warn`].
    #[must_use]
    pub fn policy(&self) -> OnMissing {
        self.on_missing
            .as_deref()
            .and_then(OnMissing::parse)
            .unwrap_or(OnMissing::Warn)
    }
}

/// What a resource declaration asks the engine to do with its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Capture full content, restore full content.
    Backup,
    /// Restore-oriented resource; captured with full content.
    Restore,
    /// Capture a checksum manifest only; apply verifies and reports drift.
    Sync,
}

impl Action {
    /// Parse the template spelling of an action.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(Self::Backup),
            "restore" => Some(Self::Restore),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

/// A file or directory resource.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    /// Source address (any form supported by the path resolver).
    pub path: String,
    /// Action; defaults to `backup`.
    #[serde(default)]
    pub action: Option<String>,
    /// Where inside the artifact directory the capture is written. Defaults
    /// to `files/<key>.json`.
    #[serde(default)]
    pub state_path: Option<String>,
    /// Encrypt the artifact payload.
    #[serde(default)]
    pub encrypt: bool,
    /// Restore-time target override; defaults to the captured source path.
    #[serde(default)]
    pub destination: Option<String>,
    /// Optional applicability condition.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl FileEntry {
    /// The validated action, defaulting to [`Action::Backup`].
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
            .as_deref()
            .and_then(Action::parse)
            .unwrap_or(Action::Backup)
    }
}

/// A hierarchical key-value (registry) resource.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    /// Key address in `reg://HIVE/path` form.
    pub path: String,
    /// Action; defaults to `backup`.
    #[serde(default)]
    pub action: Option<String>,
    /// Where inside the artifact directory the capture is written. Defaults
    /// to `registry/<key>.json`.
    #[serde(default)]
    pub state_path: Option<String>,
    /// Encrypt the artifact payload.
    #[serde(default)]
    pub encrypt: bool,
    /// Restore-time default values (value name → data), written when no
    /// captured artifact exists for this resource.
    #[serde(default)]
    pub value: Option<BTreeMap<String, toml::Value>>,
    /// Optional applicability condition.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl RegistryEntry {
    /// The validated action, defaulting to [`Action::Backup`].
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
            .as_deref()
            .and_then(Action::parse)
            .unwrap_or(Action::Backup)
    }
}

/// How an application group's install script is invoked on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Run the install script once per inventory entry.
    PerItem,
    /// Run the install script once with the full inventory appended.
    List,
}

impl InstallMode {
    /// Parse the template spelling of an install mode.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "per-item" => Some(Self::PerItem),
            "list" => Some(Self::List),
            _ => None,
        }
    }
}

/// An application inventory resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationGroup {
    /// Command that lists the installed inventory.
    pub discovery: String,
    /// Optional script the raw discovery output is piped through to produce
    /// canonical `name version [source]` lines.
    #[serde(default)]
    pub parse: Option<String>,
    /// Install script run on restore. `{name}` and `{version}` placeholders
    /// are substituted in `per-item` mode.
    #[serde(default)]
    pub install: Option<String>,
    /// Install invocation mode; defaults to `per-item`.
    #[serde(default)]
    pub install_mode: Option<String>,
    /// Source label recorded for discovered entries (e.g., the package
    /// manager name).
    #[serde(default)]
    pub source: Option<String>,
    /// Where inside the artifact directory the inventory is written.
    /// Defaults to `applications/<key>.json`.
    #[serde(default)]
    pub state_path: Option<String>,
    /// Encrypt the artifact payload.
    #[serde(default)]
    pub encrypt: bool,
    /// Optional applicability condition.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl ApplicationGroup {
    /// The validated install mode, defaulting to [`InstallMode::PerItem`].
    #[must_use]
    pub fn install_mode(&self) -> InstallMode {
        self.install_mode
            .as_deref()
            .and_then(InstallMode::parse)
            .unwrap_or(InstallMode::PerItem)
    }
}

/// An applicability condition attached to a resource.
///
/// Every specified clause must hold. Unknown facts evaluate to false rather
/// than erroring, so templates stay portable across machines lacking
/// certain facts.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Condition {
    /// Fact name to compare (`hostname`, `os`, or a custom fact).
    #[serde(default)]
    pub fact: Option<String>,
    /// The fact must equal this value (case-insensitive).
    #[serde(default)]
    pub equals: Option<String>,
    /// The fact must match this wildcard pattern (case-insensitive).
    #[serde(default)]
    pub matches: Option<String>,
    /// The given address must exist on the filesystem.
    #[serde(default)]
    pub exists: Option<String>,
    /// The machine must carry this tag.
    #[serde(default)]
    pub tag: Option<String>,
    /// Reuse a full machine selector as a condition.
    #[serde(default)]
    pub selector: Option<MachineSelector>,
}

/// Predicate deciding whether an override template applies to a machine.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MachineSelector {
    /// Hostname wildcard pattern (case-insensitive).
    #[serde(default)]
    pub hostname: Option<String>,
    /// OS family (exact, case-insensitive).
    #[serde(default)]
    pub os: Option<String>,
    /// Tags that must all be present (exact, case-sensitive).
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Stage script lists. Stages run sequentially, outside the resource model.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Stages {
    /// Runs before prerequisite checks.
    #[serde(default)]
    pub prereqs: Vec<StageStep>,
    /// Runs before the apply phase of a restore.
    #[serde(default)]
    pub preupdate: Vec<StageStep>,
    /// Runs after the apply phase of a restore.
    #[serde(default)]
    pub postupdate: Vec<StageStep>,
    /// Always runs, even when the run failed.
    #[serde(default)]
    pub cleanup: Vec<StageStep>,
}

/// One stage step: either an inline command or a script file reference.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StageStep {
    /// Inline command line.
    #[serde(default)]
    pub run: Option<String>,
    /// Script file path, relative to the template's directory.
    #[serde(default)]
    pub script: Option<String>,
}

/// The effective artifact location for a resource.
///
/// Explicit `state_path` wins; otherwise captures default to
/// `<section>/<key>.json`.
#[must_use]
pub fn effective_state_path(section: &str, key: &str, explicit: Option<&str>) -> String {
    explicit.map_or_else(|| format!("{section}/{key}.json"), ToString::to_string)
}
