//! Machine facts used by selectors, conditions, and prerequisite checks.
//!
//! Facts are detected once at startup and threaded through the engine via
//! the run context, so tests can inject synthetic facts and template
//! evaluation stays deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Operating system family of the running machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    /// Linux and other Unix-likes that are not macOS.
    Linux,
    /// macOS.
    Macos,
    /// Windows.
    Windows,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Macos => write!(f, "macos"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// Facts about the machine the engine is running on.
///
/// Selectors and conditions look facts up by name: the built-in facts are
/// `hostname` and `os`; anything else is looked up in `extra`. Tags are a
/// separate flat set supplied by the caller (e.g., `--tag ci`).
#[derive(Debug, Clone)]
pub struct MachineFacts {
    /// Machine hostname.
    pub hostname: String,
    /// Operating system family.
    pub os: OsFamily,
    /// Caller-supplied tags.
    pub tags: BTreeSet<String>,
    /// Additional custom facts.
    pub extra: BTreeMap<String, String>,
}

impl MachineFacts {
    /// Detect facts for the current machine.
    ///
    /// The hostname comes from the `HOSTNAME` (or `COMPUTERNAME` on Windows)
    /// environment variable; detection never shells out so it cannot fail.
    #[must_use]
    pub fn detect(tags: impl IntoIterator<Item = String>) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            hostname,
            os: detect_os(),
            tags: tags.into_iter().collect(),
            extra: BTreeMap::new(),
        }
    }

    /// Create facts with explicit values (for tests and overrides).
    #[must_use]
    pub fn new(hostname: impl Into<String>, os: OsFamily) -> Self {
        Self {
            hostname: hostname.into(),
            os,
            tags: BTreeSet::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Add a tag, returning self for chaining.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add a custom fact, returning self for chaining.
    #[must_use]
    pub fn with_fact(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Look up a fact by name.
    ///
    /// Returns `None` for unknown facts — conditions treat an unknown fact
    /// as "does not apply", never as an error, so templates stay portable
    /// across machines lacking certain facts.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            "hostname" => Some(self.hostname.clone()),
            "os" => Some(self.os.to_string()),
            _ => self.extra.get(name).cloned(),
        }
    }

    /// Whether the machine carries the given tag (exact, case-sensitive).
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

fn detect_os() -> OsFamily {
    if cfg!(target_os = "windows") {
        OsFamily::Windows
    } else if cfg!(target_os = "macos") {
        OsFamily::Macos
    } else {
        OsFamily::Linux
    }
}
