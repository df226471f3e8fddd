//! Address resolution.
//!
//! Templates address state through several schemes — native filesystem
//! paths, `file://` URIs, hierarchical key addresses (`reg://HIVE/path`),
//! secondary-environment paths (`subsys://NAME/path`), and environment
//! tokens (`$env:VAR`, `$VAR`, `~`). This module normalizes all of them
//! into one typed [`Address`] model.
//!
//! Resolution is a pure function over the input plus a supplied
//! [`ResolveContext`]: variable substitution reads the context map, never
//! the raw process environment, so results are deterministic and testable.
//! Ambiguous or malformed addresses fail with
//! [`ResourceError::UnresolvableAddress`] rather than guessing.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ResourceError;

/// Registry hives accepted in hierarchical key addresses.
const VALID_HIVES: &[(&str, &str)] = &[
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKU", "HKEY_USERS"),
    ("HKCC", "HKEY_CURRENT_CONFIG"),
];

/// Supplied context for address resolution.
///
/// `vars` is the only substitution source; `subsys_mounts` maps secondary
/// environment names to the host-visible root under which their filesystems
/// are reachable (e.g., `\\wsl$\Ubuntu`).
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Home directory used for `~` and `$HOME` expansion.
    pub home: PathBuf,
    /// Base directory that relative paths resolve against (the template's
    /// directory).
    pub base_dir: PathBuf,
    /// Variable substitution map.
    pub vars: BTreeMap<String, String>,
    /// Secondary environment name → host mount root. The unnamed form
    /// (`subsys:///path`) uses the entry named `default`.
    pub subsys_mounts: BTreeMap<String, PathBuf>,
}

impl ResolveContext {
    /// Create a context with the given home and base directory and no
    /// variables or mounts.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            base_dir: base_dir.into(),
            vars: BTreeMap::new(),
            subsys_mounts: BTreeMap::new(),
        }
    }

    /// Add a substitution variable, returning self for chaining.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add a secondary environment mount, returning self for chaining.
    #[must_use]
    pub fn with_mount(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.subsys_mounts.insert(name.into(), root.into());
        self
    }
}

/// The normalized form of a template address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// An absolute native filesystem path.
    FileSystem(PathBuf),
    /// A path under the user's home directory (written with a leading `~`).
    UserHome(PathBuf),
    /// A relative path, already joined against the resolve context's base
    /// directory.
    Relative(PathBuf),
    /// A UNC network path (`\\server\share\...`).
    Network(PathBuf),
    /// A file inside a secondary environment (container/VM), mapped to its
    /// host-visible path.
    SecondaryEnvironment {
        /// Environment name, `None` for the default environment.
        name: Option<String>,
        /// Host-visible path of the file.
        host_path: PathBuf,
    },
    /// A hierarchical key-value address.
    HierarchicalKey(RegistryAddress),
}

impl Address {
    /// The filesystem path this address denotes, if it denotes one.
    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::FileSystem(p)
            | Self::UserHome(p)
            | Self::Relative(p)
            | Self::Network(p)
            | Self::SecondaryEnvironment { host_path: p, .. } => Some(p),
            Self::HierarchicalKey(_) => None,
        }
    }

    /// The registry address, if this is a hierarchical key.
    #[must_use]
    pub const fn registry(&self) -> Option<&RegistryAddress> {
        match self {
            Self::HierarchicalKey(addr) => Some(addr),
            _ => None,
        }
    }
}

/// A hierarchical key address: a hive plus a path of key segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryAddress {
    /// Short hive name, normalized to upper case (e.g., `HKCU`).
    pub hive: String,
    /// Key path segments below the hive.
    pub segments: Vec<String>,
}

impl RegistryAddress {
    /// Parse the part after `reg://`: `HIVE/path/to/key`.
    ///
    /// Accepts both `/` and `\` separators and both short (`HKCU`) and long
    /// (`HKEY_CURRENT_USER`) hive names; the hive is normalized to its short
    /// form.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvableAddress` for an empty address, an unknown hive,
    /// or empty path segments.
    pub fn parse(rest: &str) -> Result<Self, ResourceError> {
        let normalized = rest.replace('\\', "/");
        let mut parts = normalized.split('/').filter(|s| !s.is_empty());
        let Some(raw_hive) = parts.next() else {
            return Err(unresolvable(rest, "missing hive"));
        };
        let upper = raw_hive.to_uppercase();
        let hive = VALID_HIVES
            .iter()
            .find(|(short, long)| upper == *short || upper == *long)
            .map(|(short, _)| (*short).to_string())
            .ok_or_else(|| unresolvable(rest, format!("unknown hive '{raw_hive}'")))?;
        Ok(Self {
            hive,
            segments: parts.map(ToString::to_string).collect(),
        })
    }

    /// The address of the parent key, or `None` at the hive root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            hive: self.hive.clone(),
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The last path segment, or `None` at the hive root.
    #[must_use]
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The address of a child key.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self {
            hive: self.hive.clone(),
            segments,
        }
    }
}

impl fmt::Display for RegistryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg://{}", self.hive)?;
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

/// Resolve a raw template address into its normalized [`Address`] form.
///
/// # Errors
///
/// Returns [`ResourceError::UnresolvableAddress`] for empty input, unknown
/// schemes, undefined substitution variables, unknown hives, and unmounted
/// secondary environments.
pub fn resolve(raw: &str, ctx: &ResolveContext) -> Result<Address, ResourceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(unresolvable(raw, "empty address"));
    }
    let started_with_tilde = trimmed.starts_with('~');
    let expanded = substitute(trimmed, ctx)?;
    let s = expanded.as_str();

    if let Some(rest) = s.strip_prefix("file://") {
        let path = PathBuf::from(rest);
        if rest.is_empty() || !path.is_absolute() {
            return Err(unresolvable(raw, "file:// URI must carry an absolute path"));
        }
        return Ok(Address::FileSystem(path));
    }
    if let Some(rest) = s.strip_prefix("reg://") {
        return Ok(Address::HierarchicalKey(RegistryAddress::parse(rest)?));
    }
    if let Some(rest) = s.strip_prefix("subsys://") {
        return resolve_subsys(raw, rest, ctx);
    }
    if let Some(scheme) = unknown_scheme(s) {
        return Err(unresolvable(raw, format!("unsupported scheme '{scheme}'")));
    }
    if s.starts_with("\\\\") {
        return Ok(Address::Network(PathBuf::from(s)));
    }
    if started_with_tilde {
        return Ok(Address::UserHome(PathBuf::from(s)));
    }
    let path = PathBuf::from(s);
    if path.is_absolute() {
        Ok(Address::FileSystem(path))
    } else {
        Ok(Address::Relative(ctx.base_dir.join(path)))
    }
}

/// Resolve `subsys://NAME/path` or `subsys:///path` against the configured
/// environment mounts.
fn resolve_subsys(raw: &str, rest: &str, ctx: &ResolveContext) -> Result<Address, ResourceError> {
    // `subsys:///home/u` → rest starts with '/': default environment.
    // `subsys://NAME/home/u` → rest starts with the environment name.
    let (name, inner) = if let Some(inner) = rest.strip_prefix('/') {
        (None, inner)
    } else {
        let (name, inner) = rest.split_once('/').unwrap_or((rest, ""));
        (Some(name.to_string()), inner)
    };
    if inner.is_empty() {
        return Err(unresolvable(raw, "secondary environment path is empty"));
    }
    let mount_key = name.as_deref().unwrap_or("default");
    let Some(root) = ctx.subsys_mounts.get(mount_key) else {
        return Err(unresolvable(
            raw,
            format!("no mount configured for secondary environment '{mount_key}'"),
        ));
    };
    let host_path = inner.split('/').fold(root.clone(), |p, seg| p.join(seg));
    Ok(Address::SecondaryEnvironment { name, host_path })
}

/// Substitute `$env:VAR`, `$VAR`, `${VAR}`, and a leading `~` from the
/// resolve context.
fn substitute(input: &str, ctx: &ResolveContext) -> Result<String, ResourceError> {
    static ENV_PREFIX: OnceLock<Regex> = OnceLock::new();
    let re = ENV_PREFIX
        .get_or_init(|| Regex::new(r"\$env:([A-Za-z_][A-Za-z0-9_]*)").expect("valid literal regex"));
    let rewritten = re.replace_all(input, |caps: &regex::Captures<'_>| {
        format!("${{{}}}", &caps[1])
    });

    let home = ctx.home.to_string_lossy().to_string();
    struct Undefined;
    let expanded = shellexpand::full_with_context(
        rewritten.as_ref(),
        || Some(home.clone()),
        |var: &str| -> Result<Option<String>, Undefined> {
            if var == "HOME" {
                return Ok(Some(home.clone()));
            }
            ctx.vars.get(var).cloned().map(Some).ok_or(Undefined)
        },
    )
    .map_err(|e| unresolvable(input, format!("undefined variable '{}'", e.var_name)))?;
    Ok(expanded.into_owned())
}

/// Extract an unrecognized `scheme://` prefix, if present.
fn unknown_scheme(s: &str) -> Option<&str> {
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    let re = SCHEME
        .get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]+)://").expect("valid literal regex"));
    re.captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|scheme| !matches!(*scheme, "file" | "reg" | "subsys"))
}

fn unresolvable(address: &str, reason: impl Into<String>) -> ResourceError {
    ResourceError::UnresolvableAddress {
        address: address.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        ResolveContext::new("/home/alice", "/templates")
            .with_var("USER", "alice")
            .with_var("XDG_CONFIG_HOME", "/home/alice/.config")
            .with_mount("default", "/mnt/subsys")
            .with_mount("ubuntu", "/mnt/ubuntu")
    }

    #[test]
    fn absolute_path_is_filesystem() {
        let addr = resolve("/etc/app/app.conf", &ctx()).unwrap();
        assert_eq!(addr, Address::FileSystem(PathBuf::from("/etc/app/app.conf")));
    }

    #[test]
    fn tilde_path_is_user_home() {
        let addr = resolve("~/.config/app.conf", &ctx()).unwrap();
        assert_eq!(
            addr,
            Address::UserHome(PathBuf::from("/home/alice/.config/app.conf"))
        );
    }

    #[test]
    fn relative_path_joins_base_dir() {
        let addr = resolve("scripts/setup.sh", &ctx()).unwrap();
        assert_eq!(
            addr,
            Address::Relative(PathBuf::from("/templates/scripts/setup.sh"))
        );
    }

    #[test]
    fn file_uri_is_filesystem() {
        let addr = resolve("file:///etc/hosts", &ctx()).unwrap();
        assert_eq!(addr, Address::FileSystem(PathBuf::from("/etc/hosts")));
    }

    #[test]
    fn file_uri_relative_fails() {
        let err = resolve("file://etc/hosts", &ctx()).unwrap_err();
        assert!(matches!(err, ResourceError::UnresolvableAddress { .. }));
    }

    #[test]
    fn network_path() {
        let addr = resolve(r"\\server\share\file.txt", &ctx()).unwrap();
        assert_eq!(addr, Address::Network(PathBuf::from(r"\\server\share\file.txt")));
    }

    #[test]
    fn env_token_substitution_uses_context_not_process_env() {
        let addr = resolve("$env:XDG_CONFIG_HOME/app.conf", &ctx()).unwrap();
        assert_eq!(
            addr,
            Address::FileSystem(PathBuf::from("/home/alice/.config/app.conf"))
        );
    }

    #[test]
    fn dollar_home_and_user_substitution() {
        let addr = resolve("$HOME/data/$USER.toml", &ctx()).unwrap();
        assert_eq!(
            addr,
            Address::FileSystem(PathBuf::from("/home/alice/data/alice.toml"))
        );
    }

    #[test]
    fn undefined_variable_fails() {
        let err = resolve("$env:NO_SUCH_VAR/x", &ctx()).unwrap_err();
        assert!(err.to_string().contains("NO_SUCH_VAR"));
    }

    #[test]
    fn unknown_scheme_fails() {
        let err = resolve("ftp://server/file", &ctx()).unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn empty_address_fails() {
        assert!(resolve("  ", &ctx()).is_err());
    }

    #[test]
    fn registry_address_short_hive() {
        let addr = resolve("reg://HKCU/Console/Font", &ctx()).unwrap();
        let reg = addr.registry().unwrap();
        assert_eq!(reg.hive, "HKCU");
        assert_eq!(reg.segments, vec!["Console", "Font"]);
    }

    #[test]
    fn registry_address_long_hive_normalizes() {
        let addr = resolve("reg://HKEY_CURRENT_USER/Console", &ctx()).unwrap();
        assert_eq!(addr.registry().unwrap().hive, "HKCU");
    }

    #[test]
    fn registry_address_backslash_separators() {
        let addr = resolve(r"reg://HKLM\Software\App", &ctx()).unwrap();
        let reg = addr.registry().unwrap();
        assert_eq!(reg.hive, "HKLM");
        assert_eq!(reg.segments, vec!["Software", "App"]);
    }

    #[test]
    fn registry_unknown_hive_fails() {
        let err = resolve("reg://NOPE/Key", &ctx()).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn registry_display_round_trips() {
        let reg = RegistryAddress::parse("HKCU/Console/Font").unwrap();
        assert_eq!(reg.to_string(), "reg://HKCU/Console/Font");
    }

    #[test]
    fn registry_parent_and_leaf() {
        let reg = RegistryAddress::parse("HKCU/Console/Font").unwrap();
        assert_eq!(reg.leaf(), Some("Font"));
        let parent = reg.parent().unwrap();
        assert_eq!(parent.to_string(), "reg://HKCU/Console");
        assert_eq!(parent.parent().unwrap().parent(), None);
    }

    #[test]
    fn subsys_default_environment() {
        let addr = resolve("subsys:///home/alice/.bashrc", &ctx()).unwrap();
        assert_eq!(
            addr,
            Address::SecondaryEnvironment {
                name: None,
                host_path: PathBuf::from("/mnt/subsys/home/alice/.bashrc"),
            }
        );
    }

    #[test]
    fn subsys_named_environment() {
        let addr = resolve("subsys://ubuntu/etc/wsl.conf", &ctx()).unwrap();
        assert_eq!(
            addr,
            Address::SecondaryEnvironment {
                name: Some("ubuntu".to_string()),
                host_path: PathBuf::from("/mnt/ubuntu/etc/wsl.conf"),
            }
        );
    }

    #[test]
    fn subsys_unmounted_environment_fails() {
        let err = resolve("subsys://missing/etc/x", &ctx()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn subsys_empty_path_fails() {
        assert!(resolve("subsys://ubuntu", &ctx()).is_err());
        assert!(resolve("subsys:///", &ctx()).is_err());
    }

    #[test]
    fn resolution_is_pure_over_context() {
        // Same input, different contexts → different results, no ambient state.
        let a = resolve("~/f", &ResolveContext::new("/home/a", "/t")).unwrap();
        let b = resolve("~/f", &ResolveContext::new("/home/b", "/t")).unwrap();
        assert_ne!(a, b);
    }
}
