//! Hierarchical key-value (registry-like) state management.
//!
//! A key can have child keys and named values with typed payloads. Capture
//! serializes the subtree at a `reg://HIVE/path` address into the artifact;
//! apply writes values back, creating intermediate keys as needed. Absent
//! keys at capture time are not an error — "not installed" simply captures
//! an empty tree.
//!
//! Access goes through the [`KeyValueStore`] capability: the real Windows
//! registry on Windows, an in-memory store elsewhere and in tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::artifact::{self, ManifestEntry, RunManifest};
use crate::context::RunContext;
use crate::error::ResourceError;
use crate::paths::{self, RegistryAddress};
use crate::state::{ApplyOutput, CaptureOutput, ResourceKind, StateManager};
use crate::template::{RegistryEntry, effective_state_path};

/// A typed value payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ValueData {
    /// A UTF-8 string value.
    String(String),
    /// A signed integer value.
    Number(i64),
    /// An opaque binary value, stored as base64 in artifacts.
    #[serde(with = "b64")]
    Binary(Vec<u8>),
    /// A list of strings.
    List(Vec<String>),
}

impl ValueData {
    /// Convert a template TOML default value into a typed payload.
    #[must_use]
    pub fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(Self::String(s.clone())),
            toml::Value::Integer(i) => Some(Self::Number(*i)),
            toml::Value::Boolean(b) => Some(Self::Number(i64::from(*b))),
            toml::Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(ToString::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            _ => None,
        }
    }
}

/// Base64 (de)serialization for binary value payloads.
mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A key subtree: named values plus child keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTree {
    /// Named values directly under this key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, ValueData>,
    /// Child keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, KeyTree>,
}

impl KeyTree {
    /// Whether this subtree carries no values and no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.keys.is_empty()
    }
}

/// Hierarchical key-value store capability.
///
/// Reads tolerate absent keys (`Ok(None)`); writes fail with
/// [`ResourceError::DestinationUnavailable`] when the target key cannot be
/// created or reached.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    /// Read the whole subtree at an address. `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] when the store itself cannot be accessed.
    fn read_tree(&self, addr: &RegistryAddress) -> Result<Option<KeyTree>, ResourceError>;

    /// Read one named value directly under an address. `Ok(None)` when the
    /// key or the value is absent.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] when the store itself cannot be accessed.
    fn read_value(
        &self,
        addr: &RegistryAddress,
        name: &str,
    ) -> Result<Option<ValueData>, ResourceError>;

    /// Create a key (and any missing intermediate keys).
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::DestinationUnavailable`] when the key cannot
    /// be created.
    fn create_key(&self, addr: &RegistryAddress) -> Result<(), ResourceError>;

    /// Write one named value under an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::DestinationUnavailable`] when the target key
    /// does not exist.
    fn write_value(
        &self,
        addr: &RegistryAddress,
        name: &str,
        value: &ValueData,
    ) -> Result<(), ResourceError>;
}

/// In-memory [`KeyValueStore`].
///
/// The default store on platforms without a system registry, and the
/// fixture store in tests. Addresses can be marked as denied to simulate
/// uncreatable destinations.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    hives: Mutex<BTreeMap<String, KeyTree>>,
    denied: Mutex<Vec<String>>,
}

impl MemoryKeyStore {
    /// Seed a subtree at an address, creating intermediate keys.
    pub fn seed(&self, addr: &RegistryAddress, tree: KeyTree) {
        let mut hives = self.lock_hives();
        let node = descend_mut(hives.entry(addr.hive.clone()).or_default(), &addr.segments);
        *node = tree;
    }

    /// Refuse future creation of this address and everything below it.
    pub fn deny(&self, addr: &RegistryAddress) {
        self.lock_denied().push(addr.to_string());
    }

    fn is_denied(&self, addr: &RegistryAddress) -> bool {
        let display = addr.to_string();
        self.lock_denied()
            .iter()
            .any(|denied| display == *denied || display.starts_with(&format!("{denied}/")))
    }

    fn lock_hives(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, KeyTree>> {
        self.hives
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_denied(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.denied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Walk (creating) to the node at the given segments.
fn descend_mut<'a>(root: &'a mut KeyTree, segments: &[String]) -> &'a mut KeyTree {
    segments
        .iter()
        .fold(root, |node, seg| node.keys.entry(seg.clone()).or_default())
}

/// Walk (read-only) to the node at the given segments.
fn descend<'a>(root: &'a KeyTree, segments: &[String]) -> Option<&'a KeyTree> {
    segments.iter().try_fold(root, |node, seg| node.keys.get(seg))
}

impl KeyValueStore for MemoryKeyStore {
    fn read_tree(&self, addr: &RegistryAddress) -> Result<Option<KeyTree>, ResourceError> {
        let hives = self.lock_hives();
        Ok(hives
            .get(&addr.hive)
            .and_then(|root| descend(root, &addr.segments))
            .cloned())
    }

    fn read_value(
        &self,
        addr: &RegistryAddress,
        name: &str,
    ) -> Result<Option<ValueData>, ResourceError> {
        let hives = self.lock_hives();
        Ok(hives
            .get(&addr.hive)
            .and_then(|root| descend(root, &addr.segments))
            .and_then(|node| node.values.get(name))
            .cloned())
    }

    fn create_key(&self, addr: &RegistryAddress) -> Result<(), ResourceError> {
        if self.is_denied(addr) {
            return Err(ResourceError::DestinationUnavailable {
                target: addr.to_string(),
            });
        }
        let mut hives = self.lock_hives();
        descend_mut(hives.entry(addr.hive.clone()).or_default(), &addr.segments);
        Ok(())
    }

    fn write_value(
        &self,
        addr: &RegistryAddress,
        name: &str,
        value: &ValueData,
    ) -> Result<(), ResourceError> {
        let mut hives = self.lock_hives();
        let node = hives
            .get_mut(&addr.hive)
            .and_then(|root| descend_existing_mut(root, &addr.segments));
        match node {
            Some(node) => {
                node.values.insert(name.to_string(), value.clone());
                Ok(())
            }
            None => Err(ResourceError::DestinationUnavailable {
                target: addr.to_string(),
            }),
        }
    }
}

/// Walk (without creating) to the node at the given segments, mutably.
fn descend_existing_mut<'a>(root: &'a mut KeyTree, segments: &[String]) -> Option<&'a mut KeyTree> {
    segments
        .iter()
        .try_fold(root, |node, seg| node.keys.get_mut(seg))
}

/// The platform's system key-value store.
///
/// On Windows this is the real registry via `winreg`; elsewhere reads see
/// an empty store and writes report the destination as unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKeyStore;

#[cfg(not(windows))]
impl KeyValueStore for SystemKeyStore {
    fn read_tree(&self, _addr: &RegistryAddress) -> Result<Option<KeyTree>, ResourceError> {
        Ok(None)
    }

    fn read_value(
        &self,
        _addr: &RegistryAddress,
        _name: &str,
    ) -> Result<Option<ValueData>, ResourceError> {
        Ok(None)
    }

    fn create_key(&self, addr: &RegistryAddress) -> Result<(), ResourceError> {
        Err(ResourceError::DestinationUnavailable {
            target: format!("{addr} (no system key-value store on this platform)"),
        })
    }

    fn write_value(
        &self,
        addr: &RegistryAddress,
        _name: &str,
        _value: &ValueData,
    ) -> Result<(), ResourceError> {
        Err(ResourceError::DestinationUnavailable {
            target: format!("{addr} (no system key-value store on this platform)"),
        })
    }
}

#[cfg(windows)]
impl KeyValueStore for SystemKeyStore {
    fn read_tree(&self, addr: &RegistryAddress) -> Result<Option<KeyTree>, ResourceError> {
        let Some(key) = windows::open(addr)? else {
            return Ok(None);
        };
        windows::read_tree(&key).map(Some)
    }

    fn read_value(
        &self,
        addr: &RegistryAddress,
        name: &str,
    ) -> Result<Option<ValueData>, ResourceError> {
        let Some(key) = windows::open(addr)? else {
            return Ok(None);
        };
        Ok(windows::read_tree(&key)?.values.remove(name))
    }

    fn create_key(&self, addr: &RegistryAddress) -> Result<(), ResourceError> {
        windows::create(addr).map(|_| ())
    }

    fn write_value(
        &self,
        addr: &RegistryAddress,
        name: &str,
        value: &ValueData,
    ) -> Result<(), ResourceError> {
        let key = windows::create(addr)?;
        windows::write_value(&key, addr, name, value)
    }
}

#[cfg(windows)]
mod windows {
    //! `winreg`-backed access to the real Windows registry.

    use winreg::enums::{
        HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS,
        RegType,
    };
    use winreg::{RegKey, RegValue};

    use super::{KeyTree, ValueData};
    use crate::error::ResourceError;
    use crate::paths::RegistryAddress;

    fn hive(addr: &RegistryAddress) -> Result<RegKey, ResourceError> {
        let predef = match addr.hive.as_str() {
            "HKCU" => HKEY_CURRENT_USER,
            "HKLM" => HKEY_LOCAL_MACHINE,
            "HKCR" => HKEY_CLASSES_ROOT,
            "HKU" => HKEY_USERS,
            "HKCC" => HKEY_CURRENT_CONFIG,
            other => {
                return Err(ResourceError::UnresolvableAddress {
                    address: addr.to_string(),
                    reason: format!("unknown hive '{other}'"),
                });
            }
        };
        Ok(RegKey::predef(predef))
    }

    pub fn open(addr: &RegistryAddress) -> Result<Option<RegKey>, ResourceError> {
        match hive(addr)?.open_subkey(addr.segments.join("\\")) {
            Ok(key) => Ok(Some(key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ResourceError::io(addr.to_string(), e)),
        }
    }

    pub fn create(addr: &RegistryAddress) -> Result<RegKey, ResourceError> {
        hive(addr)?
            .create_subkey(addr.segments.join("\\"))
            .map(|(key, _)| key)
            .map_err(|_| ResourceError::DestinationUnavailable {
                target: addr.to_string(),
            })
    }

    pub fn read_tree(key: &RegKey) -> Result<KeyTree, ResourceError> {
        let mut tree = KeyTree::default();
        for value in key.enum_values() {
            let (name, raw) = value.map_err(|e| ResourceError::io("registry", e))?;
            tree.values.insert(name, convert(&raw));
        }
        for child in key.enum_keys() {
            let name = child.map_err(|e| ResourceError::io("registry", e))?;
            let sub = key
                .open_subkey(&name)
                .map_err(|e| ResourceError::io(&name, e))?;
            tree.keys.insert(name, read_tree(&sub)?);
        }
        Ok(tree)
    }

    fn convert(raw: &RegValue) -> ValueData {
        use winreg::types::FromRegValue as _;
        match raw.vtype {
            RegType::REG_SZ | RegType::REG_EXPAND_SZ => String::from_reg_value(raw)
                .map_or_else(|_| ValueData::Binary(raw.bytes.clone()), ValueData::String),
            RegType::REG_DWORD => u32::from_reg_value(raw)
                .map_or_else(|_| ValueData::Binary(raw.bytes.clone()), |v| {
                    ValueData::Number(i64::from(v))
                }),
            RegType::REG_QWORD => u64::from_reg_value(raw)
                .map_or_else(|_| ValueData::Binary(raw.bytes.clone()), |v| {
                    ValueData::Number(v as i64)
                }),
            RegType::REG_MULTI_SZ => Vec::<String>::from_reg_value(raw)
                .map_or_else(|_| ValueData::Binary(raw.bytes.clone()), ValueData::List),
            _ => ValueData::Binary(raw.bytes.clone()),
        }
    }

    pub fn write_value(
        key: &RegKey,
        addr: &RegistryAddress,
        name: &str,
        value: &ValueData,
    ) -> Result<(), ResourceError> {
        let result = match value {
            ValueData::String(s) => key.set_value(name, s),
            ValueData::Number(n) => {
                u32::try_from(*n).map_or_else(|_| key.set_value(name, &(*n as u64)), |v| {
                    key.set_value(name, &v)
                })
            }
            ValueData::List(items) => key.set_value(name, items),
            ValueData::Binary(bytes) => key.set_raw_value(
                name,
                &RegValue {
                    bytes: bytes.clone(),
                    vtype: RegType::REG_BINARY,
                },
            ),
        };
        result.map_err(|_| ResourceError::DestinationUnavailable {
            target: addr.to_string(),
        })
    }
}

/// On-disk artifact payload for one registry resource.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryArtifact {
    /// The captured address, for display and apply-target defaulting.
    address: String,
    /// The captured subtree.
    tree: KeyTree,
}

/// State manager for hierarchical key-value resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStateManager;

impl RegistryStateManager {
    fn entry<'t>(ctx: &'t RunContext, key: &str) -> Result<&'t RegistryEntry, ResourceError> {
        ctx.template
            .registry
            .get(key)
            .ok_or_else(|| ResourceError::Payload(format!("unknown registry resource '{key}'")))
    }

    fn address(ctx: &RunContext, entry: &RegistryEntry) -> Result<RegistryAddress, ResourceError> {
        let resolved = paths::resolve(&entry.path, &ctx.resolve)?;
        resolved.registry().cloned().ok_or_else(|| {
            ResourceError::UnresolvableAddress {
                address: entry.path.clone(),
                reason: "not a hierarchical key address".to_string(),
            }
        })
    }
}

impl StateManager for RegistryStateManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Registry
    }

    fn capture(&self, ctx: &RunContext, key: &str) -> Result<CaptureOutput, ResourceError> {
        let entry = Self::entry(ctx, key)?;
        let addr = Self::address(ctx, entry)?;

        // Absent key → empty tree, by design: "not installed" is valid state.
        let tree = ctx.key_store.read_tree(&addr)?.unwrap_or_default();
        if tree.is_empty() {
            tracing::debug!(resource = key, address = %addr, "key absent or empty, capturing empty tree");
        }

        if ctx.dry_run {
            return Ok(CaptureOutput::default());
        }

        let payload = serde_json::to_vec_pretty(&RegistryArtifact {
            address: addr.to_string(),
            tree,
        })
        .map_err(|e| ResourceError::Payload(e.to_string()))?;

        let state_path = effective_state_path("registry", key, entry.state_path.as_deref());
        let stored = artifact::write_payload(
            &ctx.artifact_dir,
            &state_path,
            &payload,
            entry.encrypt,
            ctx.passphrase.as_deref(),
        )?;

        Ok(CaptureOutput {
            entry: Some(ManifestEntry {
                key: key.to_string(),
                kind: ResourceKind::Registry,
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
        let entry = Self::entry(ctx, key)?;
        let addr = Self::address(ctx, entry)?;

        let Some(man_entry) = manifest.entry(ResourceKind::Registry, key) else {
            return apply_defaults(ctx, entry, &addr);
        };

        // Decrypt and parse fully before any write.
        let payload =
            artifact::read_payload(&ctx.artifact_dir, man_entry, ctx.passphrase.as_deref())?;
        let parsed: RegistryArtifact =
            serde_json::from_slice(&payload).map_err(|e| ResourceError::Payload(e.to_string()))?;

        if ctx.dry_run {
            return Ok(ApplyOutput::default());
        }

        let mut errors = Vec::new();
        apply_tree(ctx, &addr, &parsed.tree, &mut errors);
        match errors.into_iter().next() {
            None => Ok(ApplyOutput::default()),
            Some(first) => Err(first),
        }
    }
}

/// Write the template's default values when no captured artifact exists.
fn apply_defaults(
    ctx: &RunContext,
    entry: &RegistryEntry,
    addr: &RegistryAddress,
) -> Result<ApplyOutput, ResourceError> {
    let Some(defaults) = &entry.value else {
        return Ok(ApplyOutput {
            warning: Some("no captured artifact and no default value; skipped".to_string()),
        });
    };
    if ctx.dry_run {
        return Ok(ApplyOutput::default());
    }
    ctx.key_store.create_key(addr)?;
    for (name, raw) in defaults {
        let value = ValueData::from_toml(raw).ok_or_else(|| {
            ResourceError::Payload(format!("default value '{name}' has an unsupported type"))
        })?;
        ctx.key_store.write_value(addr, name, &value)?;
    }
    Ok(ApplyOutput::default())
}

/// Recursively write a captured subtree, collecting per-key failures so one
/// unreachable destination does not abandon sibling keys.
fn apply_tree(
    ctx: &RunContext,
    addr: &RegistryAddress,
    tree: &KeyTree,
    errors: &mut Vec<ResourceError>,
) {
    if let Err(e) = ctx.key_store.create_key(addr) {
        errors.push(e);
        return;
    }
    for (name, value) in &tree.values {
        if let Err(e) = ctx.key_store.write_value(addr, name, value) {
            errors.push(e);
        }
    }
    for (name, child) in &tree.keys {
        apply_tree(ctx, &addr.child(name), child, errors);
    }
}
