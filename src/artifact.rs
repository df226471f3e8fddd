//! Artifact directory layout and the run manifest.
//!
//! One backup run owns one artifact directory. Every captured resource
//! writes exactly one payload at its state path, and the run's
//! `manifest.json` lists resource key → artifact path → encrypted flag →
//! checksum. Restore validates payloads against the manifest **before**
//! touching the target machine.
//!
//! Checksums are SHA-256 over the stored bytes (i.e., over the ciphertext
//! when the payload is encrypted), so manifest verification detects
//! corruption without needing the passphrase.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::crypto;
use crate::error::{EngineError, ResourceError};
use crate::state::ResourceKind;
use crate::template::Template;

/// Manifest filename at the artifact directory root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One captured resource in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Resource key within its template section.
    pub key: String,
    /// Resource kind (decides which state manager applies it).
    pub kind: ResourceKind,
    /// Payload path relative to the artifact directory.
    pub path: String,
    /// Whether the payload is passphrase-protected.
    pub encrypted: bool,
    /// SHA-256 (hex) of the stored payload bytes.
    pub checksum: String,
}

/// The `manifest.json` of one run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunManifest {
    /// Name of the template that produced this run.
    pub template: String,
    /// Template version at capture time.
    pub version: String,
    /// One entry per captured resource.
    pub entries: Vec<ManifestEntry>,
}

impl RunManifest {
    /// Start an empty manifest for a template.
    #[must_use]
    pub fn for_template(template: &Template) -> Self {
        Self {
            template: template.display_name(),
            version: template.metadata.version.clone(),
            entries: Vec::new(),
        }
    }

    /// Load `manifest.json` from an artifact directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Manifest`] when the file is absent or cannot
    /// be parsed — a restore cannot proceed without a valid manifest.
    pub fn load(artifact_dir: &Path) -> Result<Self, EngineError> {
        let path = artifact_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Manifest(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Manifest(format!("cannot parse {}: {e}", path.display())))
    }

    /// Write `manifest.json` into an artifact directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when the file cannot be written.
    pub fn save(&self, artifact_dir: &Path) -> Result<(), EngineError> {
        let path = artifact_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Manifest(format!("cannot serialize manifest: {e}")))?;
        std::fs::write(&path, json).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Find the entry for a resource.
    #[must_use]
    pub fn entry(&self, kind: ResourceKind, key: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.kind == kind && e.key == key)
    }
}

/// Result of storing one payload.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Payload path relative to the artifact directory.
    pub rel_path: String,
    /// Whether the stored bytes are passphrase-protected.
    pub encrypted: bool,
    /// SHA-256 (hex) of the stored bytes.
    pub checksum: String,
}

/// SHA-256 of a byte slice, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Store one payload at its state path inside the artifact directory,
/// protecting it first when requested.
///
/// # Errors
///
/// Returns [`ResourceError::PassphraseMissing`] when encryption is requested
/// without a passphrase, [`ResourceError::Payload`] for an unsafe state
/// path, and [`ResourceError::Io`] for write failures.
pub fn write_payload(
    artifact_dir: &Path,
    state_path: &str,
    plaintext: &[u8],
    encrypt: bool,
    passphrase: Option<&str>,
) -> Result<StoredArtifact, ResourceError> {
    let target = safe_join(artifact_dir, state_path)?;

    let stored: Vec<u8> = if encrypt {
        let passphrase = passphrase.ok_or(ResourceError::PassphraseMissing)?;
        crypto::protect(plaintext, passphrase)?
    } else {
        plaintext.to_vec()
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ResourceError::io(parent.display().to_string(), e))?;
    }
    std::fs::write(&target, &stored)
        .map_err(|e| ResourceError::io(target.display().to_string(), e))?;

    Ok(StoredArtifact {
        rel_path: state_path.to_string(),
        encrypted: encrypt,
        checksum: sha256_hex(&stored),
    })
}

/// Read a payload referenced by a manifest entry, verifying its checksum
/// and unprotecting it when encrypted.
///
/// Verification happens fully before any caller applies the payload, so a
/// corrupted or wrongly-keyed artifact can never be half-applied.
///
/// # Errors
///
/// Returns [`ResourceError::ArtifactMissing`], [`ResourceError::ChecksumMismatch`],
/// [`ResourceError::PassphraseMissing`], or [`ResourceError::DecryptionFailed`]
/// as appropriate.
pub fn read_payload(
    artifact_dir: &Path,
    entry: &ManifestEntry,
    passphrase: Option<&str>,
) -> Result<Vec<u8>, ResourceError> {
    let path = safe_join(artifact_dir, &entry.path)?;
    if !path.is_file() {
        return Err(ResourceError::ArtifactMissing {
            path: entry.path.clone(),
        });
    }
    let stored =
        std::fs::read(&path).map_err(|e| ResourceError::io(path.display().to_string(), e))?;

    if sha256_hex(&stored) != entry.checksum {
        return Err(ResourceError::ChecksumMismatch {
            path: entry.path.clone(),
        });
    }

    if entry.encrypted {
        let passphrase = passphrase.ok_or(ResourceError::PassphraseMissing)?;
        crypto::unprotect(&stored, passphrase)
    } else {
        Ok(stored)
    }
}

/// Join a state path under the artifact directory, rejecting absolute paths
/// and parent traversal.
fn safe_join(artifact_dir: &Path, state_path: &str) -> Result<PathBuf, ResourceError> {
    let rel = Path::new(state_path);
    let unsafe_component = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if state_path.is_empty() || unsafe_component {
        return Err(ResourceError::Payload(format!(
            "unsafe state path '{state_path}'"
        )));
    }
    Ok(artifact_dir.join(rel))
}
