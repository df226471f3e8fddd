//! File and directory state management.
//!
//! Capture reads content and metadata (size, modified time, SHA-256
//! checksum) through the path resolver and writes one JSON artifact per
//! resource. For the `sync` action only the checksum manifest is captured;
//! `backup`/`restore` carry full content. Apply validates and decodes the
//! whole artifact before writing anything, recreates the directory
//! structure, and restores Unix permissions where meaningful.
//!
//! A missing source at capture time is a recoverable, logged condition, not
//! an error — most templates target optional software.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::artifact::{self, ManifestEntry, RunManifest, sha256_hex};
use crate::context::RunContext;
use crate::error::ResourceError;
use crate::paths;
use crate::state::{ApplyOutput, CaptureOutput, ResourceKind, StateManager};
use crate::template::{Action, FileEntry, effective_state_path};

/// On-disk artifact payload for one file resource.
#[derive(Debug, Serialize, Deserialize)]
struct FileArtifact {
    /// Resolved source path at capture time; the default restore target.
    root: String,
    /// Whether the root was a directory.
    directory: bool,
    /// Whether records carry content (`false` for `sync` captures).
    with_content: bool,
    /// One record per regular file, sorted by relative path.
    entries: Vec<FileRecord>,
}

/// One captured file.
#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    /// Path relative to the root; empty when the root is the file itself.
    path: String,
    /// Content length in bytes.
    size: u64,
    /// Modification time, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modified: Option<u64>,
    /// Unix permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
    /// SHA-256 (hex) of the file content.
    checksum: String,
    /// Base64 content; absent in `sync` captures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

/// State manager for file resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStateManager;

impl FileStateManager {
    fn entry<'t>(ctx: &'t RunContext, key: &str) -> Result<&'t FileEntry, ResourceError> {
        ctx.template
            .files
            .get(key)
            .ok_or_else(|| ResourceError::Payload(format!("unknown file resource '{key}'")))
    }

    fn source_path(ctx: &RunContext, entry: &FileEntry) -> Result<PathBuf, ResourceError> {
        let resolved = paths::resolve(&entry.path, &ctx.resolve)?;
        resolved
            .file_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| ResourceError::UnresolvableAddress {
                address: entry.path.clone(),
                reason: "not a filesystem path".to_string(),
            })
    }
}

impl StateManager for FileStateManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::File
    }

    fn capture(&self, ctx: &RunContext, key: &str) -> Result<CaptureOutput, ResourceError> {
        let entry = Self::entry(ctx, key)?;
        let source = Self::source_path(ctx, entry)?;

        if !source.exists() {
            let warning = format!("source '{}' does not exist; skipped", source.display());
            tracing::warn!(resource = key, "{warning}");
            return Ok(CaptureOutput {
                entry: None,
                warning: Some(warning),
            });
        }

        if ctx.dry_run {
            return Ok(CaptureOutput::default());
        }

        let with_content = entry.action() != Action::Sync;
        let directory = source.is_dir();
        let mut records = Vec::new();
        if directory {
            let mut files = Vec::new();
            collect_files(&source, &source, &mut files)?;
            files.sort();
            for rel in files {
                records.push(read_record(&source.join(&rel), &rel, with_content)?);
            }
        } else {
            records.push(read_record(&source, Path::new(""), with_content)?);
        }

        let payload = serde_json::to_vec_pretty(&FileArtifact {
            root: dunce::simplified(&source).display().to_string(),
            directory,
            with_content,
            entries: records,
        })
        .map_err(|e| ResourceError::Payload(e.to_string()))?;

        let state_path = effective_state_path("files", key, entry.state_path.as_deref());
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
                kind: ResourceKind::File,
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

        let Some(man_entry) = manifest.entry(ResourceKind::File, key) else {
            return Ok(ApplyOutput {
                warning: Some("no captured artifact; skipped".to_string()),
            });
        };

        // Decrypt, parse, and decode every record before the first write so
        // a bad artifact can never leave the target half-applied.
        let payload =
            artifact::read_payload(&ctx.artifact_dir, man_entry, ctx.passphrase.as_deref())?;
        let parsed: FileArtifact =
            serde_json::from_slice(&payload).map_err(|e| ResourceError::Payload(e.to_string()))?;
        let decoded = decode_records(&parsed)?;

        let target = match &entry.destination {
            Some(dest) => Self::source_path(
                ctx,
                &FileEntry {
                    path: dest.clone(),
                    ..entry.clone()
                },
            )?,
            None => PathBuf::from(&parsed.root),
        };

        if !parsed.with_content {
            return Ok(verify_sync(&parsed, &target));
        }

        if ctx.dry_run {
            return Ok(ApplyOutput::default());
        }

        if parsed.directory {
            std::fs::create_dir_all(&target).map_err(|_| ResourceError::DestinationUnavailable {
                target: target.display().to_string(),
            })?;
        }
        for (record, content) in decoded {
            let dest = join_rel(&target, &record.path);
            write_file(&dest, &content, record)?;
        }

        Ok(ApplyOutput::default())
    }
}

/// Recursively collect regular files below `dir`, as paths relative to
/// `base`.
fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ResourceError> {
    let reader =
        std::fs::read_dir(dir).map_err(|e| ResourceError::io(dir.display().to_string(), e))?;
    for item in reader {
        let item = item.map_err(|e| ResourceError::io(dir.display().to_string(), e))?;
        let path = item.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(base)
                .map_or_else(|_| path.clone(), Path::to_path_buf);
            out.push(rel);
        }
    }
    Ok(())
}

/// Read one file into a capture record.
fn read_record(path: &Path, rel: &Path, with_content: bool) -> Result<FileRecord, ResourceError> {
    let display = path.display().to_string();
    let content = std::fs::read(path).map_err(|e| ResourceError::io(display.clone(), e))?;
    let metadata = std::fs::metadata(path).map_err(|e| ResourceError::io(display, e))?;

    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt as _;
        Some(metadata.permissions().mode() & 0o7777)
    };
    #[cfg(not(unix))]
    let mode = None;

    Ok(FileRecord {
        path: rel.to_string_lossy().replace('\\', "/"),
        size: content.len() as u64,
        modified,
        mode,
        checksum: sha256_hex(&content),
        content: with_content.then(|| BASE64.encode(&content)),
    })
}

/// Decode every record's content up front, validating checksums.
fn decode_records(parsed: &FileArtifact) -> Result<Vec<(&FileRecord, Vec<u8>)>, ResourceError> {
    if !parsed.with_content {
        return Ok(Vec::new());
    }
    let mut decoded = Vec::with_capacity(parsed.entries.len());
    for record in &parsed.entries {
        let encoded = record.content.as_deref().ok_or_else(|| {
            ResourceError::Payload(format!("record '{}' is missing content", record.path))
        })?;
        let content = BASE64.decode(encoded).map_err(|e| {
            ResourceError::Payload(format!("record '{}': invalid base64: {e}", record.path))
        })?;
        if sha256_hex(&content) != record.checksum {
            return Err(ResourceError::Payload(format!(
                "record '{}': content checksum mismatch",
                record.path
            )));
        }
        decoded.push((record, content));
    }
    Ok(decoded)
}

/// Check a `sync` capture against the current target state.
fn verify_sync(parsed: &FileArtifact, target: &Path) -> ApplyOutput {
    let mut drifted = Vec::new();
    for record in &parsed.entries {
        let dest = join_rel(target, &record.path);
        let matches = std::fs::read(&dest)
            .map(|content| sha256_hex(&content) == record.checksum)
            .unwrap_or(false);
        if !matches {
            drifted.push(record.path.clone());
        }
    }
    if drifted.is_empty() {
        ApplyOutput::default()
    } else {
        ApplyOutput {
            warning: Some(format!(
                "{} of {} file(s) drifted from the captured checksums: {}",
                drifted.len(),
                parsed.entries.len(),
                drifted.join(", ")
            )),
        }
    }
}

/// Join a record-relative path under the target root; an empty relative
/// path means the root itself.
fn join_rel(target: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        target.to_path_buf()
    } else {
        rel.split('/').fold(target.to_path_buf(), |p, seg| p.join(seg))
    }
}

/// Write one file, creating parents and restoring permissions.
///
/// Skips the write when the destination already holds identical content, so
/// a repeated apply changes nothing observable.
fn write_file(dest: &Path, content: &[u8], record: &FileRecord) -> Result<(), ResourceError> {
    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|_| ResourceError::DestinationUnavailable {
            target: parent.display().to_string(),
        })?;
    }

    let unchanged = std::fs::read(dest)
        .map(|existing| sha256_hex(&existing) == record.checksum)
        .unwrap_or(false);
    if !unchanged {
        std::fs::write(dest, content)
            .map_err(|e| ResourceError::io(dest.display().to_string(), e))?;
    }

    #[cfg(unix)]
    if let Some(mode) = record.mode {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
            .map_err(|e| ResourceError::io(dest.display().to_string(), e))?;
    }

    Ok(())
}
