//! Trash manager: quarantine moves, bounded restoration, retention cleanup.
//!
//! Moves are one safe primitive: atomic rename, with a streaming
//! copy + fsync + rename + remove-source fallback when the rename crosses
//! devices. Callers never see the fallback.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::cancel::CancelToken;
use crate::core::config::{Config, TrashConfig};
use crate::core::errors::{Result, SageError};
use crate::core::paths;
use crate::trash::meta::TrashMeta;

/// Streaming-copy buffer size for the cross-device fallback.
const COPY_BUFFER_BYTES: usize = 32 * 1024;
/// Safe base names are truncated to this many bytes.
const MAX_SAFE_BASE_BYTES: usize = 100;
/// Sidecar metadata suffix.
pub const META_SUFFIX: &str = ".meta";

/// One entry in the quarantine area.
#[derive(Debug, Clone, Serialize)]
pub struct TrashItem {
    /// Display name (the on-disk trash file name).
    pub name: String,
    /// On-disk path inside the trash root.
    pub path: PathBuf,
    /// Original path from signed metadata; absent when metadata is missing
    /// or does not verify.
    pub original_path: Option<PathBuf>,
    /// For directories, the recursively summed content size.
    pub size: u64,
    /// The entry's modification time.
    pub trashed_at: DateTime<Utc>,
    pub is_dir: bool,
}

/// Per-process quarantine manager. Single writer per instance; the signing
/// key is immutable for the manager's lifetime.
pub struct TrashManager {
    root: PathBuf,
    retention: Option<std::time::Duration>,
    signing_key: Vec<u8>,
    allowed_restore_roots: Vec<PathBuf>,
    closed: AtomicBool,
}

impl TrashManager {
    /// Create a manager, ensuring the trash root exists.
    ///
    /// When no signing key is supplied, a random ephemeral one is generated
    /// and a warning is emitted: metadata written now will not verify after
    /// a restart.
    pub fn new(
        root: &Path,
        retention: Option<std::time::Duration>,
        signing_key: Option<Vec<u8>>,
        allowed_restore_roots: Vec<PathBuf>,
    ) -> Result<Self> {
        let root = paths::absolute_clean(root);
        fs::create_dir_all(&root).map_err(|source| SageError::io(&root, source))?;

        let signing_key = signing_key.unwrap_or_else(|| {
            eprintln!(
                "[SSG-TRASH] no signing key configured; using an ephemeral key — \
                 trash metadata will not verify across restarts"
            );
            let mut key = vec![0u8; 32];
            rand::rng().fill_bytes(&mut key);
            key
        });

        Ok(Self {
            root,
            retention,
            signing_key,
            allowed_restore_roots: allowed_restore_roots
                .iter()
                .map(|r| paths::clean(r))
                .collect(),
            closed: AtomicBool::new(false),
        })
    }

    /// Build from the validated config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let trash: &TrashConfig = &config.trash;
        let key = if trash.signing_key.is_empty() {
            None
        } else {
            Some(decode_hex_key(&trash.signing_key)?)
        };
        Self::new(
            &trash.root,
            config.trash_retention()?,
            key,
            trash.allowed_restore_roots.clone(),
        )
    }

    /// The trash root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Idempotent close; the second and later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        self.closed.swap(true, Ordering::SeqCst);
        Ok(())
    }

    // ──────────────────── move to trash ────────────────────

    /// Move `source` into the quarantine area and write its signed sidecar.
    /// Returns the on-disk trash path.
    pub fn move_to_trash(&self, source: &Path) -> Result<PathBuf> {
        let source = paths::absolute_clean(source);
        let lstat =
            fs::symlink_metadata(&source).map_err(|err| SageError::io(&source, err))?;

        let size = if lstat.is_dir() {
            tree_file_size(&source)
        } else {
            lstat.len()
        };
        let meta = TrashMeta {
            original_path: source.clone(),
            trashed_at: Utc::now(),
            size,
            mode: permission_bits(&lstat),
            mod_time: system_time_utc(lstat.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        };

        let trash_path = self.unique_trash_path(&source);
        move_entry(&source, &trash_path)?;
        // The entry's own mtime now means "trashed at"; the original
        // mod_time lives in the sidecar. Without this, a rename-preserved
        // mtime would age old entries straight past the retention window.
        touch_now(&trash_path);
        self.write_meta(&trash_path, &meta)?;
        Ok(trash_path)
    }

    fn unique_trash_path(&self, source: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let digest = Sha256::digest(source.to_string_lossy().as_bytes());
        let hash8: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
        let base = safe_base_name(source);

        let name = format!("{stamp}_{hash8}_{base}");
        let mut candidate = self.root.join(&name);
        let mut counter = 1u32;
        while candidate.exists() || sidecar_path(&candidate).exists() {
            candidate = self.root.join(format!("{name}-{counter}"));
            counter += 1;
        }
        candidate
    }

    fn write_meta(&self, trash_path: &Path, meta: &TrashMeta) -> Result<()> {
        let meta_path = sidecar_path(trash_path);
        let content = meta.to_signed_string(&self.signing_key);
        write_private(&meta_path, content.as_bytes())
    }

    // ──────────────────── restore ────────────────────

    /// Restore a trashed entry to its original path. Returns that path.
    ///
    /// The trash path must sit inside the trash root; the sidecar must
    /// verify; the recorded original path must be absolute, lexically
    /// clean, and (when restore roots are configured) inside one of them.
    pub fn restore(&self, trash_path: &Path) -> Result<PathBuf> {
        let trash_path = paths::clean(trash_path);
        if !paths::is_within(&trash_path, &self.root) || trash_path == self.root {
            return Err(SageError::RestoreDenied {
                path: trash_path,
                reason: "outside trash root".to_string(),
            });
        }

        let meta_path = sidecar_path(&trash_path);
        let raw = fs::read_to_string(&meta_path).map_err(|_| SageError::Tampering {
            path: meta_path.clone(),
            details: "metadata missing or unreadable".to_string(),
        })?;
        let meta = TrashMeta::parse_verified(&raw, &self.signing_key, &meta_path)?;

        let original = meta.original_path;
        if !original.is_absolute() || paths::clean(&original) != original {
            return Err(SageError::RestoreDenied {
                path: original,
                reason: "original path not absolute and clean".to_string(),
            });
        }
        if !self.allowed_restore_roots.is_empty()
            && !paths::is_within_any(&original, &self.allowed_restore_roots)
        {
            return Err(SageError::RestoreDenied {
                path: original,
                reason: "outside allowed restore roots".to_string(),
            });
        }

        if fs::symlink_metadata(&original).is_ok() {
            return Err(SageError::RestoreDenied {
                path: original,
                reason: "destination exists".to_string(),
            });
        }

        if let Some(parent) = original.parent() {
            fs::create_dir_all(parent).map_err(|source| SageError::io(parent, source))?;
        }
        move_entry(&trash_path, &original)?;
        let _ = fs::remove_file(&meta_path);
        Ok(original)
    }

    // ──────────────────── list ────────────────────

    /// List the top level of the trash root. Sidecars are folded into their
    /// entries; entries without verifiable metadata are still listed.
    pub fn list(&self) -> Result<Vec<TrashItem>> {
        let entries = fs::read_dir(&self.root).map_err(|e| SageError::io(&self.root, e))?;
        let mut items = Vec::new();

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(META_SUFFIX) {
                continue;
            }
            let Ok(lstat) = fs::symlink_metadata(&path) else {
                continue;
            };
            let is_dir = lstat.is_dir();
            // Directory sizes are summed from contents, never taken from
            // the directory entry itself.
            let size = if is_dir { tree_file_size(&path) } else { lstat.len() };
            let original_path = self.read_verified_original(&path);

            items.push(TrashItem {
                name,
                path: path.clone(),
                original_path,
                size,
                trashed_at: system_time_utc(
                    lstat.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                ),
                is_dir,
            });
        }

        items.sort_by(|a, b| b.trashed_at.cmp(&a.trashed_at).then(a.name.cmp(&b.name)));
        Ok(items)
    }

    fn read_verified_original(&self, trash_path: &Path) -> Option<PathBuf> {
        let meta_path = sidecar_path(trash_path);
        let raw = fs::read_to_string(&meta_path).ok()?;
        TrashMeta::parse_verified(&raw, &self.signing_key, &meta_path)
            .ok()
            .map(|m| m.original_path)
    }

    /// Remove trash entries on demand: all of them, or only those older
    /// than `older_than`. Returns the number of entries removed.
    pub fn purge(&self, older_than: Option<std::time::Duration>) -> Result<u64> {
        let cutoff = older_than.map(|age| SystemTime::now() - age);
        let entries = fs::read_dir(&self.root).map_err(|e| SageError::io(&self.root, e))?;
        let mut removed = 0u64;

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(META_SUFFIX) {
                continue;
            }
            let Ok(lstat) = fs::symlink_metadata(&path) else {
                continue;
            };
            if let Some(cutoff) = cutoff {
                let modified = lstat.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if modified >= cutoff {
                    continue;
                }
            }
            let gone = if lstat.is_dir() {
                fs::remove_dir_all(&path).is_ok()
            } else {
                fs::remove_file(&path).is_ok()
            };
            if gone {
                removed += 1;
                let _ = fs::remove_file(sidecar_path(&path));
            }
        }
        Ok(removed)
    }

    // ──────────────────── cleanup ────────────────────

    /// Remove entries older than the retention window, along with their
    /// sidecars. Returns `(items_removed, bytes_freed)`. A zero retention
    /// window keeps everything forever.
    ///
    /// Cancellation is honored between entries and returns the partial
    /// counts without error.
    pub fn cleanup(&self, cancel: &CancelToken) -> Result<(u64, u64)> {
        let Some(retention) = self.retention else {
            return Ok((0, 0));
        };
        let cutoff = SystemTime::now() - retention;

        let entries = fs::read_dir(&self.root).map_err(|e| SageError::io(&self.root, e))?;
        let mut removed = 0u64;
        let mut bytes = 0u64;

        for entry in entries {
            if cancel.is_canceled() {
                return Ok((removed, bytes));
            }
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(META_SUFFIX) {
                continue;
            }
            let Ok(lstat) = fs::symlink_metadata(&path) else {
                continue;
            };
            let modified = lstat.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified >= cutoff {
                continue;
            }

            let size = if lstat.is_dir() { tree_file_size(&path) } else { lstat.len() };
            let gone = if lstat.is_dir() {
                fs::remove_dir_all(&path).is_ok()
            } else {
                fs::remove_file(&path).is_ok()
            };
            if gone {
                removed += 1;
                bytes += size;
                let _ = fs::remove_file(sidecar_path(&path));
            }
        }

        Ok((removed, bytes))
    }
}

// ──────────────────── move primitive ────────────────────

/// Move an entry: atomic rename, or streaming copy + fsync + rename +
/// remove-source when the rename crosses devices.
pub fn move_entry(source: &Path, dest: &Path) -> Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            copy_then_remove(source, dest)
        }
        Err(err) => Err(SageError::io(source, err)),
    }
}

fn copy_then_remove(source: &Path, dest: &Path) -> Result<()> {
    let lstat = fs::symlink_metadata(source).map_err(|e| SageError::io(source, e))?;
    if lstat.is_dir() {
        copy_tree(source, dest)?;
        fs::remove_dir_all(source).map_err(|e| SageError::io(source, e))?;
    } else {
        stream_copy_file(source, dest)?;
        fs::remove_file(source).map_err(|e| SageError::io(source, e))?;
    }
    Ok(())
}

/// Copy one file through `<dest>.tmp` with a fixed-size buffer, fsync, then
/// atomically rename into place.
fn stream_copy_file(source: &Path, dest: &Path) -> Result<()> {
    let tmp = PathBuf::from(format!("{}.tmp", dest.display()));
    let result = (|| -> Result<()> {
        let mut reader = File::open(source).map_err(|e| SageError::io(source, e))?;
        let mut writer = File::create(&tmp).map_err(|e| SageError::io(&tmp, e))?;

        let mut buffer = [0u8; COPY_BUFFER_BYTES];
        loop {
            let read = reader.read(&mut buffer).map_err(|e| SageError::io(source, e))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .map_err(|e| SageError::io(&tmp, e))?;
        }
        writer.sync_all().map_err(|e| SageError::io(&tmp, e))?;
        drop(writer);

        if let Ok(meta) = fs::metadata(source) {
            let _ = fs::set_permissions(&tmp, meta.permissions());
        }
        fs::rename(&tmp, dest).map_err(|e| SageError::io(dest, e))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Re-create the directory structure and stream-copy every file.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| SageError::io(dest, e))?;
    let entries = fs::read_dir(source).map_err(|e| SageError::io(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SageError::io(source, e))?;
        let child_src = entry.path();
        let child_dst = dest.join(entry.file_name());
        let lstat = fs::symlink_metadata(&child_src).map_err(|e| SageError::io(&child_src, e))?;
        if lstat.is_dir() {
            copy_tree(&child_src, &child_dst)?;
        } else if lstat.file_type().is_symlink() {
            // Links are not followed; preserve them as links.
            #[cfg(unix)]
            {
                let target =
                    fs::read_link(&child_src).map_err(|e| SageError::io(&child_src, e))?;
                std::os::unix::fs::symlink(&target, &child_dst)
                    .map_err(|e| SageError::io(&child_dst, e))?;
            }
        } else {
            stream_copy_file(&child_src, &child_dst)?;
        }
    }
    Ok(())
}

// ──────────────────── helpers ────────────────────

/// Recursive sum of file sizes under `path` (directory entries themselves
/// contribute nothing).
pub fn tree_file_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let Ok(lstat) = fs::symlink_metadata(entry.path()) else {
            continue;
        };
        if lstat.is_dir() {
            total += tree_file_size(&entry.path());
        } else {
            total += lstat.len();
        }
    }
    total
}

/// Best-effort bump of an entry's mtime to now.
fn touch_now(path: &Path) {
    if let Ok(file) = File::open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}

/// Sidecar path: `<trash_path>.meta`.
pub fn sidecar_path(trash_path: &Path) -> PathBuf {
    let mut name = trash_path.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

/// Base name with path-separator bytes replaced, truncated to 100 bytes on
/// a character boundary.
fn safe_base_name(source: &Path) -> String {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "entry".to_string());
    let mut safe: String = base
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    while safe.len() > MAX_SAFE_BASE_BYTES {
        safe.pop();
    }
    if safe.is_empty() { "entry".to_string() } else { safe }
}

fn permission_bits(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o644
    }
}

fn system_time_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Write a file with mode 0o600.
fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| SageError::io(path, e))?;
    file.write_all(content).map_err(|e| SageError::io(path, e))?;
    Ok(())
}

fn decode_hex_key(raw: &str) -> Result<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return Err(SageError::InvalidConfig {
            details: "signing key hex has odd length".to_string(),
        });
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| SageError::InvalidConfig {
                details: "signing key is not hex".to_string(),
            })
        })
        .collect()
}

// ──────────────────── tests ────────────────────
