//! Directory walker: discovers deletion candidates under configured roots.
//!
//! The walk runs on its own thread and hands candidates over a bounded
//! channel, so consumers see a lazy, finite, non-restartable sequence. A
//! second channel carries at most one terminal walk error. Unreadable
//! subdirectories are skipped gracefully; only a failure to read a root
//! itself terminates the walk.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::SystemTime;

use crossbeam_channel as channel;

use crate::core::cancel::CancelToken;
use crate::core::config::ScannerConfig;
use crate::core::errors::SageError;
use crate::core::paths;
use crate::core::types::{Candidate, TargetKind};

/// Parameters for one scan invocation.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Absolute scan roots.
    pub roots: Vec<PathBuf>,
    pub recursive: bool,
    pub follow_symlinks: bool,
    /// 0 = unlimited. Entries directly under a root sit at depth 1; descent
    /// stops once depth reaches the limit.
    pub max_depth: usize,
    pub include_files: bool,
    pub include_dirs: bool,
}

impl ScanRequest {
    /// Build a request from the scanner config section.
    #[must_use]
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            roots: config.roots.clone(),
            recursive: config.recursive,
            follow_symlinks: config.follow_symlinks,
            max_depth: config.max_depth,
            include_files: config.include_files,
            include_dirs: config.include_dirs,
        }
    }
}

/// Capacity of the candidate channel; keeps the walk lazy without stalling
/// on every entry.
const CANDIDATE_BUFFER: usize = 256;

/// Walks roots and emits [`Candidate`]s.
#[derive(Debug, Default)]
pub struct Scanner;

impl Scanner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Start a walk. Returns the candidate sequence and an error channel
    /// carrying at most one terminal walk error.
    ///
    /// Dropping the candidate receiver stops the walk at the next send.
    pub fn scan(
        &self,
        request: &ScanRequest,
        cancel: &CancelToken,
    ) -> (
        channel::Receiver<Candidate>,
        channel::Receiver<SageError>,
    ) {
        let (candidate_tx, candidate_rx) = channel::bounded::<Candidate>(CANDIDATE_BUFFER);
        let (error_tx, error_rx) = channel::bounded::<SageError>(1);
        let request = request.clone();
        let cancel = cancel.clone();

        thread::spawn(move || {
            walk_roots(&request, &cancel, &candidate_tx, &error_tx);
        });

        (candidate_rx, error_rx)
    }
}

fn walk_roots(
    request: &ScanRequest,
    cancel: &CancelToken,
    candidate_tx: &channel::Sender<Candidate>,
    error_tx: &channel::Sender<SageError>,
) {
    for root in &request.roots {
        if cancel.is_canceled() {
            return;
        }
        let root = paths::absolute_clean(root);
        let root_device = match fs::symlink_metadata(&root) {
            Ok(meta) => device_id(&meta),
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) if err.kind() == ErrorKind::PermissionDenied => continue,
            Err(err) => {
                let _ = error_tx.try_send(SageError::io(&root, err));
                return;
            }
        };
        if !walk_directory(&root, &root, root_device, 1, request, cancel, candidate_tx, error_tx)
        {
            return;
        }
    }
}

/// Walk one directory level. Returns `false` when the walk must stop
/// (cancellation, dropped consumer, terminal error).
#[allow(clippy::too_many_arguments)]
fn walk_directory(
    root: &Path,
    dir: &Path,
    root_device: u64,
    depth: usize,
    request: &ScanRequest,
    cancel: &CancelToken,
    candidate_tx: &channel::Sender<Candidate>,
    error_tx: &channel::Sender<SageError>,
) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // Root read failure is terminal; deeper failures are skipped.
        Err(err) if depth == 1 => {
            if !matches!(err.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) {
                let _ = error_tx.try_send(SageError::io(dir, err));
                return false;
            }
            return true;
        }
        Err(_) => return true,
    };

    for entry in entries {
        if cancel.is_canceled() {
            return false;
        }
        let Ok(entry) = entry else { continue };
        let path = paths::clean(&entry.path());

        let Ok(lstat) = fs::symlink_metadata(&path) else {
            continue;
        };
        let is_symlink = lstat.file_type().is_symlink();
        let symlink_target = if is_symlink {
            fs::read_link(&path)
                .ok()
                .map(|target| paths::resolve_link_target(&path, &target))
        } else {
            None
        };

        // With follow_symlinks, links are classified by their target;
        // otherwise a link counts as a file regardless of target kind.
        let effective = if is_symlink && request.follow_symlinks {
            fs::metadata(&path).ok()
        } else {
            None
        };
        let meta = effective.as_ref().unwrap_or(&lstat);
        let is_dir = meta.is_dir();
        let kind = if is_dir { TargetKind::Dir } else { TargetKind::File };

        let include = match kind {
            TargetKind::Dir => request.include_dirs,
            TargetKind::File => request.include_files,
        };
        if include {
            let candidate = Candidate {
                root: root.to_path_buf(),
                path: path.clone(),
                kind,
                size_bytes: if is_dir { 0 } else { meta.len() },
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                is_symlink,
                symlink_target: symlink_target.clone(),
                device_id: device_id(&lstat),
                root_device_id: root_device,
                found_at: SystemTime::now(),
            };
            if candidate_tx.send(candidate).is_err() {
                return false;
            }
        }

        let descend = is_dir
            && (!is_symlink || request.follow_symlinks)
            && request.recursive
            && (request.max_depth == 0 || depth < request.max_depth);
        if descend
            && !walk_directory(
                root,
                &path,
                root_device,
                depth + 1,
                request,
                cancel,
                candidate_tx,
                error_tx,
            )
        {
            return false;
        }
    }
    true
}

fn device_id(meta: &fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.dev()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}
