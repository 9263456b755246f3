//! Safety validation: the fail-closed checks standing between a candidate
//! and any mutation.
//!
//! [`SafetyValidator::validate`] runs at scan time against the candidate's
//! recorded metadata; [`SafetyValidator::revalidate`] runs at execute time
//! against the *live* filesystem and is the final TOCTOU gate.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::SafetyConfig;
use crate::core::paths;
use crate::core::types::{Candidate, SafetyVerdict, TargetKind};

/// System directories that are always protected, regardless of
/// configuration. Merged into every validator.
pub const REQUIRED_PROTECTED_PATHS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin", "/sys", "/usr",
];

/// Validates candidates against allowed roots, protected paths, symlink
/// rules, and the mount boundary.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    allowed_roots: Vec<PathBuf>,
    protected_paths: Vec<PathBuf>,
    allow_directory_delete: bool,
    enforce_mount_boundary: bool,
}

impl SafetyValidator {
    /// Build a validator. The required system-directory set is merged into
    /// `protected_paths` here; callers cannot opt out of it.
    #[must_use]
    pub fn new(
        allowed_roots: Vec<PathBuf>,
        protected_paths: Vec<PathBuf>,
        allow_directory_delete: bool,
        enforce_mount_boundary: bool,
    ) -> Self {
        let mut protected: BTreeSet<PathBuf> = protected_paths
            .into_iter()
            .map(|p| paths::clean(&p))
            .collect();
        for required in REQUIRED_PROTECTED_PATHS {
            protected.insert(PathBuf::from(required));
        }
        Self {
            allowed_roots: allowed_roots.iter().map(|r| paths::clean(r)).collect(),
            protected_paths: protected.into_iter().collect(),
            allow_directory_delete,
            enforce_mount_boundary,
        }
    }

    /// Build from the config section, with `allowed_roots` already resolved
    /// (`Config::effective_allowed_roots`).
    #[must_use]
    pub fn from_config(config: &SafetyConfig, allowed_roots: Vec<PathBuf>) -> Self {
        Self::new(
            allowed_roots,
            config.protected_paths.clone(),
            config.allow_directory_delete,
            config.enforce_mount_boundary,
        )
    }

    /// Scan-time validation against the candidate's recorded state.
    #[must_use]
    pub fn validate(&self, candidate: &Candidate) -> SafetyVerdict {
        self.check(
            &candidate.path,
            candidate.kind,
            candidate.symlink_target.as_deref(),
            Some((candidate.device_id, candidate.root_device_id)),
        )
    }

    /// Execute-time re-validation against the live filesystem. Called
    /// immediately before mutation; never trusts the cached candidate.
    ///
    /// A vanished entry passes so the mutation layer can report it as
    /// already gone.
    #[must_use]
    pub fn revalidate(&self, candidate: &Candidate) -> SafetyVerdict {
        let Ok(lstat) = fs::symlink_metadata(&candidate.path) else {
            return SafetyVerdict::allow("ok");
        };
        let kind = if lstat.is_dir() {
            TargetKind::Dir
        } else {
            TargetKind::File
        };
        let symlink_target = if lstat.file_type().is_symlink() {
            fs::read_link(&candidate.path)
                .ok()
                .map(|t| paths::resolve_link_target(&candidate.path, &t))
        } else {
            None
        };
        let devices = fs::symlink_metadata(&candidate.root)
            .ok()
            .map(|root_meta| (device_id(&lstat), device_id(&root_meta)));

        self.check(&candidate.path, kind, symlink_target.as_deref(), devices)
    }

    /// The ordered, fail-closed check sequence.
    fn check(
        &self,
        path: &Path,
        kind: TargetKind,
        symlink_target: Option<&Path>,
        devices: Option<(u64, u64)>,
    ) -> SafetyVerdict {
        let path = paths::clean(path);

        // 1. Must live inside some allowed root.
        if !paths::is_within_any(&path, &self.allowed_roots) {
            return SafetyVerdict::deny(format!(
                "outside_allowed_roots:{}",
                path.display()
            ));
        }

        // 2. Must not be a protected path or a descendant of one.
        for protected in &self.protected_paths {
            if paths::is_within(&path, protected) {
                return SafetyVerdict::deny(format!(
                    "protected_path:{}",
                    protected.display()
                ));
            }
        }

        // 3. Directory deletion must be explicitly enabled.
        if kind == TargetKind::Dir && !self.allow_directory_delete {
            return SafetyVerdict::deny("dir_delete_disabled");
        }

        // 4. Symlink rules.
        if let Some(target) = symlink_target {
            let target = paths::clean(target);
            if target == path {
                return SafetyVerdict::deny(format!("symlink_self:{}", path.display()));
            }
            if paths::is_within(&path, &target) && target != path {
                return SafetyVerdict::deny(format!(
                    "symlink_ancestor:{}",
                    target.display()
                ));
            }
            if !paths::is_within_any(&target, &self.allowed_roots) {
                return SafetyVerdict::deny(format!(
                    "symlink_escape:{}",
                    target.display()
                ));
            }
        }

        // 5. Mount boundary.
        if self.enforce_mount_boundary
            && let Some((entry_dev, root_dev)) = devices
            && entry_dev != root_dev
        {
            return SafetyVerdict::deny(format!("mount_boundary:{entry_dev}"));
        }

        SafetyVerdict::allow("ok")
    }
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
