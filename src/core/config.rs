//! Configuration system: TOML file + smart defaults + startup validation.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SageError};

/// Full Storage Sage configuration model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub policy: PolicyConfig,
    pub safety: SafetyConfig,
    pub trash: TrashConfig,
    pub audit: AuditConfig,
    pub daemon: DaemonConfig,
}

/// Scan roots and traversal behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    pub roots: Vec<PathBuf>,
    pub recursive: bool,
    pub follow_symlinks: bool,
    /// 0 = unlimited.
    pub max_depth: usize,
    pub include_files: bool,
    pub include_dirs: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            recursive: true,
            follow_symlinks: false,
            max_depth: 0,
            include_files: true,
            include_dirs: false,
        }
    }
}

/// Policy selection: which predicates are active and how they combine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// `all` (AND) or `any` (OR).
    pub mode: String,
    pub min_age_days: Option<u64>,
    pub min_size_mb: Option<u64>,
    pub extensions: Vec<String>,
    pub exclude_globs: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: "all".to_string(),
            min_age_days: Some(30),
            min_size_mb: None,
            extensions: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

/// Safety constraints applied at scan and execute time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Empty means "use the scanner roots".
    pub allowed_roots: Vec<PathBuf>,
    /// Merged with the built-in system-directory set at validator build time.
    pub protected_paths: Vec<PathBuf>,
    pub allow_directory_delete: bool,
    pub enforce_mount_boundary: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allowed_roots: Vec::new(),
            protected_paths: Vec::new(),
            allow_directory_delete: false,
            enforce_mount_boundary: true,
        }
    }
}

/// Quarantine area settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrashConfig {
    pub enabled: bool,
    pub root: PathBuf,
    /// Retention window as a duration string (`30d`, `720h`). Empty = keep
    /// forever.
    pub retention: String,
    /// Hex-encoded HMAC key. Empty = random ephemeral key (metadata will not
    /// verify across restarts). Never serialized back out (the config
    /// endpoint must not leak it).
    #[serde(skip_serializing)]
    pub signing_key: String,
    /// Restore targets must fall inside one of these roots (empty = any).
    pub allowed_restore_roots: Vec<PathBuf>,
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("/var/lib/storage-sage/trash"),
            retention: "30d".to_string(),
            signing_key: String::new(),
            allowed_restore_roots: Vec::new(),
        }
    }
}

/// Audit backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// `sqlite` or `jsonl`.
    pub backend: String,
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: PathBuf::from("/var/lib/storage-sage/audit.db"),
        }
    }
}

/// Daemon supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    pub listen_addr: String,
    /// `1h`, `30m`, `@every 6h`. Empty = on-demand only.
    pub schedule: String,
    /// `dry-run` or `execute`.
    pub mode: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("/var/lib/storage-sage/daemon.pid"),
            listen_addr: "127.0.0.1:8675".to_string(),
            schedule: String::new(),
            mode: "dry-run".to_string(),
        }
    }
}

// ──────────────────── loading & validation ────────────────────

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SageError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let raw = fs::read_to_string(path).map_err(|source| SageError::io(path, source))?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string and validate.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Allowed roots for safety checks: explicit list, or the scan roots.
    #[must_use]
    pub fn effective_allowed_roots(&self) -> Vec<PathBuf> {
        if self.safety.allowed_roots.is_empty() {
            self.scanner.roots.clone()
        } else {
            self.safety.allowed_roots.clone()
        }
    }

    /// Parsed trash retention; `None` = keep forever.
    pub fn trash_retention(&self) -> Result<Option<Duration>> {
        if self.trash.retention.trim().is_empty() {
            return Ok(None);
        }
        let d = parse_duration(&self.trash.retention).map_err(|details| {
            SageError::InvalidConfig {
                details: format!("trash.retention: {details}"),
            }
        })?;
        if d.is_zero() { Ok(None) } else { Ok(Some(d)) }
    }

    /// Validate the whole model. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.scanner.roots.is_empty() {
            return Err(invalid("scanner.roots must not be empty"));
        }
        for root in &self.scanner.roots {
            if !root.is_absolute() {
                return Err(invalid(&format!(
                    "scanner root must be absolute: {}",
                    root.display()
                )));
            }
        }
        for root in &self.safety.allowed_roots {
            if !root.is_absolute() {
                return Err(invalid(&format!(
                    "safety allowed root must be absolute: {}",
                    root.display()
                )));
            }
        }
        match self.policy.mode.as_str() {
            "all" | "any" => {}
            other => return Err(invalid(&format!("policy.mode must be all/any, got {other}"))),
        }
        if self.trash.enabled {
            if !self.trash.root.is_absolute() {
                return Err(invalid("trash.root must be absolute"));
            }
            for root in &self.scanner.roots {
                if crate::core::paths::is_within(&self.trash.root, root) {
                    return Err(invalid(&format!(
                        "trash.root {} must not sit inside scan root {}",
                        self.trash.root.display(),
                        root.display()
                    )));
                }
            }
            if !self.trash.signing_key.is_empty() && !is_hex(&self.trash.signing_key) {
                return Err(invalid("trash.signing_key must be hex"));
            }
            self.trash_retention()?;
        }
        match self.audit.backend.as_str() {
            "sqlite" | "jsonl" => {}
            other => {
                return Err(invalid(&format!(
                    "audit.backend must be sqlite/jsonl, got {other}"
                )));
            }
        }
        if self.daemon.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid(&format!(
                "daemon.listen_addr is not a socket address: {}",
                self.daemon.listen_addr
            )));
        }
        self.daemon.mode.parse::<crate::core::types::Mode>().map_err(|e| invalid(&e))?;
        if !self.daemon.schedule.is_empty() {
            parse_schedule(&self.daemon.schedule).map_err(|e| invalid(&e.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(details: &str) -> SageError {
    SageError::InvalidConfig {
        details: details.to_string(),
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ──────────────────── durations & schedules ────────────────────

/// Parse a duration string (`24h`, `7d`, `30m`, `1h30m`).
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(raw.trim()).map_err(|e| format!("bad duration {raw:?}: {e}"))
}

/// Parse a schedule string: a bare duration or `@every <duration>`.
///
/// Empty and zero-length schedules are rejected; callers model "no
/// schedule" by not configuring one at all.
pub fn parse_schedule(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SageError::Schedule {
            details: "empty schedule".to_string(),
        });
    }
    let spec = trimmed.strip_prefix("@every").map_or(trimmed, str::trim_start);
    if spec.starts_with('-') {
        return Err(SageError::Schedule {
            details: format!("negative interval: {raw}"),
        });
    }
    let interval = parse_duration(spec).map_err(|details| SageError::Schedule { details })?;
    if interval.is_zero() {
        return Err(SageError::Schedule {
            details: format!("zero interval: {raw}"),
        });
    }
    Ok(interval)
}

// ──────────────────── tests ────────────────────
