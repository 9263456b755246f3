//! Pipeline value types shared by scanner, policies, safety, and executor.
//!
//! Every type here is owned by the stage that produces it and handed to the
//! next stage by value or over a single-consumer channel.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

// ──────────────────── candidate ────────────────────

/// Kind of filesystem entity a candidate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    File,
    Dir,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Dir => f.write_str("dir"),
        }
    }
}

/// One observed filesystem entity.
///
/// Invariant: `path` is lexically inside `root`; both are absolute and
/// cleaned. The scanner is the only producer.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Scan root this candidate was found under.
    pub root: PathBuf,
    /// Absolute, cleaned path of the entry.
    pub path: PathBuf,
    pub kind: TargetKind,
    pub size_bytes: u64,
    pub modified: SystemTime,
    pub is_symlink: bool,
    /// Resolved absolute symlink target (relative targets resolved against
    /// the link's parent directory).
    pub symlink_target: Option<PathBuf>,
    /// Device id of the entry itself.
    pub device_id: u64,
    /// Device id of the root the entry was found under.
    pub root_device_id: u64,
    pub found_at: SystemTime,
}

// ──────────────────── policy decision ────────────────────

/// Output of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    /// Short symbolic reason key, e.g. `age_ok` or `too_new`.
    pub reason: String,
    /// Non-negative priority; zero whenever `allow` is false.
    pub score: u64,
    pub ttl: Option<Duration>,
}

impl Decision {
    /// Build an allowing decision.
    pub fn allowed(reason: impl Into<String>, score: u64) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
            score,
            ttl: None,
        }
    }

    /// Build a denying decision. Score is forced to zero.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            score: 0,
            ttl: None,
        }
    }
}

// ──────────────────── safety verdict ────────────────────

/// Output of a safety check. `reason` follows `key[:detail]`; only the key
/// (the prefix before the first `:`) appears in audit fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    /// The symbolic key: everything before the first `:`.
    #[must_use]
    pub fn reason_key(&self) -> &str {
        self.reason.split(':').next().unwrap_or(&self.reason)
    }
}

// ──────────────────── plan item ────────────────────

/// A candidate bundled with its policy decision and scan-time safety
/// verdict. Immutable after planning.
#[derive(Debug, Clone)]
pub struct PlanItem {
    pub candidate: Candidate,
    pub decision: Decision,
    pub safety: SafetyVerdict,
}

// ──────────────────── execution mode & result ────────────────────

/// Execution mode for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    DryRun,
    Execute,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => f.write_str("dry-run"),
            Self::Execute => f.write_str("execute"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            "execute" => Ok(Self::Execute),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Outcome of executing one plan item.
///
/// Invariants: `finished_at >= started_at`; `bytes_freed > 0` implies
/// `deleted` or `mode == DryRun`.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub path: PathBuf,
    pub kind: TargetKind,
    pub mode: Mode,
    pub score: u64,
    pub deleted: bool,
    pub bytes_freed: u64,
    pub reason: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub error: Option<String>,
}

// ──────────────────── environment snapshot ────────────────────

/// Wall-clock and resource readings sampled once at plan start and shared
/// by every policy evaluation in that run.
#[derive(Debug, Clone, Copy)]
pub struct EnvSnapshot {
    pub now: SystemTime,
    pub disk_used_pct: f64,
    pub cpu_used_pct: f64,
}

impl EnvSnapshot {
    /// Capture a snapshot. Disk usage is read from the filesystem holding
    /// `probe_path`; CPU from `/proc/stat`. Both readings are best-effort
    /// and default to 0.0 where unavailable.
    pub fn capture(probe_path: &std::path::Path) -> Self {
        Self {
            now: SystemTime::now(),
            disk_used_pct: disk_used_pct(probe_path).unwrap_or(0.0),
            cpu_used_pct: cpu_used_pct().unwrap_or(0.0),
        }
    }

    /// A snapshot with fixed readings, for tests and non-adaptive runs.
    #[must_use]
    pub fn fixed(now: SystemTime) -> Self {
        Self {
            now,
            disk_used_pct: 0.0,
            cpu_used_pct: 0.0,
        }
    }
}

#[cfg(unix)]
fn disk_used_pct(path: &std::path::Path) -> Option<f64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let fragment = stat.fragment_size();
    let total = stat.blocks().saturating_mul(fragment);
    let avail = stat.blocks_available().saturating_mul(fragment);
    if total == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    Some(100.0 * (total.saturating_sub(avail)) as f64 / total as f64)
}

#[cfg(not(unix))]
fn disk_used_pct(_path: &std::path::Path) -> Option<f64> {
    None
}

/// Aggregate CPU busy share since boot, from the first `/proc/stat` line.
fn cpu_used_pct() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let first = stat.lines().next()?;
        let fields: Vec<u64> = first
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        if total == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(100.0 * (total - idle) as f64 / total as f64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
