//! Tamper-evident audit log: event model, recorder contract, and the
//! line-JSON and relational backends.

#![allow(missing_docs)]

pub mod event;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
pub use event::AuditEvent;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warn => f.write_str("warn"),
            Self::Error => f.write_str("error"),
        }
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown level: {other}")),
        }
    }
}

/// Durable event sink. Recording is fail-open: implementations swallow
/// write failures (exposing them through a sticky first-error accessor)
/// so that auditing can never block a deletion.
pub trait Recorder: Send + Sync {
    /// Persist one event. Never propagates storage failures.
    fn record(&self, event: AuditEvent);

    /// Flush and close the backend. Idempotent; later calls are no-ops.
    fn close(&self) -> Result<()>;

    /// First storage failure observed, if any.
    fn first_error(&self) -> Option<String>;
}

/// A persisted audit row (relational backend).
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    /// RFC-3339 UTC with nanosecond precision, exactly as stored.
    pub timestamp: String,
    pub level: String,
    pub action: String,
    pub path: String,
    pub mode: String,
    pub decision: String,
    pub reason: String,
    pub score: i64,
    pub bytes_freed: i64,
    pub error: String,
    pub fields_json: String,
    pub checksum: String,
}

/// Filters for the relational query surface. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub action: Option<String>,
    pub level: Option<Level>,
    /// Substring match on the path column.
    pub path: Option<String>,
    pub limit: Option<u32>,
}

/// Aggregate statistics over the audit log.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AuditStats {
    pub total: i64,
    pub by_action: BTreeMap<String, i64>,
    /// Executes that ended in a hard delete.
    pub deleted: i64,
    /// Executes that ended in a quarantine move.
    pub trashed: i64,
    /// Executes recorded at error level.
    pub errors: i64,
    pub first_event: Option<String>,
    pub last_event: Option<String>,
    pub bytes_freed: i64,
}
