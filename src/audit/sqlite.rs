//! Relational audit backend: WAL-mode storage with a per-row checksum.
//!
//! The checksum is SHA-256 over the deterministic pipe-separated
//! concatenation of every other row field, which detects row tampering
//! without cross-row chaining. Recording is fail-open; queries, stats,
//! integrity verification, prune, and export are fail-closed.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use sha2::{Digest, Sha256};

use crate::audit::{AuditEvent, AuditQuery, AuditRecord, AuditStats, Recorder};
use crate::core::cancel::CancelToken;
use crate::core::errors::{Result, SageError};

/// Query limits are clamped into this range.
pub const MAX_QUERY_LIMIT: u32 = 1000;
const DEFAULT_QUERY_LIMIT: u32 = 100;

/// WAL-mode relational recorder.
pub struct SqliteRecorder {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
    first_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl SqliteRecorder {
    /// Open (or create) the database, applying PRAGMAs and schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SageError::io(parent, e))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        seed_meta(&conn)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: path.to_path_buf(),
            first_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn latch_error(&self, details: String) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(details);
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(SageError::Sql {
                context: "audit",
                details: "recorder closed".to_string(),
            }),
        }
    }

    // ──────────────────── queries ────────────────────

    /// Filtered query, newest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, action, path, mode, decision, reason,
                    score, bytes_freed, error, fields_json, checksum
             FROM audit_log WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(since) = query.since {
            sql.push_str(" AND timestamp >= ?");
            args.push(format_ts(since));
        }
        if let Some(until) = query.until {
            sql.push_str(" AND timestamp <= ?");
            args.push(format_ts(until));
        }
        if let Some(action) = &query.action {
            sql.push_str(" AND action = ?");
            args.push(action.clone());
        }
        if let Some(level) = query.level {
            sql.push_str(" AND level = ?");
            args.push(level.to_string());
        }
        if let Some(path) = &query.path {
            sql.push_str(" AND instr(path, ?) > 0");
            args.push(path.clone());
        }
        let limit = query
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        let _ = write!(sql, " ORDER BY id DESC LIMIT {limit}");

        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> Result<AuditStats> {
        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;

            let mut by_action = BTreeMap::new();
            let mut stmt =
                conn.prepare_cached("SELECT action, COUNT(*) FROM audit_log GROUP BY action")?;
            let pairs = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for pair in pairs {
                let (action, count) = pair?;
                by_action.insert(action, count);
            }

            let deleted: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = 'execute' AND reason = 'deleted'",
                [],
                |r| r.get(0),
            )?;
            let trashed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = 'execute' AND reason = 'trashed'",
                [],
                |r| r.get(0),
            )?;
            let errors: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = 'execute' AND level = 'error'",
                [],
                |r| r.get(0),
            )?;
            let (first_event, last_event): (Option<String>, Option<String>) = conn.query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM audit_log",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let bytes_freed: i64 = conn.query_row(
                "SELECT COALESCE(SUM(bytes_freed), 0) FROM audit_log
                 WHERE action = 'execute' AND reason IN ('deleted', 'trashed')",
                [],
                |r| r.get(0),
            )?;

            Ok(AuditStats {
                total,
                by_action,
                deleted,
                trashed,
                errors,
                first_event,
                last_event,
                bytes_freed,
            })
        })
    }

    /// Recompute every row checksum; returns the ids that fail. The caller
    /// decides what to do about them.
    pub fn verify_integrity(&self, cancel: &CancelToken) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, timestamp, level, action, path, mode, decision, reason,
                        score, bytes_freed, error, fields_json, checksum
                 FROM audit_log ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], row_to_record)?;

            let mut bad = Vec::new();
            for row in rows {
                if cancel.is_canceled() {
                    break;
                }
                let record = row?;
                let expected = row_checksum(
                    &record.timestamp,
                    &record.level,
                    &record.action,
                    &record.path,
                    &record.mode,
                    &record.decision,
                    &record.reason,
                    record.score,
                    record.bytes_freed,
                    &record.error,
                    &record.fields_json,
                );
                if expected != record.checksum {
                    bad.push(record.id);
                }
            }
            Ok(bad)
        })
    }

    /// Delete rows older than `cutoff`. Returns the number removed.
    pub fn prune(&self, cutoff: chrono::DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM audit_log WHERE timestamp < ?1",
                params![format_ts(cutoff)],
            )?;
            Ok(deleted)
        })
    }

    /// All records since a given time, oldest first, for export.
    pub fn export_since(&self, since: chrono::DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, timestamp, level, action, path, mode, decision, reason,
                        score, bytes_freed, error, fields_json, checksum
                 FROM audit_log WHERE timestamp >= ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![format_ts(since)], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Directly update a row (tests and tooling; tampering simulation).
    #[doc(hidden)]
    pub fn raw_execute(&self, sql: &str) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute(sql, [])?))
    }
}

impl Recorder for SqliteRecorder {
    fn record(&self, event: AuditEvent) {
        let ts = format_ts(event.time.unwrap_or_else(Utc::now));
        let level = event.level.to_string();
        let mode = field_str(&event, "mode");
        let decision = field_str(&event, "decision");
        let reason = field_str(&event, "reason");
        let score = field_i64(&event, "score");
        let bytes_freed = field_i64(&event, "bytes_freed");
        let error = event.error.clone().unwrap_or_default();
        let fields_json = if event.fields.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&event.fields).unwrap_or_default()
        };
        let checksum = row_checksum(
            &ts,
            &level,
            &event.action,
            &event.path,
            &mode,
            &decision,
            &reason,
            score,
            bytes_freed,
            &error,
            &fields_json,
        );

        let outcome = self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO audit_log (
                    timestamp, level, action, path, mode, decision, reason,
                    score, bytes_freed, error, fields_json, checksum
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            )?
            .execute(params![
                ts,
                level,
                event.action,
                event.path,
                mode,
                decision,
                reason,
                score,
                bytes_freed,
                error,
                fields_json,
                checksum,
            ])?;
            Ok(())
        });
        if let Err(e) = outcome {
            self.latch_error(e.to_string());
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        drop(self.conn.lock().take());
        Ok(())
    }

    fn first_error(&self) -> Option<String> {
        self.first_error.lock().clone()
    }
}

// ──────────────────── checksum ────────────────────

/// SHA-256 hex over the canonical pipe-separated field concatenation.
#[allow(clippy::too_many_arguments)]
pub fn row_checksum(
    ts: &str,
    level: &str,
    action: &str,
    path: &str,
    mode: &str,
    decision: &str,
    reason: &str,
    score: i64,
    bytes_freed: i64,
    error: &str,
    fields_json: &str,
) -> String {
    let canonical = format!(
        "{ts}|{level}|{action}|{path}|{mode}|{decision}|{reason}|{score}|{bytes_freed}|{error}|{fields_json}"
    );
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

// ──────────────────── helpers ────────────────────

fn format_ts(time: chrono::DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn field_str(event: &AuditEvent, key: &str) -> String {
    match event.fields.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn field_i64(event: &AuditEvent, key: &str) -> i64 {
    match event.fields.get(key) {
        Some(value) => value.as_i64().unwrap_or_else(|| {
            #[allow(clippy::cast_possible_wrap)]
            value.as_u64().map_or(0, |v| v as i64)
        }),
        None => 0,
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        level: row.get(2)?,
        action: row.get(3)?,
        path: row.get(4)?,
        mode: row.get(5)?,
        decision: row.get(6)?,
        reason: row.get(7)?,
        score: row.get(8)?,
        bytes_freed: row.get(9)?,
        error: row.get(10)?,
        fields_json: row.get(11)?,
        checksum: row.get(12)?,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            level TEXT NOT NULL,
            action TEXT NOT NULL,
            path TEXT NOT NULL,
            mode TEXT NOT NULL DEFAULT '',
            decision TEXT NOT NULL DEFAULT '',
            reason TEXT NOT NULL DEFAULT '',
            score INTEGER NOT NULL DEFAULT 0,
            bytes_freed INTEGER NOT NULL DEFAULT 0,
            error TEXT NOT NULL DEFAULT '',
            fields_json TEXT NOT NULL DEFAULT '',
            checksum TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
        CREATE INDEX IF NOT EXISTS idx_audit_path ON audit_log(path);
        CREATE INDEX IF NOT EXISTS idx_audit_level ON audit_log(level);",
    )?;
    Ok(())
}

fn seed_meta(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO audit_meta (key, value) VALUES ('created_at', ?1)",
        params![format_ts(Utc::now())],
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────
