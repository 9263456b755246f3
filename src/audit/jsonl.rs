//! Line-JSON audit backend: one self-contained JSON object per line.
//!
//! Lines are assembled in memory and written with a single `write_all`
//! under a process-wide mutex, so concurrent recorders never interleave
//! partial lines. Write failures latch into a sticky first-error and are
//! otherwise swallowed; auditing must never block the pipeline.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::audit::{AuditEvent, Level, Recorder};
use crate::core::errors::{Result, SageError};

/// On-disk line shape. Empty optionals are omitted entirely.
#[derive(Debug, Serialize)]
struct LineEntry<'a> {
    time: String,
    level: Level,
    action: &'a str,
    path: &'a str,
    #[serde(skip_serializing_if = "map_is_empty")]
    fields: &'a BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<&'a str>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn map_is_empty(fields: &&BTreeMap<String, Value>) -> bool {
    fields.is_empty()
}

/// Append-only line-JSON recorder.
pub struct JsonlRecorder {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    first_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl JsonlRecorder {
    /// Open (or create) the log file with mode 0o600.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SageError::io(parent, e))?;
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path).map_err(|e| SageError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(file)),
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
}

impl Recorder for JsonlRecorder {
    fn record(&self, event: AuditEvent) {
        let time = event
            .time
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Nanos, true);
        let entry = LineEntry {
            time,
            level: event.level,
            action: &event.action,
            path: &event.path,
            fields: &event.fields,
            err: event.error.as_deref(),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(json) => format!("{json}\n"),
            Err(e) => {
                self.latch_error(format!("serialize: {e}"));
                return;
            }
        };

        let mut writer = self.writer.lock();
        match writer.as_mut() {
            Some(file) => {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    self.latch_error(format!("write: {e}"));
                }
            }
            None => self.latch_error("recorder closed".to_string()),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(file) = self.writer.lock().take() {
            let _ = file.sync_all();
        }
        Ok(())
    }

    fn first_error(&self) -> Option<String> {
        self.first_error.lock().clone()
    }
}
