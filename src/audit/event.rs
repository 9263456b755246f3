//! In-memory audit events and the canonical event shapes emitted at plan
//! and execute time.
//!
//! Field maps are `BTreeMap`s so serialization order is stable, which the
//! relational backend's per-row checksum depends on.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::audit::Level;
use crate::core::types::{ActionResult, PlanItem};

/// Prefix carried by execute-time safety denials.
pub const SAFETY_DENY_EXECUTE_PREFIX: &str = "safety_deny_execute:";

/// One in-memory audit event, as handed to a [`Recorder`](crate::audit::Recorder).
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    /// Stamped by the backend when absent.
    pub time: Option<DateTime<Utc>>,
    pub level: Level,
    pub action: String,
    pub path: String,
    pub fields: BTreeMap<String, Value>,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// ──────────────────── canonical shapes ────────────────────

/// The standard event recorded for every planned item.
pub fn plan_event(item: &PlanItem) -> AuditEvent {
    AuditEvent::new("plan", item.candidate.path.to_string_lossy())
        .with_field("decision", if item.decision.allow { "allow" } else { "deny" })
        .with_field("reason", item.decision.reason.clone())
        .with_field("score", item.decision.score)
        .with_field("safety_allowed", item.safety.allowed)
        .with_field("safety_reason", item.safety.reason_key())
}

/// The standard event recorded after every execution attempt.
pub fn execute_event(result: &ActionResult) -> AuditEvent {
    let level = if result.error.is_some() {
        Level::Error
    } else {
        Level::Info
    };
    let mut event = AuditEvent::new("execute", result.path.to_string_lossy())
        .with_level(level)
        .with_field("mode", result.mode.to_string())
        .with_field("decision", if result_allow(result) { "allow" } else { "deny" })
        .with_field("reason", result.reason.clone())
        .with_field("score", result.score)
        .with_field("bytes_freed", result.bytes_freed)
        .with_field("outcome", outcome_action(&result.reason))
        .with_field("target", result.kind.to_string());
    if let Some(safety_reason) = execute_safety_reason(result) {
        let key = safety_reason.split(':').next().unwrap_or(safety_reason);
        event = event.with_field("safety_reason", key);
    }
    if let Some(err) = &result.error {
        event = event.with_error(err.clone());
    }
    event
}

/// Maps a result reason onto the recorded outcome action:
/// `deleted` → "delete", `would_delete` → "would_delete", else "skip".
#[must_use]
pub fn outcome_action(reason: &str) -> &'static str {
    match reason {
        "deleted" => "delete",
        "would_delete" => "would_delete",
        _ => "skip",
    }
}

/// Whether the result counts as an allow. `trashed` intentionally does not;
/// this mirrors long-standing recorded behavior.
#[must_use]
pub fn result_allow(result: &ActionResult) -> bool {
    result.reason == "would_delete" || result.reason == "deleted"
}

/// If the result was denied by the execute-time safety re-check, the reason
/// remainder after the prefix (which may itself carry a `:detail`).
#[must_use]
pub fn execute_safety_reason(result: &ActionResult) -> Option<&str> {
    result.reason.strip_prefix(SAFETY_DENY_EXECUTE_PREFIX)
}
