//! One pipeline run: scanner → planner → executor → auditor, plus trash
//! retention cleanup.

#![allow(missing_docs)]

use serde::Serialize;

use crate::audit::{AuditEvent, Level, Recorder, event};
use crate::core::cancel::CancelToken;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::core::types::{EnvSnapshot, Mode};
use crate::exec::executor::Executor;
use crate::exec::planner::Planner;
use crate::policy::Policy;
use crate::safety::SafetyValidator;
use crate::scanner::walker::{ScanRequest, Scanner};
use crate::trash::manager::TrashManager;

/// Counters for one completed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub planned: usize,
    pub executed: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
    pub trash_removed: u64,
    pub trash_bytes_freed: u64,
}

/// Drive one full run in `mode`.
///
/// Every planned item gets a plan event; every executed item gets an
/// execute event (emitted by the executor). A terminal walk error is
/// recorded at error level but does not fail the run.
pub fn run_once(
    config: &Config,
    policy: &dyn Policy,
    safety: &SafetyValidator,
    trash: Option<&TrashManager>,
    recorder: &dyn Recorder,
    mode: Mode,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    let probe = config
        .scanner
        .roots
        .first()
        .cloned()
        .unwrap_or_else(|| std::path::PathBuf::from("/"));
    let env = EnvSnapshot::capture(&probe);

    let scanner = Scanner::new();
    let request = ScanRequest::from_config(&config.scanner);
    let (candidates, walk_errors) = scanner.scan(&request, cancel);

    let planner = Planner::new(policy, safety);
    let plan = planner.plan(candidates, &env);

    if let Ok(err) = walk_errors.try_recv() {
        recorder.record(
            AuditEvent::new("scan", probe.to_string_lossy())
                .with_level(Level::Error)
                .with_error(err.to_string()),
        );
    }

    for item in &plan {
        recorder.record(event::plan_event(item));
    }

    let executor = Executor::new(
        safety,
        trash,
        Some(recorder),
        config.safety.allow_directory_delete,
    );
    let results = executor.execute(&plan, mode, cancel);

    let mut summary = RunSummary {
        planned: plan.len(),
        executed: results.len(),
        ..RunSummary::default()
    };
    for result in &results {
        if result.deleted {
            summary.deleted += 1;
        }
        summary.bytes_freed += result.bytes_freed;
    }

    if let Some(trash) = trash {
        let (removed, bytes) = trash.cleanup(cancel)?;
        summary.trash_removed = removed;
        summary.trash_bytes_freed = bytes;
    }

    Ok(summary)
}
