//! Executor: the per-item gate sequence ending in mutation.
//!
//! Five gates run in strict order; the first failing gate settles the
//! item with a deterministic reason. Gate 3 re-validates safety against
//! the live filesystem immediately before mutation — the TOCTOU defense.
//! Mutation is fail-closed and idempotent; a missing source is success
//! with no work.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::time::SystemTime;

use crate::audit::{Recorder, event};
use crate::core::cancel::CancelToken;
use crate::core::errors::SageError;
use crate::core::types::{ActionResult, Mode, PlanItem, TargetKind};
use crate::safety::SafetyValidator;
use crate::trash::manager::{TrashManager, tree_file_size};

/// Drives plan items through the gates and into mutation.
pub struct Executor<'a> {
    safety: &'a SafetyValidator,
    trash: Option<&'a TrashManager>,
    recorder: Option<&'a dyn Recorder>,
    allow_directory_delete: bool,
}

impl<'a> Executor<'a> {
    #[must_use]
    pub fn new(
        safety: &'a SafetyValidator,
        trash: Option<&'a TrashManager>,
        recorder: Option<&'a dyn Recorder>,
        allow_directory_delete: bool,
    ) -> Self {
        Self {
            safety,
            trash,
            recorder,
            allow_directory_delete,
        }
    }

    /// Execute a whole plan in order. Cancellation settles remaining items
    /// at gate 0 rather than aborting the loop, so every item is audited.
    pub fn execute(
        &self,
        items: &[PlanItem],
        mode: Mode,
        cancel: &CancelToken,
    ) -> Vec<ActionResult> {
        items
            .iter()
            .map(|item| self.execute_item(item, mode, cancel))
            .collect()
    }

    /// Run one item through the gate sequence and audit the outcome.
    pub fn execute_item(
        &self,
        item: &PlanItem,
        mode: Mode,
        cancel: &CancelToken,
    ) -> ActionResult {
        let started_at = SystemTime::now();
        let mut result = self.run_gates(item, mode, cancel, started_at);

        // Unconditional post-step: finalize timestamps, then audit. Audit
        // failures never affect the result.
        if result.finished_at == SystemTime::UNIX_EPOCH {
            result.finished_at = SystemTime::now();
        }
        if let Some(recorder) = self.recorder {
            recorder.record(event::execute_event(&result));
        }
        result
    }

    fn run_gates(
        &self,
        item: &PlanItem,
        mode: Mode,
        cancel: &CancelToken,
        started_at: SystemTime,
    ) -> ActionResult {
        let settle = |reason: String, deleted: bool, bytes: u64, error: Option<String>| {
            ActionResult {
                path: item.candidate.path.clone(),
                kind: item.candidate.kind,
                mode,
                score: item.decision.score,
                deleted,
                bytes_freed: bytes,
                reason,
                started_at,
                finished_at: SystemTime::now(),
                error,
            }
        };

        // Gate 0: cancellation.
        if cancel.is_canceled() {
            return settle("ctx_canceled".to_string(), false, 0, None);
        }

        // Gate 1: policy decision.
        if !item.decision.allow {
            return settle(
                format!("policy_deny:{}", item.decision.reason),
                false,
                0,
                None,
            );
        }

        // Gate 2: scan-time safety.
        if !item.safety.allowed {
            return settle(
                format!("safety_deny_scan:{}", item.safety.reason),
                false,
                0,
                None,
            );
        }

        // Gate 3: execute-time safety, against the live filesystem.
        let fresh = self.safety.revalidate(&item.candidate);
        if !fresh.allowed {
            return settle(
                format!("{}{}", event::SAFETY_DENY_EXECUTE_PREFIX, fresh.reason),
                false,
                0,
                None,
            );
        }

        // Gate 4: dry-run reports without mutating.
        if mode == Mode::DryRun {
            let bytes = match item.candidate.kind {
                TargetKind::File => item.candidate.size_bytes,
                TargetKind::Dir => 0,
            };
            return settle("would_delete".to_string(), false, bytes, None);
        }

        // Gate 5: mutation.
        match item.candidate.kind {
            TargetKind::File => self.mutate_file(item, settle),
            TargetKind::Dir => self.mutate_dir(item, settle),
        }
    }

    fn mutate_file(
        &self,
        item: &PlanItem,
        settle: impl Fn(String, bool, u64, Option<String>) -> ActionResult,
    ) -> ActionResult {
        let path = &item.candidate.path;
        let size = item.candidate.size_bytes;

        if let Some(trash) = self.trash {
            return match trash.move_to_trash(path) {
                Ok(_) => settle("trashed".to_string(), true, size, None),
                Err(e) if is_not_found(&e) => {
                    settle("already_gone".to_string(), false, 0, None)
                }
                Err(e) => settle("delete_failed".to_string(), false, 0, Some(e.to_string())),
            };
        }

        match fs::remove_file(path) {
            Ok(()) => settle("deleted".to_string(), true, size, None),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                settle("already_gone".to_string(), false, 0, None)
            }
            Err(e) => settle(
                "delete_failed".to_string(),
                false,
                0,
                Some(SageError::io(path, e).to_string()),
            ),
        }
    }

    fn mutate_dir(
        &self,
        item: &PlanItem,
        settle: impl Fn(String, bool, u64, Option<String>) -> ActionResult,
    ) -> ActionResult {
        if !self.allow_directory_delete {
            return settle("dir_delete_disabled".to_string(), false, 0, None);
        }
        let path = &item.candidate.path;
        // Content size is summed before removal; the directory entry itself
        // contributes nothing.
        let bytes = tree_file_size(path);

        if let Some(trash) = self.trash {
            return match trash.move_to_trash(path) {
                Ok(_) => settle("trashed".to_string(), true, bytes, None),
                Err(e) if is_not_found(&e) => {
                    settle("already_gone".to_string(), false, 0, None)
                }
                Err(e) => settle("delete_failed".to_string(), false, 0, Some(e.to_string())),
            };
        }

        match fs::remove_dir_all(path) {
            Ok(()) => settle("deleted".to_string(), true, bytes, None),
            // Recursive remove of an absent path is idempotent success.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                settle("deleted".to_string(), true, 0, None)
            }
            Err(e) => settle(
                "delete_failed".to_string(),
                false,
                0,
                Some(SageError::io(path, e).to_string()),
            ),
        }
    }
}

fn is_not_found(err: &SageError) -> bool {
    matches!(err, SageError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Candidate, Decision, SafetyVerdict};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn file_item(path: &Path, size: u64) -> PlanItem {
        PlanItem {
            candidate: Candidate {
                root: path.parent().unwrap().to_path_buf(),
                path: path.to_path_buf(),
                kind: TargetKind::File,
                size_bytes: size,
                modified: SystemTime::now() - Duration::from_secs(90 * 86_400),
                is_symlink: false,
                symlink_target: None,
                device_id: device_of(path.parent().unwrap()),
                root_device_id: device_of(path.parent().unwrap()),
                found_at: SystemTime::now(),
            },
            decision: Decision::allowed("age_ok", 42),
            safety: SafetyVerdict::allow("ok"),
        }
    }

    fn dir_item(path: &Path) -> PlanItem {
        let mut item = file_item(path, 0);
        item.candidate.kind = TargetKind::Dir;
        item
    }

    fn device_of(path: &Path) -> u64 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            fs::metadata(path).map(|m| m.dev()).unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            0
        }
    }

    fn validator_for(root: &Path, allow_dirs: bool) -> SafetyValidator {
        SafetyValidator::new(vec![root.to_path_buf()], Vec::new(), allow_dirs, true)
    }

    #[test]
    fn gate0_cancellation_settles_without_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();

        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, None, false);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = executor.execute_item(&file_item(&file, 1), Mode::Execute, &cancel);
        assert_eq!(result.reason, "ctx_canceled");
        assert!(!result.deleted);
        assert!(file.exists());
    }

    #[test]
    fn gate1_policy_denial_carries_child_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();

        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, None, false);
        let mut item = file_item(&file, 1);
        item.decision = Decision::denied("too_new");

        let result = executor.execute_item(&item, Mode::Execute, &CancelToken::new());
        assert_eq!(result.reason, "policy_deny:too_new");
        assert!(file.exists());
    }

    #[test]
    fn gate2_scan_safety_denial() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();

        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, None, false);
        let mut item = file_item(&file, 1);
        item.safety = SafetyVerdict::deny("protected_path:/etc");

        let result = executor.execute_item(&item, Mode::Execute, &CancelToken::new());
        assert_eq!(result.reason, "safety_deny_scan:protected_path:/etc");
        assert!(file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn gate3_catches_symlink_swap_between_scan_and_execute() {
        let tmp = tempfile::tempdir().unwrap();
        let allowed = tmp.path().join("a");
        let forbidden = tmp.path().join("b");
        fs::create_dir_all(&allowed).unwrap();
        fs::create_dir_all(&forbidden).unwrap();
        fs::write(allowed.join("target"), b"t").unwrap();
        fs::write(forbidden.join("secret"), b"s").unwrap();
        let link = allowed.join("link");
        std::os::unix::fs::symlink(allowed.join("target"), &link).unwrap();

        let safety = validator_for(&allowed, false);
        let executor = Executor::new(&safety, None, None, false);
        let mut item = file_item(&link, 1);
        item.candidate.root = allowed.clone();
        item.candidate.is_symlink = true;
        item.candidate.symlink_target = Some(allowed.join("target"));

        // Between scan and execute, the link is re-targeted outside.
        fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink(forbidden.join("secret"), &link).unwrap();

        let result = executor.execute_item(&item, Mode::Execute, &CancelToken::new());
        assert!(!result.deleted);
        assert!(
            result.reason.starts_with("safety_deny_execute:symlink_"),
            "{}",
            result.reason
        );
        assert!(forbidden.join("secret").exists());
    }

    #[test]
    fn gate4_dry_run_reports_without_mutating() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, vec![0u8; 2048]).unwrap();

        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, None, false);
        let result =
            executor.execute_item(&file_item(&file, 2048), Mode::DryRun, &CancelToken::new());

        assert_eq!(result.reason, "would_delete");
        assert!(!result.deleted);
        assert_eq!(result.bytes_freed, 2048);
        assert!(file.exists());
    }

    #[test]
    fn gate5_unlink_and_bytes_freed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("old.bin");
        fs::write(&file, vec![0u8; 512]).unwrap();

        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, None, false);
        let result =
            executor.execute_item(&file_item(&file, 512), Mode::Execute, &CancelToken::new());

        assert!(result.deleted);
        assert_eq!(result.reason, "deleted");
        assert_eq!(result.bytes_freed, 512);
        assert!(!file.exists());
        assert!(result.finished_at >= result.started_at);
    }

    #[test]
    fn gate5_trash_moves_instead_of_unlinking() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let file = data.join("old.bin");
        fs::write(&file, vec![0u8; 64]).unwrap();

        let trash = TrashManager::new(
            &tmp.path().join("trash"),
            None,
            Some(b"k".to_vec()),
            Vec::new(),
        )
        .unwrap();
        let safety = validator_for(&data, false);
        let executor = Executor::new(&safety, Some(&trash), None, false);
        let result =
            executor.execute_item(&file_item(&file, 64), Mode::Execute, &CancelToken::new());

        assert_eq!(result.reason, "trashed");
        assert!(result.deleted);
        assert_eq!(result.bytes_freed, 64);
        assert!(!file.exists());
        assert_eq!(trash.list().unwrap().len(), 1);
    }

    #[test]
    fn missing_file_is_already_gone_without_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();

        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, None, false);
        let item = file_item(&file, 1);

        // Removed out-of-band between plan and execute.
        fs::remove_file(&file).unwrap();

        let result = executor.execute_item(&item, Mode::Execute, &CancelToken::new());
        assert_eq!(result.reason, "already_gone");
        assert!(!result.deleted);
        assert!(result.error.is_none());
    }

    #[test]
    fn directory_delete_requires_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir_all(&dir).unwrap();

        let safety = validator_for(tmp.path(), true);
        let executor = Executor::new(&safety, None, None, false);
        let result = executor.execute_item(&dir_item(&dir), Mode::Execute, &CancelToken::new());

        assert_eq!(result.reason, "dir_delete_disabled");
        assert!(dir.exists());
    }

    #[test]
    fn directory_delete_sums_file_sizes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a"), vec![0u8; 100]).unwrap();
        fs::write(dir.join("sub/b"), vec![0u8; 150]).unwrap();

        let safety = validator_for(tmp.path(), true);
        let executor = Executor::new(&safety, None, None, true);
        let result = executor.execute_item(&dir_item(&dir), Mode::Execute, &CancelToken::new());

        assert_eq!(result.reason, "deleted");
        assert_eq!(result.bytes_freed, 250);
        assert!(!dir.exists());
    }

    #[test]
    fn missing_directory_is_idempotent_success() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("gone");
        fs::create_dir_all(&dir).unwrap();

        let safety = validator_for(tmp.path(), true);
        let executor = Executor::new(&safety, None, None, true);
        let item = dir_item(&dir);

        fs::remove_dir_all(&dir).unwrap();

        let result = executor.execute_item(&item, Mode::Execute, &CancelToken::new());
        assert_eq!(result.reason, "deleted");
        assert!(result.deleted);
        assert_eq!(result.bytes_freed, 0);
        assert!(result.error.is_none());
    }

    #[test]
    fn every_item_emits_exactly_one_audit_event() {
        use parking_lot::Mutex;

        struct CountingRecorder {
            events: Mutex<Vec<crate::audit::AuditEvent>>,
        }
        impl Recorder for CountingRecorder {
            fn record(&self, event: crate::audit::AuditEvent) {
                self.events.lock().push(event);
            }
            fn close(&self) -> crate::core::errors::Result<()> {
                Ok(())
            }
            fn first_error(&self) -> Option<String> {
                None
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        fs::write(&live, b"x").unwrap();

        let recorder = CountingRecorder {
            events: Mutex::new(Vec::new()),
        };
        let safety = validator_for(tmp.path(), false);
        let executor = Executor::new(&safety, None, Some(&recorder), false);

        let mut denied = file_item(&tmp.path().join("denied"), 1);
        denied.decision = Decision::denied("too_new");

        let results = executor.execute(
            &[file_item(&live, 1), denied],
            Mode::Execute,
            &CancelToken::new(),
        );
        assert_eq!(results.len(), 2);

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == "execute"));
        assert_eq!(events[0].fields["outcome"], "delete");
        assert_eq!(events[1].fields["outcome"], "skip");
    }

    #[test]
    fn age_gate_scenario_end_to_end() {
        // S1: old file deleted, new file denied by policy.
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let old = root.join("old.bin");
        let new = root.join("new.bin");
        let five_mib = 5 * 1024 * 1024;
        fs::write(&old, vec![0u8; 16]).unwrap();
        fs::write(&new, vec![0u8; 16]).unwrap();

        let now = SystemTime::now();
        let mut old_item = file_item(&old, five_mib);
        old_item.candidate.root = root.clone();
        old_item.candidate.modified = now - Duration::from_secs(60 * 86_400);
        let mut new_item = file_item(&new, five_mib);
        new_item.candidate.root = root.clone();
        new_item.candidate.modified = now;

        let policy = crate::policy::AgePolicy::new(30);
        let env = crate::core::types::EnvSnapshot::fixed(now);
        use crate::policy::Policy as _;
        old_item.decision = policy.evaluate(&old_item.candidate, &env);
        new_item.decision = policy.evaluate(&new_item.candidate, &env);

        let safety = validator_for(&root, false);
        let executor = Executor::new(&safety, None, None, false);
        let results = executor.execute(
            &[old_item, new_item],
            Mode::Execute,
            &CancelToken::new(),
        );

        assert!(results[0].deleted);
        assert_eq!(results[0].reason, "deleted");
        assert_eq!(results[0].bytes_freed, five_mib);
        assert!(!results[1].deleted);
        assert_eq!(results[1].reason, "policy_deny:too_new");
        assert!(new.exists());
    }
}
