//! End-to-end pipeline scenarios: scanner → planner → executor → auditor.

mod common;

use std::fs;

use common::{age_days, config_in, scan_root, write_zeros};
use storage_sage::audit::jsonl::JsonlRecorder;
use storage_sage::audit::Recorder;
use storage_sage::core::cancel::CancelToken;
use storage_sage::core::types::Mode;
use storage_sage::exec::run::run_once;
use storage_sage::policy::{AgePolicy, CompositeMode, CompositePolicy, policy_from_config};
use storage_sage::safety::SafetyValidator;
use storage_sage::trash::manager::TrashManager;

const FIVE_MIB: usize = 5 * 1024 * 1024;

fn audit_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn age_gate_deletes_old_and_denies_new() {
    // S1: /root/old.bin (5 MiB, 60d) deleted; /root/new.bin denied.
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let root = scan_root(&config);
    let old = root.join("old.bin");
    let new = root.join("new.bin");
    write_zeros(&old, FIVE_MIB);
    write_zeros(&new, FIVE_MIB);
    age_days(&old, 60);

    let policy = CompositePolicy::new(
        CompositeMode::All,
        vec![Box::new(AgePolicy::new(30))],
    );
    let safety = SafetyValidator::from_config(&config.safety, config.effective_allowed_roots());
    let recorder = JsonlRecorder::open(&config.audit.path).unwrap();

    let summary = run_once(
        &config,
        &policy,
        &safety,
        None,
        &recorder,
        Mode::Execute,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(summary.planned, 2);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.bytes_freed, FIVE_MIB as u64);
    assert!(!old.exists());
    assert!(new.exists());

    recorder.close().unwrap();
    let lines = audit_lines(&config.audit.path);
    let old_exec = lines
        .iter()
        .find(|l| l["action"] == "execute" && l["path"].as_str().unwrap().ends_with("old.bin"))
        .unwrap();
    assert_eq!(old_exec["fields"]["reason"], "deleted");
    assert_eq!(old_exec["fields"]["bytes_freed"], FIVE_MIB as u64);
    let new_exec = lines
        .iter()
        .find(|l| l["action"] == "execute" && l["path"].as_str().unwrap().ends_with("new.bin"))
        .unwrap();
    assert_eq!(new_exec["fields"]["reason"], "policy_deny:too_new");
}

#[cfg(unix)]
#[test]
fn toctou_symlink_swap_is_blocked_at_execute_time() {
    // S2: link re-targeted outside the allowed root between scan and
    // execute; the fresh gate-3 check must refuse it.
    use storage_sage::core::types::EnvSnapshot;
    use storage_sage::exec::executor::Executor;
    use storage_sage::exec::planner::Planner;
    use storage_sage::scanner::walker::{ScanRequest, Scanner};

    let tmp = tempfile::tempdir().unwrap();
    let allowed = tmp.path().join("A");
    let forbidden = tmp.path().join("B");
    fs::create_dir_all(&allowed).unwrap();
    fs::create_dir_all(&forbidden).unwrap();
    fs::write(allowed.join("target"), b"t").unwrap();
    fs::write(forbidden.join("secret"), b"s").unwrap();
    let link = allowed.join("link");
    std::os::unix::fs::symlink(allowed.join("target"), &link).unwrap();
    age_days(&link, 60);
    age_days(&allowed.join("target"), 60);

    // Scan while the link is still inside the root.
    let scanner = Scanner::new();
    let request = ScanRequest {
        roots: vec![allowed.clone()],
        recursive: true,
        follow_symlinks: false,
        max_depth: 0,
        include_files: true,
        include_dirs: false,
    };
    let (candidates, _errors) = scanner.scan(&request, &CancelToken::new());

    let policy = AgePolicy::new(1);
    let safety = SafetyValidator::new(vec![allowed.clone()], Vec::new(), false, true);
    let planner = Planner::new(&policy, &safety);
    let env = EnvSnapshot::fixed(std::time::SystemTime::now());
    let plan = planner.plan(candidates, &env);

    let link_item = plan
        .iter()
        .find(|i| i.candidate.path == link)
        .expect("link was scanned");
    assert!(link_item.safety.allowed, "scan-time safety passed");

    // Swap the link before execution.
    fs::remove_file(&link).unwrap();
    std::os::unix::fs::symlink(forbidden.join("secret"), &link).unwrap();

    let executor = Executor::new(&safety, None, None, false);
    let result = executor.execute_item(link_item, Mode::Execute, &CancelToken::new());

    assert!(!result.deleted);
    assert!(
        result.reason.starts_with("safety_deny_execute:symlink_")
            || result
                .reason
                .starts_with("safety_deny_execute:outside_allowed_roots"),
        "unexpected reason: {}",
        result.reason
    );
    assert!(forbidden.join("secret").exists(), "target must survive");
}

#[test]
fn out_of_band_removal_is_idempotent_success() {
    // S3: file present at plan time, removed before execute.
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let root = scan_root(&config);
    let victim = root.join("f");
    write_zeros(&victim, 1024);
    age_days(&victim, 90);

    use storage_sage::core::types::EnvSnapshot;
    use storage_sage::exec::executor::Executor;
    use storage_sage::exec::planner::Planner;
    use storage_sage::scanner::walker::{ScanRequest, Scanner};

    let scanner = Scanner::new();
    let (candidates, _errors) =
        scanner.scan(&ScanRequest::from_config(&config.scanner), &CancelToken::new());

    let policy = AgePolicy::new(30);
    let safety = SafetyValidator::from_config(&config.safety, config.effective_allowed_roots());
    let planner = Planner::new(&policy, &safety);
    let plan = planner.plan(candidates, &EnvSnapshot::fixed(std::time::SystemTime::now()));
    assert_eq!(plan.len(), 1);

    fs::remove_file(&victim).unwrap();

    let executor = Executor::new(&safety, None, None, false);
    let results = executor.execute(&plan, Mode::Execute, &CancelToken::new());
    assert_eq!(results[0].reason, "already_gone");
    assert!(!results[0].deleted);
    assert!(results[0].error.is_none());
}

#[test]
fn audit_event_timestamps_follow_execution() {
    // Invariant 2: finished_at >= started_at for every result.
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let root = scan_root(&config);
    for i in 0..5 {
        let f = root.join(format!("f{i}"));
        write_zeros(&f, 64);
        age_days(&f, 45);
    }

    let policy = policy_from_config(&config.policy).unwrap();
    let safety = SafetyValidator::from_config(&config.safety, config.effective_allowed_roots());
    let recorder = JsonlRecorder::open(&config.audit.path).unwrap();

    run_once(
        &config,
        &policy,
        &safety,
        None,
        &recorder,
        Mode::Execute,
        &CancelToken::new(),
    )
    .unwrap();
    recorder.close().unwrap();

    // One plan and one execute line per item, and the executor only
    // audits after finishing.
    let lines = audit_lines(&config.audit.path);
    assert_eq!(lines.iter().filter(|l| l["action"] == "plan").count(), 5);
    assert_eq!(lines.iter().filter(|l| l["action"] == "execute").count(), 5);
}

#[test]
fn canceled_run_settles_every_item_without_mutation() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let root = scan_root(&config);
    let f = root.join("old");
    write_zeros(&f, 10);
    age_days(&f, 90);

    use storage_sage::core::types::{EnvSnapshot, PlanItem};
    use storage_sage::exec::executor::Executor;

    let policy = AgePolicy::new(30);
    let safety = SafetyValidator::from_config(&config.safety, config.effective_allowed_roots());

    use storage_sage::scanner::walker::{ScanRequest, Scanner};
    let (candidates, _) = Scanner::new().scan(
        &ScanRequest::from_config(&config.scanner),
        &CancelToken::new(),
    );
    let plan: Vec<PlanItem> = storage_sage::exec::planner::Planner::new(&policy, &safety)
        .plan(candidates, &EnvSnapshot::fixed(std::time::SystemTime::now()));

    let cancel = CancelToken::new();
    cancel.cancel();
    let executor = Executor::new(&safety, None, None, false);
    let results = executor.execute(&plan, Mode::Execute, &cancel);

    assert_eq!(results.len(), plan.len());
    assert!(results.iter().all(|r| r.reason == "ctx_canceled"));
    assert!(f.exists());
}

#[test]
fn trash_enabled_run_preserves_bytes_in_quarantine() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config_in(tmp.path());
    // Moves preserve the source mtime, and retention cleanup goes by entry
    // mod-time, so an aged file would be reaped by the same run. Keep
    // forever to observe the quarantined entry.
    config.trash.retention = String::new();
    let root = scan_root(&config);
    let f = root.join("big.log");
    write_zeros(&f, 4096);
    age_days(&f, 90);

    let policy = policy_from_config(&config.policy).unwrap();
    let safety = SafetyValidator::from_config(&config.safety, config.effective_allowed_roots());
    let trash = TrashManager::from_config(&config).unwrap();
    let recorder = JsonlRecorder::open(&config.audit.path).unwrap();

    let summary = run_once(
        &config,
        &policy,
        &safety,
        Some(&trash),
        &recorder,
        Mode::Execute,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(summary.deleted, 1);
    assert!(!f.exists());
    let items = trash.list().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].size, 4096);

    recorder.close().unwrap();
    let lines = audit_lines(&config.audit.path);
    let exec = lines.iter().find(|l| l["action"] == "execute").unwrap();
    assert_eq!(exec["fields"]["reason"], "trashed");

    // Keep-forever retention makes cleanup a no-op.
    let (removed, _) = trash.cleanup(&CancelToken::new()).unwrap();
    assert_eq!(removed, 0);
}
