//! Quarantine round-trips, signed metadata, retention, and restoration.

mod common;

use std::fs;
use std::time::Duration;

use common::age_days;
use storage_sage::core::cancel::CancelToken;
use storage_sage::trash::manager::{TrashManager, sidecar_path};
use storage_sage::trash::meta::TrashMeta;

fn manager(tmp: &std::path::Path, restore_roots: Vec<std::path::PathBuf>) -> TrashManager {
    TrashManager::new(
        &tmp.join("trash"),
        Some(Duration::from_secs(30 * 86_400)),
        Some(b"integration-key".to_vec()),
        restore_roots,
    )
    .unwrap()
}

#[test]
fn file_round_trip_preserves_path_and_bytes() {
    // S4: /U/doc.txt ("hello, world!") → trash → restore.
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("U");
    fs::create_dir_all(&home).unwrap();
    let doc = home.join("doc.txt");
    fs::write(&doc, b"hello, world!").unwrap();

    let trash = manager(tmp.path(), vec![home.clone()]);
    let trash_path = trash.move_to_trash(&doc).unwrap();
    assert!(!doc.exists());
    assert!(sidecar_path(&trash_path).exists());

    let restored = trash.restore(&trash_path).unwrap();
    assert_eq!(restored, doc);
    assert_eq!(fs::read(&doc).unwrap(), b"hello, world!");
    assert!(!sidecar_path(&trash_path).exists());

    // No .tmp or .meta remains anywhere in the trash root.
    let leftovers: Vec<String> = fs::read_dir(trash.root())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn every_written_sidecar_verifies_with_the_manager_key() {
    // Invariant 4.
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("u");
    fs::create_dir_all(&home).unwrap();
    let trash = manager(tmp.path(), Vec::new());

    for i in 0..5 {
        let f = home.join(format!("f{i}.dat"));
        fs::write(&f, vec![0u8; 10 + i]).unwrap();
        let trash_path = trash.move_to_trash(&f).unwrap();
        let raw = fs::read_to_string(sidecar_path(&trash_path)).unwrap();
        let meta = TrashMeta::parse_verified(
            &raw,
            b"integration-key",
            &sidecar_path(&trash_path),
        )
        .unwrap();
        assert_eq!(meta.original_path, f);
        assert_eq!(meta.size, (10 + i) as u64);
    }
}

#[test]
fn directory_trash_item_size_is_recursive_content_sum() {
    // Invariant 5.
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("bundle");
    fs::create_dir_all(src.join("deep/deeper")).unwrap();
    fs::write(src.join("a"), vec![0u8; 111]).unwrap();
    fs::write(src.join("deep/b"), vec![0u8; 222]).unwrap();
    fs::write(src.join("deep/deeper/c"), vec![0u8; 333]).unwrap();

    let trash = manager(tmp.path(), Vec::new());
    trash.move_to_trash(&src).unwrap();

    let items = trash.list().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].is_dir);
    assert_eq!(items[0].size, 666);
}

#[test]
fn directory_round_trip_restores_structure() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("u");
    let src = home.join("project");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("top.txt"), b"top").unwrap();
    fs::write(src.join("sub/nested.txt"), b"nested").unwrap();

    let trash = manager(tmp.path(), vec![home.clone()]);
    let trash_path = trash.move_to_trash(&src).unwrap();
    assert!(!src.exists());

    let restored = trash.restore(&trash_path).unwrap();
    assert_eq!(restored, src);
    assert_eq!(fs::read(src.join("top.txt")).unwrap(), b"top");
    assert_eq!(fs::read(src.join("sub/nested.txt")).unwrap(), b"nested");
}

#[test]
fn cleanup_is_idempotent_across_runs() {
    // Invariant 8: a second cleanup with no new entries removes nothing.
    let tmp = tempfile::tempdir().unwrap();
    let trash = TrashManager::new(
        &tmp.path().join("trash"),
        Some(Duration::from_secs(3600)),
        Some(b"k".to_vec()),
        Vec::new(),
    )
    .unwrap();

    for i in 0..3 {
        let entry = trash.root().join(format!("expired-{i}"));
        fs::write(&entry, vec![0u8; 50]).unwrap();
        age_days(&entry, 2);
    }
    let keep = trash.root().join("fresh");
    fs::write(&keep, b"keep").unwrap();

    let (first_removed, first_bytes) = trash.cleanup(&CancelToken::new()).unwrap();
    assert_eq!(first_removed, 3);
    assert_eq!(first_bytes, 150);
    assert!(keep.exists());

    let (second_removed, second_bytes) = trash.cleanup(&CancelToken::new()).unwrap();
    assert_eq!((second_removed, second_bytes), (0, 0));
    assert!(keep.exists());
}

#[test]
fn tampered_sidecar_blocks_restore_but_not_listing() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("u");
    fs::create_dir_all(&home).unwrap();
    let f = home.join("doc");
    fs::write(&f, b"data").unwrap();

    let trash = manager(tmp.path(), Vec::new());
    let trash_path = trash.move_to_trash(&f).unwrap();

    let sidecar = sidecar_path(&trash_path);
    let raw = fs::read_to_string(&sidecar).unwrap();
    fs::write(&sidecar, raw.replace("doc", "payload")).unwrap();

    // Listing still shows the entry, with no trusted original path.
    let items = trash.list().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].original_path.is_none());

    // Restore fails closed.
    let err = trash.restore(&trash_path).unwrap_err();
    assert_eq!(err.code(), "SSG-2201");
    assert!(trash_path.exists());
}

#[test]
fn ephemeral_key_manager_cannot_restore_across_restart() {
    // Flagged source behavior: without a configured key, a restart makes
    // earlier metadata unverifiable, by design.
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("u");
    fs::create_dir_all(&home).unwrap();
    let f = home.join("doc");
    fs::write(&f, b"data").unwrap();

    let first = TrashManager::new(&tmp.path().join("trash"), None, None, Vec::new()).unwrap();
    let trash_path = first.move_to_trash(&f).unwrap();
    drop(first);

    let second = TrashManager::new(&tmp.path().join("trash"), None, None, Vec::new()).unwrap();
    let err = second.restore(&trash_path).unwrap_err();
    assert_eq!(err.code(), "SSG-2201");
}
