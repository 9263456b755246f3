//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use storage_sage::core::config::{
    AuditConfig, Config, DaemonConfig, ScannerConfig, TrashConfig,
};

/// A config rooted entirely inside `tmp`: one scan root, jsonl audit,
/// trash beside it, ephemeral HTTP port.
pub fn config_in(tmp: &Path) -> Config {
    let root = tmp.join("root");
    fs::create_dir_all(&root).unwrap();
    Config {
        scanner: ScannerConfig {
            roots: vec![root],
            ..ScannerConfig::default()
        },
        trash: TrashConfig {
            root: tmp.join("trash"),
            signing_key: "ab".repeat(32),
            ..TrashConfig::default()
        },
        audit: AuditConfig {
            backend: "jsonl".to_string(),
            path: tmp.join("audit.jsonl"),
        },
        daemon: DaemonConfig {
            pid_file: tmp.join("daemon.pid"),
            listen_addr: "127.0.0.1:0".to_string(),
            ..DaemonConfig::default()
        },
        ..Config::default()
    }
}

/// The scan root of a config built by [`config_in`].
pub fn scan_root(config: &Config) -> PathBuf {
    config.scanner.roots[0].clone()
}

/// Rewind a file's mtime by `days`.
pub fn age_days(path: &Path, days: u64) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    #[allow(clippy::cast_possible_wrap)]
    let then = (now - days * 86_400) as i64;
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(then, 0)).unwrap();
}

/// Write `size` zero bytes at `path`.
pub fn write_zeros(path: &Path, size: usize) {
    fs::write(path, vec![0u8; size]).unwrap();
}
