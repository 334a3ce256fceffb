//! End-to-end pipeline scenarios against the synthetic capture source.

use std::fs;
use std::path::Path;
use std::time::Duration;

use duplex_core::pipeline::DuplexEngine;
use duplex_core::storage::StorageManager;
use duplex_core::{ComponentState, CoreConfig};
use tempfile::tempdir;

fn fast_config(dir: &Path) -> CoreConfig {
    CoreConfig {
        working_dir: dir.to_path_buf(),
        flush_age: Duration::from_millis(50),
        idle_flush: Duration::from_millis(20),
        stage_wait: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(25),
        ..CoreConfig::default()
    }
}

fn wav_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "wav").unwrap_or(false))
        .collect();
    out.sort();
    out
}

#[test]
fn clean_shutdown_under_synthetic_load() {
    let dir = tempdir().unwrap();
    let engine = DuplexEngine::new(fast_config(dir.path())).unwrap();
    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(400));
    let report = engine.shutdown().unwrap();
    assert!(report.succeeded());

    // Queues drained, every lease returned.
    let pool = engine.pool().stats();
    assert_eq!(pool.total_in_use(), 0);
    assert_eq!(pool.allocations - pool.releases, 0);
    assert_eq!(pool.leaked, 0);

    // At least one wav + matching sidecar per channel.
    let session = engine.session().to_string();
    for channel in ["left", "right"] {
        let channel_dir = dir.path().join("recordings").join(&session).join(channel);
        let wavs = wav_files(&channel_dir);
        assert!(!wavs.is_empty(), "no output for {channel}");
        for wav in &wavs {
            StorageManager::verify_file(wav).unwrap();
        }
        // Sequences start at 1 with no gaps.
        for (i, wav) in wavs.iter().enumerate() {
            let _ = i;
            let stem = wav.file_stem().unwrap().to_string_lossy().to_string();
            let seq: u64 = stem.parse().unwrap();
            assert!(seq >= 1 && seq <= wavs.len() as u64);
        }
    }

    // History ends in CLEANUP_COMPLETED.
    let history = engine.system_history();
    assert_eq!(history.last().unwrap().to, ComponentState::CleanupCompleted);

    // Session marker persisted for the next start.
    let marker = fs::read_to_string(dir.path().join(".session")).unwrap();
    assert_eq!(marker.trim(), session);

    // Recovery journal exists and every line parses.
    let journal = dir
        .path()
        .join("logs/recovery")
        .join(format!("{session}.jsonl"));
    let text = fs::read_to_string(journal).unwrap();
    for line in text.lines() {
        let _: serde_json::Value = serde_json::from_str(line).unwrap();
    }
}

#[test]
fn flush_failure_routes_batches_to_emergency_backup() {
    let dir = tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.flush_max_retries = 1;
    let engine = DuplexEngine::new(config).unwrap();
    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(150));

    // Break the left primary tree mid-run: replace the directory with a
    // plain file so every WAV create fails.
    let session = engine.session().to_string();
    let left_dir = dir.path().join("recordings").join(&session).join("left");
    let _ = fs::remove_dir_all(&left_dir);
    fs::write(&left_dir, b"blocked").unwrap();

    std::thread::sleep(Duration::from_millis(300));

    // Restore the primary tree so later flushes succeed again.
    let _ = fs::remove_file(&left_dir);
    fs::create_dir_all(&left_dir).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let _ = engine.shutdown();

    let backup_dir = dir.path().join("emergency_backup").join(&session).join("left");
    let backups = wav_files(&backup_dir);
    assert!(!backups.is_empty(), "nothing was routed to emergency backup");
    for wav in &backups {
        StorageManager::verify_file(wav).unwrap();
    }
    assert!(engine.storage().stats().emergency_batches > 0);
    assert!(engine.monitor().error_count("flush_failed") > 0);
}

#[test]
fn session_ids_are_monotonic_across_runs() {
    let dir = tempdir().unwrap();

    let first = {
        let engine = DuplexEngine::new(fast_config(dir.path())).unwrap();
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        engine.shutdown().unwrap();
        engine.session()
    };

    let engine = DuplexEngine::new(fast_config(dir.path())).unwrap();
    assert_eq!(engine.session(), first + 1);
}

#[test]
fn illegal_transition_leaves_component_untouched() {
    let dir = tempdir().unwrap();
    let engine = DuplexEngine::new(fast_config(dir.path())).unwrap();
    engine.start().unwrap();

    let capture = engine.registry().handle("capture").unwrap();
    assert_eq!(capture.cell().current(), ComponentState::Running);
    let history_before = capture.cell().history().len();

    let err = capture
        .cell()
        .transition(ComponentState::Initializing, "test")
        .unwrap_err();
    assert!(matches!(
        err,
        duplex_core::DuplexError::InvalidTransition {
            from: ComponentState::Running,
            to: ComponentState::Initializing,
        }
    ));
    assert_eq!(capture.cell().current(), ComponentState::Running);
    assert_eq!(capture.cell().history().len(), history_before);

    engine.shutdown().unwrap();
}
