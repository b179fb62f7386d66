//! End-to-end fuzzing runs over throwaway shell targets.

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use grizzly::{Checkpoint, Config, Fuzzer, GrizzlyError};

fn temp_workspace(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("grizzly-loop-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp workspace");
    root
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

fn seed_dir(ws: &Path, seeds: &[&[u8]]) -> PathBuf {
    let dir = ws.join("seeds");
    std::fs::create_dir_all(&dir).expect("create seed dir");
    for (i, data) in seeds.iter().enumerate() {
        std::fs::write(dir.join(format!("seed{i}")), data).expect("write seed");
    }
    dir
}

fn short_run_config(ws: &Path, target: PathBuf, duration: u64) -> Config {
    Config {
        target,
        seeds: ws.join("seeds"),
        output: ws.join("output"),
        duration,
        timeout: 2.0,
        bitmap_size: 1024,
        max_seed_size: 4096,
        log_interval: 0.2,
        checkpoint_interval: 3600.0,
        seed: Some(7),
        ..Config::default()
    }
}

#[test]
fn short_run_produces_artifacts() {
    let ws = temp_workspace("artifacts");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");
    seed_dir(&ws, &[b"hello", b"world"]);

    let report = Fuzzer::new(short_run_config(&ws, target, 1))
        .expect("fuzzer")
        .run()
        .expect("run");

    assert!(report.total_execs > 2, "only the dry run executed");
    assert_eq!(report.total_seeds, 2);

    let out = ws.join("output");
    let timeline = std::fs::read_to_string(out.join("timeline.csv")).expect("timeline");
    let mut lines = timeline.lines();
    assert_eq!(
        lines.next(),
        Some("elapsed_s,total_execs,exec_rate,total_crashes,saved_crashes,total_hangs,saved_hangs,coverage_bits")
    );
    assert!(lines.next().is_some(), "no timeline rows recorded");

    assert!(out.join("stats.json").exists());
    assert!(out.join("final_report.json").exists());
    assert!(out.join("crashes").is_dir());
    assert!(out.join("hangs").is_dir());
    assert!(out.join("queue").is_dir());
}

#[test]
fn crashes_are_counted_but_deduped_by_coverage() {
    let ws = temp_workspace("crashes");
    // An uninstrumented target writes no coverage, so no crash clears a
    // virgin-crash bit: everything is counted, nothing is saved.
    let target = write_script(&ws, "crash.sh", "exit 77");
    seed_dir(&ws, &[b"x"]);

    let report = Fuzzer::new(short_run_config(&ws, target, 1))
        .expect("fuzzer")
        .run()
        .expect("run");

    assert!(report.total_crashes > 0);
    assert_eq!(report.saved_crashes, 0);
    assert_eq!(
        std::fs::read_dir(ws.join("output").join("crashes"))
            .expect("crashes dir")
            .count(),
        0
    );
}

#[test]
fn hang_budget_applies_every_iteration() {
    let ws = temp_workspace("hangs");
    let target = write_script(&ws, "sleep.sh", "sleep 30");
    seed_dir(&ws, &[b"z"]);

    let mut config = short_run_config(&ws, target, 2);
    config.timeout = 0.2;
    let report = Fuzzer::new(config).expect("fuzzer").run().expect("run");

    assert!(report.total_hangs > 0);
    assert_eq!(report.total_hangs, report.total_execs);
    assert!(report.saved_hangs <= 1, "hang fingerprint failed to dedup");
}

#[test]
fn oversized_initial_seeds_are_skipped() {
    let ws = temp_workspace("oversized");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");
    seed_dir(&ws, &[b"small", &[0u8; 8192]]);

    let report = Fuzzer::new(short_run_config(&ws, target, 1))
        .expect("fuzzer")
        .run()
        .expect("run");
    assert_eq!(report.total_seeds, 1);
}

#[test]
fn too_many_initial_seeds_is_a_startup_error() {
    let ws = temp_workspace("toomany");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");
    seed_dir(&ws, &[b"a", b"b", b"c"]);

    let mut config = short_run_config(&ws, target, 1);
    config.max_seeds = 2;
    let err = Fuzzer::new(config)
        .expect("fuzzer")
        .run()
        .expect_err("should refuse to start");
    assert!(matches!(err, GrizzlyError::Config(_)));
}

#[test]
fn missing_seed_dir_synthesizes_an_empty_seed() {
    let ws = temp_workspace("noseeds");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");

    let report = Fuzzer::new(short_run_config(&ws, target, 1))
        .expect("fuzzer")
        .run()
        .expect("run");
    assert_eq!(report.total_seeds, 1);
    assert!(report.total_execs > 0);
}

#[test]
fn checkpoint_resume_continues_counters() {
    let ws = temp_workspace("resume");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");
    seed_dir(&ws, &[b"hello"]);

    // First leg: checkpoint aggressively so at least one lands.
    let mut first = short_run_config(&ws, target.clone(), 1);
    first.checkpoint_interval = 0.1;
    Fuzzer::new(first).expect("fuzzer").run().expect("first leg");

    let checkpoint_path = ws.join("output").join("checkpoints").join("checkpoint.json");
    assert!(checkpoint_path.exists(), "no checkpoint written");
    let saved = Checkpoint::read(&checkpoint_path).expect("read checkpoint");
    assert!(saved.stats.total_execs > 0);
    assert!(saved.elapsed_s > 0.0);

    // Second leg resumes into a fresh output dir; total_execs keeps growing
    // from the checkpointed value and the dry run is skipped.
    let ws2 = temp_workspace("resume-second");
    let mut second = short_run_config(&ws2, target, 2);
    second.resume_from = Some(checkpoint_path);
    let report = Fuzzer::new(second).expect("fuzzer").run().expect("second leg");

    assert!(report.total_execs > saved.stats.total_execs);
    assert_eq!(report.total_seeds, saved.seeds.len());
}

#[test]
fn resume_from_garbage_is_fatal() {
    let ws = temp_workspace("badresume");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");
    seed_dir(&ws, &[b"x"]);

    let bad = ws.join("checkpoint.json");
    std::fs::write(&bad, b"not json").expect("write garbage");

    let mut config = short_run_config(&ws, target, 1);
    config.resume_from = Some(bad);
    let err = Fuzzer::new(config)
        .expect("fuzzer")
        .run()
        .expect_err("resume should fail");
    assert!(matches!(err, GrizzlyError::Checkpoint(_)));
}

#[test]
fn fifo_strategy_runs_the_same_loop() {
    let ws = temp_workspace("fifo");
    let target = write_script(&ws, "cat.sh", "cat >/dev/null");
    seed_dir(&ws, &[b"one", b"two"]);

    let mut config = short_run_config(&ws, target, 1);
    config.seed_sort_strategy = grizzly::ScheduleStrategy::Fifo;
    let report = Fuzzer::new(config).expect("fuzzer").run().expect("run");
    assert!(report.total_execs > 2);
}
