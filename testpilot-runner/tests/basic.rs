// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end runs over real script fixtures.

#![cfg(unix)]

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use pretty_assertions::assert_eq;
use testpilot_runner::{
    config::RunOptions,
    list::{TestGroup, TestSpec, TestUnit},
    results::exit_code,
    runner::TestRun,
    signal::SignalHandlerKind,
};

fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Utf8PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn options(output_dir: &Utf8Path) -> RunOptions {
    RunOptions {
        output_dir: output_dir.to_owned(),
        quiet: true,
        ..RunOptions::default()
    }
}

fn single(pathname: Utf8PathBuf, options: &RunOptions) -> TestUnit {
    TestUnit::Single(TestSpec::from_options(pathname, options))
}

fn execute(options: RunOptions, units: Vec<TestUnit>) -> testpilot_runner::results::RunCounters {
    TestRun::new(options, units, SignalHandlerKind::Noop)
        .execute()
        .expect("run completes")
}

/// The timestamped run directory created under `output_dir`.
fn run_dir(output_dir: &Utf8Path) -> Utf8PathBuf {
    let mut dirs: Vec<Utf8PathBuf> = output_dir
        .read_dir_utf8()
        .expect("output dir exists")
        .map(|entry| entry.expect("entry is readable"))
        .filter(|entry| entry.file_name() != "current")
        .map(|entry| entry.into_path())
        .collect();
    assert_eq!(dirs.len(), 1, "one run directory per run");
    dirs.remove(0)
}

#[test]
fn classifies_pass_skip_fail_and_writes_artifacts() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let pass = write_script(&suite, "pass.sh", "echo hello stdout\nexit 0");
    let skip = write_script(&suite, "skip.sh", "exit 4");
    let fail = write_script(&suite, "fail.sh", "echo boom >&2\nexit 1");

    let output = temp.path().join("results");
    let options = options(&output);
    let units = vec![
        single(pass, &options),
        single(skip, &options),
        single(fail, &options),
    ];
    let counters = execute(options, units);

    assert_eq!(counters.total, 3);
    assert_eq!(counters.pass, 1);
    assert_eq!(counters.skip, 1);
    assert_eq!(counters.fail, 1);
    assert_eq!(counters.exit_code(), exit_code::TESTS_FAILED);

    let run_dir = run_dir(&output);
    let log = std::fs::read_to_string(run_dir.join("log")).unwrap();
    assert!(log.contains("[PASS]"), "pass line present in:\n{log}");
    assert!(log.contains("[SKIP]"), "skip line present in:\n{log}");
    assert!(log.contains("[FAIL]"), "fail line present in:\n{log}");
    assert!(log.contains("hello stdout"), "child output logged in:\n{log}");

    // Distinct basenames keep the per-test directories shallow.
    let stdout = std::fs::read_to_string(run_dir.join("pass.sh/stdout")).unwrap();
    assert_eq!(stdout, "hello stdout\n");
    let stderr = std::fs::read_to_string(run_dir.join("fail.sh/stderr")).unwrap();
    assert_eq!(stderr, "boom\n");

    let current = std::fs::read_link(output.join("current")).unwrap();
    assert_eq!(current, run_dir.as_std_path());
}

#[test]
fn merged_artifact_covers_both_streams() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let both = write_script(&suite, "both.sh", "echo out-line\necho err-line >&2");

    let output = temp.path().join("results");
    let options = options(&output);
    let counters = execute(options.clone(), vec![single(both, &options)]);
    assert_eq!(counters.pass, 1);

    let test_dir = run_dir(&output).join("both.sh");
    let stdout = std::fs::read_to_string(test_dir.join("stdout")).unwrap();
    assert_eq!(stdout, "out-line\n");
    let stderr = std::fs::read_to_string(test_dir.join("stderr")).unwrap();
    assert_eq!(stderr, "err-line\n");

    // The merged file holds every line from both streams, each prefixed
    // with its arrival timestamp.
    let merged = std::fs::read_to_string(test_dir.join("merged")).unwrap();
    let lines: Vec<&str> = merged.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|line| line.ends_with("out-line")));
    assert!(lines.iter().any(|line| line.ends_with("err-line")));
}

#[test]
fn timeout_kills_long_running_scripts() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let slow = write_script(&suite, "slow.sh", "sleep 10");

    let output = temp.path().join("results");
    let mut options = options(&output);
    options.timeout_secs = 1;
    let units = vec![single(slow, &options)];
    let counters = execute(options, units);

    assert_eq!(counters.total, 1);
    assert_eq!(counters.killed, 1);
    assert_eq!(counters.exit_code(), exit_code::TESTS_FAILED);

    let log = std::fs::read_to_string(run_dir(&output).join("log")).unwrap();
    assert!(log.contains("[KILLED]"), "killed line present in:\n{log}");
}

#[test]
fn failed_setup_skips_the_body() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let setup = write_script(&suite, "setup.sh", "exit 1");
    let body = write_script(&suite, "check.sh", "exit 0");

    let output = temp.path().join("results");
    let mut options = options(&output);
    options.setup = Some(setup);
    let units = vec![single(body, &options)];
    let counters = execute(options, units);

    // The setup failure is recorded and the body is never invoked.
    assert_eq!(counters.total, 2);
    assert_eq!(counters.fail, 1);
    assert_eq!(counters.skip, 1);
    assert_eq!(counters.pass, 0);
    assert_eq!(counters.exit_code(), exit_code::TESTS_FAILED);
}

#[test]
fn groups_run_members_with_shared_setup_and_teardown() {
    let temp = Utf8TempDir::new().unwrap();
    let group_dir = temp.path().join("group");
    std::fs::create_dir(&group_dir).unwrap();
    write_script(&group_dir, "first.sh", "echo first");
    write_script(&group_dir, "second.sh", "echo second");
    write_script(&group_dir, "setup.sh", "exit 0");
    write_script(&group_dir, "teardown.sh", "exit 0");

    let output = temp.path().join("results");
    let options = options(&output);
    let mut spec = TestSpec::from_options(group_dir, &options);
    // Relative auxiliary scripts resolve against the group directory, and
    // member names probe the script suffixes.
    spec.setup = Some("setup".into());
    spec.teardown = Some("teardown".into());
    let units = vec![TestUnit::Group(TestGroup {
        spec,
        members: vec!["first".to_owned(), "second".to_owned()],
    })];
    let counters = execute(options, units);

    assert_eq!(counters.total, 4);
    assert_eq!(counters.pass, 4);
    assert_eq!(counters.exit_code(), exit_code::ALL_PASSED);

    let run_dir = run_dir(&output);
    let first = std::fs::read_to_string(run_dir.join("group/first.sh/stdout")).unwrap();
    assert_eq!(first, "first\n");
    let second = std::fs::read_to_string(run_dir.join("group/second.sh/stdout")).unwrap();
    assert_eq!(second, "second\n");
}

#[test]
fn failed_group_setup_skips_every_member() {
    let temp = Utf8TempDir::new().unwrap();
    let group_dir = temp.path().join("group");
    std::fs::create_dir(&group_dir).unwrap();
    write_script(&group_dir, "first.sh", "echo first");
    write_script(&group_dir, "second.sh", "echo second");
    write_script(&group_dir, "setup.sh", "exit 1");

    let output = temp.path().join("results");
    let options = options(&output);
    let mut spec = TestSpec::from_options(group_dir, &options);
    spec.setup = Some("setup".into());
    let units = vec![TestUnit::Group(TestGroup {
        spec,
        members: vec!["first".to_owned(), "second".to_owned()],
    })];
    let counters = execute(options, units);

    assert_eq!(counters.total, 3);
    assert_eq!(counters.fail, 1);
    assert_eq!(counters.skip, 2);
    assert_eq!(counters.exit_code(), exit_code::TESTS_FAILED);
}

#[test]
fn unselected_groups_do_not_run() {
    let temp = Utf8TempDir::new().unwrap();
    let group_dir = temp.path().join("group");
    std::fs::create_dir(&group_dir).unwrap();
    write_script(&group_dir, "first.sh", "echo first");

    let output = temp.path().join("results");
    let mut options = options(&output);
    options.tags = vec!["perf".to_owned()];
    let mut spec = TestSpec::from_options(group_dir, &options);
    spec.tags = vec!["functional".to_owned()];
    let units = vec![TestUnit::Group(TestGroup {
        spec,
        members: vec!["first".to_owned()],
    })];
    let counters = execute(options, units);

    assert_eq!(counters.total, 0);
    assert_eq!(counters.exit_code(), exit_code::NO_TESTS_RUN);
}

#[test]
fn dry_run_executes_nothing() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let pass = write_script(&suite, "pass.sh", "exit 0");

    let output = temp.path().join("results");
    let mut options = options(&output);
    options.dry_run = true;
    let units = vec![single(pass, &options)];
    let counters = execute(options, units);

    assert_eq!(counters.total, 0);
    assert_eq!(counters.exit_code(), exit_code::NO_TESTS_RUN);
    // No run directory is created in dry-run mode.
    assert!(!output.exists());
}

#[test]
fn unverifiable_tests_are_excluded() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let pass = write_script(&suite, "pass.sh", "exit 0");
    let missing = suite.join("missing.sh");

    let output = temp.path().join("results");
    let options = options(&output);
    let units = vec![single(missing, &options), single(pass, &options)];
    let counters = execute(options, units);

    assert_eq!(counters.total, 1);
    assert_eq!(counters.pass, 1);
    assert_eq!(counters.exit_code(), exit_code::ALL_PASSED);
}

#[test]
fn iterations_repeat_the_whole_set() {
    let temp = Utf8TempDir::new().unwrap();
    let suite = temp.path().join("suite");
    std::fs::create_dir(&suite).unwrap();
    let pass = write_script(&suite, "pass.sh", "exit 0");

    let output = temp.path().join("results");
    let mut options = options(&output);
    options.iterations = 2;
    let units = vec![single(pass, &options)];
    let counters = execute(options, units);

    assert_eq!(counters.total, 2);
    assert_eq!(counters.pass, 2);
    assert_eq!(counters.exit_code(), exit_code::ALL_PASSED);
}
