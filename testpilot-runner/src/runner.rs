// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run coordination.
//!
//! A [`TestRun`] owns the verified units and drives the whole run: it
//! assigns collision-free output directories, creates the timestamped run
//! directory and the `current` symlink, executes the configured number of
//! iterations with singles before groups in path order, and aggregates the
//! counters the final exit code is derived from.

use crate::{
    config::RunOptions,
    errors::{ExecutionError, LogSetupError, RunError},
    executor::{AttemptOutput, ScriptCommand},
    list::{TestGroup, TestSpec, TestUnit, UserVerifier},
    reporter::{Logger, write_artifacts},
    results::{AttemptResult, RunCounters},
    signal::{SignalHandler, SignalHandlerKind},
    stopwatch::stopwatch,
};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::collections::BTreeSet;
use tracing::debug;

/// Directory name format for one run, e.g. `20260806T143015`.
const RUN_DIR_FORMAT: &str = "%Y%m%dT%H%M%S";

/// One configured run: options plus the units to execute.
#[derive(Debug)]
pub struct TestRun {
    options: RunOptions,
    tests: Vec<TestSpec>,
    groups: Vec<TestGroup>,
    logger: Logger,
    signal_kind: SignalHandlerKind,
}

impl TestRun {
    /// Builds a run over `units` with the given defaults.
    pub fn new(options: RunOptions, units: Vec<TestUnit>, signal_kind: SignalHandlerKind) -> Self {
        let logger = Logger::new(options.quiet);
        let mut tests = Vec::new();
        let mut groups = Vec::new();
        for unit in units {
            match unit {
                TestUnit::Single(spec) => tests.push(spec),
                TestUnit::Group(group) => groups.push(group),
            }
        }
        Self {
            options,
            tests,
            groups,
            logger,
            signal_kind,
        }
    }

    /// Executes the run to completion and returns the final counters.
    ///
    /// The caller derives the process exit code from the counters on
    /// success, and from [`RunError::exit_code`] on failure.
    pub fn execute(self) -> Result<RunCounters, RunError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(ExecutionError::Runtime)?;
        runtime.block_on(self.execute_inner())
    }

    async fn execute_inner(self) -> Result<RunCounters, RunError> {
        let Self {
            options,
            mut tests,
            mut groups,
            mut logger,
            signal_kind,
        } = self;

        let mut users = UserVerifier::default();
        tests.retain_mut(|test| test.verify(&mut users, &mut logger));
        groups.retain_mut(|group| group.verify(&mut users, &mut logger));

        tests.sort_by(|a, b| a.pathname.cmp(&b.pathname));
        groups.sort_by(|a, b| a.spec.pathname.cmp(&b.spec.pathname));

        let run_dir = options
            .output_dir
            .join(Local::now().format(RUN_DIR_FORMAT).to_string());
        if !options.dry_run {
            create_run_dir(&run_dir, &mut logger)?;
            logger.attach_log_file(&run_dir)?;
        }
        complete_output_dirs(&mut tests, &mut groups, &run_dir);

        let mut signal = signal_kind.build()?;
        let invoking_user =
            whoami::username().unwrap_or_else(|_| String::from("unknown"));

        let start = stopwatch();
        let mut counters = RunCounters::default();
        let result = run_units(
            options.iterations,
            &tests,
            &groups,
            &mut RunContext {
                tags: &options.tags,
                dry_run: options.dry_run,
                invoking_user: &invoking_user,
                logger: &mut logger,
                counters: &mut counters,
                signal: &mut signal,
            },
        )
        .await;

        // An interrupted run still gets the partial summary; other fatal
        // errors leave the diagnostic to the caller.
        match &result {
            Ok(()) | Err(RunError::Interrupted) => {
                logger.summary(&counters, start.elapsed(), &run_dir);
            }
            Err(_) => {}
        }
        result.map(|()| counters)
    }
}

async fn run_units(
    iterations: u64,
    tests: &[TestSpec],
    groups: &[TestGroup],
    cx: &mut RunContext<'_>,
) -> Result<(), RunError> {
    for iteration in 0..iterations {
        if iterations > 1 {
            debug!(iteration = iteration + 1, "starting iteration");
        }
        for test in tests {
            test.run(cx).await?;
        }
        for group in groups {
            group.run(cx).await?;
        }
    }
    Ok(())
}

/// Mutable state shared by every unit in a run.
///
/// Single ownership of the logger, the counters, and the signal handler
/// flows through here, so each finalized attempt is recorded exactly once.
pub(crate) struct RunContext<'a> {
    /// The caller's tag selection.
    pub(crate) tags: &'a [String],
    dry_run: bool,
    invoking_user: &'a str,
    logger: &'a mut Logger,
    counters: &'a mut RunCounters,
    signal: &'a mut SignalHandler,
}

impl RunContext<'_> {
    /// Runs one supervised command, or describes it in dry-run mode.
    ///
    /// Returns the finalized result, or `None` when nothing was executed.
    /// An external interrupt records the killed attempt and then unwinds
    /// with [`RunError::Interrupted`].
    pub(crate) async fn run_command(
        &mut self,
        cmd: &ScriptCommand,
    ) -> Result<Option<AttemptResult>, RunError> {
        if self.dry_run {
            print!("{cmd}");
            return Ok(None);
        }

        match cmd.run(self.invoking_user, self.signal).await? {
            AttemptOutput::Final(result) => {
                self.finalize(cmd, &result)?;
                Ok(Some(result))
            }
            AttemptOutput::Interrupted(result) => {
                self.finalize(cmd, &result)?;
                Err(RunError::Interrupted)
            }
        }
    }

    /// Records a command that is skipped without being invoked.
    pub(crate) fn skip_command(&mut self, cmd: &ScriptCommand) -> Result<(), RunError> {
        let result = AttemptResult::skipped();
        self.finalize(cmd, &result)
    }

    fn finalize(&mut self, cmd: &ScriptCommand, result: &AttemptResult) -> Result<(), RunError> {
        self.counters.record(result);
        self.logger
            .report_result(cmd, self.invoking_user, result)?;
        write_artifacts(&cmd.output_dir, result)?;
        Ok(())
    }
}

fn create_run_dir(run_dir: &Utf8Path, logger: &mut Logger) -> Result<(), LogSetupError> {
    std::fs::create_dir_all(run_dir).map_err(|error| LogSetupError::CreateDir {
        path: run_dir.to_owned(),
        error,
    })?;
    update_current_symlink(run_dir, logger);
    Ok(())
}

/// Points `<base>/current` at the new run directory. A stale symlink is
/// replaced; anything else at that name is left alone with a warning.
#[cfg(unix)]
fn update_current_symlink(run_dir: &Utf8Path, logger: &mut Logger) {
    let Some(base) = run_dir.parent() else {
        return;
    };
    let link = base.join("current");
    match link.symlink_metadata() {
        Ok(metadata) if metadata.is_symlink() => {
            let _ = std::fs::remove_file(&link);
        }
        Ok(_) => {
            logger.warning(&format!(
                "`{link}` exists and is not a symlink, not updating it"
            ));
            return;
        }
        Err(_) => {}
    }
    if let Err(error) = std::os::unix::fs::symlink(run_dir, &link) {
        logger.warning(&format!("failed to update `{link}`: {error}"));
    }
}

#[cfg(not(unix))]
fn update_current_symlink(_run_dir: &Utf8Path, _logger: &mut Logger) {}

/// Assigns every unit an output directory unique within the run.
///
/// Starting from the last path component, the suffix grows one component to
/// the left until no two units share it; each unit then gets
/// `<run dir>/<suffix>`. Unit paths themselves are unique, so the walk
/// terminates by the time whole paths are in play.
fn complete_output_dirs(tests: &mut [TestSpec], groups: &mut [TestGroup], run_dir: &Utf8Path) {
    let paths: Vec<Utf8PathBuf> = tests
        .iter()
        .map(|test| test.pathname.clone())
        .chain(groups.iter().map(|group| group.spec.pathname.clone()))
        .collect();
    let max_depth = paths
        .iter()
        .map(|path| normal_components(path).count())
        .max()
        .unwrap_or(1);

    let mut depth = 1;
    let suffixes = loop {
        let suffixes: Vec<Utf8PathBuf> =
            paths.iter().map(|path| path_suffix(path, depth)).collect();
        let unique: BTreeSet<_> = suffixes.iter().collect();
        if unique.len() == suffixes.len() || depth >= max_depth {
            break suffixes;
        }
        depth += 1;
    };

    let mut suffixes = suffixes.into_iter();
    for test in tests.iter_mut() {
        let suffix = suffixes.next().expect("one suffix per unit");
        test.output_dir = run_dir.join(suffix);
    }
    for group in groups.iter_mut() {
        let suffix = suffixes.next().expect("one suffix per unit");
        group.spec.output_dir = run_dir.join(suffix);
    }
}

/// The last `depth` normal components of `path`, joined without a leading
/// separator.
fn path_suffix(path: &Utf8Path, depth: usize) -> Utf8PathBuf {
    let components: Vec<&str> = normal_components(path).collect();
    let start = components.len().saturating_sub(depth);
    components[start..].iter().copied().collect()
}

fn normal_components(path: &Utf8Path) -> impl Iterator<Item = &str> {
    path.components().filter_map(|component| match component {
        Utf8Component::Normal(name) => Some(name),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(pathname: &str) -> TestSpec {
        TestSpec::from_options(pathname.into(), &RunOptions::default())
    }

    #[test]
    fn suffixes_walk_right_to_left() {
        let path = Utf8Path::new("/opt/suite/dir/check");
        assert_eq!(path_suffix(path, 1), Utf8Path::new("check"));
        assert_eq!(path_suffix(path, 2), Utf8Path::new("dir/check"));
        // Depth past the root yields the whole path, rootless.
        assert_eq!(path_suffix(path, 10), Utf8Path::new("opt/suite/dir/check"));
    }

    #[test]
    fn output_dirs_use_the_shortest_unique_suffix() {
        let mut tests = vec![spec("/a/x/check"), spec("/b/x/check")];
        let mut groups = vec![TestGroup {
            spec: spec("/opt/suite/group"),
            members: vec!["first".to_owned()],
        }];

        complete_output_dirs(&mut tests, &mut groups, Utf8Path::new("/var/tmp/run"));

        // `check` and `x/check` both collide; three components are unique.
        assert_eq!(tests[0].output_dir, "/var/tmp/run/a/x/check");
        assert_eq!(tests[1].output_dir, "/var/tmp/run/b/x/check");
        assert_eq!(groups[0].spec.output_dir, "/var/tmp/run/opt/suite/group");
    }

    #[test]
    fn distinct_basenames_stay_shallow() {
        let mut tests = vec![spec("/opt/suite/first"), spec("/opt/suite/second")];
        let mut groups = Vec::new();

        complete_output_dirs(&mut tests, &mut groups, Utf8Path::new("/var/tmp/run"));

        assert_eq!(tests[0].output_dir, "/var/tmp/run/first");
        assert_eq!(tests[1].output_dir, "/var/tmp/run/second");
    }
}
