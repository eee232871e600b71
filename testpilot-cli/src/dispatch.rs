// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line parsing and dispatch.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use testpilot_runner::{
    config::{RunFile, RunOptions, UnitOverrides},
    errors::{ConfigError, RunError},
    list::{TestGroup, TestSpec, TestUnit},
    results::exit_code,
    runner::TestRun,
    signal::SignalHandlerKind,
};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

/// Runs test scripts and reports their outcomes.
///
/// Pathnames name single test scripts or directories of them. A script
/// exits 0 to pass, 4 to report it does not apply to this host, and
/// anything else to fail. Alternatively a runfile describes the whole run
/// declaratively.
#[derive(Debug, Parser)]
#[command(name = "testpilot", version)]
pub struct TestPilotApp {
    /// Read the run from this runfile instead of positional pathnames.
    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        conflicts_with_all = ["write_runfile", "pathnames"]
    )]
    runfile: Option<Utf8PathBuf>,

    /// Describe the commands that would run without executing anything.
    #[arg(short = 'd', long)]
    dry_run: bool,

    /// Turn each directory found under the pathnames into a test group.
    #[arg(short = 'g', long)]
    per_dir_groups: bool,

    /// Base directory for run results [default: /var/tmp/test_results].
    #[arg(short = 'o', long, value_name = "DIR")]
    output_dir: Option<Utf8PathBuf>,

    /// Setup script run before each test [default: none].
    #[arg(short = 'p', long, value_name = "SCRIPT")]
    setup: Option<Utf8PathBuf>,

    /// Teardown script run after each test [default: none].
    #[arg(short = 'P', long, value_name = "SCRIPT")]
    teardown: Option<Utf8PathBuf>,

    /// Print only non-passing result lines to the console.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Seconds a script may run before it is killed; 0 disables the limit
    /// [default: 60].
    #[arg(short = 't', long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Identity to run test scripts as [default: the invoking user].
    #[arg(short = 'u', long, value_name = "USER")]
    user: Option<String>,

    /// Write a runfile template for the discovered units and exit.
    #[arg(short = 'w', long, value_name = "FILE")]
    write_runfile: Option<Utf8PathBuf>,

    /// Identity to run setup scripts as.
    #[arg(short = 'x', long, value_name = "USER")]
    setup_user: Option<String>,

    /// Identity to run teardown scripts as.
    #[arg(short = 'X', long, value_name = "USER")]
    teardown_user: Option<String>,

    /// Run only groups tagged with at least one of these tags.
    #[arg(short = 'T', long, value_name = "TAG", value_delimiter = ',')]
    tags: Vec<String>,

    /// Number of times to run the whole set [default: 1].
    #[arg(short = 'I', long, value_name = "N")]
    iterations: Option<u64>,

    /// Test scripts and directories to run.
    #[arg(value_name = "PATHNAME", required_unless_present = "runfile")]
    pathnames: Vec<Utf8PathBuf>,
}

/// A fatal error raised before or during a run.
#[derive(Debug, Error)]
pub enum AppError {
    /// The runfile could not be read or written.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run itself failed.
    #[error(transparent)]
    Run(#[from] RunError),
}

impl AppError {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => exit_code::SETUP_ERROR,
            Self::Run(error) => error.exit_code(),
        }
    }
}

impl TestPilotApp {
    /// Executes the parsed invocation and returns the process exit code.
    pub fn exec(self) -> Result<i32, AppError> {
        let (options, units) = match &self.runfile {
            Some(path) => {
                let runfile = RunFile::load(path)?;
                let options = self.options(runfile.defaults.clone());
                let units = units_from_runfile(&runfile, &options);
                (options, units)
            }
            None => {
                let options = self.options(RunOptions::default());
                let units = self.discover_units(&options);
                (options, units)
            }
        };

        if let Some(path) = &self.write_runfile {
            write_template(path, &options, &units)?;
            return Ok(exit_code::ALL_PASSED);
        }

        let run = TestRun::new(options, units, SignalHandlerKind::Standard);
        let counters = run.execute()?;
        Ok(counters.exit_code())
    }

    /// Applies explicitly given flags on top of `base`. With a runfile, the
    /// base is its `[defaults]` table; otherwise the built-in defaults.
    fn options(&self, base: RunOptions) -> RunOptions {
        RunOptions {
            output_dir: self.output_dir.clone().unwrap_or(base.output_dir),
            quiet: self.quiet || base.quiet,
            timeout_secs: self.timeout.unwrap_or(base.timeout_secs),
            user: self.user.clone().or(base.user),
            setup: self.setup.clone().or(base.setup),
            setup_user: self.setup_user.clone().or(base.setup_user),
            teardown: self.teardown.clone().or(base.teardown),
            teardown_user: self.teardown_user.clone().or(base.teardown_user),
            tags: if self.tags.is_empty() {
                base.tags
            } else {
                self.tags.clone()
            },
            iterations: self.iterations.unwrap_or(base.iterations),
            dry_run: self.dry_run,
        }
    }

    /// Turns the positional pathnames into runnable units. Files become
    /// single tests; directories are walked, yielding either every file as
    /// a single test or one group per directory.
    fn discover_units(&self, options: &RunOptions) -> Vec<TestUnit> {
        let mut units = Vec::new();
        for pathname in &self.pathnames {
            let pathname = absolutize(pathname);
            if pathname.is_dir() {
                if self.per_dir_groups {
                    discover_groups(&pathname, options, &mut units);
                } else {
                    discover_singles(&pathname, options, &mut units);
                }
            } else {
                units.push(TestUnit::Single(TestSpec::from_options(pathname, options)));
            }
        }
        units
    }
}

fn units_from_runfile(runfile: &RunFile, defaults: &RunOptions) -> Vec<TestUnit> {
    runfile
        .sections
        .iter()
        .map(|(pathname, overrides)| {
            let merged = defaults.merged_with(overrides);
            let mut spec = TestSpec::from_options(pathname.into(), &merged);
            spec.tags = overrides.tags.clone().unwrap_or_default();
            match &overrides.tests {
                Some(tests) => TestUnit::Group(TestGroup {
                    spec,
                    members: tests.clone(),
                }),
                None => TestUnit::Single(spec),
            }
        })
        .collect()
}

fn write_template(
    path: &Utf8Path,
    options: &RunOptions,
    units: &[TestUnit],
) -> Result<(), ConfigError> {
    let mut runfile = RunFile::new(options.clone());
    for unit in units {
        match unit {
            TestUnit::Single(spec) => {
                runfile.insert_section(spec.pathname.as_str(), UnitOverrides::default());
            }
            TestUnit::Group(group) => {
                runfile.insert_section(
                    group.spec.pathname.as_str(),
                    UnitOverrides {
                        tests: Some(group.members.clone()),
                        ..UnitOverrides::default()
                    },
                );
            }
        }
    }
    runfile.write(path)
}

fn discover_singles(dir: &Utf8Path, options: &RunOptions, units: &mut Vec<TestUnit>) {
    for entry in sorted_walk(dir) {
        if !entry.file_type().is_file() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) => units.push(TestUnit::Single(TestSpec::from_options(path, options))),
            Err(path) => warn!(path = %path.display(), "skipping non-UTF-8 path"),
        }
    }
}

fn discover_groups(dir: &Utf8Path, options: &RunOptions, units: &mut Vec<TestUnit>) {
    for entry in sorted_walk(dir) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir_path = match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) => path,
            Err(path) => {
                warn!(path = %path.display(), "skipping non-UTF-8 path");
                continue;
            }
        };

        let members: Vec<String> = WalkDir::new(&dir_path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .collect();
        if !members.is_empty() {
            units.push(TestUnit::Group(TestGroup {
                spec: TestSpec::from_options(dir_path, options),
                members,
            }));
        }
    }
}

fn sorted_walk(dir: &Utf8Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%error, "skipping unreadable directory entry");
                None
            }
        })
}

fn absolutize(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        camino::absolute_utf8(path).unwrap_or_else(|_| path.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn runfile_conflicts_with_pathnames_and_templates() {
        let error = TestPilotApp::try_parse_from(["testpilot", "-c", "run.toml", "/opt/suite"])
            .expect_err("runfile plus pathnames is rejected");
        assert_eq!(error.kind(), ErrorKind::ArgumentConflict);

        let error =
            TestPilotApp::try_parse_from(["testpilot", "-c", "run.toml", "-w", "out.toml"])
                .expect_err("runfile plus write-runfile is rejected");
        assert_eq!(error.kind(), ErrorKind::ArgumentConflict);

        let error = TestPilotApp::try_parse_from(["testpilot"])
            .expect_err("some input is required");
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);

        TestPilotApp::try_parse_from(["testpilot", "-c", "run.toml"])
            .expect("a runfile alone is enough");
    }

    #[test]
    fn explicit_flags_override_runfile_defaults() {
        let app = TestPilotApp::try_parse_from([
            "testpilot",
            "-t",
            "30",
            "-q",
            "-c",
            "run.toml",
        ])
        .expect("flags parse");

        let base = RunOptions {
            timeout_secs: 600,
            user: Some("zfs-tests".to_owned()),
            iterations: 3,
            ..RunOptions::default()
        };
        let options = app.options(base);

        assert_eq!(options.timeout_secs, 30);
        assert!(options.quiet);
        // Flags left unset keep the runfile's defaults.
        assert_eq!(options.user.as_deref(), Some("zfs-tests"));
        assert_eq!(options.iterations, 3);
    }

    #[test]
    fn tags_parse_as_a_comma_list() {
        let app = TestPilotApp::try_parse_from([
            "testpilot",
            "-T",
            "functional,perf",
            "/opt/suite",
        ])
        .expect("tags parse");
        let options = app.options(RunOptions::default());
        assert_eq!(options.tags, vec!["functional", "perf"]);
    }
}
