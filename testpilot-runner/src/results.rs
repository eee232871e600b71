// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outcome classification and run-level aggregation.

use crate::output::CapturedLine;
use chrono::{DateTime, Local};
use std::{fmt, time::Duration};

/// The exit code by which a script reports that it does not apply to the
/// current host.
pub const SKIP_EXIT_CODE: i32 = 4;

/// The outcome of a single finalized attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Outcome {
    /// The script exited 0.
    Pass,

    /// The script exited with [`SKIP_EXIT_CODE`], or was never invoked
    /// because its setup script did not pass.
    Skip,

    /// The script exited with any other code, or died to a signal the
    /// supervisor did not send.
    Fail,

    /// The supervisor killed the script, either at the timeout or on an
    /// external interrupt.
    Killed,
}

impl Outcome {
    /// Classifies an attempt from its raw exit code and whether the
    /// supervisor killed it.
    ///
    /// A kill always wins over whatever status the child manages to exit
    /// with.
    pub fn classify(exit_code: Option<i32>, killed: bool) -> Self {
        if killed {
            Self::Killed
        } else {
            match exit_code {
                Some(0) => Self::Pass,
                Some(SKIP_EXIT_CODE) => Self::Skip,
                _ => Self::Fail,
            }
        }
    }

    /// Whether this outcome is a pass.
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.pad("PASS"),
            Self::Skip => f.pad("SKIP"),
            Self::Fail => f.pad("FAIL"),
            Self::Killed => f.pad("KILLED"),
        }
    }
}

/// A finalized attempt: everything the reporter and the counters need.
#[derive(Clone, Debug)]
pub struct AttemptResult {
    /// Wall-clock time at which the attempt started.
    pub start_time: DateTime<Local>,

    /// Monotonic elapsed time of the attempt.
    pub duration: Duration,

    /// The raw exit code, or `None` if the child died to a signal.
    pub exit_code: Option<i32>,

    /// The classified outcome.
    pub outcome: Outcome,

    /// Captured standard output lines, in arrival order.
    pub stdout: Vec<CapturedLine>,

    /// Captured standard error lines, in arrival order.
    pub stderr: Vec<CapturedLine>,

    /// Whether the supervisor killed the child.
    pub killed: bool,

    /// Whether this attempt is the rerun of one whose timeout fired early
    /// relative to the monotonic clock.
    pub reran: bool,
}

impl AttemptResult {
    /// An attempt that was never invoked: members gated by a failed group
    /// setup, and bodies gated by a failed setup script.
    pub fn skipped() -> Self {
        Self {
            start_time: Local::now(),
            duration: Duration::ZERO,
            exit_code: Some(SKIP_EXIT_CODE),
            outcome: Outcome::Skip,
            stdout: Vec::new(),
            stderr: Vec::new(),
            killed: false,
            reran: false,
        }
    }

    /// Elapsed runtime formatted as `mm:ss`.
    pub fn runtime(&self) -> String {
        let secs = self.duration.as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

/// Aggregate counters for a run.
///
/// Counters only ever go up, and each finalized attempt bumps exactly one
/// outcome counter plus the total.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RunCounters {
    /// Finalized attempts.
    pub total: usize,

    /// Attempts that passed.
    pub pass: usize,

    /// Attempts that failed.
    pub fail: usize,

    /// Attempts that were skipped.
    pub skip: usize,

    /// Attempts that were killed.
    pub killed: usize,

    /// Attempts that were reruns.
    pub reran: usize,
}

impl RunCounters {
    /// Records one finalized attempt.
    pub fn record(&mut self, result: &AttemptResult) {
        self.total += 1;
        match result.outcome {
            Outcome::Pass => self.pass += 1,
            Outcome::Fail => self.fail += 1,
            Outcome::Skip => self.skip += 1,
            Outcome::Killed => self.killed += 1,
        }
        if result.reran {
            self.reran += 1;
        }
    }

    /// The percentage of attempts that passed. Skipped attempts count in the
    /// denominator only.
    pub fn percent_passed(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.pass as f64 * 100.0 / self.total as f64
        }
    }

    /// The whole-run exit code this tally maps to.
    pub fn exit_code(&self) -> i32 {
        if self.total == 0 {
            exit_code::NO_TESTS_RUN
        } else if self.fail > 0 || self.killed > 0 {
            exit_code::TESTS_FAILED
        } else if self.reran > 0 {
            exit_code::RERUN_OCCURRED
        } else {
            exit_code::ALL_PASSED
        }
    }
}

/// Process exit codes for the `testpilot` binary.
pub mod exit_code {
    /// Every attempt passed or skipped.
    pub const ALL_PASSED: i32 = 0;

    /// At least one attempt failed or was killed.
    pub const TESTS_FAILED: i32 = 1;

    /// No attempts were finalized.
    pub const NO_TESTS_RUN: i32 = 2;

    /// Nothing failed, but at least one attempt was rerun after a suspect
    /// timeout.
    pub const RERUN_OCCURRED: i32 = 3;

    /// Configuration or run setup failed before any test executed.
    pub const SETUP_ERROR: i32 = 96;

    /// Spawning or supervising a child process failed mid-run.
    pub const EXECUTION_ERROR: i32 = 97;

    /// The run was interrupted by an external signal.
    pub const INTERRUPTED: i32 = 98;
}
