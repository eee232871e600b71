// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Console and log-file reporting.
//!
//! Result lines are fixed-width: the test description on the left, the
//! runtime and outcome right-aligned at column 80. Every line goes to the
//! run log; the console additionally gets it unless quiet mode suppresses
//! passing lines. Captured child output is written to the log and to
//! per-test artifact files, never to the console.

use crate::{
    errors::{LogSetupError, ReportError},
    executor::ScriptCommand,
    output::{CapturedLine, merge_by_timestamp},
    results::{AttemptResult, RunCounters},
};
use camino::Utf8Path;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    time::Duration,
};

/// Width result lines are padded to.
const LINE_WIDTH: usize = 80;

/// Sink for result lines, warnings, and the end-of-run summary.
///
/// The logger starts console-only; [`Logger::attach_log_file`] adds the run
/// log once the run directory exists. Log-file writes after that point are
/// best effort so a full disk cannot take down a run mid-flight.
#[derive(Debug)]
pub(crate) struct Logger {
    log_file: Option<File>,
    quiet: bool,
}

impl Logger {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            log_file: None,
            quiet,
        }
    }

    /// Opens `log` inside the run directory and mirrors subsequent lines
    /// into it.
    pub(crate) fn attach_log_file(&mut self, run_dir: &Utf8Path) -> Result<(), LogSetupError> {
        let path = run_dir.join("log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| LogSetupError::OpenLogFile { path, error })?;
        self.log_file = Some(file);
        Ok(())
    }

    /// Prints a warning to standard error and the run log.
    pub(crate) fn warning(&mut self, message: &str) {
        eprintln!("Warning: {message}");
        self.log_line(&format!("Warning: {message}"));
    }

    /// Reports one finalized attempt: the padded result line, then the
    /// timestamp-merged child output into the run log.
    pub(crate) fn report_result(
        &mut self,
        cmd: &ScriptCommand,
        invoking_user: &str,
        result: &AttemptResult,
    ) -> Result<(), ReportError> {
        let line = result_line(cmd, invoking_user, result);
        self.log_line(&line);
        if !(self.quiet && result.outcome.is_pass()) {
            println!("{line}");
        }

        let merged = merge_by_timestamp(result.stdout.clone(), result.stderr.clone());
        if !merged.is_empty() {
            self.log_output(&merged).map_err(ReportError::Log)?;
        }
        Ok(())
    }

    /// Prints the end-of-run summary to the console and the run log. A run
    /// in which nothing was finalized produces no summary.
    pub(crate) fn summary(&mut self, counters: &RunCounters, elapsed: Duration, run_dir: &Utf8Path) {
        if counters.total == 0 {
            return;
        }

        let mut lines = vec![String::new(), "Results Summary".to_owned()];
        for (name, count) in [
            ("PASS", counters.pass),
            ("FAIL", counters.fail),
            ("SKIP", counters.skip),
            ("KILLED", counters.killed),
            ("RERAN", counters.reran),
        ] {
            if count > 0 {
                lines.push(format!("{name}\t{count:>4}"));
            }
        }

        let secs = elapsed.as_secs();
        lines.push(String::new());
        lines.push(format!(
            "Running Time:\t{:02}:{:02}:{:02}",
            secs / 3600,
            secs % 3600 / 60,
            secs % 60
        ));
        lines.push(format!("Percent passed:\t{:.1}%", counters.percent_passed()));
        lines.push(format!("Log directory:\t{run_dir}"));

        for line in &lines {
            println!("{line}");
            self.log_line(line);
        }
    }

    fn log_line(&mut self, line: &str) {
        if let Some(file) = &mut self.log_file {
            // Best effort: losing log lines is better than aborting the run.
            let _ = writeln!(file, "{line}");
        }
    }

    fn log_output(&mut self, merged: &[CapturedLine]) -> std::io::Result<()> {
        let Some(file) = &mut self.log_file else {
            return Ok(());
        };
        writeln!(file)?;
        for line in merged {
            write!(file, "{} ", line.timestamp.format("%H:%M:%S%.3f"))?;
            file.write_all(&line.data)?;
            file.write_all(b"\n")?;
        }
        writeln!(file)?;
        Ok(())
    }
}

/// Writes one attempt's captured output under its output directory:
/// `stdout` and `stderr` hold the raw streams, and `merged` interleaves
/// them with capture timestamps when both are non-empty.
pub(crate) fn write_artifacts(
    output_dir: &Utf8Path,
    result: &AttemptResult,
) -> Result<(), ReportError> {
    let artifacts = |error| ReportError::Artifacts {
        path: output_dir.to_owned(),
        error,
    };
    std::fs::create_dir_all(output_dir).map_err(artifacts)?;

    write_stream(&output_dir.join("stdout"), &result.stdout).map_err(artifacts)?;
    write_stream(&output_dir.join("stderr"), &result.stderr).map_err(artifacts)?;

    if !result.stdout.is_empty() && !result.stderr.is_empty() {
        let merged = merge_by_timestamp(result.stdout.clone(), result.stderr.clone());
        let mut file = File::create(output_dir.join("merged")).map_err(artifacts)?;
        for line in &merged {
            write!(file, "{} ", line.timestamp.format("%H:%M:%S%.3f")).map_err(artifacts)?;
            file.write_all(&line.data).map_err(artifacts)?;
            file.write_all(b"\n").map_err(artifacts)?;
        }
    }
    Ok(())
}

fn write_stream(path: &Utf8Path, lines: &[CapturedLine]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    for line in lines {
        file.write_all(&line.data)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Formats one result line, padded so the runtime and outcome end at column
/// 80.
fn result_line(cmd: &ScriptCommand, invoking_user: &str, result: &AttemptResult) -> String {
    let user = cmd.user.as_deref().unwrap_or(invoking_user);
    let left = format!("Test: {} (run as {user}) ", cmd.pathname);
    let reran = if result.reran { " (RERAN)" } else { "" };
    let right = format!("[{}] [{}]{reran}", result.runtime(), result.outcome);
    let pad = LINE_WIDTH.saturating_sub(left.len() + right.len() + 1);
    format!("{left}{:pad$}{right}", "")
}
