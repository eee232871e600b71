// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervised execution of a single script.
//!
//! One attempt spawns the script in its own process group, then races child
//! I/O, child exit, the watchdog timer, and signal delivery in a select
//! loop. A timed-out child is sent SIGTERM; if the watchdog fired with less
//! monotonic time elapsed than the configured timeout (the host slept
//! mid-attempt), the attempt is discarded and rerun once.

use crate::{
    errors::ExecutionError,
    output::{ChildAccumulator, ChildFds},
    results::{AttemptResult, Outcome},
    signal::SignalHandler,
    stopwatch::stopwatch,
};
use camino::Utf8PathBuf;
use std::{fmt, process::Stdio, time::Duration};
use tracing::debug;

/// One supervised invocation: an executable script, where its artifacts go,
/// a wall-clock timeout, and the identity to run it as.
#[derive(Clone, Debug)]
pub(crate) struct ScriptCommand {
    pub(crate) pathname: Utf8PathBuf,
    pub(crate) output_dir: Utf8PathBuf,
    /// Seconds before the watchdog fires. Zero disables the watchdog.
    pub(crate) timeout_secs: u64,
    pub(crate) user: Option<String>,
}

/// What the supervisor produced for one terminal attempt.
pub(crate) enum AttemptOutput {
    /// The attempt finalized normally.
    Final(AttemptResult),

    /// The attempt was killed by an external shutdown signal. The caller
    /// should report it, then unwind the run.
    Interrupted(AttemptResult),
}

enum AttemptState {
    Terminal(AttemptOutput),
    /// The watchdog fired suspiciously early; the attempt was discarded
    /// without being finalized.
    Superseded,
}

impl ScriptCommand {
    /// Runs the script to completion, enforcing the timeout and applying the
    /// rerun heuristic at most once.
    pub(crate) async fn run(
        &self,
        invoking_user: &str,
        signal: &mut SignalHandler,
    ) -> Result<AttemptOutput, ExecutionError> {
        match self.attempt(invoking_user, signal, false).await? {
            AttemptState::Terminal(output) => Ok(output),
            AttemptState::Superseded => {
                debug!(
                    pathname = %self.pathname,
                    "watchdog fired before the monotonic timeout elapsed, rerunning once"
                );
                match self.attempt(invoking_user, signal, true).await? {
                    AttemptState::Terminal(output) => Ok(output),
                    AttemptState::Superseded => {
                        unreachable!("a rerun attempt is never superseded")
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        invoking_user: &str,
        signal: &mut SignalHandler,
        reran: bool,
    ) -> Result<AttemptState, ExecutionError> {
        let elevated = self.is_elevated(invoking_user);
        let (program, args) = self.argv(elevated);

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Run the child in its own process group so the timeout kill reaches
        // any processes the script spawns.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd: tokio::process::Command = cmd.into();
        let mut child = cmd.spawn().map_err(|error| ExecutionError::Start {
            command: self.pathname.clone(),
            error,
        })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut acc = ChildAccumulator::new(ChildFds::new(stdout, stderr));

        let start = stopwatch();
        let timeout = Duration::from_secs(self.timeout_secs);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        let mut killed = false;
        let mut interrupted = false;
        let mut rerun_requested = false;
        let mut signals_done = false;

        let status = loop {
            tokio::select! {
                res = acc.fill_buf(), if !acc.fds.is_done() => {
                    res.map_err(|error| ExecutionError::Read {
                        command: self.pathname.clone(),
                        error,
                    })?;
                }
                res = child.wait() => {
                    break res.map_err(|error| ExecutionError::Wait {
                        command: self.pathname.clone(),
                        error,
                    })?;
                }
                _ = &mut sleep, if self.timeout_secs > 0
                        && !killed && !rerun_requested && !interrupted => {
                    if should_rerun(reran, start.elapsed(), timeout) {
                        rerun_requested = true;
                    } else {
                        killed = true;
                    }
                    debug!(
                        pathname = %self.pathname,
                        elapsed = ?start.elapsed(),
                        rerun_requested,
                        "timeout expired, killing child"
                    );
                    self.kill_child(&mut child, elevated).await?;
                }
                event = signal.recv(), if !signals_done => {
                    match event {
                        Some(event) => {
                            debug!(
                                ?event,
                                pathname = %self.pathname,
                                "shutdown signal received, killing child"
                            );
                            interrupted = true;
                            killed = true;
                            self.kill_child(&mut child, elevated).await?;
                        }
                        None => signals_done = true,
                    }
                }
            }
        };

        // The child can exit with pipe data still in flight; drain both
        // channels to EOF so exit-time output is never lost.
        while !acc.fds.is_done() {
            acc.fill_buf().await.map_err(|error| ExecutionError::Read {
                command: self.pathname.clone(),
                error,
            })?;
        }

        if rerun_requested && !interrupted {
            return Ok(AttemptState::Superseded);
        }

        let snapshot = start.snapshot();
        let exit_code = status.code();
        let result = AttemptResult {
            start_time: snapshot.start_time,
            duration: snapshot.duration,
            exit_code,
            outcome: Outcome::classify(exit_code, killed),
            stdout: acc.stdout.into_lines(),
            stderr: acc.stderr.into_lines(),
            killed,
            reran,
        };

        if interrupted {
            Ok(AttemptState::Terminal(AttemptOutput::Interrupted(result)))
        } else {
            Ok(AttemptState::Terminal(AttemptOutput::Final(result)))
        }
    }

    fn is_elevated(&self, invoking_user: &str) -> bool {
        self.user.as_deref().is_some_and(|user| user != invoking_user)
    }

    /// The program and arguments to spawn. A run-as identity other than the
    /// invoking user wraps the script in `sudo -E -u USER`.
    fn argv(&self, elevated: bool) -> (String, Vec<String>) {
        if elevated {
            let user = self.user.clone().expect("elevated commands have a user");
            (
                "sudo".to_owned(),
                vec!["-E".to_owned(), "-u".to_owned(), user, self.pathname.to_string()],
            )
        } else {
            (self.pathname.to_string(), Vec::new())
        }
    }

    async fn kill_child(
        &self,
        child: &mut tokio::process::Child,
        elevated: bool,
    ) -> Result<(), ExecutionError> {
        let Some(pid) = child.id() else {
            // The child exited already.
            return Ok(());
        };

        if elevated {
            // Our own signal would be refused by a child running as another
            // user, so relay the kill through sudo.
            let status = tokio::process::Command::new("sudo")
                .args(["kill", "-TERM", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|error| ExecutionError::Kill {
                    command: self.pathname.clone(),
                    error,
                })?;
            if !status.success() {
                debug!(pid, %status, "sudo kill did not succeed");
            }
        } else {
            terminate_group(pid);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    // The child is its own process group leader; signal the whole group.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

/// Decides whether a timed-out attempt should be discarded and rerun.
///
/// The watchdog timer and the monotonic clock can disagree when the host
/// sleeps mid-attempt: the timer fires on resume even though the script got
/// little actual runtime. Best-effort heuristic; an attempt is rerun at most
/// once, and never on an external interrupt.
fn should_rerun(already_reran: bool, elapsed: Duration, timeout: Duration) -> bool {
    !already_reran && elapsed < timeout
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pathname: {}", self.pathname)?;
        writeln!(f, "Outputdir: {}", self.output_dir)?;
        writeln!(f, "Timeout: {}", self.timeout_secs)?;
        writeln!(f, "User: {}", self.user.as_deref().unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn command(user: Option<&str>) -> ScriptCommand {
        ScriptCommand {
            pathname: "/opt/suite/check".into(),
            output_dir: "/var/tmp/test_results/check".into(),
            timeout_secs: 60,
            user: user.map(String::from),
        }
    }

    #[test]
    fn argv_wraps_with_sudo_only_when_elevated() {
        let cmd = command(Some("zfs-tests"));
        assert!(cmd.is_elevated("builder"));
        let (program, args) = cmd.argv(true);
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["-E", "-u", "zfs-tests", "/opt/suite/check"]);

        // Running as the invoking user needs no wrapper.
        let cmd = command(Some("builder"));
        assert!(!cmd.is_elevated("builder"));
        let (program, args) = cmd.argv(false);
        assert_eq!(program, "/opt/suite/check");
        assert!(args.is_empty());

        let cmd = command(None);
        assert!(!cmd.is_elevated("builder"));
    }

    #[test]
    fn rerun_only_on_early_watchdog() {
        let timeout = Duration::from_secs(60);

        // Watchdog fired with the full timeout elapsed: a plain kill.
        assert!(!should_rerun(false, Duration::from_secs(61), timeout));
        assert!(!should_rerun(false, timeout, timeout));

        // Fired early relative to the monotonic clock: rerun once.
        assert!(should_rerun(false, Duration::from_secs(10), timeout));

        // Never rerun a rerun.
        assert!(!should_rerun(true, Duration::from_secs(10), timeout));
    }

    #[test]
    fn display_describes_the_command() {
        let cmd = command(Some("zfs-tests"));
        let description = cmd.to_string();
        assert_eq!(
            description,
            "Pathname: /opt/suite/check\n\
             Outputdir: /var/tmp/test_results/check\n\
             Timeout: 60\n\
             User: zfs-tests\n"
        );
    }
}
