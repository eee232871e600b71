// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test units: single scripts and script groups.
//!
//! A unit enters the runnable set only after verification: its scripts must
//! resolve to executable regular files (probing the `.ksh` and `.sh`
//! suffixes when the bare path does not match), and every requested run-as
//! identity must exist and be reachable through passwordless sudo. Every
//! exclusion is reported, never silent.

use crate::{
    config::RunOptions,
    errors::RunError,
    executor::ScriptCommand,
    reporter::Logger,
    runner::RunContext,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{collections::BTreeSet, process::Stdio};
use tracing::debug;

/// Suffixes probed, in priority order, when a pathname does not name an
/// executable regular file directly.
const SCRIPT_SUFFIXES: &[&str] = &["", ".ksh", ".sh"];

/// Descriptor shared by single tests and groups. Immutable once verified.
#[derive(Clone, Debug)]
pub struct TestSpec {
    /// The test script, or the group directory.
    pub pathname: Utf8PathBuf,

    /// Where this unit's artifacts go. Assigned by the coordinator before
    /// the run starts.
    pub output_dir: Utf8PathBuf,

    /// Seconds a script may run before it is killed. Zero means no limit.
    pub timeout_secs: u64,

    /// Identity to run the body as.
    pub user: Option<String>,

    /// Setup script gating the body.
    pub setup: Option<Utf8PathBuf>,

    /// Identity to run the setup script as.
    pub setup_user: Option<String>,

    /// Teardown script, always attempted after the body.
    pub teardown: Option<Utf8PathBuf>,

    /// Identity to run the teardown script as.
    pub teardown_user: Option<String>,

    /// Tags this unit is selected by.
    pub tags: Vec<String>,
}

impl TestSpec {
    /// A spec for `pathname` taking every option from `options`.
    pub fn from_options(pathname: Utf8PathBuf, options: &RunOptions) -> Self {
        Self {
            pathname,
            output_dir: Utf8PathBuf::new(),
            timeout_secs: options.timeout_secs,
            user: options.user.clone(),
            setup: options.setup.clone(),
            setup_user: options.setup_user.clone(),
            teardown: options.teardown.clone(),
            teardown_user: options.teardown_user.clone(),
            tags: Vec::new(),
        }
    }

    pub(crate) fn verify(&mut self, users: &mut UserVerifier, logger: &mut Logger) -> bool {
        let mut ok = resolve_in_place(&mut self.pathname, logger);
        if let Some(setup) = &mut self.setup {
            ok &= resolve_in_place(setup, logger);
        }
        if let Some(teardown) = &mut self.teardown {
            ok &= resolve_in_place(teardown, logger);
        }
        ok &= self.verify_users(users, logger);
        if !ok {
            logger.warning(&format!(
                "test `{}` failed verification, excluding it from the run",
                self.pathname
            ));
        }
        ok
    }

    fn verify_users(&self, users: &mut UserVerifier, logger: &mut Logger) -> bool {
        let mut ok = true;
        for user in [&self.user, &self.setup_user, &self.teardown_user]
            .into_iter()
            .flatten()
        {
            ok &= users.verify(user, logger);
        }
        ok
    }

    pub(crate) async fn run(&self, cx: &mut RunContext<'_>) -> Result<(), RunError> {
        let proceed = match &self.setup {
            Some(setup) => {
                let result = cx
                    .run_command(&self.aux_command(setup, self.setup_user.clone()))
                    .await?;
                result.is_none_or(|result| result.outcome.is_pass())
            }
            None => true,
        };

        let body = self.command();
        if proceed {
            cx.run_command(&body).await?;
        } else {
            debug!(pathname = %self.pathname, "setup did not pass, skipping body");
            cx.skip_command(&body)?;
        }

        // Teardown runs regardless of how the body went; its outcome is
        // recorded but never rewrites the body's.
        if let Some(teardown) = &self.teardown {
            cx.run_command(&self.aux_command(teardown, self.teardown_user.clone()))
                .await?;
        }
        Ok(())
    }

    fn command(&self) -> ScriptCommand {
        ScriptCommand {
            pathname: self.pathname.clone(),
            output_dir: self.output_dir.clone(),
            timeout_secs: self.timeout_secs,
            user: self.user.clone(),
        }
    }

    fn aux_command(&self, script: &Utf8Path, user: Option<String>) -> ScriptCommand {
        let name = script.file_name().expect("verified scripts have a file name");
        ScriptCommand {
            pathname: script.to_owned(),
            output_dir: self.output_dir.join(name),
            timeout_secs: self.timeout_secs,
            user,
        }
    }
}

/// A group of scripts sharing a directory, setup, and teardown.
#[derive(Clone, Debug)]
pub struct TestGroup {
    /// The group descriptor. Its `pathname` is the group directory.
    pub spec: TestSpec,

    /// Member file names relative to the group directory, in run order.
    pub members: Vec<String>,
}

impl TestGroup {
    pub(crate) fn verify(&mut self, users: &mut UserVerifier, logger: &mut Logger) -> bool {
        let dir = self.spec.pathname.clone();
        if !dir.is_dir() {
            logger.warning(&format!("group `{dir}` is not a directory, excluding it"));
            return false;
        }

        let mut ok = resolve_aux(&dir, &mut self.spec.setup, logger);
        ok &= resolve_aux(&dir, &mut self.spec.teardown, logger);
        ok &= self.spec.verify_users(users, logger);
        if !ok {
            logger.warning(&format!(
                "group `{dir}` failed verification, excluding it from the run"
            ));
            return false;
        }

        let mut members = Vec::with_capacity(self.members.len());
        for name in self.members.drain(..) {
            match resolve_executable(&dir.join(&name)) {
                Some(resolved) => {
                    let resolved = resolved
                        .file_name()
                        .expect("resolved scripts have a file name");
                    members.push(resolved.to_owned());
                }
                None => logger.warning(&format!(
                    "group `{dir}`: dropping `{name}`, not an executable script"
                )),
            }
        }
        if members.is_empty() {
            logger.warning(&format!("group `{dir}` has no runnable members, excluding it"));
            return false;
        }
        self.members = members;
        true
    }

    pub(crate) async fn run(&self, cx: &mut RunContext<'_>) -> Result<(), RunError> {
        if !tags_match(cx.tags, &self.spec.tags) {
            debug!(pathname = %self.spec.pathname, "tags do not match the selection, skipping group");
            return Ok(());
        }

        let proceed = match &self.spec.setup {
            Some(setup) => {
                let result = cx
                    .run_command(&self.spec.aux_command(setup, self.spec.setup_user.clone()))
                    .await?;
                result.is_none_or(|result| result.outcome.is_pass())
            }
            None => true,
        };

        for member in &self.members {
            let cmd = ScriptCommand {
                pathname: self.spec.pathname.join(member),
                output_dir: self.spec.output_dir.join(member),
                timeout_secs: self.spec.timeout_secs,
                user: self.spec.user.clone(),
            };
            if proceed {
                cx.run_command(&cmd).await?;
            } else {
                cx.skip_command(&cmd)?;
            }
        }

        if let Some(teardown) = &self.spec.teardown {
            cx.run_command(&self.spec.aux_command(teardown, self.spec.teardown_user.clone()))
                .await?;
        }
        Ok(())
    }
}

/// A runnable unit: one script, or one group of scripts.
///
/// Groups are plain composition over [`TestSpec`]: a group holds member file
/// names and materializes one supervised command per member.
#[derive(Clone, Debug)]
pub enum TestUnit {
    /// A single test script.
    Single(TestSpec),

    /// A directory of test scripts run as a unit.
    Group(TestGroup),
}

/// Whether a unit tagged `unit_tags` is selected. An empty selection selects
/// everything; otherwise the unit needs at least one selected tag.
pub(crate) fn tags_match(selected: &[String], unit_tags: &[String]) -> bool {
    selected.is_empty() || unit_tags.iter().any(|tag| selected.contains(tag))
}

/// Resolves `pathname` to an executable regular file, probing the script
/// suffixes in priority order.
pub fn resolve_executable(pathname: &Utf8Path) -> Option<Utf8PathBuf> {
    SCRIPT_SUFFIXES.iter().find_map(|suffix| {
        let candidate = Utf8PathBuf::from(format!("{pathname}{suffix}"));
        is_executable_file(&candidate).then_some(candidate)
    })
}

/// Whether `path` names an executable regular file. Directories and symlinks
/// do not qualify.
#[cfg(unix)]
pub fn is_executable_file(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let Ok(metadata) = path.symlink_metadata() else {
        return false;
    };
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

/// Whether `path` names a regular file. Directories and symlinks do not
/// qualify.
#[cfg(not(unix))]
pub fn is_executable_file(path: &Utf8Path) -> bool {
    path.symlink_metadata().is_ok_and(|metadata| metadata.is_file())
}

fn resolve_in_place(path: &mut Utf8PathBuf, logger: &mut Logger) -> bool {
    match resolve_executable(path) {
        Some(resolved) => {
            *path = resolved;
            true
        }
        None => {
            logger.warning(&format!("no executable script at `{path}`"));
            false
        }
    }
}

/// Resolves a group auxiliary script. Relative paths resolve against the
/// group directory, and the script must live directly inside it.
fn resolve_aux(group_dir: &Utf8Path, aux: &mut Option<Utf8PathBuf>, logger: &mut Logger) -> bool {
    let Some(path) = aux else {
        return true;
    };
    let candidate = if path.is_relative() {
        group_dir.join(&path)
    } else {
        path.clone()
    };
    if candidate.parent() != Some(group_dir) {
        logger.warning(&format!(
            "auxiliary script `{path}` is not in group directory `{group_dir}`"
        ));
        return false;
    }
    match resolve_executable(&candidate) {
        Some(resolved) => {
            *aux = Some(resolved);
            true
        }
        None => {
            logger.warning(&format!("no executable script at `{candidate}`"));
            false
        }
    }
}

/// Verifies run-as identities: the user must exist and passwordless sudo to
/// it must work. Verified names are memoized for the rest of the run.
#[derive(Debug, Default)]
pub(crate) struct UserVerifier {
    verified: BTreeSet<String>,
}

impl UserVerifier {
    pub(crate) fn verify(&mut self, user: &str, logger: &mut Logger) -> bool {
        if self.verified.contains(user) {
            return true;
        }
        if !user_exists(user) {
            logger.warning(&format!("user `{user}` does not exist"));
            return false;
        }
        if !can_elevate(user) {
            logger.warning(&format!("passwordless sudo to user `{user}` failed"));
            return false;
        }
        debug!(user, "identity verified");
        self.verified.insert(user.to_owned());
        true
    }
}

fn user_exists(user: &str) -> bool {
    probe(std::process::Command::new("id").arg("-u").arg(user))
}

fn can_elevate(user: &str) -> bool {
    probe(std::process::Command::new("sudo").args(["-n", "-u", user, "true"]))
}

fn probe(cmd: &mut std::process::Command) -> bool {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    #[cfg(unix)]
    fn touch_script(dir: &Utf8Path, name: &str, mode: u32) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn resolve_probes_suffixes_in_order() {
        let temp = Utf8TempDir::new().unwrap();
        let dir = temp.path();

        touch_script(dir, "suffixed.ksh", 0o755);
        assert_eq!(
            resolve_executable(&dir.join("suffixed")),
            Some(dir.join("suffixed.ksh"))
        );

        // The bare path wins over suffixed variants.
        touch_script(dir, "both", 0o755);
        touch_script(dir, "both.ksh", 0o755);
        touch_script(dir, "both.sh", 0o755);
        assert_eq!(resolve_executable(&dir.join("both")), Some(dir.join("both")));

        // `.ksh` wins over `.sh`.
        touch_script(dir, "shell.ksh", 0o755);
        touch_script(dir, "shell.sh", 0o755);
        assert_eq!(
            resolve_executable(&dir.join("shell")),
            Some(dir.join("shell.ksh"))
        );

        touch_script(dir, "noexec", 0o644);
        assert_eq!(resolve_executable(&dir.join("noexec")), None);
        assert_eq!(resolve_executable(&dir.join("missing")), None);
    }

    #[cfg(unix)]
    #[test]
    fn executable_check_rejects_dirs_and_symlinks() {
        let temp = Utf8TempDir::new().unwrap();
        let dir = temp.path();

        assert!(!is_executable_file(dir));

        let target = touch_script(dir, "target", 0o755);
        assert!(is_executable_file(&target));

        let link = dir.join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(!is_executable_file(&link));
    }

    #[test]
    fn tag_selection() {
        let functional = vec!["functional".to_owned()];
        let perf = vec!["perf".to_owned()];
        let both = vec!["functional".to_owned(), "perf".to_owned()];

        // No selection runs everything.
        assert!(tags_match(&[], &functional));
        assert!(tags_match(&[], &[]));

        assert!(tags_match(&functional, &functional));
        assert!(tags_match(&functional, &both));
        assert!(!tags_match(&functional, &perf));
        // A selection never matches an untagged unit.
        assert!(!tags_match(&functional, &[]));
    }
}
