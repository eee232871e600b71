// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run options and the declarative runfile.
//!
//! A runfile is a TOML document with a `[defaults]` table mirroring
//! [`RunOptions`], followed by one table per unit path. Group tables carry a
//! `tests` array naming their members in run order. Values set in a unit's
//! table override the defaults; everything left unset falls back to them.

use crate::errors::ConfigError;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Options applied to every unit that does not override them.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RunOptions {
    /// Base directory under which run directories are created.
    pub output_dir: Utf8PathBuf,

    /// Echo only non-passing result lines to the console.
    pub quiet: bool,

    /// Seconds a script may run before it is killed. Zero means no limit.
    pub timeout_secs: u64,

    /// Identity to run scripts as. `None` runs them as the invoking user.
    pub user: Option<String>,

    /// Setup script run before each unit.
    pub setup: Option<Utf8PathBuf>,

    /// Identity to run setup scripts as.
    pub setup_user: Option<String>,

    /// Teardown script run after each unit.
    pub teardown: Option<Utf8PathBuf>,

    /// Identity to run teardown scripts as.
    pub teardown_user: Option<String>,

    /// Selected tags. A non-empty selection runs only groups tagged with at
    /// least one of them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Number of times to run the whole set.
    pub iterations: u64,

    /// Describe the commands that would run without executing anything.
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_dir: Utf8PathBuf::from("/var/tmp/test_results"),
            quiet: false,
            timeout_secs: 60,
            user: None,
            setup: None,
            setup_user: None,
            teardown: None,
            teardown_user: None,
            tags: Vec::new(),
            iterations: 1,
            dry_run: false,
        }
    }
}

impl RunOptions {
    /// Applies one unit's runfile overrides on top of these defaults.
    ///
    /// This is the only place override precedence is decided: a value set in
    /// the unit's table always beats the default, and an unset value always
    /// keeps it.
    pub fn merged_with(&self, overrides: &UnitOverrides) -> RunOptions {
        RunOptions {
            output_dir: self.output_dir.clone(),
            quiet: self.quiet,
            timeout_secs: overrides.timeout_secs.unwrap_or(self.timeout_secs),
            user: overrides.user.clone().or_else(|| self.user.clone()),
            setup: overrides.setup.clone().or_else(|| self.setup.clone()),
            setup_user: overrides
                .setup_user
                .clone()
                .or_else(|| self.setup_user.clone()),
            teardown: overrides
                .teardown
                .clone()
                .or_else(|| self.teardown.clone()),
            teardown_user: overrides
                .teardown_user
                .clone()
                .or_else(|| self.teardown_user.clone()),
            // `tags` here is the caller's selection, not the unit's own tags;
            // a unit's tags come straight from its `UnitOverrides`.
            tags: self.tags.clone(),
            iterations: self.iterations,
            dry_run: self.dry_run,
        }
    }
}

/// Per-unit values from a runfile table.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UnitOverrides {
    /// Seconds before this unit's scripts are killed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Identity to run this unit as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Setup script for this unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<Utf8PathBuf>,

    /// Identity to run the setup script as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_user: Option<String>,

    /// Teardown script for this unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<Utf8PathBuf>,

    /// Identity to run the teardown script as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_user: Option<String>,

    /// Tags this unit is selected by.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Ordered member file names. Present exactly when the unit is a group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<String>>,
}

/// A parsed runfile: the `[defaults]` table plus one table per unit path.
///
/// Tables keep their file order, so a written template round-trips in the
/// order units were discovered.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RunFile {
    /// The `[defaults]` table.
    #[serde(default)]
    pub defaults: RunOptions,

    /// One table per unit, keyed by unit path.
    #[serde(flatten)]
    pub sections: IndexMap<String, UnitOverrides>,
}

impl RunFile {
    /// A runfile with the given defaults and no unit tables.
    pub fn new(defaults: RunOptions) -> Self {
        Self {
            defaults,
            sections: IndexMap::new(),
        }
    }

    /// Appends one unit table.
    pub fn insert_section(&mut self, pathname: impl Into<String>, overrides: UnitOverrides) {
        self.sections.insert(pathname.into(), overrides);
    }

    /// Loads and parses a runfile.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_owned(),
            error,
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    /// Serializes this runfile and writes it to `path`.
    pub fn write(&self, path: &Utf8Path) -> Result<(), ConfigError> {
        let data =
            toml::to_string_pretty(self).map_err(|error| ConfigError::Serialize { error })?;
        std::fs::write(path, data).map_err(|error| ConfigError::Write {
            path: path.to_owned(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_runfile_with_defaults_and_sections() {
        let input = indoc! {r#"
            [defaults]
            output_dir = "/var/tmp/results"
            quiet = true
            timeout_secs = 600
            user = "zfs-tests"

            ["/opt/suite/alone"]
            timeout_secs = 30

            ["/opt/suite/group"]
            tests = ["first", "second"]
            tags = ["functional"]
            setup = "setup"
        "#};

        let runfile: RunFile = toml::from_str(input).expect("runfile parses");
        assert_eq!(runfile.defaults.output_dir, "/var/tmp/results");
        assert!(runfile.defaults.quiet);
        assert_eq!(runfile.defaults.timeout_secs, 600);
        assert_eq!(runfile.defaults.user.as_deref(), Some("zfs-tests"));
        assert_eq!(runfile.defaults.iterations, 1);

        let keys: Vec<_> = runfile.sections.keys().cloned().collect();
        assert_eq!(keys, vec!["/opt/suite/alone", "/opt/suite/group"]);

        let single = &runfile.sections["/opt/suite/alone"];
        assert_eq!(single.timeout_secs, Some(30));
        assert!(single.tests.is_none());

        let group = &runfile.sections["/opt/suite/group"];
        assert_eq!(
            group.tests.as_deref(),
            Some(&["first".to_owned(), "second".to_owned()][..])
        );
        assert_eq!(group.tags.as_deref(), Some(&["functional".to_owned()][..]));
        assert_eq!(group.setup.as_deref(), Some(Utf8Path::new("setup")));
    }

    #[test]
    fn overrides_beat_defaults() {
        let defaults = RunOptions {
            timeout_secs: 600,
            user: Some("zfs-tests".to_owned()),
            setup: Some("setup".into()),
            ..RunOptions::default()
        };

        let merged = defaults.merged_with(&UnitOverrides {
            timeout_secs: Some(30),
            user: Some("root".to_owned()),
            ..UnitOverrides::default()
        });
        assert_eq!(merged.timeout_secs, 30);
        assert_eq!(merged.user.as_deref(), Some("root"));
        // Unset overrides keep the default.
        assert_eq!(merged.setup.as_deref(), Some(Utf8Path::new("setup")));

        let merged = defaults.merged_with(&UnitOverrides::default());
        assert_eq!(merged.timeout_secs, 600);
        assert_eq!(merged.user.as_deref(), Some("zfs-tests"));
    }

    #[test]
    fn written_template_round_trips() {
        let mut runfile = RunFile::new(RunOptions::default());
        runfile.insert_section(
            "/opt/suite/group",
            UnitOverrides {
                tests: Some(vec!["first".to_owned()]),
                ..UnitOverrides::default()
            },
        );

        let text = toml::to_string_pretty(&runfile).expect("runfile serializes");
        let reparsed: RunFile = toml::from_str(&text).expect("template parses back");
        assert_eq!(reparsed.defaults.timeout_secs, 60);
        assert_eq!(
            reparsed.sections["/opt/suite/group"].tests.as_deref(),
            Some(&["first".to_owned()][..])
        );
    }
}
