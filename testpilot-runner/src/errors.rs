// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testpilot.

use crate::results::exit_code;
use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error that occurred while reading or writing a runfile.
///
/// Configuration errors are fatal before any test executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The runfile could not be read.
    #[error("failed to read runfile `{path}`")]
    Read {
        /// The runfile path.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },

    /// The runfile was not valid TOML or did not match the expected shape.
    #[error("failed to parse runfile `{path}`")]
    Parse {
        /// The runfile path.
        path: Utf8PathBuf,

        /// The underlying deserialization error.
        #[source]
        error: toml::de::Error,
    },

    /// A runfile template could not be serialized.
    #[error("failed to serialize runfile")]
    Serialize {
        /// The underlying serialization error.
        #[source]
        error: toml::ser::Error,
    },

    /// The runfile could not be written.
    #[error("failed to write runfile `{path}`")]
    Write {
        /// The runfile path.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while preparing the run directory or its log file.
#[derive(Debug, Error)]
pub enum LogSetupError {
    /// An output directory could not be created.
    #[error("failed to create output directory `{path}`")]
    CreateDir {
        /// The directory being created.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },

    /// The persistent log file could not be opened.
    #[error("failed to open log file `{path}`")]
    OpenLogFile {
        /// The log file path.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while reading from a child's output pipes.
#[derive(Debug, Error)]
pub enum ChildReadError {
    /// An error occurred while reading standard output.
    #[error("error reading standard output")]
    Stdout(#[source] io::Error),

    /// An error occurred while reading standard error.
    #[error("error reading standard error")]
    Stderr(#[source] io::Error),
}

/// An error that occurred while spawning or supervising a child process.
///
/// Execution errors are fatal to the run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The child process failed to start.
    #[error("failed to start `{command}`")]
    Start {
        /// The script being run.
        command: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },

    /// Waiting for the child process failed.
    #[error("failed to wait for `{command}`")]
    Wait {
        /// The script being run.
        command: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },

    /// Reading the child's output failed.
    #[error("failed to read output of `{command}`")]
    Read {
        /// The script being run.
        command: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: ChildReadError,
    },

    /// Signaling the child process failed.
    #[error("failed to signal `{command}`")]
    Kill {
        /// The script being run.
        command: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },

    /// The Tokio runtime could not be built.
    #[error("failed to build the Tokio runtime")]
    Runtime(#[source] io::Error),
}

/// An error that occurred while writing result lines or artifacts.
#[derive(Debug, Error)]
pub enum ReportError {
    /// An error occurred while writing to the run log.
    #[error("error writing to the run log")]
    Log(#[source] io::Error),

    /// An error occurred while writing per-test artifact files.
    #[error("error writing artifacts under `{path}`")]
    Artifacts {
        /// The unit's output directory.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up the signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);

/// A fatal error that unwinds a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Preparing the run directory or log file failed.
    #[error(transparent)]
    Setup(#[from] LogSetupError),

    /// A child process could not be spawned or supervised.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Results could not be reported.
    #[error(transparent)]
    Report(#[from] ReportError),

    /// The signal handler could not be installed.
    #[error(transparent)]
    SignalSetup(#[from] SignalHandlerSetupError),

    /// The run was interrupted by an external signal.
    ///
    /// Already-finalized results are still reported before the run exits.
    #[error("run interrupted by signal")]
    Interrupted,
}

impl RunError {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Setup(_) | Self::SignalSetup(_) => exit_code::SETUP_ERROR,
            Self::Execution(_) | Self::Report(_) => exit_code::EXECUTION_ERROR,
            Self::Interrupted => exit_code::INTERRUPTED,
        }
    }
}
