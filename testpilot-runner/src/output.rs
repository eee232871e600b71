// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Captured script output: timestamped lines and the merged stream.
//!
//! Each output channel is read through a buffered reader and split into
//! lines as data arrives. Every line records the wall-clock instant of the
//! read that completed it, so the two channels can later be merged into one
//! chronological stream. The merge is best-effort interleaving: it is
//! consistent and reproducible, not sub-millisecond accurate.

use crate::errors::ChildReadError;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use std::io;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStderr, ChildStdout},
};

/// The size of each buffered reader's buffer.
///
/// This size is not totally arbitrary, but rather the (normal) page size on most systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// One captured output line: the arrival time of the read that completed it,
/// plus the line's bytes without the trailing newline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CapturedLine {
    /// When the line arrived.
    pub timestamp: DateTime<Local>,
    /// The line's bytes, not necessarily valid UTF-8.
    pub data: Bytes,
}

/// Accumulates one output channel into timestamped lines.
///
/// Complete lines (terminated by `\n`) are emitted as they arrive; every
/// line completed by a single read shares that read's timestamp. An
/// unterminated tail stays buffered until [`drain`](Self::drain) flushes it
/// at end of stream.
#[derive(Debug, Default)]
pub(crate) struct LineAccumulator {
    partial: BytesMut,
    lines: Vec<CapturedLine>,
}

impl LineAccumulator {
    pub(crate) fn extend(&mut self, timestamp: DateTime<Local>, buf: &[u8]) {
        self.partial.extend_from_slice(buf);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut data = self.partial.split_to(pos + 1);
            data.truncate(pos);
            self.lines.push(CapturedLine {
                timestamp,
                data: data.freeze(),
            });
        }
    }

    /// Flushes an unterminated tail as a final line. EOF acts as an implicit
    /// terminator.
    pub(crate) fn drain(&mut self, timestamp: DateTime<Local>) {
        if !self.partial.is_empty() {
            self.lines.push(CapturedLine {
                timestamp,
                data: self.partial.split().freeze(),
            });
        }
    }

    pub(crate) fn into_lines(self) -> Vec<CapturedLine> {
        self.lines
    }
}

/// A `BufReader` over an `AsyncRead` that tracks whether the reader is done.
pub(crate) struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    pub(crate) async fn fill_buf(&mut self, acc: &mut LineAccumulator) -> Result<(), io::Error> {
        if self.done {
            return Ok(());
        }

        match self.reader.fill_buf().await {
            Ok(buf) => {
                let now = Local::now();
                if buf.is_empty() {
                    self.done = true;
                    acc.drain(now);
                } else {
                    acc.extend(now, buf);
                }
                let len = buf.len();
                self.reader.consume(len);
                Ok(())
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }
}

/// The stdout and stderr pipes of a child process.
pub(crate) struct ChildFds {
    stdout: FusedBufReader<ChildStdout>,
    stderr: FusedBufReader<ChildStderr>,
}

impl ChildFds {
    pub(crate) fn new(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self {
            stdout: FusedBufReader::new(stdout),
            stderr: FusedBufReader::new(stderr),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.stdout.is_done() && self.stderr.is_done()
    }

    /// Fills one of the accumulators with available data from the child.
    ///
    /// A single step in collecting the child's output. This operation is
    /// cancel-safe, since the underlying [`AsyncBufReadExt::fill_buf`]
    /// operation is cancel-safe.
    pub(crate) async fn fill_buf(
        &mut self,
        stdout_acc: &mut LineAccumulator,
        stderr_acc: &mut LineAccumulator,
    ) -> Result<(), ChildReadError> {
        // Wait until either pipe makes progress.
        tokio::select! {
            res = self.stdout.fill_buf(stdout_acc), if !self.stdout.is_done() => {
                res.map_err(ChildReadError::Stdout)
            }
            res = self.stderr.fill_buf(stderr_acc), if !self.stderr.is_done() => {
                res.map_err(ChildReadError::Stderr)
            }
            // If both are done, do nothing.
            else => {
                Ok(())
            }
        }
    }
}

/// Line accumulators for a child process.
pub(crate) struct ChildAccumulator {
    pub(crate) fds: ChildFds,
    pub(crate) stdout: LineAccumulator,
    pub(crate) stderr: LineAccumulator,
}

impl ChildAccumulator {
    pub(crate) fn new(fds: ChildFds) -> Self {
        Self {
            fds,
            stdout: LineAccumulator::default(),
            stderr: LineAccumulator::default(),
        }
    }

    pub(crate) async fn fill_buf(&mut self) -> Result<(), ChildReadError> {
        self.fds.fill_buf(&mut self.stdout, &mut self.stderr).await
    }
}

/// Merges the stdout and stderr line sequences into one stream ordered by
/// arrival timestamp.
///
/// The sort is stable: lines sharing a timestamp keep stdout before stderr,
/// and intra-channel order is always preserved.
pub fn merge_by_timestamp(
    stdout: Vec<CapturedLine>,
    stderr: Vec<CapturedLine>,
) -> Vec<CapturedLine> {
    let mut merged: Vec<CapturedLine> = stdout.into_iter().chain(stderr).collect();
    merged.sort_by_key(|line| line.timestamp);
    merged
}
