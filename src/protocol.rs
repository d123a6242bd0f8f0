// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The line-based control protocol spoken with `simpleperf record --stdio-controls-profiling`.
//!
//! The parent writes one command per line on the child's stdin; the child answers every
//! command with exactly one line on its stdout, and writes one unsolicited `started` line
//! once recording begins.

use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
};
#[cfg(test)]
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;

const START_FLAG: &str = "started";
const OK_REPLY: &str = "ok";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("failed to send cmd to simpleperf: {0}")]
    Write(#[source] io::Error),
    #[error("failed to send cmd to simpleperf: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("failed to read reply from simpleperf: {0}")]
    Read(#[source] io::Error),
    #[error("failed to run cmd in simpleperf: {cmd}, reply {reply:?}")]
    UnexpectedReply { cmd: ControlCommand, reply: String },
    #[error("failed to receive simpleperf start flag, got {0:?}")]
    MissingStartFlag(String),
}

/// A command understood by the profiler child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parent's ends of the control (parent to child) and reply (child to parent) pipes.
pub(crate) struct ControlChannel<W = File, R = File> {
    control: W,
    reply: R,
}

impl<W, R> fmt::Debug for ControlChannel<W, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl<W: Write, R: Read> ControlChannel<W, R> {
    pub(crate) fn new(control: W, reply: R) -> Self {
        Self { control, reply }
    }

    /// Waits for the line the child writes once recording has started.
    pub(crate) fn wait_started(&mut self) -> Result<(), ProtocolError> {
        let reply = self.read_reply()?;
        if reply != START_FLAG {
            return Err(ProtocolError::MissingStartFlag(reply));
        }
        Ok(())
    }

    /// Sends `cmd` and checks that the child acknowledged it.
    pub(crate) fn send_cmd(&mut self, cmd: ControlCommand) -> Result<(), ProtocolError> {
        let data = format!("{cmd}\n");
        let written = loop {
            match self.control.write(data.as_bytes()) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => break result.map_err(ProtocolError::Write)?,
            }
        };
        if written != data.len() {
            return Err(ProtocolError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        tracing::debug!(%cmd, "sent cmd to simpleperf");

        let reply = self.read_reply()?;
        if reply != OK_REPLY {
            return Err(ProtocolError::UnexpectedReply { cmd, reply });
        }
        Ok(())
    }

    /// Reads one reply line, without the trailing newline.
    ///
    /// Reads a byte at a time: the stream has no other framing, and nothing past the
    /// current line may be consumed.
    pub(crate) fn read_reply(&mut self) -> Result<String, ProtocolError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.reply.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Read(e)),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (W, R) {
        (self.control, self.reply)
    }
}

#[cfg(test)]
impl ControlChannel {
    /// The control and reply descriptors.
    pub(crate) fn raw_fds(&self) -> (RawFd, RawFd) {
        (self.control.as_raw_fd(), self.reply.as_raw_fd())
    }
}
