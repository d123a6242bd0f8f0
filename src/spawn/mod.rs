// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    ffi::{OsStr, OsString},
    fs::File,
    io::{self, Read},
    os::fd::{AsRawFd, OwnedFd},
    path::Path,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{pipe2, Pid},
};
use thiserror::Error;

use crate::protocol::{ControlChannel, ProtocolError};

pub(crate) mod raw;

use raw::{ChildFds, ExecPlan};

/// Arguments placed between the binary and the caller's record arguments.
const RECORD_PREAMBLE: [&str; 7] = [
    "record",
    "--log-to-android-buffer",
    "--log",
    "debug",
    "--stdio-controls-profiling",
    "--in-app",
    "--tracepoint-events",
];

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SpawnError {
    #[error("no command to run")]
    EmptyCommand,
    #[error("argument contains a nul byte: {0:?}")]
    NulByte(String),
    #[error("failed to call pipe: {0}")]
    Pipe(Errno),
    #[error("failed to open /dev/null: {0}")]
    DevNull(io::Error),
    #[error("failed to fork {program:?}: {source}")]
    Fork {
        program: OsString,
        source: io::Error,
    },
    #[error("failed to call waitpid: {0}")]
    Wait(Errno),
    #[error("failed to read output of {program:?}: {source}")]
    ReadOutput {
        program: OsString,
        source: io::Error,
    },
    #[error("failed to receive simpleperf start flag, got {reply:?} (child status {status:?})")]
    NotStarted {
        reply: String,
        status: Option<WaitStatus>,
    },
    #[error("failed to receive simpleperf start flag: {0}")]
    Protocol(#[source] ProtocolError),
}

/// A running profiler, with the parent's ends of its control and reply pipes.
#[derive(Debug)]
pub(crate) struct ProfilerChild {
    pub(crate) pid: Pid,
    pub(crate) channel: ControlChannel,
}

/// The command line the profiler child is started with.
pub(crate) fn record_command_line(
    binary: &Path,
    tracepoint_events: &Path,
    record_args: &[String],
) -> Vec<OsString> {
    let mut args = Vec::with_capacity(RECORD_PREAMBLE.len() + 2 + record_args.len());
    args.push(binary.as_os_str().to_owned());
    args.extend(RECORD_PREAMBLE.iter().map(OsString::from));
    args.push(tracepoint_events.as_os_str().to_owned());
    args.extend(record_args.iter().map(OsString::from));
    args
}

/// Starts `simpleperf record` in `workspace` and waits until it reports that recording
/// started.
///
/// The child reads commands on its stdin and writes replies on its stdout. On failure the
/// parent's pipe ends are closed and a child that was already started is killed and
/// reaped.
pub(crate) fn spawn_profiler(
    binary: &Path,
    tracepoint_events: &Path,
    workspace: &Path,
    record_args: &[String],
) -> Result<ProfilerChild, SpawnError> {
    let args = record_command_line(binary, tracepoint_events, record_args);
    let plan = ExecPlan::new(&args, Some(workspace))?;

    let (control_read, control_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (reply_read, reply_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;

    let pid = raw::clone_exec(
        &plan,
        &ChildFds {
            stdin: control_read.as_raw_fd(),
            stdout: reply_write.as_raw_fd(),
            close: &[control_write.as_raw_fd(), reply_read.as_raw_fd()],
        },
    )
    .map_err(|source| SpawnError::Fork {
        program: plan.program().to_owned(),
        source,
    })?;
    drop(control_read);
    drop(reply_write);
    tracing::debug!(pid = pid.as_raw(), ?args, "spawned simpleperf");

    let mut channel = ControlChannel::new(File::from(control_write), File::from(reply_read));
    match channel.wait_started() {
        Ok(()) => Ok(ProfilerChild { pid, channel }),
        Err(err) => {
            drop(channel);
            let status = kill_and_reap(pid);
            Err(match err {
                ProtocolError::MissingStartFlag(reply) => SpawnError::NotStarted { reply, status },
                err => SpawnError::Protocol(err),
            })
        }
    }
}

/// Output of a helper command.
#[derive(Debug)]
pub(crate) struct CmdOutput {
    pub(crate) status: WaitStatus,
    pub(crate) stdout: Vec<u8>,
}

impl CmdOutput {
    pub(crate) fn success(&self) -> bool {
        matches!(self.status, WaitStatus::Exited(_, 0))
    }
}

/// Runs a short-lived helper to completion, with stdin on `/dev/null` and stdout captured.
pub(crate) fn run_cmd<S: AsRef<OsStr>>(args: &[S]) -> Result<CmdOutput, SpawnError> {
    let plan = ExecPlan::new(args, None)?;
    let program = plan.program().to_owned();

    let dev_null = OwnedFd::from(File::open("/dev/null").map_err(SpawnError::DevNull)?);
    let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;

    let pid = raw::clone_exec(
        &plan,
        &ChildFds {
            stdin: dev_null.as_raw_fd(),
            stdout: stdout_write.as_raw_fd(),
            close: &[stdout_read.as_raw_fd()],
        },
    )
    .map_err(|source| SpawnError::Fork {
        program: program.clone(),
        source,
    })?;
    drop(stdout_write);
    drop(dev_null);

    // drain before reaping so a chatty helper can't block on a full pipe
    let mut stdout = Vec::new();
    let read = File::from(stdout_read).read_to_end(&mut stdout);
    let status = wait_for_exit(pid)?;
    read.map_err(|source| SpawnError::ReadOutput { program, source })?;
    Ok(CmdOutput { status, stdout })
}

/// `waitpid` that retries when interrupted by a signal.
pub(crate) fn wait_for_exit(pid: Pid) -> Result<WaitStatus, SpawnError> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            result => return result.map_err(SpawnError::Wait),
        }
    }
}

fn kill_and_reap(pid: Pid) -> Option<WaitStatus> {
    if let Err(err) = kill(pid, Signal::SIGKILL) {
        tracing::warn!(pid = pid.as_raw(), ?err, "unable to kill simpleperf");
    }
    wait_for_exit(pid)
        .inspect_err(|err| tracing::warn!(pid = pid.as_raw(), ?err, "unable to reap simpleperf"))
        .ok()
}
