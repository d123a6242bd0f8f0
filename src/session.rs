// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    ffi::OsStr,
    fmt, fs, io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::WaitStatus,
    },
};
use thiserror::Error;

use crate::{
    device::{self, DeviceError, DevicePaths},
    options::RecordOptions,
    protocol::{ControlChannel, ControlCommand, ProtocolError},
    spawn::{self, ProfilerChild, SpawnError},
};

/// Target fatal session errors are logged under.
pub const LOG_TAG: &str = "simpleperf";

const TRACE_OFFCPU_ARG: &str = "--trace-offcpu";
const WORKSPACE_DIR_NAME: &str = "simpleperf_data";
const APP_DATA_ROOT: &str = "/data/data";

/// Where a [`Session`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotYetStarted,
    Started,
    Paused,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::NotYetStarted => "NOT_YET_STARTED",
            State::Started => "STARTED",
            State::Paused => "PAUSED",
            State::Stopped => "STOPPED",
        })
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("{op}: session in wrong state {state}")]
    WrongState { op: &'static str, state: State },
    #[error("--trace-offcpu doesn't work well with pause/resume recording")]
    TraceOffCpuPause,
    #[error("failed to read /proc/self/cmdline: {0}")]
    ReadCmdline(#[source] io::Error),
    #[error("failed to find package name in /proc/self/cmdline")]
    PackageNameNotFound,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to stop simpleperf: {0}")]
    Signal(#[source] Errno),
    #[error("simpleperf exited with error, status = {0:?}")]
    ProfilerFailed(WaitStatus),
}

enum Status {
    NotYetStarted,
    Running {
        child: ProfilerChild,
        paused: bool,
    },
    // the child is reaped, but its pipes stay open until the session is dropped
    Stopped {
        _channel: ControlChannel,
    },
}

impl Status {
    fn state(&self) -> State {
        match self {
            Status::NotYetStarted => State::NotYetStarted,
            Status::Running { paused: false, .. } => State::Started,
            Status::Running { paused: true, .. } => State::Paused,
            Status::Stopped { .. } => State::Stopped,
        }
    }
}

struct Inner {
    status: Status,
    trace_offcpu: bool,
}

/// Builds a [`Session`] with non-default settings.
#[derive(Debug)]
pub struct SessionBuilder {
    app_data_dir: PathBuf,
    device_paths: Option<DevicePaths>,
}

impl SessionBuilder {
    /// Sets where the session looks for simpleperf and its helper tools.
    pub fn with_device_paths(mut self, paths: DevicePaths) -> SessionBuilder {
        self.device_paths = Some(paths);
        self
    }

    /// Creates the session. It doesn't touch the device until it is started.
    pub fn build(self) -> Session {
        Session {
            workspace: self.app_data_dir.join(WORKSPACE_DIR_NAME),
            app_data_dir: self.app_data_dir,
            device_paths: self.device_paths.unwrap_or_default(),
            inner: Mutex::new(Inner {
                status: Status::NotYetStarted,
                trace_offcpu: false,
            }),
        }
    }
}

/// Controls a `simpleperf record` process profiling the current app.
///
/// A session goes through `NOT_YET_STARTED -> STARTED <-> PAUSED -> STOPPED`, and cannot be
/// started again once stopped. All methods may be called from any thread; they are
/// serialized by an internal lock.
///
/// Recording errors have no useful recovery for the app, so [`start`](Self::start),
/// [`pause`](Self::pause), [`resume`](Self::resume) and [`stop`](Self::stop) log the error
/// under the [`LOG_TAG`] target and abort the process. The `try_` variants return the error
/// instead.
///
/// ```no_run
/// # use simpleperf_app_api::{options::RecordOptions, session::Session};
/// let session = Session::new("/data/data/com.example.app");
/// session.start(&RecordOptions::default().record_dwarf_call_graph());
/// // ... interesting work ...
/// session.pause();
/// session.resume();
/// session.stop();
/// ```
pub struct Session {
    app_data_dir: PathBuf,
    workspace: PathBuf,
    device_paths: DevicePaths,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("app_data_dir", &self.app_data_dir)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session storing its recordings in `app_data_dir/simpleperf_data/`.
    ///
    /// `app_data_dir` is the same as `android.content.Context.getDataDir()`.
    pub fn new(app_data_dir: impl Into<PathBuf>) -> Session {
        Session::builder(app_data_dir).build()
    }

    /// Starts building a session for `app_data_dir`, see [`SessionBuilder`].
    pub fn builder(app_data_dir: impl Into<PathBuf>) -> SessionBuilder {
        SessionBuilder {
            app_data_dir: app_data_dir.into(),
            device_paths: None,
        }
    }

    /// Creates a session for the current app, assuming its data directory is
    /// `/data/data/<package name>`. Aborts if the package name can't be found.
    pub fn for_current_app() -> Session {
        fatal(Session::try_for_current_app())
    }

    /// Like [`for_current_app`](Self::for_current_app), returning the error instead of
    /// aborting.
    pub fn try_for_current_app() -> Result<Session, SessionError> {
        let cmdline = fs::read("/proc/self/cmdline").map_err(SessionError::ReadCmdline)?;
        Ok(Session::new(app_data_dir_from_cmdline(&cmdline)?))
    }

    /// The app data directory the session was created for.
    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    /// The directory simpleperf runs in and writes its recording to.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Where the session is in its lifecycle.
    pub fn state(&self) -> State {
        self.lock().status.state()
    }

    /// PID of the simpleperf process while it is recording.
    pub fn profiler_pid(&self) -> Option<u32> {
        match &self.lock().status {
            Status::Running { child, .. } => Some(child.pid.as_raw() as u32),
            _ => None,
        }
    }

    /// Starts recording with `options`.
    pub fn start(&self, options: &RecordOptions) {
        fatal(self.try_start(options))
    }

    /// Starts recording with arguments for `simpleperf record`.
    pub fn start_with_args(&self, record_args: &[String]) {
        fatal(self.try_start_with_args(record_args))
    }

    /// Pauses recording. No samples are generated while paused.
    pub fn pause(&self) {
        fatal(self.try_pause())
    }

    /// Resumes a paused recording.
    pub fn resume(&self) {
        fatal(self.try_resume())
    }

    /// Stops recording, leaving the recording file in the workspace.
    pub fn stop(&self) {
        fatal(self.try_stop())
    }

    /// Starts recording with `options`, returning any error instead of aborting.
    pub fn try_start(&self, options: &RecordOptions) -> Result<(), SessionError> {
        self.try_start_with_args(&options.to_record_args())
    }

    /// Starts recording with raw `simpleperf record` arguments.
    ///
    /// Looks for simpleperf, checks perf events are enabled, creates the workspace, then waits
    /// for simpleperf to report that recording started.
    pub fn try_start_with_args(&self, record_args: &[String]) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let state = inner.status.state();
        if state != State::NotYetStarted {
            return Err(SessionError::WrongState { op: "start", state });
        }
        if record_args.iter().any(|arg| arg == TRACE_OFFCPU_ARG) {
            inner.trace_offcpu = true;
        }

        let profiler = device::find_profiler(&self.device_paths, &self.app_data_dir)?;
        tracing::debug!(?profiler, "found simpleperf");
        device::require_perf_enabled(&self.device_paths)?;
        device::ensure_workspace(&self.workspace)?;
        let child = spawn::spawn_profiler(
            &profiler,
            &self.device_paths.tracepoint_events,
            &self.workspace,
            record_args,
        )?;

        tracing::info!(pid = child.pid.as_raw(), "simpleperf started recording");
        inner.status = Status::Running {
            child,
            paused: false,
        };
        Ok(())
    }

    /// Pauses recording. Fails for sessions recording with `--trace-offcpu`.
    pub fn try_pause(&self) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let state = inner.status.state();
        let Status::Running {
            child,
            paused: paused @ false,
        } = &mut inner.status
        else {
            return Err(SessionError::WrongState { op: "pause", state });
        };
        if inner.trace_offcpu {
            return Err(SessionError::TraceOffCpuPause);
        }
        child.channel.send_cmd(ControlCommand::Pause)?;
        *paused = true;
        Ok(())
    }

    /// Resumes a paused recording.
    pub fn try_resume(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let state = inner.status.state();
        let Status::Running {
            child,
            paused: paused @ true,
        } = &mut inner.status
        else {
            return Err(SessionError::WrongState { op: "resume", state });
        };
        child.channel.send_cmd(ControlCommand::Resume)?;
        *paused = false;
        Ok(())
    }

    /// Stops simpleperf with SIGINT and waits for it to finish the recording file.
    ///
    /// The profiler must exit with status 0. The pipes to it stay open until the session is
    /// dropped.
    pub fn try_stop(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let (child, paused) = match std::mem::replace(&mut inner.status, Status::NotYetStarted) {
            Status::Running { child, paused } => (child, paused),
            other => {
                let state = other.state();
                inner.status = other;
                return Err(SessionError::WrongState { op: "stop", state });
            }
        };

        // SIGINT makes simpleperf finish the recording file and exit.
        if let Err(err) = kill(child.pid, Signal::SIGINT) {
            inner.status = Status::Running { child, paused };
            return Err(SessionError::Signal(err));
        }
        let status = match spawn::wait_for_exit(child.pid) {
            Ok(status) => status,
            Err(err) => {
                inner.status = Status::Running { child, paused };
                return Err(err.into());
            }
        };
        inner.status = Status::Stopped {
            _channel: child.channel,
        };
        if !matches!(status, WaitStatus::Exited(_, 0)) {
            return Err(SessionError::ProfilerFailed(status));
        }
        tracing::info!("simpleperf stopped recording");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // nothing panics while holding the lock
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Status::Running { child, .. } =
            std::mem::replace(&mut inner.status, Status::NotYetStarted)
        {
            tracing::warn!(
                pid = child.pid.as_raw(),
                "session dropped while recording, stopping simpleperf"
            );
            let ProfilerChild { pid, channel } = child;
            drop(channel);
            match kill(pid, Signal::SIGINT) {
                Ok(()) => {
                    if let Err(err) = spawn::wait_for_exit(pid) {
                        tracing::warn!(?err, "unable to reap simpleperf during drop");
                    }
                }
                Err(err) => tracing::warn!(?err, "unable to stop simpleperf during drop"),
            }
        }
    }
}

fn app_data_dir_from_cmdline(cmdline: &[u8]) -> Result<PathBuf, SessionError> {
    let package_name = cmdline.split(|&b| b == 0).next().unwrap_or_default();
    if package_name.is_empty() {
        return Err(SessionError::PackageNameNotFound);
    }
    Ok(Path::new(APP_DATA_ROOT).join(OsStr::from_bytes(package_name)))
}

fn fatal<T>(result: Result<T, SessionError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(target: LOG_TAG, "{err}");
            std::process::abort()
        }
    }
}
