// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device-side preparation for a session: finding a runnable `simpleperf`, checking that
//! perf events are enabled, and creating the directory the recording is written to.

use std::{
    ffi::OsStr,
    fs::{self, DirBuilder},
    io,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spawn::{self, CmdOutput};

const PERF_HARDEN_PROPERTY: &str = "security.perf_harden";
/// Name of the profiler copy in the app data directory.
const COPIED_PROFILER_NAME: &str = "simpleperf";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("can't find simpleperf on device. Please run api_profiler.py.")]
    ProfilerNotFound,
    #[error("linux perf events aren't enabled on the device. Please run api_profiler.py.")]
    PerfDisabled,
    #[error("failed to create simpleperf data dir {path:?}: {source}")]
    CreateWorkspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fixed locations on the device the session depends on.
///
/// The defaults are the Android locations; they only need changing when running against a
/// different layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePaths {
    /// Where `api_profiler.py` pushes a newer simpleperf. Preferred over the system one.
    pub staging_profiler: PathBuf,
    /// The simpleperf shipped in the system image, available on Android >= Q.
    pub system_profiler: PathBuf,
    /// Tracepoint event list passed to `simpleperf record --tracepoint-events`.
    pub tracepoint_events: PathBuf,
    /// Tool used to read system properties.
    pub getprop: PathBuf,
    /// Tool used to copy the staged profiler into the app data directory.
    pub copy_tool: PathBuf,
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self {
            staging_profiler: "/data/local/tmp/simpleperf".into(),
            system_profiler: "/system/bin/simpleperf".into(),
            tracepoint_events: "/data/local/tmp/tracepoint_events".into(),
            getprop: "/system/bin/getprop".into(),
            copy_tool: "/system/bin/cp".into(),
        }
    }
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|md| md.is_file() && md.permissions().mode() & 0o100 != 0)
        .unwrap_or(false)
}

fn run_ok(args: &[&Path]) -> bool {
    match spawn::run_cmd(args) {
        Ok(output) if output.success() => true,
        Ok(CmdOutput { status, .. }) => {
            tracing::debug!(?args, ?status, "command failed");
            false
        }
        Err(err) => {
            tracing::debug!(?args, ?err, "unable to run command");
            false
        }
    }
}

/// Finds a simpleperf binary the app is allowed to execute.
pub(crate) fn find_profiler(
    paths: &DevicePaths,
    app_data_dir: &Path,
) -> Result<PathBuf, DeviceError> {
    // The staged binary is probably newer than the system one.
    if let Some(path) = find_staged_profiler(paths, app_data_dir) {
        return Ok(path);
    }
    if is_executable_file(&paths.system_profiler) {
        return Ok(paths.system_profiler.clone());
    }
    Err(DeviceError::ProfilerNotFound)
}

fn find_staged_profiler(paths: &DevicePaths, app_data_dir: &Path) -> Option<PathBuf> {
    if !is_executable_file(&paths.staging_profiler) {
        return None;
    }
    // Apps may only execute files in their own data directory, so run a copy.
    let to_path = app_data_dir.join(COPIED_PROFILER_NAME);
    if !run_ok(&[
        paths.copy_tool.as_path(),
        paths.staging_profiler.as_path(),
        to_path.as_path(),
    ]) {
        return None;
    }
    if !is_executable_file(&to_path) {
        return None;
    }
    // For apps with target sdk >= 29, executing app data files isn't allowed either.
    if !run_ok(&[to_path.as_path()]) {
        tracing::debug!(path = ?to_path, "copied simpleperf isn't executable from the app");
        return None;
    }
    Some(to_path)
}

/// Fails if the `security.perf_harden` property says perf events are disabled.
///
/// The check is skipped when the property can't be read.
pub(crate) fn require_perf_enabled(paths: &DevicePaths) -> Result<(), DeviceError> {
    let args = [paths.getprop.as_os_str(), OsStr::new(PERF_HARDEN_PROPERTY)];
    let output = match spawn::run_cmd(&args) {
        Ok(output) if output.success() => output,
        Ok(CmdOutput { status, .. }) => {
            tracing::debug!(?status, "getprop failed, skipping perf_harden check");
            return Ok(());
        }
        Err(err) => {
            tracing::debug!(?err, "unable to run getprop, skipping perf_harden check");
            return Ok(());
        }
    };
    if output.stdout.first() == Some(&b'1') {
        return Err(DeviceError::PerfDisabled);
    }
    Ok(())
}

/// Creates the session workspace with mode 0700 unless it already exists.
pub(crate) fn ensure_workspace(path: &Path) -> Result<(), DeviceError> {
    if path.is_dir() {
        return Ok(());
    }
    DirBuilder::new()
        .mode(0o700)
        .create(path)
        .map_err(|source| DeviceError::CreateWorkspace {
            path: path.to_owned(),
            source,
        })?;
    tracing::debug!(?path, "created simpleperf data dir");
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::spawn::tests::write_script;

    fn paths_in(dir: &Path) -> DevicePaths {
        DevicePaths {
            staging_profiler: dir.join("staging/simpleperf"),
            system_profiler: dir.join("system/simpleperf"),
            tracepoint_events: dir.join("tracepoint_events"),
            getprop: dir.join("getprop"),
            copy_tool: "/bin/cp".into(),
        }
    }

    #[test]
    fn test_find_profiler_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        assert!(matches!(
            find_profiler(&paths, dir.path()),
            Err(DeviceError::ProfilerNotFound)
        ));
    }

    #[test]
    fn test_find_profiler_system() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::create_dir(dir.path().join("system")).unwrap();
        write_script(&dir.path().join("system"), "simpleperf", "exit 0\n");
        assert_eq!(
            find_profiler(&paths, dir.path()).unwrap(),
            paths.system_profiler
        );
    }

    #[test]
    fn test_find_profiler_ignores_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::create_dir(dir.path().join("system")).unwrap();
        fs::write(&paths.system_profiler, "not a program").unwrap();
        assert!(find_profiler(&paths, dir.path()).is_err());
    }

    #[test]
    fn test_find_profiler_copies_staged_binary() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("app");
        fs::create_dir(&app_dir).unwrap();
        let paths = paths_in(dir.path());
        fs::create_dir(dir.path().join("staging")).unwrap();
        write_script(&dir.path().join("staging"), "simpleperf", "exit 0\n");
        fs::create_dir(dir.path().join("system")).unwrap();
        write_script(&dir.path().join("system"), "simpleperf", "exit 0\n");

        let found = find_profiler(&paths, &app_dir).unwrap();
        assert_eq!(found, app_dir.join("simpleperf"));
        assert_eq!(
            fs::read(&found).unwrap(),
            fs::read(&paths.staging_profiler).unwrap()
        );
    }

    #[test]
    fn test_find_profiler_falls_back_when_copy_fails_self_test() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("app");
        fs::create_dir(&app_dir).unwrap();
        let paths = paths_in(dir.path());
        fs::create_dir(dir.path().join("staging")).unwrap();
        write_script(&dir.path().join("staging"), "simpleperf", "exit 1\n");
        fs::create_dir(dir.path().join("system")).unwrap();
        write_script(&dir.path().join("system"), "simpleperf", "exit 0\n");

        assert_eq!(
            find_profiler(&paths, &app_dir).unwrap(),
            paths.system_profiler
        );
    }

    #[test_case(Some("1\n"), false; "perf hardened")]
    #[test_case(Some("0\n"), true; "perf enabled")]
    #[test_case(Some(""), true; "property unset")]
    #[test_case(None, true; "no getprop")]
    fn test_require_perf_enabled(value: Option<&str>, enabled: bool) {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        if let Some(value) = value {
            write_script(
                dir.path(),
                "getprop",
                &format!("[ \"$1\" = security.perf_harden ] || exit 1\nprintf '{value}'\n"),
            );
        }
        let result = require_perf_enabled(&paths);
        assert_eq!(result.is_ok(), enabled, "{result:?}");
        if !enabled {
            assert!(matches!(result, Err(DeviceError::PerfDisabled)));
        }
    }

    #[test]
    fn test_ensure_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("simpleperf_data");
        ensure_workspace(&workspace).unwrap();
        let md = fs::metadata(&workspace).unwrap();
        assert!(md.is_dir());
        assert_eq!(md.permissions().mode() & 0o777, 0o700);
        // already there
        ensure_workspace(&workspace).unwrap();
    }

    #[test]
    fn test_ensure_workspace_failure() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("missing/simpleperf_data");
        assert!(matches!(
            ensure_workspace(&workspace),
            Err(DeviceError::CreateWorkspace { path, .. }) if path == workspace
        ));
    }

    #[test]
    fn test_device_paths_from_json() {
        let paths: DevicePaths =
            serde_json::from_str(r#"{"system_profiler": "/vendor/bin/simpleperf"}"#).unwrap();
        assert_eq!(paths.system_profiler, Path::new("/vendor/bin/simpleperf"));
        assert_eq!(paths.getprop, DevicePaths::default().getprop);
    }
}
