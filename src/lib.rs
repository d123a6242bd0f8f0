// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## simpleperf app API
//! An in-process controller for profiling an Android app with [simpleperf]. The app
//! starts a `simpleperf record` child process, can pause and resume it around the code it is
//! interested in, and stops it to get a recording file in its own data directory.
//!
//! [simpleperf]: https://android.googlesource.com/platform/system/extras/+/main/simpleperf/
//!
//! ### OS/CPU Support
//!
//! This crate only supports Linux and Android. It starts processes with
//! `clone(2)` and `CLONE_VM | CLONE_VFORK`.
//!
//! ### Usage
//!
//! ```no_run
//! use simpleperf_app_api::{options::RecordOptions, session::Session};
//!
//! let options = RecordOptions::default()
//!     .with_output_filename("startup.data")
//!     .record_dwarf_call_graph();
//! let session = Session::for_current_app();
//! session.start(&options);
//! // ... code to profile ...
//! session.stop();
//! ```
//!
//! The recording is written to `<app data dir>/simpleperf_data/startup.data`.
//!
//! ### Finding simpleperf
//!
//! When starting, the session looks for simpleperf in these places:
//! 1. `/data/local/tmp/simpleperf`, where `api_profiler.py` pushes it. Apps are not allowed to
//!    run it from there, so it is copied to `<app data dir>/simpleperf` and used only if the
//!    copy runs.
//! 2. `/system/bin/simpleperf`, available on Android >= Q.
//!
//! Recording also needs perf events to be enabled on the device (`security.perf_harden`
//! unset or 0). Both locations and the helper tools can be changed through
//! [`device::DevicePaths`] and [`session::SessionBuilder::with_device_paths`].
//!
//! ### Errors
//!
//! A half-started recording can't be recovered by the app, so the [`session::Session`]
//! methods abort the process when anything goes wrong, after logging the error with
//! [`tracing`] under the `simpleperf` target. Each method has a `try_` variant returning a
//! [`session::SessionError`] instead. To read the log of simpleperf itself, filter logcat with
//! `simpleperf`.

pub mod device;
pub mod options;
pub mod protocol;
pub mod session;
pub mod spawn;
