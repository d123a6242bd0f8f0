// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    ffi::{c_char, c_int, c_void, CString, OsStr},
    io,
    os::{fd::RawFd, unix::ffi::OsStrExt},
    path::Path,
    ptr,
};

use nix::unistd::Pid;

use super::SpawnError;

/// Exit code of a child that could not set up its stdio.
pub(crate) const EXIT_REDIRECT_FAILED: i32 = 125;
/// Exit code of a child that could not change into its working directory.
pub(crate) const EXIT_CHDIR_FAILED: i32 = 126;
/// Exit code of a child whose exec failed.
pub(crate) const EXIT_EXEC_FAILED: i32 = 127;

/// Everything the child needs between `clone` and `execv`, allocated up front.
pub(crate) struct ExecPlan {
    // owns the strings `argv` points into
    args: Vec<CString>,
    argv: Vec<*const c_char>,
    cwd: Option<CString>,
}

impl ExecPlan {
    pub(crate) fn new<S: AsRef<OsStr>>(args: &[S], cwd: Option<&Path>) -> Result<Self, SpawnError> {
        if args.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        let args = args
            .iter()
            .map(|arg| to_cstring(arg.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut argv: Vec<*const c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(ptr::null());
        let cwd = cwd.map(|dir| to_cstring(dir.as_os_str())).transpose()?;
        Ok(Self { args, argv, cwd })
    }

    pub(crate) fn program(&self) -> &OsStr {
        OsStr::from_bytes(self.args[0].as_bytes())
    }
}

fn to_cstring(s: &OsStr) -> Result<CString, SpawnError> {
    CString::new(s.as_bytes()).map_err(|_| SpawnError::NulByte(s.to_string_lossy().into_owned()))
}

/// Descriptors the child gets on its stdin and stdout, plus descriptors it closes first.
pub(crate) struct ChildFds<'a> {
    pub(crate) stdin: RawFd,
    pub(crate) stdout: RawFd,
    pub(crate) close: &'a [RawFd],
}

/// Stack the child runs on until it execs.
const CHILD_STACK_SIZE: usize = 64 * 1024;

struct ChildArgs<'a> {
    plan: &'a ExecPlan,
    fds: &'a ChildFds<'a>,
}

/// Starts `plan` in a child sharing our address space, like `vfork(2)`.
///
/// `clone(CLONE_VM | CLONE_VFORK)` rather than `fork` keeps atfork handlers registered by
/// other native libraries from running in the child, where they have been seen to deadlock.
/// The child runs [`child_main`] on its own stack, so nothing it does touches our frames, and
/// we stay suspended until it execs or exits. It only reads memory prepared in `plan` and
/// only calls async-signal-safe functions. Failures in the child are reported through its
/// exit code: [`EXIT_REDIRECT_FAILED`], [`EXIT_CHDIR_FAILED`] or [`EXIT_EXEC_FAILED`].
pub(crate) fn clone_exec(plan: &ExecPlan, fds: &ChildFds<'_>) -> io::Result<Pid> {
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    // the stack grows down on every supported target; clone wants its top, 16-byte aligned
    let top = stack.as_mut_ptr().wrapping_add(CHILD_STACK_SIZE);
    let top = top.wrapping_sub(top as usize % 16);
    let mut args = ChildArgs { plan, fds };

    // SAFETY: CLONE_VFORK suspends this thread until the child execs or exits, so `stack`
    // and `args` outlive every access the child makes to them.
    let pid = unsafe {
        libc::clone(
            child_main,
            top.cast::<c_void>(),
            libc::CLONE_VM | libc::CLONE_VFORK | libc::SIGCHLD,
            ptr::from_mut(&mut args).cast::<c_void>(),
        )
    };
    // read errno before freeing the stack can touch it
    let result = match pid {
        -1 => Err(io::Error::last_os_error()),
        pid => Ok(Pid::from_raw(pid)),
    };
    drop(stack);
    result
}

/// Entry point of the cloned child. Never returns.
extern "C" fn child_main(arg: *mut c_void) -> c_int {
    // SAFETY: `arg` is the `ChildArgs` built by `clone_exec`, whose thread is suspended
    // until we exec or exit.
    let ChildArgs { plan, fds } = unsafe { &*arg.cast::<ChildArgs<'_>>() };
    // SAFETY: only async-signal-safe calls, no allocation, and every pointer was built
    // before the clone.
    unsafe {
        for &fd in fds.close {
            libc::close(fd);
        }
        if !redirect(fds.stdin, libc::STDIN_FILENO)
            || !redirect(fds.stdout, libc::STDOUT_FILENO)
        {
            libc::_exit(EXIT_REDIRECT_FAILED);
        }
        if let Some(cwd) = &plan.cwd {
            if libc::chdir(cwd.as_ptr()) == -1 {
                libc::_exit(EXIT_CHDIR_FAILED);
            }
        }
        libc::execv(plan.argv[0], plan.argv.as_ptr());
        libc::_exit(EXIT_EXEC_FAILED)
    }
}

/// Makes `target` refer to `fd` across exec. Only runs in the cloned child.
unsafe fn redirect(fd: RawFd, target: RawFd) -> bool {
    if fd == target {
        // dup2 onto itself would keep O_CLOEXEC set
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) != -1 }
    } else {
        unsafe { libc::dup2(fd, target) != -1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rejects_nul_bytes() {
        let err = ExecPlan::new(&["/bin/true", "a\0b"], None)
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::NulByte(arg) if arg == "a\0b"));
    }

    #[test]
    fn test_plan_rejects_empty_command() {
        let args: [&str; 0] = [];
        assert!(matches!(
            ExecPlan::new(&args, None),
            Err(SpawnError::EmptyCommand)
        ));
    }

    #[test]
    fn test_plan_argv_is_null_terminated() {
        let plan = ExecPlan::new(&["/bin/echo", "hi"], Some(Path::new("/tmp"))).unwrap();
        assert_eq!(plan.program(), "/bin/echo");
        assert_eq!(plan.argv.len(), 3);
        assert!(plan.argv[2].is_null());
        assert_eq!(plan.cwd.as_deref(), Some(c"/tmp"));
    }
}
