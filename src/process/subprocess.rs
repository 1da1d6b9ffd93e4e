//! Single Subprocess
//!
//! One child process running `/bin/sh -c command` in its own process
//! group. Stdout and stderr are merged into one pipe whose read end the
//! set polls; the full buffer is delivered only on completion, so
//! output from concurrent children never interleaves.
//!
//! Console children inherit the parent's stdio instead of the pipe,
//! but still carry the pipe's write end so their exit is observable as
//! EOF like everyone else's.

use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};

/// How a child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure(i32),
    /// Terminated by an interrupt-class signal.
    Interrupted,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

pub struct Subprocess {
    /// Set-assigned handle, used by callers to map children to edges.
    pub token: u64,
    pub use_console: bool,
    child: Child,
    fd: Option<RawFd>,
    buf: Vec<u8>,
}

impl Subprocess {
    pub(crate) fn start(token: u64, command: &str, use_console: bool) -> std::io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        // The read end stays in this process only.
        unsafe {
            libc::fcntl(read_fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        // Each child gets its own process group so cancellation can
        // signal the whole tree it spawns.
        cmd.process_group(0);

        if use_console {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            // write_fd is not close-on-exec, so the child inherits it
            // and EOF still reports its exit.
        } else {
            let err_fd = unsafe { libc::dup(write_fd) };
            if err_fd < 0 {
                let e = std::io::Error::last_os_error();
                unsafe {
                    libc::close(read_fd);
                    libc::close(write_fd);
                }
                return Err(e);
            }
            cmd.stdin(Stdio::null());
            cmd.stdout(unsafe { Stdio::from_raw_fd(write_fd) });
            cmd.stderr(unsafe { Stdio::from_raw_fd(err_fd) });
        }

        let spawned = cmd.spawn();
        if use_console {
            // Our copy of the write end; the child keeps its own.
            unsafe {
                libc::close(write_fd);
            }
        }
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                unsafe {
                    libc::close(read_fd);
                }
                return Err(e);
            }
        };

        Ok(Self {
            token,
            use_console,
            child,
            fd: Some(read_fd),
            buf: Vec::new(),
        })
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    /// Service a readable pipe. Returns true once EOF is reached, i.e.
    /// the child has exited and its output is complete.
    pub(crate) fn on_pipe_ready(&mut self) -> bool {
        let fd = match self.fd {
            Some(fd) => fd,
            None => return true,
        };
        let mut chunk = [0u8; 4096];
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n > 0 {
            self.buf.extend_from_slice(&chunk[..n as usize]);
            return false;
        }
        unsafe {
            libc::close(fd);
        }
        self.fd = None;
        true
    }

    /// Reap the child and classify its exit.
    pub fn finish(&mut self) -> ExitStatus {
        match self.child.wait() {
            Ok(status) => match status.code() {
                Some(0) => ExitStatus::Success,
                Some(code) => ExitStatus::Failure(code),
                None => match status.signal() {
                    Some(libc::SIGINT) | Some(libc::SIGTERM) | Some(libc::SIGHUP) => {
                        ExitStatus::Interrupted
                    }
                    Some(sig) => ExitStatus::Failure(128 + sig),
                    None => ExitStatus::Failure(-1),
                },
            },
            Err(_) => ExitStatus::Failure(-1),
        }
    }

    /// The merged stdout+stderr captured so far.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// Forward a signal to the child's process group.
    pub fn signal_group(&self, sig: i32) {
        let pgid = self.child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pgid, sig);
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
