//! Subprocess Set
//!
//! Owns the running children and multiplexes their output pipes with
//! `poll`. SIGINT/SIGTERM/SIGHUP are caught by a handler that writes to
//! a self-pipe included in every poll set, so a signal interrupts the
//! wait without races.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::process::subprocess::Subprocess;

static INTERRUPT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(sig: libc::c_int) {
    INTERRUPT_SIGNAL.store(sig, Ordering::Relaxed);
    let fd = SELF_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"!".as_ptr() as *const libc::c_void, 1);
        }
    }
}

const HANDLED_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

pub struct SubprocessSet {
    running: Vec<Subprocess>,
    finished: VecDeque<Subprocess>,
    self_pipe_read: RawFd,
    self_pipe_write: RawFd,
    old_actions: Vec<(libc::c_int, libc::sigaction)>,
    next_token: u64,
}

impl SubprocessSet {
    pub fn new() -> std::io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        INTERRUPT_SIGNAL.store(0, Ordering::Relaxed);
        SELF_PIPE_WRITE.store(fds[1], Ordering::Relaxed);

        let mut old_actions = Vec::new();
        for sig in HANDLED_SIGNALS {
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as usize;
                libc::sigemptyset(&mut action.sa_mask);
                // No SA_RESTART: poll must return EINTR.
                action.sa_flags = 0;
                let mut old: libc::sigaction = std::mem::zeroed();
                libc::sigaction(sig, &action, &mut old);
                old_actions.push((sig, old));
            }
        }

        Ok(Self {
            running: Vec::new(),
            finished: VecDeque::new(),
            self_pipe_read: fds[0],
            self_pipe_write: fds[1],
            old_actions,
            next_token: 0,
        })
    }

    /// Launch a command. Returns a token for matching the finished
    /// child back to its edge.
    pub fn add(&mut self, command: &str, use_console: bool) -> std::io::Result<u64> {
        let token = self.next_token;
        self.next_token += 1;
        let subprocess = Subprocess::start(token, command, use_console)?;
        self.running.push(subprocess);
        Ok(token)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn has_finished(&self) -> bool {
        !self.finished.is_empty()
    }

    /// The signal that interrupted us, if any.
    pub fn interrupt_signal(&self) -> Option<i32> {
        match INTERRUPT_SIGNAL.load(Ordering::Relaxed) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// Service pipes until something completes, a signal arrives, or
    /// the timeout expires. Returns true when interrupted.
    pub fn do_work(&mut self, timeout: Option<Duration>) -> bool {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.running.len() + 1);
        pollfds.push(libc::pollfd {
            fd: self.self_pipe_read,
            events: libc::POLLIN,
            revents: 0,
        });
        for subprocess in &self.running {
            if let Some(fd) = subprocess.fd() {
                pollfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
        }

        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let rc = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
        };
        if rc < 0 {
            // EINTR means a signal fired; fall through to the check.
            return self.interrupted();
        }

        if pollfds[0].revents != 0 {
            self.drain_self_pipe();
            return self.interrupted();
        }

        let mut fd_index = 1;
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].fd().is_none() {
                i += 1;
                continue;
            }
            let revents = pollfds[fd_index].revents;
            fd_index += 1;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                && self.running[i].on_pipe_ready()
            {
                let done = self.running.remove(i);
                self.finished.push_back(done);
                continue;
            }
            i += 1;
        }

        self.interrupted()
    }

    fn interrupted(&self) -> bool {
        self.interrupt_signal().is_some()
    }

    fn drain_self_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.self_pipe_read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn next_finished(&mut self) -> Option<Subprocess> {
        self.finished.pop_front()
    }

    /// Signal every running child's process group and reap them all.
    pub fn clear(&mut self, sig: i32) {
        for subprocess in &self.running {
            // Console children share the terminal's foreground group
            // and already saw the interactive signal.
            if !subprocess.use_console {
                subprocess.signal_group(sig);
            }
        }
        while !self.running.is_empty() {
            self.do_work(Some(Duration::from_millis(100)));
        }
        self.finished.clear();
    }
}

impl Drop for SubprocessSet {
    fn drop(&mut self) {
        for (sig, old) in self.old_actions.drain(..) {
            unsafe {
                libc::sigaction(sig, &old, std::ptr::null_mut());
            }
        }
        SELF_PIPE_WRITE.store(-1, Ordering::Relaxed);
        unsafe {
            libc::close(self.self_pipe_read);
            libc::close(self.self_pipe_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ExitStatus;

    fn wait_all(set: &mut SubprocessSet, expected: usize) -> Vec<Subprocess> {
        let mut done = Vec::new();
        let mut spins = 0;
        while done.len() < expected && spins < 1000 {
            set.do_work(Some(Duration::from_millis(100)));
            while let Some(subprocess) = set.next_finished() {
                done.push(subprocess);
            }
            spins += 1;
        }
        done
    }

    #[test]
    fn test_capture_output() {
        let mut set = SubprocessSet::new().unwrap();
        set.add("echo hello", false).unwrap();
        let mut done = wait_all(&mut set, 1);
        assert_eq!(done.len(), 1);
        let mut subprocess = done.remove(0);
        assert_eq!(subprocess.finish(), ExitStatus::Success);
        assert_eq!(subprocess.output(), "hello\n");
    }

    #[test]
    fn test_stderr_merged() {
        let mut set = SubprocessSet::new().unwrap();
        set.add("echo out; echo err >&2", false).unwrap();
        let mut done = wait_all(&mut set, 1);
        let mut subprocess = done.remove(0);
        subprocess.finish();
        assert_eq!(subprocess.output(), "out\nerr\n");
    }

    #[test]
    fn test_exit_code() {
        let mut set = SubprocessSet::new().unwrap();
        set.add("exit 3", false).unwrap();
        let mut done = wait_all(&mut set, 1);
        assert_eq!(done[0].token, 0);
        assert_eq!(done.remove(0).finish(), ExitStatus::Failure(3));
    }

    #[test]
    fn test_multiple_children_output_stays_separate() {
        let mut set = SubprocessSet::new().unwrap();
        let t1 = set.add("printf aaaa", false).unwrap();
        let t2 = set.add("printf bbbb", false).unwrap();
        let done = wait_all(&mut set, 2);
        assert_eq!(done.len(), 2);
        for mut subprocess in done {
            let expected = if subprocess.token == t1 {
                "aaaa"
            } else {
                assert_eq!(subprocess.token, t2);
                "bbbb"
            };
            subprocess.finish();
            assert_eq!(subprocess.output(), expected);
        }
    }

    #[test]
    fn test_clear_terminates_children() {
        let mut set = SubprocessSet::new().unwrap();
        set.add("sleep 30", false).unwrap();
        set.clear(libc::SIGTERM);
        assert_eq!(set.running_count(), 0);
    }
}
