//! Jobserver Client
//!
//! Cooperative concurrency cap shared with a parent build tool (GNU
//! make protocol). The parent advertises a token pipe or FIFO in
//! `MAKEFLAGS`; each running command beyond the free implicit token
//! must hold a token read from it. Acquisition is strictly
//! non-blocking so a nested build can never deadlock its parent.

use std::os::fd::RawFd;

enum Mode {
    Disabled,
    /// Descriptors inherited from the parent (`--jobserver-auth=R,W`).
    /// Not ours to close.
    Fds { read_fd: RawFd, write_fd: RawFd },
    /// A FIFO we opened ourselves (`--jobserver-auth=fifo:PATH`).
    Fifo { read_fd: RawFd, write_fd: RawFd },
}

pub struct Jobserver {
    mode: Mode,
    /// Token bytes currently held, to be written back verbatim.
    tokens: Vec<u8>,
    /// Jobs currently counted against our capacity (including the one
    /// on the implicit token).
    in_use: usize,
}

impl Jobserver {
    /// Configure from `MAKEFLAGS`; degrades to disabled when absent or
    /// unusable.
    pub fn from_env() -> Self {
        match std::env::var("MAKEFLAGS") {
            Ok(flags) => Self::from_makeflags(&flags),
            Err(_) => Self::disabled(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
            tokens: Vec::new(),
            in_use: 0,
        }
    }

    pub fn from_makeflags(flags: &str) -> Self {
        let re = regex_lite::Regex::new(
            r"--jobserver-(?:auth|fds)=(?:fifo:([^ ]+)|(-?[0-9]+),(-?[0-9]+))",
        )
        .expect("jobserver regex");
        let captures = match re.captures(flags) {
            Some(c) => c,
            None => return Self::disabled(),
        };

        if let Some(path) = captures.get(1) {
            return Self::open_fifo(path.as_str());
        }

        let read_fd: RawFd = match captures.get(2).and_then(|m| m.as_str().parse().ok()) {
            Some(fd) if fd >= 0 => fd,
            _ => return Self::disabled(),
        };
        let write_fd: RawFd = match captures.get(3).and_then(|m| m.as_str().parse().ok()) {
            Some(fd) if fd >= 0 => fd,
            _ => return Self::disabled(),
        };
        // The descriptors are only usable if the parent actually passed
        // them down.
        let valid = unsafe {
            libc::fcntl(read_fd, libc::F_GETFD) != -1 && libc::fcntl(write_fd, libc::F_GETFD) != -1
        };
        if !valid {
            return Self::disabled();
        }
        Self {
            mode: Mode::Fds { read_fd, write_fd },
            tokens: Vec::new(),
            in_use: 0,
        }
    }

    fn open_fifo(path: &str) -> Self {
        let cpath = match std::ffi::CString::new(path) {
            Ok(c) => c,
            Err(_) => return Self::disabled(),
        };
        let read_fd = unsafe {
            libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        };
        if read_fd < 0 {
            return Self::disabled();
        }
        let write_fd =
            unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
        if write_fd < 0 {
            unsafe {
                libc::close(read_fd);
            }
            return Self::disabled();
        }
        Self {
            mode: Mode::Fifo { read_fd, write_fd },
            tokens: Vec::new(),
            in_use: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.mode, Mode::Disabled)
    }

    fn read_fd(&self) -> Option<RawFd> {
        match self.mode {
            Mode::Disabled => None,
            Mode::Fds { read_fd, .. } | Mode::Fifo { read_fd, .. } => Some(read_fd),
        }
    }

    fn write_fd(&self) -> Option<RawFd> {
        match self.mode {
            Mode::Disabled => None,
            Mode::Fds { write_fd, .. } | Mode::Fifo { write_fd, .. } => Some(write_fd),
        }
    }

    /// Try to take capacity for one more job without blocking. The
    /// implicit token is always available; beyond that a token must be
    /// readable right now.
    pub fn acquire(&mut self) -> bool {
        if !self.enabled() {
            return true;
        }
        if self.in_use < 1 + self.tokens.len() {
            self.in_use += 1;
            return true;
        }
        if self.try_read_token() {
            self.in_use += 1;
            return true;
        }
        false
    }

    /// Give back capacity after a job finishes, returning surplus
    /// tokens to the parent promptly.
    pub fn release(&mut self) {
        if !self.enabled() || self.in_use == 0 {
            return;
        }
        self.in_use -= 1;
        if self.tokens.len() > self.in_use {
            self.write_back_token();
        }
    }

    fn try_read_token(&mut self) -> bool {
        let fd = match self.read_fd() {
            Some(fd) => fd,
            None => return false,
        };
        // Poll first: the descriptor may be shared (and blocking) when
        // inherited from the parent.
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if rc <= 0 || pollfd.revents & libc::POLLIN == 0 {
            return false;
        }
        let mut token = 0u8;
        let n = unsafe { libc::read(fd, &mut token as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            self.tokens.push(token);
            true
        } else {
            false
        }
    }

    fn write_back_token(&mut self) {
        let fd = match self.write_fd() {
            Some(fd) => fd,
            None => return,
        };
        if let Some(token) = self.tokens.pop() {
            unsafe {
                libc::write(fd, &token as *const u8 as *const libc::c_void, 1);
            }
        }
    }
}

impl Drop for Jobserver {
    fn drop(&mut self) {
        // Return anything still held, then close FIFO descriptors we
        // opened ourselves.
        while !self.tokens.is_empty() {
            self.write_back_token();
        }
        if let Mode::Fifo { read_fd, write_fd } = self.mode {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_always_acquires() {
        let mut js = Jobserver::disabled();
        assert!(!js.enabled());
        for _ in 0..100 {
            assert!(js.acquire());
        }
    }

    #[test]
    fn test_no_makeflags_disables() {
        assert!(!Jobserver::from_makeflags("").enabled());
        assert!(!Jobserver::from_makeflags("-j8 -k").enabled());
    }

    #[test]
    fn test_negative_fds_disable() {
        assert!(!Jobserver::from_makeflags("--jobserver-auth=-1,-1").enabled());
    }

    #[test]
    fn test_missing_fifo_disables() {
        assert!(
            !Jobserver::from_makeflags("--jobserver-auth=fifo:/nonexistent/jb-fifo").enabled()
        );
    }

    #[test]
    fn test_token_accounting_over_pipe() {
        // Stand in for the parent with a pipe preloaded with 2 tokens.
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::write(fds[1], b"++".as_ptr() as *const libc::c_void, 2);
        }
        let mut js = Jobserver {
            mode: Mode::Fds {
                read_fd: fds[0],
                write_fd: fds[1],
            },
            tokens: Vec::new(),
            in_use: 0,
        };

        // Implicit token plus the two in the pipe.
        assert!(js.acquire());
        assert!(js.acquire());
        assert!(js.acquire());
        assert!(!js.acquire());

        // Releasing returns surplus tokens to the pipe.
        js.release();
        js.release();
        let mut buf = [0u8; 4];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 1, "one token should be back in the pipe");

        drop(js);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
