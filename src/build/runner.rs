//! Command Runners
//!
//! The driver hands evaluated command strings to a `CommandRunner` and
//! waits for completions; it never talks to processes directly. The
//! real runner wraps the subprocess set and the jobserver client; the
//! dry-run runner pretends everything succeeds instantly; tests supply
//! scripted runners.

use std::collections::{HashMap, VecDeque};

use crate::graph::{BuildError, EdgeId};
use crate::jobserver::Jobserver;
use crate::process::{ExitStatus, SubprocessSet};

#[derive(Debug)]
pub struct CommandResult {
    pub edge: EdgeId,
    pub status: ExitStatus,
    pub output: String,
}

pub trait CommandRunner {
    /// Whether another command may start now. May reserve jobserver
    /// capacity; the reservation is consumed by the next
    /// start_command().
    fn can_run_more(&mut self) -> bool;

    fn start_command(
        &mut self,
        edge: EdgeId,
        command: &str,
        use_console: bool,
    ) -> Result<(), BuildError>;

    /// Block until some command completes. None means the build was
    /// interrupted by a signal.
    fn wait_for_command(&mut self) -> Option<CommandResult>;

    /// Edges currently running, for cleanup after failure or interrupt.
    fn active_edges(&self) -> Vec<EdgeId>;

    /// Terminate everything still running and reap it.
    fn abort(&mut self);
}

pub struct RealCommandRunner {
    subprocs: SubprocessSet,
    jobserver: Jobserver,
    max_jobs: usize,
    token_to_edge: HashMap<u64, EdgeId>,
    /// A jobserver slot acquired by can_run_more() awaiting its
    /// start_command().
    reserved: bool,
}

impl RealCommandRunner {
    pub fn new(max_jobs: usize, jobserver: Jobserver) -> std::io::Result<Self> {
        Ok(Self {
            subprocs: SubprocessSet::new()?,
            jobserver,
            max_jobs,
            token_to_edge: HashMap::new(),
            reserved: false,
        })
    }
}

impl CommandRunner for RealCommandRunner {
    fn can_run_more(&mut self) -> bool {
        if self.token_to_edge.len() >= self.max_jobs {
            return false;
        }
        if self.reserved {
            return true;
        }
        if self.jobserver.acquire() {
            self.reserved = true;
            return true;
        }
        false
    }

    fn start_command(
        &mut self,
        edge: EdgeId,
        command: &str,
        use_console: bool,
    ) -> Result<(), BuildError> {
        let token = self
            .subprocs
            .add(command, use_console)
            .map_err(|e| BuildError::Spawn(e.to_string()))?;
        self.token_to_edge.insert(token, edge);
        self.reserved = false;
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        loop {
            if let Some(mut subprocess) = self.subprocs.next_finished() {
                let status = subprocess.finish();
                self.jobserver.release();
                if let Some(edge) = self.token_to_edge.remove(&subprocess.token) {
                    return Some(CommandResult {
                        edge,
                        status,
                        output: subprocess.output(),
                    });
                }
                continue;
            }
            if self.subprocs.do_work(None) {
                return None;
            }
        }
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        self.token_to_edge.values().copied().collect()
    }

    fn abort(&mut self) {
        let sig = self.subprocs.interrupt_signal().unwrap_or(libc::SIGTERM);
        self.subprocs.clear(sig);
        self.token_to_edge.clear();
    }
}

/// Runner for `-n`: reports every command as instantly successful
/// without executing anything.
#[derive(Default)]
pub struct DryRunCommandRunner {
    queue: VecDeque<EdgeId>,
}

impl DryRunCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandRunner for DryRunCommandRunner {
    fn can_run_more(&mut self) -> bool {
        true
    }

    fn start_command(
        &mut self,
        edge: EdgeId,
        _command: &str,
        _use_console: bool,
    ) -> Result<(), BuildError> {
        self.queue.push_back(edge);
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        self.queue.pop_front().map(|edge| CommandResult {
            edge,
            status: ExitStatus::Success,
            output: String::new(),
        })
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        self.queue.iter().copied().collect()
    }

    fn abort(&mut self) {
        self.queue.clear();
    }
}
