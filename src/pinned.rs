// Single-task process executor pinned to one CPU core, plus the round-robin core allocator.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
use crate::core::process::{ChildProcess, SpawnOptions, allowed_cores, set_affinity, spawn};

/// Hands out cores in round-robin order; shared by every task that should spread out.
#[derive(Debug)]
pub struct CoreAllocator {
    cores: Vec<usize>,
    next: AtomicUsize,
}

impl CoreAllocator {
    pub fn new() -> Self {
        Self::from_list(allowed_cores())
    }

    pub fn with_cores(cores: Vec<usize>) -> Result<Self, Error> {
        if cores.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("core list is empty"));
        }
        Ok(Self::from_list(cores))
    }

    fn from_list(cores: Vec<usize>) -> Self {
        Self {
            cores,
            next: AtomicUsize::new(0),
        }
    }

    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    pub fn next_core(&self) -> usize {
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        self.cores[turn % self.cores.len()]
    }
}

impl Default for CoreAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PinnedTask<F> {
    function: F,
    core: usize,
    child: Option<ChildProcess>,
}

impl<F> PinnedTask<F>
where
    F: Fn() -> i32,
{
    pub fn new(allocator: &CoreAllocator, function: F) -> Self {
        Self {
            function,
            core: allocator.next_core(),
            child: None,
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(ChildProcess::pid)
    }

    pub fn is_alive(&mut self) -> bool {
        self.child.as_mut().is_some_and(ChildProcess::is_alive)
    }

    /// Forks the task held at its start barrier, pins it, then lets it run.
    pub fn start(&mut self, daemon: bool) -> Result<i32, Error> {
        if self.is_alive() {
            let mut err = Error::new(ErrorKind::AlreadyRunning).with_message("pinned task is still running");
            if let Some(pid) = self.pid() {
                err = err.with_pid(pid);
            }
            return Err(err);
        }
        let function = &self.function;
        let mut child = spawn(
            SpawnOptions::new().with_suspended(true).with_daemon(daemon),
            move || function(),
        )?;
        if let Err(err) = set_affinity(child.pid(), self.core) {
            let _ = child.kill();
            child.wait(None);
            return Err(err);
        }
        child.resume()?;
        let pid = child.pid();
        tracing::debug!(pid, core = self.core, "pinned task started");
        self.child = Some(child);
        Ok(pid)
    }

    pub fn signal(&mut self, sig: libc::c_int) -> Result<(), Error> {
        match &mut self.child {
            Some(child) => child.signal(sig),
            None => Err(Error::new(ErrorKind::Usage).with_message("pinned task was never started")),
        }
    }

    /// Exit code once finished; `None` if never started or still running at the deadline.
    pub fn join(&mut self, timeout: Option<Duration>) -> Option<i32> {
        self.child.as_mut().and_then(|child| child.wait(timeout))
    }
}
