//! Purpose: Fixed-size pool of forked worker processes running the same entry function.
//! Exports: `WorkerPool`, `PoolOptions`, `PoolState`.
//! Role: Multi-process executor; workers report only an exit status.
//! Invariants: Slot `i` always refers to the most recent worker started for index `i`.
//! Invariants: Nothing is restarted automatically; replacement happens only through the
//! explicit `restart_*` calls.
//! Invariants: With synchronous start no worker runs its body until every worker exists.
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::process::{ChildProcess, SpawnOptions, spawn};

#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    pub workers: usize,
    /// Hold every worker at a start barrier until all of them are forked.
    pub synchronous_start: bool,
    /// Kill workers when the pool is dropped or this process dies.
    pub daemon: bool,
}

impl PoolOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            synchronous_start: true,
            daemon: false,
        }
    }

    pub fn with_synchronous_start(mut self, synchronous_start: bool) -> Self {
        self.synchronous_start = synchronous_start;
        self
    }

    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolState {
    Idle,
    Running,
    PartiallyFailed,
}

pub struct WorkerPool<F> {
    function: F,
    options: PoolOptions,
    workers: Vec<Option<ChildProcess>>,
}

impl<F> WorkerPool<F> {
    pub fn new(function: F, options: PoolOptions) -> Result<Self, Error> {
        if options.workers == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("worker pool needs at least one worker")
                .with_hint("Pass --workers 1 or more."));
        }
        Ok(Self {
            function,
            options,
            workers: (0..options.workers).map(|_| None).collect(),
        })
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn alive(&mut self) -> impl Iterator<Item = &mut ChildProcess> {
        self.workers
            .iter_mut()
            .flatten()
            .filter_map(|child| if child.is_alive() { Some(child) } else { None })
    }

    pub fn active_count(&mut self) -> usize {
        self.alive().count()
    }

    pub fn is_any_alive(&mut self) -> bool {
        self.alive().next().is_some()
    }

    /// Pid per slot; `None` for slots never started.
    pub fn pids(&self) -> Vec<Option<i32>> {
        self.workers
            .iter()
            .map(|slot| slot.as_ref().map(ChildProcess::pid))
            .collect()
    }

    /// Exit code per slot; `None` while running or never started.
    pub fn exit_codes(&mut self) -> Vec<Option<i32>> {
        self.workers
            .iter_mut()
            .map(|slot| slot.as_mut().and_then(ChildProcess::exit_code))
            .collect()
    }

    pub fn state(&mut self) -> PoolState {
        if self.is_any_alive() {
            return PoolState::Running;
        }
        if self.exit_codes().iter().flatten().any(|code| *code > 0) {
            return PoolState::PartiallyFailed;
        }
        PoolState::Idle
    }

    /// Waits for every worker to exit. Returns `false` if some are still alive at the deadline.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        for child in self.workers.iter_mut().flatten() {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if child.wait(remaining).is_none() {
                return false;
            }
        }
        true
    }

    pub fn signal(&mut self, sig: libc::c_int) -> Result<(), Error> {
        for child in self.alive() {
            child.signal(sig)?;
        }
        Ok(())
    }

    pub fn terminate(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&mut self) -> Result<(), Error> {
        self.signal(libc::SIGKILL)
    }
}

impl<F> WorkerPool<F> {
    fn spawn_worker<A>(&self, args: A, suspended: bool) -> Result<ChildProcess, Error>
    where
        F: Fn(A) -> i32,
    {
        let options = SpawnOptions::new()
            .with_suspended(suspended)
            .with_daemon(self.options.daemon);
        let function = &self.function;
        spawn(options, move || function(args))
    }

    /// Spawns one worker per listed slot, all held at the start barrier when
    /// `synchronous` and released together once every one exists.
    fn launch<A>(&mut self, args: &A, slots: &[usize], synchronous: bool) -> Result<(), Error>
    where
        F: Fn(A) -> i32,
        A: Clone,
    {
        let mut started = Vec::with_capacity(slots.len());
        for _ in slots {
            match self.spawn_worker(args.clone(), synchronous) {
                Ok(child) => started.push(child),
                Err(err) => {
                    discard(&mut started);
                    return Err(err);
                }
            }
        }
        if synchronous {
            let resumed = started.iter_mut().try_for_each(ChildProcess::resume);
            if let Err(err) = resumed {
                discard(&mut started);
                return Err(err);
            }
        }
        for (slot, child) in slots.iter().zip(started) {
            self.workers[*slot] = Some(child);
        }
        Ok(())
    }

    pub fn start<A>(&mut self, args: A) -> Result<(), Error>
    where
        F: Fn(A) -> i32,
        A: Clone,
    {
        if self.is_any_alive() {
            return Err(Error::new(ErrorKind::AlreadyRunning)
                .with_message("worker pool is already running")
                .with_hint("Wait for the workers or kill them before starting again."));
        }
        let slots: Vec<usize> = (0..self.workers.len()).collect();
        self.launch(&args, &slots, self.options.synchronous_start)?;
        tracing::debug!(
            workers = slots.len(),
            synchronous = self.options.synchronous_start,
            "worker pool started"
        );
        Ok(())
    }

    fn restart_where<A, P>(&mut self, args: A, label: &str, predicate: P) -> Result<usize, Error>
    where
        F: Fn(A) -> i32,
        A: Clone,
        P: Fn(i32) -> bool,
    {
        let slots: Vec<usize> = self
            .exit_codes()
            .into_iter()
            .enumerate()
            .filter_map(|(slot, code)| code.filter(|code| predicate(*code)).map(|_| slot))
            .collect();
        for slot in &slots {
            tracing::warn!(slot, kind = label, "restarting worker");
        }
        self.launch(&args, &slots, false)?;
        Ok(slots.len())
    }

    /// Replaces every worker that has exited, whatever its status.
    pub fn restart_closed<A>(&mut self, args: A) -> Result<usize, Error>
    where
        F: Fn(A) -> i32,
        A: Clone,
    {
        self.restart_where(args, "closed", |_| true)
    }

    /// Replaces workers that exited with a positive status; signal deaths are left alone.
    pub fn restart_failed<A>(&mut self, args: A) -> Result<usize, Error>
    where
        F: Fn(A) -> i32,
        A: Clone,
    {
        self.restart_where(args, "failed", |code| code > 0)
    }

    /// Interrupts every live worker, kills those still alive after `grace_period`,
    /// then starts a full new set.
    pub fn restart_all<A>(&mut self, args: A, grace_period: Duration) -> Result<usize, Error>
    where
        F: Fn(A) -> i32,
        A: Clone,
    {
        self.signal(libc::SIGINT)?;
        if !self.wait(Some(grace_period)) {
            for child in self.alive() {
                tracing::warn!(pid = child.pid(), "worker ignored SIGINT; killing");
                child.kill()?;
            }
            self.wait(None);
        }
        let slots: Vec<usize> = (0..self.workers.len()).collect();
        self.launch(&args, &slots, self.options.synchronous_start)?;
        tracing::warn!(workers = slots.len(), "worker pool restarted");
        Ok(slots.len())
    }
}

/// Kills and reaps workers from a launch that could not complete; stopped ones included.
fn discard(started: &mut [ChildProcess]) {
    for child in started {
        let _ = child.kill();
        child.wait(None);
    }
}
