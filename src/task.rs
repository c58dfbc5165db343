//! Purpose: Run one callable on a fresh thread or forked process and hand back its future.
//! Exports: `TaskHandle`, `Backing`.
//! Role: Smallest executor; `WorkerPool` and `PinnedTask` cover the multi-process cases.
//! Invariants: A handle owns at most one launched unit; relaunching while it runs fails
//! with `AlreadyRunning`.
//! Invariants: Task failures (errors, panics, SIGINT) travel through the future only; the
//! launching context never sees them as its own errors.
//! Invariants: Killing a process task leaves its future pending.
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use signal_hook::consts::SIGINT;
use signal_hook::iterator::Signals;

use crate::core::error::{Error, ErrorKind};
use crate::core::outcome::{Outcome, TaskError};
use crate::core::process::{ChildProcess, SpawnOptions, spawn};
use crate::future::process::{self, ProcessConsumer, ProcessProducer};
use crate::future::thread::{Consumer, unbound_pair};

const JOIN_POLL: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backing {
    Thread,
    Process,
}

enum Unit {
    Thread(Option<JoinHandle<()>>),
    Process(ChildProcess),
}

pub struct TaskHandle<F> {
    function: Arc<F>,
    unit: Option<Unit>,
}

impl<F> TaskHandle<F> {
    pub fn new(function: F) -> Self {
        Self {
            function: Arc::new(function),
            unit: None,
        }
    }

    pub fn backing(&self) -> Option<Backing> {
        self.unit.as_ref().map(|unit| match unit {
            Unit::Thread(_) => Backing::Thread,
            Unit::Process(_) => Backing::Process,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        match &self.unit {
            Some(Unit::Process(child)) => Some(child.pid()),
            _ => None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        match &mut self.unit {
            None => false,
            Some(Unit::Thread(handle)) => handle.as_ref().is_some_and(|handle| !handle.is_finished()),
            Some(Unit::Process(child)) => child.is_alive(),
        }
    }

    fn ensure_idle(&mut self) -> Result<(), Error> {
        if self.is_running() {
            let mut err = Error::new(ErrorKind::AlreadyRunning).with_message("task is still running");
            if let Some(pid) = self.pid() {
                err = err.with_pid(pid);
            }
            return Err(err);
        }
        Ok(())
    }

    fn child(&mut self, action: &str) -> Result<&mut ChildProcess, Error> {
        match &mut self.unit {
            Some(Unit::Process(child)) => Ok(child),
            Some(Unit::Thread(_)) => Err(Error::new(ErrorKind::NotSupported)
                .with_message(format!("cannot {action} a thread-backed task"))),
            None => Err(Error::new(ErrorKind::Usage).with_message("task was never launched")),
        }
    }

    pub fn suspend(&mut self) -> Result<(), Error> {
        self.child("suspend")?.suspend()
    }

    pub fn resume(&mut self) -> Result<(), Error> {
        self.child("resume")?.resume()
    }

    pub fn kill(&mut self) -> Result<(), Error> {
        self.child("kill")?.kill()
    }

    /// Waits for the launched unit to finish; returns `TimedOut` if it is still running.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        match &mut self.unit {
            None => Ok(()),
            Some(Unit::Process(child)) => match child.wait(timeout) {
                Some(_) => Ok(()),
                None => Err(join_timed_out().with_pid(child.pid())),
            },
            Some(Unit::Thread(slot)) => {
                let Some(handle) = slot.take() else {
                    return Ok(());
                };
                while !handle.is_finished() {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        *slot = Some(handle);
                        return Err(join_timed_out());
                    }
                    std::thread::sleep(JOIN_POLL);
                }
                // The body's panics are caught inside the thread, so join only fails on
                // a panic in the delivery path.
                if handle.join().is_err() {
                    return Err(Error::new(ErrorKind::Internal).with_message("task thread panicked"));
                }
                Ok(())
            }
        }
    }

    /// Runs `function(args)` on a new thread; the thread is the producer of the returned future.
    pub fn launch_thread<A, T, E>(&mut self, args: A) -> Result<Consumer<T>, Error>
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + Sync + 'static,
        E: Display,
    {
        self.ensure_idle()?;
        let (producer, consumer) = unbound_pair();
        let function = self.function.clone();
        let handle = std::thread::Builder::new()
            .name("tandem-task".to_string())
            .spawn(move || {
                producer.bind_current();
                let outcome = run_body(|| function(args));
                if let Err(err) = producer.fulfill(outcome) {
                    tracing::error!(error = %err, "thread task could not deliver its outcome");
                }
            })
            .map_err(|err| Error::io(err).with_message("failed to spawn task thread"))?;
        tracing::debug!("launched thread task");
        self.unit = Some(Unit::Thread(Some(handle)));
        Ok(consumer)
    }

    /// Runs `function(args)` in a forked child; the child is the producer of the returned future.
    pub fn launch_process<A, T, E>(&mut self, args: A) -> Result<ProcessConsumer<T>, Error>
    where
        F: Fn(A) -> Result<T, E>,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Display,
    {
        self.ensure_idle()?;
        let (producer, consumer) = process::channel::<T>()?;
        let function = self.function.clone();
        let child = spawn(SpawnOptions::new(), move || {
            run_process_task(producer, || run_body(|| function(args)))
        })?;
        tracing::debug!(pid = child.pid(), "launched process task");
        self.unit = Some(Unit::Process(child));
        Ok(consumer)
    }
}

fn join_timed_out() -> Error {
    Error::new(ErrorKind::TimedOut).with_message("task still running")
}

fn run_body<T, E, B>(body: B) -> Outcome<T>
where
    B: FnOnce() -> Result<T, E>,
    E: Display,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => Outcome::from_task(result),
        Err(payload) => Outcome::Error(TaskError::from_panic(payload.as_ref())),
    }
}

type ProducerSlot<T> = Arc<Mutex<Option<ProcessProducer<T>>>>;

fn take_producer<T>(slot: &ProducerSlot<T>) -> Option<ProcessProducer<T>> {
    lock_slot(slot).take()
}

fn lock_slot<T>(slot: &ProducerSlot<T>) -> MutexGuard<'_, Option<ProcessProducer<T>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Child-side driver: exit 0 after delivering a value, 1 after delivering an error.
fn run_process_task<T, B>(mut producer: ProcessProducer<T>, body: B) -> i32
where
    T: Serialize + Send + 'static,
    B: FnOnce() -> Outcome<T>,
{
    producer.bind_current();
    let slot: ProducerSlot<T> = Arc::new(Mutex::new(Some(producer)));
    if let Err(err) = watch_interrupt(slot.clone()) {
        eprintln!("tandem: interrupt watcher unavailable: {err}");
    }

    let outcome = body();
    let failed = outcome.is_err();
    // The watcher may have claimed the producer already; its reply wins.
    let Some(mut producer) = take_producer(&slot) else {
        return 1;
    };
    match producer.send(outcome) {
        Ok(()) if !failed => 0,
        Ok(()) => 1,
        Err(err) => {
            eprintln!("tandem: failed to deliver task outcome: {err}");
            1
        }
    }
}

/// On SIGINT, replies with an `Interrupted` error and then dies of the signal.
fn watch_interrupt<T>(slot: ProducerSlot<T>) -> Result<(), Error>
where
    T: Serialize + Send + 'static,
{
    let mut signals = Signals::new([SIGINT]).map_err(|err| Error::io(err).with_message("failed to register SIGINT"))?;
    std::thread::Builder::new()
        .name("tandem-sigint".to_string())
        .spawn(move || {
            if signals.forever().next().is_none() {
                return;
            }
            if let Some(mut producer) = take_producer(&slot) {
                let _ = producer.throw(TaskError::interrupted());
            }
            let _ = signal_hook::low_level::emulate_default_handler(SIGINT);
        })
        .map_err(|err| Error::io(err).with_message("failed to start SIGINT watcher"))?;
    Ok(())
}
