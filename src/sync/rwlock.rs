//! Purpose: Fair reader-writer lock built on an ordered queue of waiter records.
//! Exports: `ReaderWriterLock`, `ReadGuard`, `WriteGuard`, `WaiterKind`.
//! Role: In-process coordination where writers must not starve behind a stream of readers.
//! Invariants: At most one writer record is active; only reader groups at the front of the
//! queue are active alongside each other; nothing ever jumps the queue.
//! Invariants: New readers merge into the tail group only when the tail is itself a reader group.
//! Invariants: Holders are tracked per thread, so releasing a lock the thread does not
//! hold fails with `NotAcquired`.
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaiterKind {
    Readers,
    Writer,
}

struct Record {
    id: u64,
    kind: WaiterKind,
    pending: usize,
    active: bool,
    ready: Arc<Condvar>,
}

#[derive(Default)]
struct RwState {
    queue: VecDeque<Record>,
    next_id: u64,
    readers: HashMap<ThreadId, Vec<u64>>,
    writer: Option<(ThreadId, u64)>,
}

impl RwState {
    fn enqueue(&mut self, kind: WaiterKind) -> u64 {
        if kind == WaiterKind::Readers {
            if let Some(tail) = self.queue.back_mut() {
                if tail.kind == WaiterKind::Readers {
                    tail.pending += 1;
                    return tail.id;
                }
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Record {
            id,
            kind,
            pending: 1,
            active: false,
            ready: Arc::new(Condvar::new()),
        });
        self.promote();
        id
    }

    fn record(&self, id: u64) -> Option<&Record> {
        self.queue.iter().find(|record| record.id == id)
    }

    /// Drops one participant from record `id`, removing the record when it empties.
    fn leave(&mut self, id: u64) {
        let Some(index) = self.queue.iter().position(|record| record.id == id) else {
            return;
        };
        let record = &mut self.queue[index];
        record.pending -= 1;
        if record.pending == 0 {
            self.queue.remove(index);
            self.promote();
        }
    }

    /// Activates the head record, plus every reader group directly behind a head reader group.
    fn promote(&mut self) {
        let mut head_kind = None;
        for record in self.queue.iter_mut() {
            match head_kind {
                None => head_kind = Some(record.kind),
                Some(WaiterKind::Readers) if record.kind == WaiterKind::Readers => {}
                Some(_) => break,
            }
            if !record.active {
                record.active = true;
                tracing::debug!(record = record.id, kind = ?record.kind, "rwlock record activated");
                record.ready.notify_all();
            }
        }
    }

    fn holds_any(&self, me: ThreadId) -> bool {
        self.readers.contains_key(&me) || self.writer.is_some_and(|(owner, _)| owner == me)
    }
}

#[derive(Default)]
pub struct ReaderWriterLock {
    state: Mutex<RwState>,
}

impl ReaderWriterLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RwState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn acquire_reader(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let me = thread::current().id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        if state.writer.is_some_and(|(owner, _)| owner == me) {
            return Err(Error::new(ErrorKind::Usage).with_message("thread already holds the writer lock"));
        }
        let id = state.enqueue(WaiterKind::Readers);
        let mut state = self.wait_active(state, id, deadline)?;
        state.readers.entry(me).or_default().push(id);
        Ok(())
    }

    pub fn acquire_writer(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let me = thread::current().id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        if state.holds_any(me) {
            return Err(Error::new(ErrorKind::Usage).with_message("thread already holds this lock"));
        }
        let id = state.enqueue(WaiterKind::Writer);
        let mut state = self.wait_active(state, id, deadline)?;
        state.writer = Some((me, id));
        Ok(())
    }

    fn wait_active<'a>(
        &'a self,
        mut state: MutexGuard<'a, RwState>,
        id: u64,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, RwState>, Error> {
        loop {
            let Some(record) = state.record(id) else {
                return Err(Error::new(ErrorKind::Internal).with_message("waiter record vanished"));
            };
            if record.active {
                return Ok(state);
            }
            let ready = record.ready.clone();
            state = match deadline {
                None => ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.leave(id);
                        return Err(Error::new(ErrorKind::TimedOut).with_message("rwlock not acquired"));
                    }
                    ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    pub fn release_reader(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.lock();
        let Some(ids) = state.readers.get_mut(&me) else {
            return Err(not_acquired("reader"));
        };
        let id = ids.pop();
        if ids.is_empty() {
            state.readers.remove(&me);
        }
        match id {
            Some(id) => {
                state.leave(id);
                Ok(())
            }
            None => Err(not_acquired("reader")),
        }
    }

    pub fn release_writer(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.lock();
        match state.writer {
            Some((owner, id)) if owner == me => {
                state.writer = None;
                state.leave(id);
                Ok(())
            }
            _ => Err(not_acquired("writer")),
        }
    }

    pub fn read(&self, timeout: Option<Duration>) -> Result<ReadGuard<'_>, Error> {
        self.acquire_reader(timeout)?;
        Ok(ReadGuard {
            lock: self,
            _thread_bound: PhantomData,
        })
    }

    pub fn write(&self, timeout: Option<Duration>) -> Result<WriteGuard<'_>, Error> {
        self.acquire_writer(timeout)?;
        Ok(WriteGuard {
            lock: self,
            _thread_bound: PhantomData,
        })
    }

    /// Number of reader acquisitions currently held.
    pub fn readers(&self) -> usize {
        self.lock().readers.values().map(Vec::len).sum()
    }

    pub fn has_writer(&self) -> bool {
        self.lock().writer.is_some()
    }

    /// Records in the queue, active ones included.
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }
}

fn not_acquired(kind: &str) -> Error {
    Error::new(ErrorKind::NotAcquired).with_message(format!("{kind} lock not held by this thread"))
}

/// Reader hold released on drop; tied to the acquiring thread.
pub struct ReadGuard<'a> {
    lock: &'a ReaderWriterLock,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_reader() {
            tracing::error!(error = %err, "read guard release failed");
        }
    }
}

/// Writer hold released on drop; tied to the acquiring thread.
pub struct WriteGuard<'a> {
    lock: &'a ReaderWriterLock,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_writer() {
            tracing::error!(error = %err, "write guard release failed");
        }
    }
}
