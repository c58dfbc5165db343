//! Purpose: Bounded counting semaphore with first-come, first-served acquisition.
//! Exports: `Semaphore`, `SemaphorePermit`.
//! Role: Caps concurrent holders among the threads of one process.
//! Invariants: `0 <= count <= max_count` at all times; releasing past the cap fails with `Overrelease`.
//! Invariants: Acquirers take tickets and are served strictly in ticket order; a timed-out
//! acquirer withdraws its ticket so later ones are not stuck behind it.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};

struct SemState {
    count: usize,
    next_ticket: u64,
    queue: VecDeque<u64>,
}

pub struct Semaphore {
    state: Mutex<SemState>,
    // Signalled when the head of the ticket queue changes.
    turn: Condvar,
    // Signalled when the count leaves zero.
    nonzero: Condvar,
    max_count: usize,
}

impl Semaphore {
    /// Semaphore that starts with all `max_count` permits available.
    pub fn new(max_count: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                count: max_count,
                next_ticket: 0,
                queue: VecDeque::new(),
            }),
            turn: Condvar::new(),
            nonzero: Condvar::new(),
            max_count,
        }
    }

    pub fn with_count(initial: usize, max_count: usize) -> Result<Self, Error> {
        if initial > max_count {
            return Err(Error::new(ErrorKind::Usage).with_message("initial count exceeds max_count"));
        }
        let semaphore = Self::new(max_count);
        semaphore.lock().count = initial;
        Ok(semaphore)
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn count(&self) -> usize {
        self.lock().count
    }

    pub fn waiting(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            let my_turn = state.queue.front() == Some(&ticket);
            if my_turn && state.count > 0 {
                state.count -= 1;
                state.queue.pop_front();
                drop(state);
                self.turn.notify_all();
                return Ok(());
            }

            let signal = if my_turn { &self.nonzero } else { &self.turn };
            state = match deadline {
                None => signal
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.queue.retain(|queued| *queued != ticket);
                        drop(state);
                        if my_turn {
                            self.turn.notify_all();
                        }
                        return Err(Error::new(ErrorKind::TimedOut).with_message("semaphore not acquired"));
                    }
                    signal
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    pub fn try_acquire(&self) -> Result<(), Error> {
        self.acquire(Some(Duration::ZERO))
    }

    pub fn release(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if state.count >= self.max_count {
            return Err(Error::new(ErrorKind::Overrelease)
                .with_message(format!("release would exceed max_count {}", self.max_count)));
        }
        state.count += 1;
        drop(state);
        self.nonzero.notify_all();
        Ok(())
    }

    pub fn permit(&self, timeout: Option<Duration>) -> Result<SemaphorePermit<'_>, Error> {
        self.acquire(timeout)?;
        Ok(SemaphorePermit { semaphore: self })
    }
}

pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.semaphore.release() {
            tracing::error!(error = %err, "semaphore permit release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use crate::core::error::ErrorKind;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn exhausting_permits_times_out() {
        let semaphore = Semaphore::new(3);
        for _ in 0..3 {
            semaphore.acquire(None).expect("acquire");
        }
        assert_eq!(semaphore.count(), 0);
        let err = semaphore.acquire(Some(Duration::ZERO)).expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[test]
    fn over_release_is_rejected() {
        let semaphore = Semaphore::new(2);
        semaphore.acquire(None).expect("acquire");
        semaphore.release().expect("release");
        let err = semaphore.release().expect_err("over release");
        assert_eq!(err.kind(), ErrorKind::Overrelease);
        assert_eq!(semaphore.count(), 2);
    }

    #[test]
    fn initial_count_is_validated() {
        let err = Semaphore::with_count(3, 2).err().expect("too many");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let semaphore = Semaphore::with_count(0, 2).expect("empty");
        assert_eq!(semaphore.try_acquire().expect_err("empty").kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn permits_release_on_drop() {
        let semaphore = Semaphore::new(1);
        {
            let _permit = semaphore.permit(None).expect("permit");
            assert_eq!(semaphore.count(), 0);
        }
        assert_eq!(semaphore.count(), 1);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let semaphore = Arc::new(Semaphore::with_count(0, 4).expect("semaphore"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..4 {
            let worker = semaphore.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                worker.acquire(Some(Duration::from_secs(10))).expect("acquire");
                order.lock().expect("order").push(id);
            }));
            while semaphore.waiting() < id + 1 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        for _ in 0..4 {
            semaphore.release().expect("release");
            std::thread::sleep(Duration::from_millis(25));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn timed_out_waiter_does_not_block_the_line() {
        let semaphore = Arc::new(Semaphore::with_count(0, 1).expect("semaphore"));
        let first = semaphore.clone();
        let impatient = std::thread::spawn(move || first.acquire(Some(Duration::from_millis(20))));
        while semaphore.waiting() < 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let second = semaphore.clone();
        let patient = std::thread::spawn(move || second.acquire(Some(Duration::from_secs(10))));

        let err = impatient.join().expect("join").expect_err("impatient");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        semaphore.release().expect("release");
        patient.join().expect("join").expect("patient acquires");
    }
}
