// Role-less in-process future: any clone may resolve, subscribe, or wait.
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::Error;
use crate::core::outcome::{Outcome, TaskError};
use crate::future::{Cell, not_ready, value_of};

/// A future with no producer/consumer split, usable from one thread or shared
/// between threads by cloning.
pub struct LocalFuture<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for LocalFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Default for LocalFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalFuture<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell::new()),
        }
    }

    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.cell.fulfill(Outcome::Value(value))
    }

    pub fn throw(&self, err: TaskError) -> Result<(), Error> {
        self.cell.fulfill(Outcome::Error(err))
    }

    pub fn then<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.cell.then(Box::new(callback))
    }

    pub fn is_fulfilled(&self) -> bool {
        self.cell.outcome().is_some()
    }

    pub fn has_erred(&self) -> Option<bool> {
        self.cell.outcome().map(|outcome| outcome.is_err())
    }
}

impl<T: Clone> LocalFuture<T> {
    pub fn response(&self) -> Result<T, Error> {
        value_of(&self.response_outcome()?)
    }

    pub fn response_outcome(&self) -> Result<Outcome<T>, Error> {
        self.cell
            .outcome()
            .map(|outcome| (*outcome).clone())
            .ok_or_else(not_ready)
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, Error> {
        value_of(&self.wait_outcome(timeout)?)
    }

    pub fn wait_outcome(&self, timeout: Option<Duration>) -> Result<Outcome<T>, Error> {
        Ok((*self.cell.wait(timeout)?).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::LocalFuture;
    use crate::core::error::ErrorKind;
    use crate::core::outcome::{Outcome, TaskError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn double_resolve_keeps_first_outcome() {
        let future = LocalFuture::new();
        future.resolve(1u32).expect("resolve");
        let err = future.resolve(2).expect_err("second resolve");
        assert_eq!(err.kind(), ErrorKind::AlreadyFulfilled);
        let err = future.throw(TaskError::failed("late")).expect_err("throw after resolve");
        assert_eq!(err.kind(), ErrorKind::AlreadyFulfilled);
        assert_eq!(future.response().expect("response"), 1);
        assert_eq!(future.has_erred(), Some(false));
    }

    #[test]
    fn same_thread_poll_before_resolve_is_not_ready() {
        let future: LocalFuture<u32> = LocalFuture::new();
        assert!(!future.is_fulfilled());
        assert_eq!(future.has_erred(), None);
        assert_eq!(future.response().expect_err("pending").kind(), ErrorKind::NotReady);
        let err = future.wait(Some(Duration::from_millis(5))).expect_err("pending");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn callbacks_run_at_fulfillment_and_reject_late_registration() {
        let future = LocalFuture::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let hits = seen.clone();
        future
            .then(move |outcome: &Outcome<usize>| {
                hits.store(*outcome.value().expect("value"), Ordering::SeqCst);
            })
            .expect("then");
        future.resolve(9).expect("resolve");
        assert_eq!(seen.load(Ordering::SeqCst), 9);

        let err = future.then(|_| {}).expect_err("late then");
        assert_eq!(err.kind(), ErrorKind::AlreadyHandled);
    }

    #[test]
    fn thrown_error_is_reraised_or_returned() {
        let future: LocalFuture<u32> = LocalFuture::new();
        future.throw(TaskError::failed("nope")).expect("throw");
        assert_eq!(future.wait(None).expect_err("raised").kind(), ErrorKind::Task);
        match future.wait_outcome(None).expect("outcome") {
            Outcome::Error(err) => assert_eq!(err.message, "nope"),
            Outcome::Value(_) => panic!("expected error outcome"),
        }
    }

    #[test]
    fn clones_share_state_across_threads() {
        let future = LocalFuture::new();
        let producer = future.clone();
        let handle = std::thread::spawn(move || producer.resolve("done".to_string()));
        assert_eq!(future.wait(Some(Duration::from_secs(5))).expect("wait"), "done");
        handle.join().expect("join").expect("resolve");
    }
}
