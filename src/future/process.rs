//! Purpose: Cross-process future carried by a one-shot pipe.
//! Exports: `channel`, `ProcessProducer`, `ProcessConsumer`.
//! Role: Result channel of process-backed tasks; both halves are created before fork.
//! Invariants: The consumer belongs to the creating process; the producer may not resolve
//! from that process, and the consumer may not poll from any other.
//! Invariants: Exactly one `{success, payload}` message is written; the consumer decodes it once,
//! caches it, and closes its pipe half. A message that fails to decode is reported as
//! `Corrupt` on every later poll.
//! Invariants: Callbacks run when the consumer first observes the message, either from a
//! poll or from the listener thread started by `subscribe`.
use std::error::Error as _;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::ident::ProcessId;
use crate::core::oneshot::{self, Receiver, Sender};
use crate::core::outcome::{Callback, Callbacks, Outcome, TaskError};
use crate::future::{not_ready, timed_out, value_of};

const POLL_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    success: bool,
    payload: Value,
}

pub struct ProcessProducer<T> {
    sender: Sender,
    origin: ProcessId,
    bound: Option<ProcessId>,
    _marker: PhantomData<fn(T)>,
}

struct ConsumerState<T> {
    receiver: Receiver,
    outcome: Option<Arc<Outcome<T>>>,
    corrupt: Option<String>,
    callbacks: Callbacks<T>,
}

pub struct ProcessConsumer<T> {
    state: Arc<Mutex<ConsumerState<T>>>,
    origin: ProcessId,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Creates both halves in the current process, which becomes the consumer side.
pub fn channel<T>() -> Result<(ProcessProducer<T>, ProcessConsumer<T>), Error> {
    let (sender, receiver) = oneshot::channel()?;
    let origin = ProcessId::current();
    Ok((
        ProcessProducer {
            sender,
            origin,
            bound: None,
            _marker: PhantomData,
        },
        ProcessConsumer {
            state: Arc::new(Mutex::new(ConsumerState {
                receiver,
                outcome: None,
                corrupt: None,
                callbacks: Callbacks::new(),
            })),
            origin,
            listener: Mutex::new(None),
        },
    ))
}

impl<T: Serialize> ProcessProducer<T> {
    /// Pins the producer role to the calling process (normally a freshly forked child).
    pub fn bind_current(&mut self) {
        self.bound = Some(ProcessId::current());
    }

    pub fn resolve(&mut self, value: T) -> Result<(), Error> {
        self.send(Outcome::Value(value))
    }

    pub fn throw(&mut self, err: TaskError) -> Result<(), Error> {
        self.send(Outcome::Error(err))
    }

    pub(crate) fn send(&mut self, outcome: Outcome<T>) -> Result<(), Error> {
        self.check_context()?;
        let envelope = match &outcome {
            Outcome::Value(value) => Envelope {
                success: true,
                payload: serde_json::to_value(value).map_err(encode_error)?,
            },
            Outcome::Error(err) => Envelope {
                success: false,
                payload: serde_json::to_value(err).map_err(encode_error)?,
            },
        };
        let bytes = serde_json::to_vec(&envelope).map_err(encode_error)?;
        self.sender.send(&bytes)
    }

    fn check_context(&self) -> Result<(), Error> {
        let current = ProcessId::current();
        let allowed = match self.bound {
            Some(bound) => bound == current,
            None => current != self.origin,
        };
        if !allowed {
            return Err(Error::new(ErrorKind::WrongContext).with_message("cannot send reply as consumer"));
        }
        Ok(())
    }
}

fn encode_error(err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("response is not serializable")
        .with_source(err)
}

fn decode_error(err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message("response could not be decoded")
        .with_source(err)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Outcome<T>, Error> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(decode_error)?;
    if envelope.success {
        Ok(Outcome::Value(serde_json::from_value(envelope.payload).map_err(decode_error)?))
    } else {
        Ok(Outcome::Error(serde_json::from_value(envelope.payload).map_err(decode_error)?))
    }
}

impl<T> ConsumerState<T>
where
    T: DeserializeOwned,
{
    /// Reads the message if one arrives within `slice`. The first read also hands
    /// back the pending callbacks so they can run outside the lock.
    fn observe(&mut self, slice: Duration) -> Result<Observed<T>, Error> {
        if let Some(outcome) = &self.outcome {
            return Ok(Some((outcome.clone(), None)));
        }
        if let Some(reason) = &self.corrupt {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("response could not be decoded: {reason}")));
        }
        let Some(bytes) = self.receiver.try_recv(slice)? else {
            return Ok(None);
        };
        let outcome = match decode::<T>(&bytes) {
            Ok(outcome) => Arc::new(outcome),
            Err(err) => {
                self.corrupt = Some(
                    err.source()
                        .map_or_else(|| "malformed envelope".to_string(), |source| source.to_string()),
                );
                return Err(err);
            }
        };
        self.outcome = Some(outcome.clone());
        Ok(Some((outcome, Some(self.callbacks.take()))))
    }
}

type Observed<T> = Option<(Arc<Outcome<T>>, Option<Callbacks<T>>)>;

fn poll_state<T: DeserializeOwned>(
    state: &Mutex<ConsumerState<T>>,
    slice: Duration,
) -> Result<Option<Arc<Outcome<T>>>, Error> {
    let observed = lock_state(state).observe(slice)?;
    Ok(observed.map(|(outcome, callbacks)| {
        if let Some(callbacks) = callbacks {
            callbacks.fire(&outcome);
        }
        outcome
    }))
}

impl<T> ProcessConsumer<T>
where
    T: DeserializeOwned,
{
    fn lock(&self) -> MutexGuard<'_, ConsumerState<T>> {
        lock_state(&self.state)
    }

    fn poll(&self, slice: Duration) -> Result<Option<Arc<Outcome<T>>>, Error> {
        poll_state(&self.state, slice)
    }

    fn check_context(&self) -> Result<(), Error> {
        if ProcessId::current() != self.origin {
            return Err(Error::new(ErrorKind::WrongContext).with_message("cannot poll reply as producer"));
        }
        Ok(())
    }

    /// Non-blocking: peeks the pipe and decodes the message if it is there.
    pub fn is_fulfilled(&self) -> bool {
        if self.check_context().is_err() {
            return false;
        }
        match self.poll(Duration::ZERO) {
            Ok(outcome) => outcome.is_some(),
            Err(err) => {
                tracing::debug!(error = %err, "process future peek failed");
                false
            }
        }
    }

    pub fn has_erred(&self) -> Option<bool> {
        self.check_context().ok()?;
        match self.poll(Duration::ZERO) {
            Ok(outcome) => outcome.map(|outcome| outcome.is_err()),
            Err(_) => None,
        }
    }

    pub fn then<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return Err(Error::new(ErrorKind::AlreadyHandled).with_message("response already handled"));
        }
        let callback: Callback<T> = Box::new(callback);
        state.callbacks.push(callback);
        Ok(())
    }

    pub fn callback_count(&self) -> usize {
        self.lock().callbacks.len()
    }
}

impl<T> ProcessConsumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Starts the listener thread that delivers callbacks as soon as the message lands.
    pub fn subscribe(&self) -> Result<(), Error> {
        self.check_context()?;
        let mut listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listener.is_some() {
            return Ok(());
        }
        let state = self.state.clone();
        let handle = std::thread::Builder::new()
            .name("tandem-listener".to_string())
            .spawn(move || {
                loop {
                    match poll_state(&state, POLL_SLICE) {
                        Ok(Some(_)) => return,
                        Ok(None) => {
                            if Arc::strong_count(&state) == 1 {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "process future listener stopped");
                            return;
                        }
                    }
                }
            })
            .map_err(|err| Error::io(err).with_message("failed to start listener"))?;
        *listener = Some(handle);
        Ok(())
    }
}

impl<T> ProcessConsumer<T>
where
    T: DeserializeOwned + Clone,
{
    pub fn response(&self) -> Result<T, Error> {
        value_of(&self.response_outcome()?)
    }

    pub fn response_outcome(&self) -> Result<Outcome<T>, Error> {
        self.check_context()?;
        match self.poll(Duration::ZERO)? {
            Some(outcome) => Ok((*outcome).clone()),
            None => Err(not_ready()),
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, Error> {
        value_of(&self.wait_outcome(timeout)?)
    }

    pub fn wait_outcome(&self, timeout: Option<Duration>) -> Result<Outcome<T>, Error> {
        self.check_context()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let slice = match deadline {
                None => POLL_SLICE,
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_SLICE),
            };
            if let Some(outcome) = self.poll(slice)? {
                return Ok((*outcome).clone());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(timed_out());
            }
        }
    }
}

fn lock_state<T>(state: &Mutex<ConsumerState<T>>) -> MutexGuard<'_, ConsumerState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{ProcessConsumer, channel};
    use crate::core::error::ErrorKind;
    use crate::core::outcome::{Outcome, TaskError};
    use crate::core::process::{SpawnOptions, spawn};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Report {
        name: String,
        scores: Vec<i64>,
    }

    #[test]
    fn value_round_trips_through_a_child() {
        let (mut producer, consumer) = channel::<Report>().expect("channel");
        let mut child = spawn(SpawnOptions::new(), move || {
            producer.bind_current();
            let report = Report {
                name: "child".to_string(),
                scores: vec![3, -1, 4],
            };
            match producer.resolve(report) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        })
        .expect("spawn");

        let report = consumer.wait(Some(Duration::from_secs(5))).expect("wait");
        assert_eq!(report.name, "child");
        assert_eq!(report.scores, vec![3, -1, 4]);
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));
        assert_eq!(consumer.response().expect("cached"), report);
    }

    #[test]
    fn consumer_process_cannot_resolve() {
        let (mut producer, consumer) = channel::<u32>().expect("channel");
        let err = producer.resolve(1).expect_err("resolve from consumer process");
        assert_eq!(err.kind(), ErrorKind::WrongContext);
        assert!(!consumer.is_fulfilled());
        assert_eq!(consumer.has_erred(), None);
        assert_eq!(consumer.response().expect_err("pending").kind(), ErrorKind::NotReady);
    }

    #[test]
    fn producer_process_cannot_poll() {
        let (mut producer, consumer) = channel::<u32>().expect("channel");
        let mut child = spawn(SpawnOptions::new(), || {
            producer.bind_current();
            let wait = consumer.wait(Some(Duration::ZERO));
            if !matches!(wait, Err(ref err) if err.kind() == ErrorKind::WrongContext) {
                return 3;
            }
            let response = consumer.response();
            if !matches!(response, Err(ref err) if err.kind() == ErrorKind::WrongContext) {
                return 4;
            }
            if producer.resolve(5).is_err() {
                return 5;
            }
            0
        })
        .expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));
        assert_eq!(consumer.wait(Some(Duration::from_secs(5))).expect("wait"), 5);
    }

    #[test]
    fn undecodable_message_stays_corrupt() {
        let (mut producer, consumer) = channel::<u32>().expect("channel");
        let mut child = spawn(SpawnOptions::new(), move || {
            if producer.sender.send(b"not an envelope").is_ok() { 0 } else { 1 }
        })
        .expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));

        let err = consumer.wait(Some(Duration::from_secs(5))).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        let start = Instant::now();
        let err = consumer.wait(Some(Duration::from_secs(5))).expect_err("still corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(consumer.response().expect_err("response").kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn thrown_error_crosses_the_pipe() {
        let (mut producer, consumer) = channel::<u32>().expect("channel");
        let mut child = spawn(SpawnOptions::new(), move || {
            let _ = producer.throw(TaskError::failed("no luck"));
            let second = producer.throw(TaskError::failed("again"));
            if second.is_err() { 0 } else { 1 }
        })
        .expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));

        assert!(consumer.is_fulfilled());
        assert_eq!(consumer.has_erred(), Some(true));
        match consumer.wait_outcome(None).expect("outcome") {
            Outcome::Error(err) => assert_eq!(err.message, "no luck"),
            Outcome::Value(_) => panic!("expected error outcome"),
        }
        assert_eq!(consumer.wait(None).expect_err("raised").kind(), ErrorKind::Task);
    }

    #[test]
    fn subscribed_callbacks_fire_without_polling() {
        let (mut producer, consumer) = channel::<u32>().expect("channel");
        let seen = Arc::new(AtomicU32::new(0));
        let hits = seen.clone();
        consumer
            .then(move |outcome: &Outcome<u32>| {
                hits.store(*outcome.value().expect("value"), Ordering::SeqCst);
            })
            .expect("then");
        consumer.subscribe().expect("subscribe");
        consumer.subscribe().expect("subscribe twice");

        let mut child = spawn(SpawnOptions::new(), move || {
            std::thread::sleep(Duration::from_millis(20));
            if producer.resolve(11).is_ok() { 0 } else { 1 }
        })
        .expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));

        let start = Instant::now();
        while seen.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 11);
        assert_eq!(consumer.callback_count(), 0);
        let err = consumer.then(|_| {}).expect_err("late then");
        assert_eq!(err.kind(), ErrorKind::AlreadyHandled);
    }

    #[test]
    fn silent_producer_leaves_future_pending() {
        let (producer, consumer): (_, ProcessConsumer<u32>) = channel().expect("channel");
        let mut child = spawn(SpawnOptions::new(), move || {
            drop(producer);
            0
        })
        .expect("spawn");
        assert_eq!(child.wait(Some(Duration::from_secs(5))), Some(0));
        let err = consumer.wait(Some(Duration::from_millis(30))).expect_err("pending");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }
}
