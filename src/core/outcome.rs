//! Purpose: Model a finished task (value or error descriptor) and its callback list.
//! Exports: `Outcome`, `TaskError`, `TaskErrorKind`, `Callback`.
//! Role: Shared vocabulary of every future flavour; `TaskError` also crosses process pipes.
//! Invariants: Each callback runs at most once; a panicking callback never stops the rest.
//! Invariants: `TaskError` serializes to a stable `{kind, message}` JSON object.
use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The task body returned an error.
    Failed,
    /// The task body panicked.
    Panicked,
    /// The task process received `SIGINT` before finishing.
    Interrupted,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Failed, message)
    }

    pub fn interrupted() -> Self {
        Self::new(TaskErrorKind::Interrupted, "task interrupted")
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(TaskErrorKind::Panicked, panic_message(payload))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl StdError for TaskError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome<T> {
    Value(T),
    Error(TaskError),
}

impl<T> Outcome<T> {
    pub fn is_err(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Error(err) => Some(err),
        }
    }

    /// Converts into a `Result`, surfacing task failures as `ErrorKind::Task`.
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(err) => Err(Error::new(ErrorKind::Task)
                .with_message(err.message.clone())
                .with_source(err)),
        }
    }

    pub(crate) fn from_task<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => Outcome::Error(TaskError::failed(err.to_string())),
        }
    }
}

pub type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

pub(crate) struct Callbacks<T> {
    entries: Vec<Callback<T>>,
}

impl<T> Callbacks<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, callback: Callback<T>) {
        self.entries.push(callback);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn take(&mut self) -> Callbacks<T> {
        Callbacks {
            entries: std::mem::take(&mut self.entries),
        }
    }

    pub(crate) fn fire(self, outcome: &Outcome<T>) {
        for (index, callback) in self.entries.into_iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome)));
            if let Err(payload) = result {
                tracing::error!(
                    callback = index,
                    "future callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
