use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::constants::prefetcher::UNKNOWN_PANIC_MESSAGE;
use crate::errors::{ReaderError, Result};

/// First-failure capture shared between worker threads and one consumer.
///
/// Any number of threads may call [`ErrorCapture::safe_run`]; only the first
/// failure is kept. [`ErrorCapture::rethrow_if_happened`] hands it to the
/// consumer once, after which the slot is empty again.
#[derive(Debug, Default)]
pub struct ErrorCapture {
    slot: Mutex<Option<ReaderError>>,
}

impl ErrorCapture {
    /// Create an empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f`, returning its value, or `None` after capturing its error or panic.
    pub fn safe_run<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                self.capture(err);
                None
            }
            Err(payload) => {
                self.capture(ReaderError::WorkerPanicked {
                    message: panic_message(payload.as_ref()),
                });
                None
            }
        }
    }

    /// Return the captured failure, if any, and clear the slot.
    pub fn rethrow_if_happened(&self) -> Result<()> {
        match self.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove and return the captured failure.
    pub fn take(&self) -> Option<ReaderError> {
        self.slot.lock().expect("error capture poisoned").take()
    }

    /// Returns `true` when a failure is waiting to be rethrown.
    pub fn has_failure(&self) -> bool {
        self.slot.lock().expect("error capture poisoned").is_some()
    }

    fn capture(&self, err: ReaderError) {
        let mut slot = self.slot.lock().expect("error capture poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        UNKNOWN_PANIC_MESSAGE.to_string()
    }
}
