// ABOUTME: Settle-once completion used to hand connection and command results to waiters.
// ABOUTME: Tracks pending/succeeded/failed explicitly; settling twice is a bug and panics.

use crate::error::{Error, Result};
use futures::FutureExt;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

enum Slot<T> {
    Pending(oneshot::Sender<Result<T>>),
    Succeeded,
    Failed,
}

impl<T> Slot<T> {
    fn describe(&self) -> &'static str {
        match self {
            Slot::Pending(_) => "pending",
            Slot::Succeeded => "succeeded",
            Slot::Failed => "failed",
        }
    }
}

/// Producer side of a one-shot result.
///
/// Clones refer to the same slot, so one party may succeed it while another
/// holds on to it to report failure. Exactly one of them gets to settle it.
pub struct Completion<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("state", &self.slot.lock().describe())
            .finish()
    }
}

impl<T> Completion<T> {
    /// Create a completion and the future that resolves when it is settled.
    pub fn new() -> (Self, Pending<T>) {
        let (sender, receiver) = oneshot::channel();
        let completion = Self {
            slot: Arc::new(Mutex::new(Slot::Pending(sender))),
        };
        (completion, Pending { receiver })
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending(_))
    }

    /// Resolve with `value`. If the waiting side was dropped the value is
    /// handed back so the caller can release it.
    ///
    /// # Panics
    ///
    /// Panics if the completion was already settled.
    pub fn succeed(&self, value: T) -> std::result::Result<(), T> {
        match self.take_sender(Slot::Succeeded).send(Ok(value)) {
            Ok(()) => Ok(()),
            Err(Ok(value)) => Err(value),
            Err(Err(_)) => Ok(()),
        }
    }

    /// Fail with `reason`. If the waiting side was dropped the reason is
    /// handed back.
    ///
    /// # Panics
    ///
    /// Panics if the completion was already settled.
    pub fn fail(&self, reason: Error) -> std::result::Result<(), Error> {
        match self.take_sender(Slot::Failed).send(Err(reason)) {
            Ok(()) => Ok(()),
            Err(Err(reason)) => Err(reason),
            Err(Ok(_)) => Ok(()),
        }
    }

    fn take_sender(&self, settled: Slot<T>) -> oneshot::Sender<Result<T>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, settled) {
            Slot::Pending(sender) => sender,
            previous => {
                let was = previous.describe();
                *slot = previous;
                drop(slot);
                panic!("completion settled twice (already {was})");
            }
        }
    }
}

/// Waiting side of a [`Completion`].
///
/// Dropping it abandons the result; the producer finds out when it settles.
#[must_use = "dropping a pending result abandons it"]
pub struct Pending<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_unpin(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(Error::ConnectionLost(
                    "result dropped before it was settled".to_string(),
                ))
            })
        })
    }
}
