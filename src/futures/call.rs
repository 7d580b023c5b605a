//! Bridging callback-style calls into a single `.await`.
//!
//! A transport that delivers its outcome through a callback implements
//! [AsyncCall]. [AsyncScope::await_call](crate::task::AsyncScope::await_call)
//! invokes a factory for such a call, registers a [Callback] with it, and
//! hands back an [Await] future. The running computation suspends on that
//! future until the transport fires the callback, possibly from another thread.
//!
//! The callback is the suspension handle: exactly one terminal event reaches
//! the computation. The first call to [Callback::on_response] or
//! [Callback::on_failure] wins; every later call is rejected with
//! [Error::AlreadyResolved] and leaves the computation untouched.
//!
//! Outcomes map onto errors as follows:
//!
//! - [Callback::on_failure] raises [Error::TransportFailure].
//! - A non-2xx [Response] raises [Error::UnsuccessfulResponse].
//! - A 2xx [Response] without a body raises [Error::EmptyResult].
//! - Anything else yields the body.
//!
//! Awaiting always suspends at least once, even when the outcome was delivered
//! synchronously from inside [AsyncCall::enqueue].
use std::{
    future::Future,
    io,
    mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use log::warn;

use crate::error::{Error, Result};

/// An in-flight callback-style request.
///
/// `enqueue` must eventually fire `callback` exactly once, from any thread.
/// Retrying internally is allowed; only the final outcome should be reported.
pub trait AsyncCall<T>: Send {
    fn enqueue(self, callback: Callback<T>);
}

impl<T, F> AsyncCall<T> for F
where
    F: FnOnce(Callback<T>) + Send,
{
    fn enqueue(self, callback: Callback<T>) {
        self(callback)
    }
}

/// The outcome of a call that reached the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
    pub status: u16,
    pub message: String,
    pub body: Option<T>,
}

impl<T> Response<T> {
    pub fn new(status: u16, message: impl Into<String>, body: Option<T>) -> Self {
        Self {
            status,
            message: message.into(),
            body,
        }
    }

    /// A `200 OK` response carrying `body`.
    pub fn ok(body: T) -> Self {
        Self::new(200, "OK", Some(body))
    }

    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn into_result(self) -> Result<T> {
        if !self.is_successful() {
            return Err(Error::UnsuccessfulResponse {
                status: self.status,
                message: self.message,
            });
        }

        self.body.ok_or(Error::EmptyResult)
    }
}

enum SlotState<T> {
    Waiting(Option<Waker>),
    Resolved(Result<T>),
    Consumed,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

/// Completion handle given to an [AsyncCall].
pub struct Callback<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Callback<T> {
    /// Deliver a response. Fails with [Error::AlreadyResolved] if an outcome
    /// was already delivered.
    pub fn on_response(&self, response: Response<T>) -> Result<()> {
        self.resolve(response.into_result())
    }

    /// Deliver a transport failure. Fails with [Error::AlreadyResolved] if an
    /// outcome was already delivered.
    pub fn on_failure(&self, err: io::Error) -> Result<()> {
        self.resolve(Err(Error::TransportFailure(err)))
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.slot.state.lock().unwrap(), SlotState::Waiting(_))
    }

    fn resolve(&self, result: Result<T>) -> Result<()> {
        let waker = {
            let mut state = self.slot.state.lock().unwrap();

            match mem::replace(&mut *state, SlotState::Consumed) {
                SlotState::Waiting(waker) => {
                    *state = SlotState::Resolved(result);
                    waker
                }
                other => {
                    *state = other;
                    warn!("callback resolved more than once, dropping the late outcome");
                    return Err(Error::AlreadyResolved);
                }
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }

        Ok(())
    }
}

/// Future returned by
/// [AsyncScope::await_call](crate::task::AsyncScope::await_call).
#[must_use = "futures do nothing unless you `.await` them"]
pub struct Await<T> {
    slot: Arc<Slot<T>>,
    suspended: bool,
}

impl<T> Await<T> {
    /// Build the call and register its callback right away.
    pub(crate) fn new<C, F>(factory: F) -> Self
    where
        F: FnOnce() -> C,
        C: AsyncCall<T>,
    {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState::Waiting(None)),
        });

        factory().enqueue(Callback { slot: slot.clone() });

        Self {
            slot,
            suspended: false,
        }
    }
}

impl<T> Future for Await<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let first = !mem::replace(&mut self.suspended, true);
        let mut state = self.slot.state.lock().unwrap();

        match mem::replace(&mut *state, SlotState::Consumed) {
            // Already resolved: still hop once so the continuation re-enters
            // through the waker instead of running on the delivering thread.
            SlotState::Resolved(result) if first => {
                *state = SlotState::Resolved(result);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            SlotState::Resolved(result) => Poll::Ready(result),
            SlotState::Waiting(_) => {
                *state = SlotState::Waiting(Some(cx.waker().clone()));
                Poll::Pending
            }
            SlotState::Consumed => panic!("`Await` polled after completion"),
        }
    }
}
