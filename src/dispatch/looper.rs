//! A single-consumer work queue that acts as a designated execution context.
//!
//! [Looper::new] creates the queue and its first [Handler]. Whichever thread
//! calls [Looper::run] becomes the looper thread: every piece of work sent
//! through any clone of the handler executes there, one at a time, in the order
//! it was dispatched.
//!
//! # Teardown policy
//!
//! Once [Handler::quit] has been called, or the looper has gone away, every
//! further [Handler::dispatch] fails with
//! [Error::ContextUnavailable](crate::Error::ContextUnavailable) and the work
//! is dropped. Work that was already queued before the quit request still runs:
//! a dispatch that succeeded is never ordered behind the quit request.
//!
//! # Example
//!
//! ```
//! use tether::dispatch::{Dispatcher, Looper};
//! use std::sync::{Arc, Mutex};
//!
//! let (looper, handler) = Looper::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! for i in 0..3 {
//!     let seen = seen.clone();
//!     handler.dispatch(Box::new(move || seen.lock().unwrap().push(i))).unwrap();
//! }
//!
//! // The looper exits once every handler is gone and the queue is drained.
//! drop(handler);
//! looper.run();
//!
//! assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
//! ```
use std::{
    io,
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, OnceLock,
    },
    thread::{self, JoinHandle, ThreadId},
};

use log::debug;

use super::{Dispatcher, Work};
use crate::error::{Error, Result};

enum Message {
    Run(Work),
    Quit,
}

struct Shared {
    // Held across every send so no work can be queued behind `Quit`.
    quitting: Mutex<bool>,
    thread: OnceLock<ThreadId>,
}

/// The consuming end of the queue. See the [module-level documentation](self).
pub struct Looper {
    rx: Receiver<Message>,
    shared: Arc<Shared>,
}

/// A [Dispatcher] that posts work to a [Looper].
#[derive(Clone)]
pub struct Handler {
    tx: Sender<Message>,
    shared: Arc<Shared>,
}

impl Looper {
    /// Create a new looper together with the first handler that feeds it.
    pub fn new() -> (Looper, Handler) {
        let (tx, rx) = channel();
        let shared = Arc::new(Shared {
            quitting: Mutex::new(false),
            thread: OnceLock::new(),
        });

        (
            Looper {
                rx,
                shared: shared.clone(),
            },
            Handler { tx, shared },
        )
    }

    /// Run a looper on a freshly spawned OS thread called `name`.
    pub fn spawn(name: &str) -> io::Result<(Handler, JoinHandle<()>)> {
        let (looper, handler) = Looper::new();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || looper.run())?;

        Ok((handler, thread))
    }

    /// Execute queued work on the calling thread.
    ///
    /// Blocks until either a quit request is processed or every [Handler] has
    /// been dropped and the queue is empty.
    pub fn run(self) {
        let _ = self.shared.thread.set(thread::current().id());

        debug!(
            "looper running on thread {}",
            thread::current().name().unwrap_or("<unnamed>")
        );

        while let Ok(msg) = self.rx.recv() {
            match msg {
                Message::Run(work) => work(),
                Message::Quit => break,
            }
        }

        *self.shared.quitting.lock().unwrap() = true;

        let discarded = self
            .rx
            .try_iter()
            .filter(|msg| matches!(msg, Message::Run(_)))
            .count();

        debug!("looper exited, {discarded} queued work item(s) discarded");
    }
}

impl Handler {
    /// Ask the looper to stop after the work that is already queued.
    pub fn quit(&self) {
        let mut quitting = self.shared.quitting.lock().unwrap();

        if !*quitting {
            *quitting = true;
            let _ = self.tx.send(Message::Quit);
        }
    }

    /// Returns `true` when called from the thread that is running the looper.
    pub fn is_current(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }
}

impl Dispatcher for Handler {
    fn dispatch(&self, work: Work) -> Result<()> {
        let quitting = self.shared.quitting.lock().unwrap();

        if *quitting {
            return Err(Error::ContextUnavailable);
        }

        self.tx
            .send(Message::Run(work))
            .map_err(|_| Error::ContextUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc::channel,
            Arc, Mutex,
        },
        thread,
    };

    use anyhow::Result;

    use super::Looper;
    use crate::{dispatch::Dispatcher, Error};

    #[test]
    fn fifo_on_looper_thread() {
        let (looper, handler) = Looper::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let producer = {
            let handler = handler.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                for i in 0..3 {
                    let seen = seen.clone();
                    let handler2 = handler.clone();
                    handler
                        .dispatch(Box::new(move || {
                            assert!(handler2.is_current());
                            seen.lock().unwrap().push((i, thread::current().id()));
                        }))
                        .unwrap();
                }
            })
        };

        producer.join().unwrap();
        drop(handler);
        looper.run();

        let me = thread::current().id();
        assert_eq!(*seen.lock().unwrap(), vec![(0, me), (1, me), (2, me)]);
    }

    #[test]
    fn quit_rejects_further_work() {
        let (looper, handler) = Looper::new();
        let ran = Arc::new(Mutex::new(0));

        {
            let ran = ran.clone();
            handler
                .dispatch(Box::new(move || *ran.lock().unwrap() += 1))
                .unwrap();
        }

        handler.quit();

        assert!(matches!(
            handler.dispatch(Box::new(|| panic!("should never run"))),
            Err(Error::ContextUnavailable)
        ));

        // Returns even though `handler` is still alive.
        looper.run();

        assert_eq!(*ran.lock().unwrap(), 1);
        assert!(!handler.is_current());
    }

    #[test]
    fn dropped_looper_is_unavailable() {
        let (looper, handler) = Looper::new();
        drop(looper);

        assert!(matches!(
            handler.dispatch(Box::new(|| {})),
            Err(Error::ContextUnavailable)
        ));
    }

    #[test]
    fn spawned_looper_runs_on_own_thread() -> Result<()> {
        let (handler, thread) = Looper::spawn("tether-ui")?;
        let (tx, rx) = channel();

        {
            let handler2 = handler.clone();
            handler.dispatch(Box::new(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send((name, handler2.is_current())).unwrap();
            }))?;
        }

        assert_eq!(rx.recv()?, (Some("tether-ui".to_owned()), true));
        assert!(!handler.is_current());

        handler.quit();
        thread.join().unwrap();

        assert!(handler.dispatch(Box::new(|| {})).is_err());

        Ok(())
    }

    #[test]
    fn accepted_work_runs_despite_concurrent_quit() -> Result<()> {
        let (handler, looper) = Looper::spawn("tether-quit")?;
        let ran = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let handler = handler.clone();
                let ran = ran.clone();

                thread::spawn(move || {
                    let mut accepted = 0;

                    for _ in 0..500 {
                        let ran = ran.clone();
                        let work = Box::new(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        });

                        if handler.dispatch(work).is_ok() {
                            accepted += 1;
                        }
                    }

                    accepted
                })
            })
            .collect();

        handler.quit();

        let accepted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();
        looper.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), accepted);

        Ok(())
    }
}
