//! Running computations and resuming them on their dispatcher.
//!
//! [Executor::run_async] starts a computation, written as an ordinary `async`
//! block, synchronously on the calling thread. It runs until the first
//! suspension point or until it finishes. Every later resumption is posted
//! through the [Dispatcher] of the computation's [ResumptionContext]. It never
//! happens inline on the thread that delivered the result, so all user code
//! after the first `.await` runs on the designated execution context.
//!
//! Each computation instance moves through
//! `Created → Running → Suspended → Running → … → Completed | Failed`. Live
//! computations are kept in an arena owned by the [Executor]; a terminated
//! computation is removed from it, which releases its context.
//!
//! # Example
//!
//! ```
//! use tether::dispatch::Looper;
//! use tether::futures::call::{Callback, Response};
//! use tether::task::{Executor, ResumptionContext};
//!
//! let (looper, handler) = Looper::new();
//! let executor = Executor::new();
//!
//! let task = executor.run_async(ResumptionContext::new(handler), |scope| async move {
//!     let n = scope
//!         .await_call(|| {
//!             |cb: Callback<u32>| {
//!                 std::thread::spawn(move || cb.on_response(Response::ok(41)));
//!             }
//!         })
//!         .await?;
//!     Ok(n + 1)
//! });
//!
//! looper.run();
//! assert_eq!(task.join().unwrap(), 42);
//! ```
//!
//! # Failures
//!
//! A computation that returns an `Err` ends in the `Failed` state. The failure
//! is logged at `error` level and delivered to the computation's
//! [TaskJoiner]; it never escapes anywhere else. If the dispatcher refuses a
//! resumption the computation fails with
//! [Error::ContextUnavailable](crate::Error::ContextUnavailable).
use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{sync_channel, Receiver, TryRecvError},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll, Wake, Waker},
};

use log::{debug, error, trace};
use slab::Slab;

use crate::{
    dispatch::{Dispatcher, Work},
    error::{Error, Result},
    futures::call::{AsyncCall, Await},
};

type BoxFuture = Pin<Box<dyn Future<Output = TaskState> + Send>>;
type Abort = Box<dyn FnOnce(Error) + Send>;

/// Lifecycle of a computation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };

        f.write_str(s)
    }
}

/// Identifies one computation instance within an [Executor].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    key: usize,
    generation: u64,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.key, self.generation)
    }
}

struct ContextInner {
    dispatcher: Arc<dyn Dispatcher>,
    name: String,
}

/// Where a computation resumes, plus the data attached to the run.
///
/// Cheap to clone; all clones share the same immutable contents.
#[derive(Clone)]
pub struct ResumptionContext {
    inner: Arc<ContextInner>,
}

impl ResumptionContext {
    pub fn new<D: Dispatcher + 'static>(dispatcher: D) -> Self {
        Self::from_shared(Arc::new(dispatcher))
    }

    /// Build a context around a dispatcher that is already shared.
    pub fn from_shared(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                dispatcher,
                name: String::from("anonymous"),
            }),
        }
    }

    /// Attach a name, used in log output for this run.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                dispatcher: self.inner.dispatcher.clone(),
                name: name.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dispatcher(&self) -> &dyn Dispatcher {
        self.inner.dispatcher.as_ref()
    }
}

impl fmt::Debug for ResumptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumptionContext")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Handed to every computation; the only way to reach a suspension point.
#[derive(Clone, Debug)]
pub struct AsyncScope {
    context: ResumptionContext,
    id: TaskId,
}

impl AsyncScope {
    pub fn context(&self) -> &ResumptionContext {
        &self.context
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Issue a callback-style call and get a future for its outcome.
    ///
    /// `factory` runs immediately and its callback is registered before this
    /// function returns. Only one call per computation should be outstanding
    /// at a time; run independent computations to fan out.
    pub fn await_call<T, C, F>(&self, factory: F) -> Await<T>
    where
        F: FnOnce() -> C,
        C: AsyncCall<T>,
    {
        trace!("task {} awaiting a call", self.id);
        Await::new(factory)
    }
}

/// A handle to a running computation.
///
/// Dropping the joiner detaches the computation, which keeps running; its
/// result is then only visible in the log.
pub struct TaskJoiner<T> {
    id: TaskId,
    rx: Receiver<Result<T>>,
}

impl<T> TaskJoiner<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the computation terminates and return its result.
    ///
    /// *Note* calling this on the thread that runs the computation's
    /// dispatcher deadlocks; use [TaskJoiner::try_join] there instead. Returns
    /// [Error::AlreadyTerminated] if the computation was discarded without a
    /// result, which happens when its [Executor] is dropped while it is
    /// suspended.
    pub fn join(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(Error::AlreadyTerminated))
    }

    /// Return the result if the computation has terminated, without blocking.
    pub fn try_join(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::AlreadyTerminated)),
        }
    }
}

enum Stage {
    Running { notified: bool },
    Suspended(BoxFuture),
}

struct Record {
    generation: u64,
    stage: Stage,
    context: ResumptionContext,
    abort: Option<Abort>,
}

struct Inner {
    records: Mutex<Slab<Record>>,
    generations: AtomicU64,
}

struct Resumer {
    executor: Weak<Inner>,
    id: TaskId,
}

impl Wake for Resumer {
    fn wake(self: Arc<Self>) {
        if let Some(inner) = self.executor.upgrade() {
            Executor { inner }.schedule(self.id);
        }
    }
}

/// A resumption handed to a dispatcher. If the dispatcher drops it without
/// running it, the computation fails with [Error::ContextUnavailable].
struct Resumption {
    executor: Executor,
    id: TaskId,
    ran: bool,
}

impl Resumption {
    fn run(mut self) {
        self.ran = true;

        if let Err(e) = self.executor.resume(self.id) {
            debug!("task {}: stale resumption: {e}", self.id);
        }
    }
}

impl Drop for Resumption {
    fn drop(&mut self) {
        if !self.ran {
            self.executor.abort(self.id, Error::ContextUnavailable);
        }
    }
}

/// Drives computations started with [Executor::run_async].
///
/// Construct one when composing the application and pass clones to whoever
/// starts computations. The executor must outlive the computations it runs.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(Slab::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Start `block` on the calling thread and return a joiner for its result.
    ///
    /// The computation runs until its first suspension point before this
    /// function returns. Every resumption after that is dispatched through
    /// `context`.
    pub fn run_async<F, Fut, T>(&self, context: ResumptionContext, block: F) -> TaskJoiner<T>
    where
        F: FnOnce(AsyncScope) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        let abort_tx = tx.clone();

        let id = {
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
            let key = self.inner.records.lock().unwrap().insert(Record {
                generation,
                stage: Stage::Running { notified: false },
                context: context.clone(),
                abort: Some(Box::new(move |err: Error| {
                    let _ = abort_tx.try_send(Err(err));
                })),
            });

            TaskId { key, generation }
        };

        trace!("task {id}: {} on context {}", TaskState::Created, context.name());

        let name = context.name().to_owned();
        let fut = block(AsyncScope { context, id });

        let task = async move {
            let result = fut.await;

            let state = match &result {
                Ok(_) => TaskState::Completed,
                Err(e) => {
                    error!("task {id} on context {name} failed: {e}");
                    TaskState::Failed
                }
            };

            let _ = tx.try_send(result);

            state
        };

        trace!("task {id}: {}", TaskState::Running);
        self.drive(id, Box::pin(task));

        TaskJoiner { id, rx }
    }

    /// The state of a live computation, or `None` once it has terminated.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        let records = self.inner.records.lock().unwrap();

        records
            .get(id.key)
            .filter(|record| record.generation == id.generation)
            .map(|record| match record.stage {
                Stage::Running { .. } => TaskState::Running,
                Stage::Suspended(_) => TaskState::Suspended,
            })
    }

    /// Returns `true` when no computation is live.
    pub fn is_idle(&self) -> bool {
        self.inner.records.lock().unwrap().is_empty()
    }

    /// Continue the computation `id`. Called on the dispatcher's context.
    pub(crate) fn resume(&self, id: TaskId) -> Result<()> {
        let fut = {
            let mut records = self.inner.records.lock().unwrap();
            let record = records
                .get_mut(id.key)
                .filter(|record| record.generation == id.generation)
                .ok_or(Error::AlreadyTerminated)?;

            match mem::replace(&mut record.stage, Stage::Running { notified: false }) {
                Stage::Suspended(fut) => fut,
                Stage::Running { .. } => {
                    // Woken before the current poll returned; `drive` will
                    // reschedule once it parks the future.
                    record.stage = Stage::Running { notified: true };
                    return Ok(());
                }
            }
        };

        trace!("task {id}: {}", TaskState::Running);
        self.drive(id, fut);

        Ok(())
    }

    fn drive(&self, id: TaskId, mut fut: BoxFuture) {
        let waker = Waker::from(Arc::new(Resumer {
            executor: Arc::downgrade(&self.inner),
            id,
        }));
        let mut cx = Context::from_waker(&waker);

        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(state) => {
                let record = self.take_record(id);
                trace!("task {id}: {state}");
                drop(record);
            }
            Poll::Pending => {
                let notified = {
                    let mut records = self.inner.records.lock().unwrap();

                    let Some(record) = records
                        .get_mut(id.key)
                        .filter(|record| record.generation == id.generation)
                    else {
                        // Aborted while running.
                        return;
                    };

                    let notified = matches!(record.stage, Stage::Running { notified: true });
                    record.stage = Stage::Suspended(fut);
                    notified
                };

                trace!("task {id}: {}", TaskState::Suspended);

                if notified {
                    self.schedule(id);
                }
            }
        }
    }

    fn schedule(&self, id: TaskId) {
        let context = {
            let records = self.inner.records.lock().unwrap();

            match records
                .get(id.key)
                .filter(|record| record.generation == id.generation)
            {
                Some(record) => record.context.clone(),
                None => {
                    debug!("task {id}: wakeup after termination ignored");
                    return;
                }
            }
        };

        let resumption = Resumption {
            executor: self.clone(),
            id,
            ran: false,
        };
        let work: Work = Box::new(move || resumption.run());

        if let Err(e) = context.dispatcher().dispatch(work) {
            self.abort(id, e);
        }
    }

    fn abort(&self, id: TaskId, err: Error) {
        let Some(mut record) = self.take_record(id) else {
            return;
        };

        error!(
            "task {id} on context {} {}: {err}",
            record.context.name(),
            TaskState::Failed
        );

        if let Some(abort) = record.abort.take() {
            abort(err);
        }
    }

    fn take_record(&self, id: TaskId) -> Option<Record> {
        let mut records = self.inner.records.lock().unwrap();

        let live = records
            .get(id.key)
            .is_some_and(|record| record.generation == id.generation);

        live.then(|| records.remove(id.key))
    }
}
