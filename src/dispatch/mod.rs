//! Dispatchers decide where suspended work resumes.
//!
//! A [Dispatcher] is an opaque executor capability: hand it a unit of [Work]
//! and it runs that work later on the execution context it wraps, without
//! blocking the caller. The driver in [crate::task] never resumes a computation
//! inline on the thread that delivered a result; it always goes through the
//! dispatcher of the computation's
//! [ResumptionContext](crate::task::ResumptionContext).
//!
//! The only dispatcher shipped with `tether` is the [Handler] of a
//! [Looper], a single-consumer FIFO queue. Anything that can "run this closure
//! later on me" can implement the trait.
pub mod looper;

pub use looper::{Handler, Looper};

use crate::error::Result;

/// A deferred unit of work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Schedules work onto a specific execution context.
///
/// Implementations must accept concurrent calls from any thread. No ordering
/// is promised beyond whatever the underlying context provides.
pub trait Dispatcher: Send + Sync {
    /// Queue `work` for execution on the target context. Returns
    /// [Error::ContextUnavailable](crate::Error::ContextUnavailable) if the
    /// context has been torn down, in which case `work` is dropped unexecuted.
    fn dispatch(&self, work: Work) -> Result<()>;
}
