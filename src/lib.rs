//! # `tether`: direct-style code over callback APIs
//!
//! `tether` is a minimal cooperative scheduler. It lets sequential-looking
//! `async` code drive callback-based requests without nesting callbacks. Each
//! request is a single `.await`; when the callback fires, possibly on some I/O
//! thread, the rest of the computation is resumed on an execution context the
//! caller picked.
//!
//! Three pieces cooperate:
//!
//! - A [Dispatcher](dispatch::Dispatcher) runs deferred work on a designated
//!   context. [Looper](dispatch::Looper) is a ready-made serial work queue.
//! - The await adapter in [futures::call] turns one callback registration into
//!   one suspension point.
//! - The driver in [task] starts computations and resumes them through their
//!   dispatcher after every suspension.
//!
//! [http] and [github] provide a small JSON-over-HTTP transport and a demo API
//! built on top.
//!
//! ## Example
//!
//! ```
//! use tether::dispatch::Looper;
//! use tether::futures::call::{Callback, Response};
//! use tether::task::{Executor, ResumptionContext};
//! use std::thread;
//!
//! let (looper, handler) = Looper::new();
//! let executor = Executor::new();
//!
//! let greeting = executor.run_async(ResumptionContext::new(handler), |scope| async move {
//!     let hello = scope
//!         .await_call(|| {
//!             |cb: Callback<&'static str>| {
//!                 thread::spawn(move || cb.on_response(Response::ok("Hello, ")));
//!             }
//!         })
//!         .await?;
//!     let world = scope
//!         .await_call(|| {
//!             |cb: Callback<&'static str>| {
//!                 thread::spawn(move || cb.on_response(Response::ok("world!")));
//!             }
//!         })
//!         .await?;
//!     Ok(format!("{hello}{world}"))
//! });
//!
//! // This thread becomes the designated context; `run` returns once the
//! // computation has finished and released its handler.
//! looper.run();
//! assert_eq!(greeting.join().unwrap(), "Hello, world!");
//! ```
pub mod dispatch;
pub mod error;
pub mod futures;
pub mod github;
pub mod http;
pub mod task;

pub use error::{Error, Result};
