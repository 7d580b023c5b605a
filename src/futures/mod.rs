//! Future sub-modules.
//!
//! Futures in this module represent the suspension points a computation can
//! sit on while the [Executor](crate::task::Executor) waits for an external
//! event. They are woken from whichever thread delivers the event; the driver
//! then routes the resumption through the computation's dispatcher.
//!
//! - `call`: adapts a callback-style asynchronous call into a single `.await`.
pub mod call;
