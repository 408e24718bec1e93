#![forbid(unsafe_code)]

//! Lazily recalculated values on top of `obsgraph-core`.
//!
//! - [`SimpleValue`]: a settable leaf input that announces changes.
//! - [`LazyValue`]: a cached derived value that listens to its inputs,
//!   invalidates on change, forwards the announcement to its own dependents
//!   and recomputes only when read.
//!
//! Together they form the usual invalidate-now, recompute-later pattern: a
//! burst of input changes costs one recomputation per derived value, and
//! [`NotificationPolicy::defer_updates`](obsgraph_core::NotificationPolicy::defer_updates)
//! collapses the notification traffic as well.

pub mod lazy_value;
pub mod simple_value;

pub use lazy_value::LazyValue;
pub use simple_value::SimpleValue;
