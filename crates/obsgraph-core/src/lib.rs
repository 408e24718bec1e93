#![forbid(unsafe_code)]

//! Change propagation between subjects and listeners.
//!
//! # Role
//! `obsgraph-core` is the invalidation backbone of a lazily recalculating
//! model: mutable objects ([`Subject`]) announce that they changed, and
//! dependents ([`Listener`]) react, typically by flagging cached results as
//! stale. The crate knows nothing about what a reaction does.
//!
//! # Primary pieces
//! - **Subject**: holds the ids of registered listeners; `announce_change`.
//! - **Listener / Registrations**: the reacting type and its side of the
//!   relation, which co-owns the subjects it listens to.
//! - **NotificationPolicy**: switch between immediate, dropped and deferred
//!   propagation, plus the pending batch for deferred mode.
//!
//! # Concurrency
//! Single-threaded and synchronous. Fan-out and flush iterate over snapshots,
//! so reactions may change registrations while a notification is in flight.
//! Handles are `Rc`-based and therefore `!Send`; each thread has its own
//! default policy.

pub mod config;
pub mod error;
mod fanout;
pub mod listener;
pub mod policy;
pub mod subject;

pub use config::{ConfigError, PolicyConfig, PolicyConfigParse};
pub use error::{FanoutOrigin, NotificationError, ReactionError, ReactionResult};
pub use listener::{Listener, ListenerId, Registrations};
pub use policy::{DeferGuard, NotificationPolicy, UpdateMode};
pub use subject::{Observable, Subject, SubjectHandle, SubjectId};
