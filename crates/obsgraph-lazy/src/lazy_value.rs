#![forbid(unsafe_code)]

//! Cached derived value that recomputes on demand.
//!
//! # Design
//!
//! [`LazyValue<T>`] sits in the middle of a dependency graph: it listens to
//! its inputs and is itself observable by dependents. A change in any input
//! only flags the cache as stale and forwards the announcement; the compute
//! closure runs on the next [`get`](LazyValue::get).
//!
//! # Invariants
//!
//! 1. The compute closure runs at most once per invalidation.
//! 2. An input change while the value is already stale is not forwarded again
//!    (unless `always_forward` is set): dependents were told the first time.
//! 3. A frozen value keeps serving its cache and does not forward changes;
//!    unfreezing announces once.
//! 4. A notification arriving while this value is already forwarding one is
//!    ignored, so cyclic graphs terminate.
//!
//! # Failure Modes
//!
//! - **Re-entrant get**: a compute closure that reads its own `LazyValue`
//!   recurses without bound. Dependency graphs must be acyclic for reads.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use obsgraph_core::{
    Listener, NotificationError, NotificationPolicy, Observable, ReactionResult, Registrations,
    Subject, SubjectHandle,
};

type Compute<T> = Box<dyn Fn() -> T>;

/// Puts a flag back to `restore` when dropped, including during unwinding.
struct FlagReset<'a> {
    flag: &'a Cell<bool>,
    restore: bool,
}

impl<'a> FlagReset<'a> {
    fn new(flag: &'a Cell<bool>, restore: bool) -> Self {
        Self { flag, restore }
    }
}

impl Drop for FlagReset<'_> {
    fn drop(&mut self) {
        self.flag.set(self.restore);
    }
}

/// A lazily recalculated value that is both a listener and a subject.
pub struct LazyValue<T> {
    registrations: Registrations,
    subject: SubjectHandle,
    compute: Compute<T>,
    cache: RefCell<Option<T>>,
    calculated: Cell<bool>,
    frozen: Cell<bool>,
    always_forward: Cell<bool>,
    updating: Cell<bool>,
}

impl<T: Clone + 'static> LazyValue<T> {
    /// New stale value bound to the thread's default policy.
    #[must_use]
    pub fn new(compute: impl Fn() -> T + 'static) -> Rc<Self> {
        Self::with_policy(&NotificationPolicy::current(), compute)
    }

    #[must_use]
    pub fn with_policy(policy: &NotificationPolicy, compute: impl Fn() -> T + 'static) -> Rc<Self> {
        Rc::new_cyclic(|me: &Weak<Self>| Self {
            registrations: Registrations::new(me),
            subject: Rc::new(Subject::with_policy(policy)),
            compute: Box::new(compute),
            cache: RefCell::new(None),
            calculated: Cell::new(false),
            frozen: Cell::new(false),
            always_forward: Cell::new(false),
            updating: Cell::new(false),
        })
    }

    /// Announce every input change to dependents, even while already stale.
    ///
    /// Off by default: a stale value forwards only the first change.
    pub fn set_always_forward(&self, enabled: bool) {
        self.always_forward.set(enabled);
    }

    /// Register with `input`; returns `true` if the dependency is new.
    pub fn depends_on<O: Observable + ?Sized>(&self, input: &O) -> bool {
        self.registrations.register_with_observable(input)
    }

    /// Drop the dependency on `input`.
    pub fn forget<O: Observable + ?Sized>(&self, input: &O) -> usize {
        self.registrations.unregister_with(input.subject())
    }

    #[must_use]
    pub fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    /// Current value, recomputing first if stale.
    pub fn get(&self) -> T {
        if self.calculated.get() || self.frozen.get() {
            if let Some(value) = self.cache.borrow().as_ref() {
                return value.clone();
            }
        }
        let value = (self.compute)();
        *self.cache.borrow_mut() = Some(value.clone());
        self.calculated.set(true);
        value
    }

    #[must_use]
    pub fn is_calculated(&self) -> bool {
        self.calculated.get()
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }

    /// Recompute now, even if frozen, and announce the new value.
    ///
    /// # Errors
    ///
    /// Returns the aggregated failure of the dependents' reactions.
    pub fn recalculate(&self) -> Result<(), NotificationError> {
        let was_frozen = self.frozen.replace(false);
        {
            let _restore = FlagReset::new(&self.frozen, was_frozen);
            self.calculated.set(false);
            self.get();
        }
        self.subject.announce_change()
    }

    /// Stop invalidating on input changes; `get` serves the cache.
    pub fn freeze(&self) {
        self.frozen.set(true);
    }

    /// Resume invalidation and announce once so dependents catch up.
    ///
    /// The cache stays valid unless an input changed while frozen.
    ///
    /// # Errors
    ///
    /// Returns the aggregated failure of the dependents' reactions.
    pub fn unfreeze(&self) -> Result<(), NotificationError> {
        if !self.frozen.replace(false) {
            return Ok(());
        }
        self.subject.announce_change()
    }
}

impl<T> Listener for LazyValue<T> {
    fn react_to(&self) -> ReactionResult {
        if self.updating.get() {
            return Ok(());
        }
        if !(self.calculated.get() || self.always_forward.get()) {
            return Ok(());
        }
        self.calculated.set(false);
        if self.frozen.get() {
            return Ok(());
        }
        self.updating.set(true);
        let forwarded = {
            let _reset = FlagReset::new(&self.updating, false);
            self.subject.announce_change()
        };
        tracing::trace!(
            listener = self.registrations.id().get(),
            ok = forwarded.is_ok(),
            "lazy value invalidated"
        );
        Ok(forwarded?)
    }
}

impl<T> Observable for LazyValue<T> {
    fn subject(&self) -> &SubjectHandle {
        &self.subject
    }
}

impl<T: fmt::Debug> fmt::Debug for LazyValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyValue")
            .field("cache", &*self.cache.borrow())
            .field("calculated", &self.calculated.get())
            .field("frozen", &self.frozen.get())
            .field("dependencies", &self.registrations.subject_count())
            .field("dependents", &self.subject.listener_count())
            .finish()
    }
}
