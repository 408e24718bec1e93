#![forbid(unsafe_code)]

//! Listener side of the registration relation.
//!
//! A reacting type implements [`Listener`] and embeds a [`Registrations`]
//! value. Because the subjects it registers with keep a non-owning
//! back-reference to it, the type is built with [`Rc::new_cyclic`]:
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::{Rc, Weak};
//! use obsgraph_core::{Listener, ReactionResult, Registrations, Subject};
//!
//! struct Dirty {
//!     registrations: Registrations,
//!     stale: Cell<bool>,
//! }
//!
//! impl Listener for Dirty {
//!     fn react_to(&self) -> ReactionResult {
//!         self.stale.set(true);
//!         Ok(())
//!     }
//! }
//!
//! let quote = Rc::new(Subject::new());
//! let dirty = Rc::new_cyclic(|me: &Weak<Dirty>| Dirty {
//!     registrations: Registrations::new(me),
//!     stale: Cell::new(false),
//! });
//! dirty.registrations.register_with(&quote);
//!
//! quote.announce_change().unwrap();
//! assert!(dirty.stale.get());
//! ```
//!
//! # Invariants
//!
//! 1. For every subject held here, that subject lists this listener's id,
//!    and vice versa.
//! 2. Registering twice with the same subject is the same as once.
//! 3. Dropping a [`Registrations`] unregisters from every subject it holds, so
//!    no subject outlives its listeners' bookkeeping.
//!
//! # Ownership
//!
//! Registrations co-own their subjects (`Rc<Subject>`); subjects hold only
//! `Weak<dyn Listener>` back-references. A subject must only be reached
//! through a [`SubjectHandle`]: that is what guarantees a listener never
//! points at a freed subject.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::error::ReactionResult;
use crate::subject::{Observable, SubjectHandle, SubjectId};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a listener within registration sets and the deferred batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A type that reacts when a subject it registered with announces a change.
pub trait Listener {
    /// React to "something changed".
    ///
    /// Called only by a subject's fan-out or a deferred flush, never directly.
    /// Implementations typically just flag cached state as stale. They may
    /// register or unregister listeners, including themselves.
    ///
    /// # Errors
    ///
    /// A failure is recorded by the caller; sibling listeners are still
    /// notified.
    fn react_to(&self) -> ReactionResult;
}

/// The set of subjects a listener is registered with.
///
/// Dropping it unregisters the owner from all of them.
pub struct Registrations {
    id: ListenerId,
    owner: Weak<dyn Listener>,
    subjects: RefCell<FxHashMap<SubjectId, SubjectHandle>>,
}

impl Registrations {
    /// Empty registration set for the listener behind `owner`.
    ///
    /// `owner` is usually the `Weak` handed out by [`Rc::new_cyclic`].
    #[must_use]
    pub fn new<L: Listener + 'static>(owner: &Weak<L>) -> Self {
        let owner: Weak<dyn Listener> = owner.clone();
        Self {
            id: ListenerId::next(),
            owner,
            subjects: RefCell::new(FxHashMap::default()),
        }
    }

    /// Copy construction: a new registration set for `owner` holding the same
    /// subjects as `self`, with `owner` (not `self`'s owner) registered with
    /// each. `self` is unaffected.
    #[must_use]
    pub fn clone_for<L: Listener + 'static>(&self, owner: &Weak<L>) -> Self {
        let copy = Self::new(owner);
        for subject in self.handles() {
            copy.register_with(&subject);
        }
        copy
    }

    /// Copy assignment: unregister from everything held, then take `source`'s
    /// subjects and register with each. Assigning from itself changes nothing.
    pub fn assign_from(&self, source: &Registrations) {
        if std::ptr::eq(self, source) {
            return;
        }
        let incoming = source.handles();
        self.unregister_with_all();
        for subject in &incoming {
            self.register_with(subject);
        }
    }

    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Register with `subject`, recording both sides of the relation.
    ///
    /// Returns `true` if this created a new registration.
    pub fn register_with(&self, subject: &SubjectHandle) -> bool {
        subject.register(self.id, self.owner.clone());
        let inserted = self
            .subjects
            .borrow_mut()
            .insert(subject.id(), Rc::clone(subject))
            .is_none();
        if inserted {
            tracing::trace!(listener = self.id.get(), subject = subject.id().get(), "registered");
        }
        inserted
    }

    /// Register with the subject facet of a domain object.
    pub fn register_with_observable<O: Observable + ?Sized>(&self, observable: &O) -> bool {
        self.register_with(observable.subject())
    }

    /// Unregister from `subject` on both sides. Returns the number of
    /// registrations removed (0 or 1).
    pub fn unregister_with(&self, subject: &SubjectHandle) -> usize {
        subject.unregister(self.id);
        let removed = self.subjects.borrow_mut().remove(&subject.id());
        usize::from(removed.is_some())
    }

    /// Unregister from every held subject and clear the set.
    pub fn unregister_with_all(&self) {
        let drained: Vec<SubjectHandle> = self
            .subjects
            .borrow_mut()
            .drain()
            .map(|(_, subject)| subject)
            .collect();
        if drained.is_empty() {
            return;
        }
        tracing::trace!(
            listener = self.id.get(),
            subjects = drained.len(),
            "unregistering from all"
        );
        for subject in &drained {
            subject.unregister(self.id);
        }
    }

    #[must_use]
    pub fn subject_count(&self) -> usize {
        self.subjects.borrow().len()
    }

    #[must_use]
    pub fn is_registered_with(&self, subject: &SubjectHandle) -> bool {
        self.subjects.borrow().contains_key(&subject.id())
    }

    /// Handles to every subject currently held.
    #[must_use]
    pub fn handles(&self) -> Vec<SubjectHandle> {
        self.subjects.borrow().values().cloned().collect()
    }
}

impl fmt::Debug for Registrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrations")
            .field("id", &self.id)
            .field("subject_count", &self.subject_count())
            .finish()
    }
}

impl Drop for Registrations {
    fn drop(&mut self) {
        self.unregister_with_all();
    }
}
