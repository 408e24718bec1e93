#![forbid(unsafe_code)]

//! Subject side of the registration relation.
//!
//! A mutable domain object embeds a [`SubjectHandle`] and calls
//! [`Subject::announce_change`] at the end of every state-changing operation.
//!
//! # Performance
//!
//! | Operation           | Complexity                 |
//! |---------------------|----------------------------|
//! | register/unregister | O(1) average               |
//! | `announce_change()` | O(L) where L = listeners   |
//!
//! # Failure Modes
//!
//! - **Failing reaction**: recorded, the remaining listeners are still
//!   notified, and one [`NotificationError`] is returned afterwards.
//! - **Re-entrant registration**: a reaction may register or unregister
//!   listeners on the announcing subject. The current fan-out is unaffected;
//!   it runs over the snapshot taken before the first reaction.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::error::{FanoutOrigin, NotificationError};
use crate::fanout;
use crate::listener::{Listener, ListenerId};
use crate::policy::{NotificationPolicy, UpdateMode};

static NEXT_SUBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(u64);

impl SubjectId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// Shared-ownership handle through which subjects are reached.
pub type SubjectHandle = Rc<Subject>;

/// Something whose changes listeners can register for.
///
/// Implemented by domain objects that embed a subject.
pub trait Observable {
    fn subject(&self) -> &SubjectHandle;
}

impl Observable for SubjectHandle {
    fn subject(&self) -> &SubjectHandle {
        self
    }
}

/// Holds the listeners registered against it and announces changes to them.
///
/// Registration is only possible through
/// [`Registrations`](crate::Registrations), which keeps both sides of the
/// relation in step.
pub struct Subject {
    id: SubjectId,
    policy: NotificationPolicy,
    listeners: RefCell<FxHashMap<ListenerId, Weak<dyn Listener>>>,
}

impl Subject {
    /// Subject bound to the thread's default [`NotificationPolicy`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(&NotificationPolicy::current())
    }

    /// Subject bound to an explicit policy.
    #[must_use]
    pub fn with_policy(policy: &NotificationPolicy) -> Self {
        Self {
            id: SubjectId::next(),
            policy: policy.clone(),
            listeners: RefCell::new(FxHashMap::default()),
        }
    }

    /// A fresh subject on the same policy. Listeners are not copied: nobody
    /// asked to register with the new subject.
    #[must_use]
    pub fn detached_copy(&self) -> Self {
        Self::with_policy(&self.policy)
    }

    #[must_use]
    pub fn id(&self) -> SubjectId {
        self.id
    }

    #[must_use]
    pub fn policy(&self) -> &NotificationPolicy {
        &self.policy
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    #[must_use]
    pub fn has_listener(&self, listener: ListenerId) -> bool {
        self.listeners.borrow().contains_key(&listener)
    }

    /// Insert `listener`. Returns `true` if it was not registered yet.
    pub(crate) fn register(&self, id: ListenerId, listener: Weak<dyn Listener>) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        if listeners.contains_key(&id) {
            return false;
        }
        listeners.insert(id, listener);
        true
    }

    /// Remove `listener` and withdraw this subject's contribution to the
    /// deferred batch. Returns the number of entries removed (0 or 1).
    pub(crate) fn unregister(&self, id: ListenerId) -> usize {
        self.policy.withdraw_pending(id, self.id);
        usize::from(self.listeners.borrow_mut().remove(&id).is_some())
    }

    /// Tell every registered listener that this subject changed.
    ///
    /// - Updates enabled: each listener in a snapshot of the current set reacts
    ///   exactly once, in unspecified order.
    /// - Disabled and deferred: the listeners join the policy's pending batch.
    /// - Disabled: nothing happens and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns the aggregated failure if any reaction failed. Every listener in
    /// the snapshot has been invoked by then.
    pub fn announce_change(&self) -> Result<(), NotificationError> {
        match self.policy.mode() {
            UpdateMode::Enabled => {}
            UpdateMode::DisabledImmediate => return Ok(()),
            UpdateMode::DisabledDeferred => {
                let queued: Vec<(ListenerId, Weak<dyn Listener>)> = self
                    .listeners
                    .borrow()
                    .iter()
                    .map(|(id, listener)| (*id, listener.clone()))
                    .collect();
                self.policy.merge_pending(self.id, queued);
                return Ok(());
            }
        }

        let snapshot: Vec<Rc<dyn Listener>> = self
            .listeners
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }

        tracing::trace!(subject = self.id.get(), listeners = snapshot.len(), "direct notification");
        fanout::deliver(&snapshot, FanoutOrigin::Announce, self.policy.catches_panics())
    }
}

impl Default for Subject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("id", &self.id)
            .field("listener_count", &self.listener_count())
            .field("mode", &self.policy.mode())
            .finish()
    }
}
