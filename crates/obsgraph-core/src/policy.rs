#![forbid(unsafe_code)]

//! Notification policy: the switch that lets change propagation run
//! immediately, be dropped, or be deferred into a batch.
//!
//! # Design
//!
//! [`NotificationPolicy`] is a cheap-clone handle to shared state
//! (`Rc<PolicyState>`). Every [`Subject`](crate::Subject) holds one, so the
//! context is injected rather than reached through a hidden global.
//! [`NotificationPolicy::current`] hands out the thread's default instance,
//! created on first use from [`PolicyConfig::from_env`].
//!
//! # State machine
//!
//! ```text
//!              disable_updates(false)
//!   Enabled ──────────────────────────▶ DisabledImmediate
//!     ▲  │     disable_updates(true)
//!     │  └────────────────────────────▶ DisabledDeferred
//!     │                                      │
//!     └────────── enable_updates() ◀─────────┘  (flushes the batch)
//! ```
//!
//! Transitions never stack: the last call wins.
//!
//! # Invariants
//!
//! 1. A listener appears in the pending batch at most once, however many
//!    subjects queued it.
//! 2. `enable_updates` clears the batch before any queued reaction runs; the
//!    batch counts as delivered even if reactions fail.
//! 3. A listener unregistering from subject S withdraws S's contribution to
//!    the batch; it stays pending while another subject still contributes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::config::PolicyConfig;
use crate::error::{FanoutOrigin, NotificationError};
use crate::fanout;
use crate::listener::{Listener, ListenerId};
use crate::subject::SubjectId;

/// Current propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdateMode {
    /// Announcements fan out synchronously.
    #[default]
    Enabled,
    /// Announcements are dropped without a trace.
    DisabledImmediate,
    /// Announcements queue their listeners for the next `enable_updates`.
    DisabledDeferred,
}

impl UpdateMode {
    /// Parse `enabled`, `disabled` or `deferred` (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enabled" | "on" => Some(Self::Enabled),
            "disabled" | "off" => Some(Self::DisabledImmediate),
            "deferred" | "defer" => Some(Self::DisabledDeferred),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::DisabledImmediate => "disabled",
            Self::DisabledDeferred => "deferred",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A listener waiting for the deferred flush, with the subjects that queued it.
struct PendingEntry {
    listener: Weak<dyn Listener>,
    sources: SmallVec<[SubjectId; 2]>,
}

struct PolicyState {
    mode: Cell<UpdateMode>,
    catch_panics: Cell<bool>,
    pending: RefCell<FxHashMap<ListenerId, PendingEntry>>,
}

/// Shared switch controlling whether subject announcements fire, vanish, or
/// wait in a batch.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct NotificationPolicy {
    inner: Rc<PolicyState>,
}

thread_local! {
    static CURRENT: NotificationPolicy = NotificationPolicy::from_env();
}

impl NotificationPolicy {
    /// Isolated policy with default settings (updates enabled).
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&PolicyConfig::default())
    }

    #[must_use]
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            inner: Rc::new(PolicyState {
                mode: Cell::new(config.initial_mode),
                catch_panics: Cell::new(config.catch_panics),
                pending: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    fn from_env() -> Self {
        let parsed = PolicyConfig::from_env_with_diagnostics();
        for err in &parsed.errors {
            tracing::warn!(%err, "ignoring invalid notification policy setting");
        }
        Self::from_config(&parsed.config)
    }

    /// The thread's default policy, created on first use.
    ///
    /// Subjects built with [`Subject::new`](crate::Subject::new) bind to it.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    /// Whether two handles refer to the same policy state.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn mode(&self) -> UpdateMode {
        self.inner.mode.get()
    }

    #[must_use]
    pub fn updates_enabled(&self) -> bool {
        self.mode() == UpdateMode::Enabled
    }

    /// Only meaningful while updates are disabled.
    #[must_use]
    pub fn updates_deferred(&self) -> bool {
        self.mode() == UpdateMode::DisabledDeferred
    }

    #[must_use]
    pub fn catches_panics(&self) -> bool {
        self.inner.catch_panics.get()
    }

    pub fn set_catch_panics(&self, enabled: bool) {
        self.inner.catch_panics.set(enabled);
    }

    /// Stop propagating announcements. With `deferred`, announcing subjects
    /// queue their listeners for the next [`enable_updates`](Self::enable_updates).
    ///
    /// Replaces whatever mode was active; calls do not nest.
    pub fn disable_updates(&self, deferred: bool) {
        let next = if deferred {
            UpdateMode::DisabledDeferred
        } else {
            UpdateMode::DisabledImmediate
        };
        let previous = self.inner.mode.replace(next);
        tracing::debug!(
            from = previous.as_str(),
            to = next.as_str(),
            "notification updates disabled"
        );
    }

    /// Re-enable propagation and flush any deferred listeners.
    ///
    /// The batch is cleared before the first queued reaction runs. Each queued
    /// listener reacts exactly once, whatever the number of subjects that
    /// queued it.
    ///
    /// # Errors
    ///
    /// Returns the aggregated failure if one or more queued reactions failed.
    /// The mode is `Enabled` and the batch empty regardless.
    pub fn enable_updates(&self) -> Result<(), NotificationError> {
        let previous = self.inner.mode.replace(UpdateMode::Enabled);
        if previous != UpdateMode::Enabled {
            tracing::debug!(from = previous.as_str(), "notification updates enabled");
        }

        let batch: Vec<Rc<dyn Listener>> = {
            let mut pending = self.inner.pending.borrow_mut();
            if pending.is_empty() {
                return Ok(());
            }
            pending
                .drain()
                .filter_map(|(_, entry)| entry.listener.upgrade())
                .collect()
        };

        let _span = tracing::debug_span!("deferred_flush", listeners = batch.len()).entered();
        tracing::trace!(listeners = batch.len(), "deferred notification");
        fanout::deliver(&batch, FanoutOrigin::DeferredFlush, self.catches_panics())
    }

    /// Disable with deferral and return a guard that re-enables on
    /// [`DeferGuard::finish`] or drop.
    ///
    /// Guards do not nest: the first one to finish flushes the batch.
    pub fn defer_updates(&self) -> DeferGuard {
        self.disable_updates(true);
        DeferGuard {
            policy: self.clone(),
            finished: false,
        }
    }

    /// Queue `listeners` on behalf of subject `source`. Ignored unless the
    /// policy is in [`UpdateMode::DisabledDeferred`].
    pub(crate) fn merge_pending<I>(&self, source: SubjectId, listeners: I)
    where
        I: IntoIterator<Item = (ListenerId, Weak<dyn Listener>)>,
    {
        if !self.updates_deferred() {
            return;
        }
        let mut pending = self.inner.pending.borrow_mut();
        let before = pending.len();
        let mut offered = 0usize;
        for (id, listener) in listeners {
            offered += 1;
            let entry = pending.entry(id).or_insert_with(|| PendingEntry {
                listener,
                sources: SmallVec::new(),
            });
            if !entry.sources.contains(&source) {
                entry.sources.push(source);
            }
        }
        tracing::trace!(
            subject = source.get(),
            offered,
            added = pending.len() - before,
            "adding listeners to the deferred batch"
        );
    }

    /// Withdraw `source`'s contribution for `listener`. Returns `true` if the
    /// listener left the batch as a result.
    pub(crate) fn withdraw_pending(&self, listener: ListenerId, source: SubjectId) -> bool {
        let mut pending = self.inner.pending.borrow_mut();
        let Some(entry) = pending.get_mut(&listener) else {
            return false;
        };
        entry.sources.retain(|s| *s != source);
        if entry.sources.is_empty() {
            pending.remove(&listener);
            tracing::trace!(listener = listener.get(), "removing listener from the deferred batch");
            true
        } else {
            false
        }
    }

    /// Remove `listener` from the deferred batch regardless of which subjects
    /// queued it. Returns whether it was pending.
    pub fn drop_from_pending(&self, listener: ListenerId) -> bool {
        let removed = self.inner.pending.borrow_mut().remove(&listener).is_some();
        if removed {
            tracing::trace!(listener = listener.get(), "removing listener from the deferred batch");
        }
        removed
    }

    /// Number of listeners awaiting the deferred flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    #[must_use]
    pub fn is_pending(&self, listener: ListenerId) -> bool {
        self.inner.pending.borrow().contains_key(&listener)
    }

    /// Pending listener ids in ascending order.
    #[must_use]
    pub fn pending_listeners(&self) -> Vec<ListenerId> {
        let mut ids: Vec<ListenerId> = self.inner.pending.borrow().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationPolicy")
            .field("mode", &self.mode())
            .field("catch_panics", &self.catches_panics())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Scope in which announcements are deferred.
///
/// [`finish`](Self::finish) re-enables updates and reports the flush result.
/// Dropping an unfinished guard re-enables too; a failed flush is then only
/// logged.
#[must_use = "updates are re-enabled when the guard is dropped"]
pub struct DeferGuard {
    policy: NotificationPolicy,
    finished: bool,
}

impl DeferGuard {
    /// Re-enable updates and flush the batch.
    ///
    /// # Errors
    ///
    /// Returns the aggregated failure of the flush.
    pub fn finish(mut self) -> Result<(), NotificationError> {
        self.finished = true;
        self.policy.enable_updates()
    }
}

impl fmt::Debug for DeferGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferGuard")
            .field("policy", &self.policy)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.policy.enable_updates() {
            tracing::warn!(%err, "deferred flush failed while dropping guard");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReactionError, ReactionResult};
    use crate::listener::Registrations;
    use crate::subject::{Subject, SubjectHandle};
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    struct Probe {
        calls: Cell<u32>,
        fail: bool,
    }

    impl Listener for Probe {
        fn react_to(&self) -> ReactionResult {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(ReactionError::failed("probe"))
            } else {
                Ok(())
            }
        }
    }

    fn probe(fail: bool) -> (ListenerId, Rc<Probe>) {
        (
            ListenerId::next(),
            Rc::new(Probe {
                calls: Cell::new(0),
                fail,
            }),
        )
    }

    fn weak(p: &Rc<Probe>) -> Weak<dyn Listener> {
        let w: Weak<Probe> = Rc::downgrade(p);
        w
    }

    #[test]
    fn starts_enabled() {
        let policy = NotificationPolicy::new();
        assert!(policy.updates_enabled());
        assert!(!policy.updates_deferred());
        assert_eq!(policy.pending_count(), 0);
    }

    #[test]
    fn transitions_replace_state() {
        let policy = NotificationPolicy::new();
        policy.disable_updates(true);
        assert_eq!(policy.mode(), UpdateMode::DisabledDeferred);
        policy.disable_updates(false);
        assert_eq!(policy.mode(), UpdateMode::DisabledImmediate);
        assert!(!policy.updates_enabled());
        assert!(policy.enable_updates().is_ok());
        assert_eq!(policy.mode(), UpdateMode::Enabled);
    }

    #[test]
    fn merge_ignored_unless_deferred() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(false);
        let source = SubjectId::next();
        policy.merge_pending(source, [(id, weak(&p))]);
        assert_eq!(policy.pending_count(), 0);

        policy.disable_updates(false);
        policy.merge_pending(source, [(id, weak(&p))]);
        assert_eq!(policy.pending_count(), 0);
    }

    #[test]
    fn merge_deduplicates_and_flush_reacts_once() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(false);
        policy.disable_updates(true);
        policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        assert_eq!(policy.pending_count(), 1);
        assert!(policy.is_pending(id));

        assert!(policy.enable_updates().is_ok());
        assert_eq!(p.calls.get(), 1);
        assert_eq!(policy.pending_count(), 0);
    }

    #[test]
    fn withdraw_keeps_other_contributions() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(false);
        let (a, b) = (SubjectId::next(), SubjectId::next());
        policy.disable_updates(true);
        policy.merge_pending(a, [(id, weak(&p))]);
        policy.merge_pending(b, [(id, weak(&p))]);

        assert!(!policy.withdraw_pending(id, a));
        assert!(policy.is_pending(id));
        assert!(policy.withdraw_pending(id, b));
        assert!(!policy.is_pending(id));
    }

    #[test]
    fn drop_from_pending_is_unconditional() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(false);
        policy.disable_updates(true);
        policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        assert!(policy.drop_from_pending(id));
        assert!(!policy.drop_from_pending(id));
        assert!(policy.enable_updates().is_ok());
        assert_eq!(p.calls.get(), 0);
    }

    #[test]
    fn flush_failure_still_clears_batch() {
        let policy = NotificationPolicy::new();
        let (bad_id, bad) = probe(true);
        let (good_id, good) = probe(false);
        policy.disable_updates(true);
        policy.merge_pending(SubjectId::next(), [(bad_id, weak(&bad)), (good_id, weak(&good))]);

        let err = policy.enable_updates().unwrap_err();
        assert_eq!(err.origin(), FanoutOrigin::DeferredFlush);
        assert_eq!(err.failed(), 1);
        assert_eq!(bad.calls.get(), 1);
        assert_eq!(good.calls.get(), 1);
        assert_eq!(policy.pending_count(), 0);
        assert!(policy.updates_enabled());

        // No retry on the next enable.
        assert!(policy.enable_updates().is_ok());
        assert_eq!(bad.calls.get(), 1);
    }

    #[test]
    fn dead_pending_listener_is_skipped() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(false);
        policy.disable_updates(true);
        policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        drop(p);
        assert!(policy.enable_updates().is_ok());
        assert_eq!(policy.pending_count(), 0);
    }

    #[test]
    fn defer_guard_finish_flushes() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(false);
        let guard = policy.defer_updates();
        assert!(policy.updates_deferred());
        policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        assert!(guard.finish().is_ok());
        assert!(policy.updates_enabled());
        assert_eq!(p.calls.get(), 1);
    }

    #[test]
    fn defer_guard_drop_reenables() {
        let policy = NotificationPolicy::new();
        let (id, p) = probe(true);
        {
            let _guard = policy.defer_updates();
            policy.merge_pending(SubjectId::next(), [(id, weak(&p))]);
        }
        assert!(policy.updates_enabled());
        assert_eq!(p.calls.get(), 1);
    }

    struct Registered {
        registrations: Registrations,
        calls: Cell<u32>,
        panics: bool,
    }

    impl Listener for Registered {
        fn react_to(&self) -> ReactionResult {
            self.calls.set(self.calls.get() + 1);
            if self.panics {
                panic!("reaction blew up");
            }
            Ok(())
        }
    }

    fn registered_on(subject: &SubjectHandle, panics: bool) -> Rc<Registered> {
        let l = Rc::new_cyclic(|me| Registered {
            registrations: Registrations::new(me),
            calls: Cell::new(0),
            panics,
        });
        l.registrations.register_with(subject);
        l
    }

    #[test]
    fn from_config_starts_deferred() {
        let config = PolicyConfig::default().with_initial_mode(UpdateMode::DisabledDeferred);
        let policy = NotificationPolicy::from_config(&config);
        assert!(policy.updates_deferred());

        let subject = Rc::new(Subject::with_policy(&policy));
        let l = registered_on(&subject, false);
        assert!(subject.announce_change().is_ok());
        assert_eq!(l.calls.get(), 0);
        assert!(policy.is_pending(l.registrations.id()));

        assert!(policy.enable_updates().is_ok());
        assert_eq!(l.calls.get(), 1);
    }

    #[test]
    fn from_config_without_panic_capture_unwinds() {
        let config = PolicyConfig::default().with_catch_panics(false);
        let policy = NotificationPolicy::from_config(&config);
        assert!(!policy.catches_panics());

        let subject = Rc::new(Subject::with_policy(&policy));
        let l = registered_on(&subject, true);
        let outcome = catch_unwind(AssertUnwindSafe(|| subject.announce_change()));
        assert!(outcome.is_err());
        assert_eq!(l.calls.get(), 1);

        policy.set_catch_panics(true);
        let err = subject.announce_change().unwrap_err();
        assert_eq!(err.last_message(), Some("reaction blew up"));
        assert_eq!(l.calls.get(), 2);
    }

    #[test]
    fn current_is_shared_per_thread() {
        let a = NotificationPolicy::current();
        let b = NotificationPolicy::current();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&NotificationPolicy::new()));
    }

    #[test]
    fn parse_modes() {
        assert_eq!(UpdateMode::parse("Enabled"), Some(UpdateMode::Enabled));
        assert_eq!(UpdateMode::parse(" disabled "), Some(UpdateMode::DisabledImmediate));
        assert_eq!(UpdateMode::parse("deferred"), Some(UpdateMode::DisabledDeferred));
        assert_eq!(UpdateMode::parse("later"), None);
        assert_eq!(UpdateMode::DisabledDeferred.to_string(), "deferred");
    }

    #[test]
    fn debug_format() {
        let dbg = format!("{:?}", NotificationPolicy::new());
        assert!(dbg.contains("NotificationPolicy"));
        assert!(dbg.contains("Enabled"));
    }
}
