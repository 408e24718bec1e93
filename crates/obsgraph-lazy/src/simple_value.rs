#![forbid(unsafe_code)]

//! Settable input that announces when its value changes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use obsgraph_core::{NotificationError, NotificationPolicy, Observable, Subject, SubjectHandle};

/// A mutable leaf value (a quote, a fixing, a notional) that listeners can
/// depend on.
///
/// Setting a value equal to the current one is a no-op: nothing is announced.
pub struct SimpleValue<T> {
    value: RefCell<T>,
    subject: SubjectHandle,
}

impl<T: Clone + PartialEq> SimpleValue<T> {
    /// Value bound to the thread's default policy.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_policy(value, &NotificationPolicy::current())
    }

    #[must_use]
    pub fn with_policy(value: T, policy: &NotificationPolicy) -> Self {
        Self {
            value: RefCell::new(value),
            subject: Rc::new(Subject::with_policy(policy)),
        }
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Store `value` and announce the change if it differs from the current
    /// one.
    ///
    /// # Errors
    ///
    /// Returns the aggregated failure of the listeners' reactions. The new
    /// value is stored regardless.
    pub fn set(&self, value: T) -> Result<(), NotificationError> {
        {
            let mut current = self.value.borrow_mut();
            if *current == value {
                return Ok(());
            }
            *current = value;
        }
        self.subject.announce_change()
    }
}

impl<T> Observable for SimpleValue<T> {
    fn subject(&self) -> &SubjectHandle {
        &self.subject
    }
}

impl<T: fmt::Debug> fmt::Debug for SimpleValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleValue")
            .field("value", &*self.value.borrow())
            .field("listener_count", &self.subject.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsgraph_core::{Listener, ReactionResult, Registrations};
    use std::cell::Cell;

    struct Watcher {
        registrations: Registrations,
        hits: Cell<u32>,
    }

    impl Listener for Watcher {
        fn react_to(&self) -> ReactionResult {
            self.hits.set(self.hits.get() + 1);
            Ok(())
        }
    }

    fn watch(value: &SimpleValue<f64>) -> Rc<Watcher> {
        let w = Rc::new_cyclic(|me| Watcher {
            registrations: Registrations::new(me),
            hits: Cell::new(0),
        });
        w.registrations.register_with_observable(value);
        w
    }

    #[test]
    fn set_announces_change() {
        let policy = NotificationPolicy::new();
        let quote = SimpleValue::with_policy(1.0, &policy);
        let w = watch(&quote);
        quote.set(1.5).unwrap();
        assert_eq!(quote.get(), 1.5);
        assert_eq!(w.hits.get(), 1);
    }

    #[test]
    fn equal_value_is_silent() {
        let policy = NotificationPolicy::new();
        let quote = SimpleValue::with_policy(1.0, &policy);
        let w = watch(&quote);
        quote.set(1.0).unwrap();
        assert_eq!(w.hits.get(), 0);
    }

    #[test]
    fn deferred_sets_coalesce() {
        let policy = NotificationPolicy::new();
        let quote = SimpleValue::with_policy(1.0, &policy);
        let w = watch(&quote);
        let guard = policy.defer_updates();
        quote.set(2.0).unwrap();
        quote.set(3.0).unwrap();
        assert_eq!(w.hits.get(), 0);
        guard.finish().unwrap();
        assert_eq!(w.hits.get(), 1);
        assert_eq!(quote.get(), 3.0);
    }

    #[test]
    fn debug_format() {
        let quote = SimpleValue::with_policy(42, &NotificationPolicy::new());
        let dbg = format!("{quote:?}");
        assert!(dbg.contains("SimpleValue"));
        assert!(dbg.contains("42"));
    }
}
