#![forbid(unsafe_code)]

//! Best-effort delivery loop shared by direct announcements and deferred
//! flushes.
//!
//! The caller hands over an owned snapshot; no registration set is borrowed
//! while reactions run, so a reaction may freely register, unregister or drop
//! listeners (including itself).

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use crate::error::{FanoutOrigin, NotificationError, ReactionError, ReactionResult};
use crate::listener::Listener;

/// Invoke every listener in `snapshot` exactly once.
///
/// A failing reaction never stops the loop. If any failed, one aggregated
/// [`NotificationError`] is returned after the last reaction has run.
pub(crate) fn deliver(
    snapshot: &[Rc<dyn Listener>],
    origin: FanoutOrigin,
    catch_panics: bool,
) -> Result<(), NotificationError> {
    let mut failed = 0usize;
    let mut last_message = None;

    for listener in snapshot {
        if let Err(err) = invoke(listener.as_ref(), catch_panics) {
            failed += 1;
            tracing::warn!(origin = origin.as_str(), error = %err, "listener reaction failed");
            if let ReactionError::Failed(msg) = err {
                last_message = Some(msg);
            }
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(NotificationError::new(
            origin,
            snapshot.len(),
            failed,
            last_message,
        ))
    }
}

fn invoke(listener: &dyn Listener, catch_panics: bool) -> ReactionResult {
    if !catch_panics {
        return listener.react_to();
    }
    match catch_unwind(AssertUnwindSafe(|| listener.react_to())) {
        Ok(result) => result,
        Err(payload) => Err(panic_to_error(&*payload)),
    }
}

fn panic_to_error(payload: &(dyn Any + Send)) -> ReactionError {
    if let Some(s) = payload.downcast_ref::<&str>() {
        ReactionError::Failed((*s).to_string())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        ReactionError::Failed(s.clone())
    } else {
        ReactionError::Unknown
    }
}
