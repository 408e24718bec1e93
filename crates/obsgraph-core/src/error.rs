#![forbid(unsafe_code)]

//! Reaction failures and their aggregation.
//!
//! A single listener reports a [`ReactionError`]. A fan-out (direct
//! announcement or deferred flush) attempts every listener in its snapshot and
//! then folds all individual failures into one [`NotificationError`].
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | `Failed(msg)` | Reaction returned or panicked with a description | Counted, message kept if it is the latest |
//! | `Unknown` | Reaction panicked with a non-string payload | Counted, earlier message untouched |
//! | Aggregate | One or more reactions in a fan-out failed | Surfaced once, after the loop completes |

use std::fmt;

/// Outcome of a single [`Listener::react_to`](crate::Listener::react_to) call.
pub type ReactionResult = Result<(), ReactionError>;

/// Failure reported by one listener's reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionError {
    /// The reaction failed with a known description.
    Failed(String),
    /// The reaction failed without a recoverable description.
    Unknown,
}

impl ReactionError {
    /// Convenience constructor for [`ReactionError::Failed`].
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// The failure description, if one was captured.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failed(msg) => Some(msg),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ReactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "reaction failed: {msg}"),
            Self::Unknown => f.write_str("reaction failed with an unknown error"),
        }
    }
}

impl std::error::Error for ReactionError {}

/// A listener that is itself a subject forwards the change to its own
/// dependents; their aggregated failure becomes this listener's failure.
impl From<NotificationError> for ReactionError {
    fn from(err: NotificationError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Which delivery path produced a [`NotificationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanoutOrigin {
    /// `Subject::announce_change` with updates enabled.
    Announce,
    /// `NotificationPolicy::enable_updates` flushing the deferred batch.
    DeferredFlush,
}

impl FanoutOrigin {
    /// Stable lowercase name, used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::DeferredFlush => "deferred_flush",
        }
    }
}

impl fmt::Display for FanoutOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated failure of one fan-out.
///
/// Only the most recent described message survives; messages from earlier
/// failing listeners in the same fan-out are discarded. An
/// [`ReactionError::Unknown`] does not clear a message captured before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationError {
    origin: FanoutOrigin,
    attempted: usize,
    failed: usize,
    last_message: Option<String>,
}

impl NotificationError {
    pub(crate) fn new(
        origin: FanoutOrigin,
        attempted: usize,
        failed: usize,
        last_message: Option<String>,
    ) -> Self {
        Self {
            origin,
            attempted,
            failed,
            last_message,
        }
    }

    /// Delivery path that failed.
    #[must_use]
    pub const fn origin(&self) -> FanoutOrigin {
        self.origin
    }

    /// Number of reactions invoked in the fan-out.
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.attempted
    }

    /// Number of reactions that failed.
    #[must_use]
    pub const fn failed(&self) -> usize {
        self.failed
    }

    /// Last described failure message, if any failure carried one.
    #[must_use]
    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("could not notify one or more listeners")?;
        match &self.last_message {
            Some(msg) => write!(f, ": {msg}"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for NotificationError {}
