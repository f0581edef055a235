//! Failure taxonomy for producers, handlers, and result merging.
//!
//! Producers and extension handlers return `Result<_, Failure>`. The engine
//! sorts every failure into one of three internal signals or one
//! user-visible error:
//!
//! | Failure                               | Resulting state          | Logged | `on_error` |
//! |---------------------------------------|--------------------------|--------|------------|
//! | [`Failure::Declined`]                 | `Idle`                   | no     | no         |
//! | [`Cancelled`] from a revoked attempt  | unchanged (discarded)    | no     | no         |
//! | dedup skip (engine-internal)          | last stable snapshot     | no     | no         |
//! | any other cause                       | `Error(cause, prev_data)`| once   | yes        |
//!
//! # The Conversion Rule
//!
//! `Failure` converts from anything that converts into `anyhow::Error`, so `?`
//! works on any error inside a producer:
//!
//! ```ignore
//! let rows = ctx.token().race(db.fetch(query)).await?;  // Cancelled -> discarded
//! let page: Page = serde_json::from_value(source)?;     // -> Error state
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::token::Cancelled;

// =============================================================================
// Failure
// =============================================================================

/// Why a producer or handler did not produce data.
pub enum Failure {
    /// The producer chose not to produce a value. The instance returns to `Idle`.
    Declined,
    /// Anything else. Cancellation causes from a revoked attempt are discarded.
    Failed(anyhow::Error),
}

impl Failure {
    /// Shorthand for [`Failure::Declined`].
    pub fn declined() -> Self {
        Failure::Declined
    }

    /// Build a failure from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Failure::Failed(anyhow::Error::msg(message))
    }

    /// Whether the cause is a token cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Failure::Declined => false,
            Failure::Failed(cause) => cause.is::<Cancelled>(),
        }
    }
}

impl<E> From<E> for Failure
where
    E: Into<anyhow::Error>,
{
    fn from(error: E) -> Self {
        Failure::Failed(error.into())
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Declined => f.write_str("Declined"),
            Failure::Failed(cause) => f.debug_tuple("Failed").field(cause).finish(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Declined => f.write_str("producer declined"),
            Failure::Failed(cause) => write!(f, "{cause}"),
        }
    }
}

// =============================================================================
// CombineError
// =============================================================================

struct CombineErrorInner {
    cause: anyhow::Error,
    logged: AtomicBool,
}

/// A user-visible failure, wrapped once around the original cause.
///
/// Cheap to clone; clones share the cause and the once-only `logged` flag.
/// When a producer forwards a `CombineError` it received from another
/// instance, the engine reuses it instead of wrapping it again, so the cause
/// is logged exactly once across the whole dependency graph.
#[derive(Clone, Error)]
#[error("{}", .inner.cause)]
pub struct CombineError {
    inner: Arc<CombineErrorInner>,
}

impl CombineError {
    pub(crate) fn new(cause: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(CombineErrorInner {
                cause,
                logged: AtomicBool::new(false),
            }),
        }
    }

    /// Wrap `cause`, reusing it if it already is a `CombineError`.
    pub(crate) fn from_cause(cause: anyhow::Error) -> Self {
        match cause.downcast::<CombineError>() {
            Ok(existing) => existing,
            Err(cause) => Self::new(cause),
        }
    }

    /// The original cause.
    pub fn cause(&self) -> &anyhow::Error {
        &self.inner.cause
    }

    /// Downcast the original cause.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.cause.downcast_ref::<E>()
    }

    /// Whether the cause has already been logged.
    pub fn is_logged(&self) -> bool {
        self.inner.logged.load(Ordering::Acquire)
    }

    /// Mark as logged. Returns `true` only for the first caller.
    pub(crate) fn mark_logged(&self) -> bool {
        !self.inner.logged.swap(true, Ordering::AcqRel)
    }

    /// Whether two errors share the same underlying cause.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for CombineError {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for CombineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombineError")
            .field("cause", &self.inner.cause)
            .field("logged", &self.is_logged())
            .finish()
    }
}

// =============================================================================
// MergeError
// =============================================================================

/// Which side of a merge was malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSide {
    /// The previously committed data.
    Previous,
    /// The data the current execution produced.
    Next,
}

impl fmt::Display for MergeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeSide::Previous => write!(f, "previous"),
            MergeSide::Next => write!(f, "next"),
        }
    }
}

/// Merging with previous data only works on arrays.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("merging with previous data allowed only for arrays, but {side} data is {found}")]
    NotAnArray {
        side: MergeSide,
        found: &'static str,
    },

    #[error("merging with previous data at key {key:?} allowed only for arrays, but {side} data has {found}")]
    KeyNotAnArray {
        key: String,
        side: MergeSide,
        found: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn fallible() -> Result<(), Boom> {
        Err(Boom)
    }

    fn produce() -> Result<u32, Failure> {
        fallible()?;
        Ok(1)
    }

    #[test]
    fn test_question_mark_converts_into_failed() {
        match produce() {
            Err(Failure::Failed(cause)) => assert!(cause.is::<Boom>()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_is_recognised() {
        let failure: Failure = Cancelled.into();
        assert!(failure.is_cancelled());
        assert!(!Failure::declined().is_cancelled());
        assert!(!Failure::msg("nope").is_cancelled());
    }

    #[test]
    fn test_from_cause_reuses_existing_combine_error() {
        let original = CombineError::new(anyhow::anyhow!("upstream broke"));
        let forwarded: anyhow::Error = original.clone().into();

        let rewrapped = CombineError::from_cause(forwarded);

        assert!(rewrapped.ptr_eq(&original));
        assert_eq!(rewrapped.to_string(), "upstream broke");
    }

    #[test]
    fn test_mark_logged_is_once_only() {
        let error = CombineError::new(anyhow::anyhow!("x"));
        let clone = error.clone();

        assert!(error.mark_logged());
        assert!(!clone.mark_logged());
        assert!(clone.is_logged());
    }

    #[test]
    fn test_downcast_original_cause() {
        let error = CombineError::new(Boom.into());
        assert!(error.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn test_merge_error_messages() {
        let err = MergeError::KeyNotAnArray {
            key: "items".into(),
            side: MergeSide::Next,
            found: "a string",
        };
        assert_eq!(
            err.to_string(),
            "merging with previous data at key \"items\" allowed only for arrays, but next data has a string"
        );
    }
}
