//! The published four-phase state of one engine instance.
//!
//! ```text
//!            ┌──────── set_data ─────────────────────┐
//!            │                                       ▼
//!  Idle ──► Pending ──► Ready ──► Pending ──► Error ──► Pending ...
//!   ▲          │                                       │
//!   └─ decline ┘◄──────────── decline ─────────────────┘
//! ```
//!
//! Every transition is a whole-value replacement, and the boolean
//! projections are derived from the tag, so they can never disagree.

use crate::error::CombineError;

/// Lifecycle state of an engine instance.
#[derive(Debug, Clone, PartialEq)]
pub enum CombineState<D> {
    /// No data and nothing running.
    Idle,
    /// A run is in flight.
    Pending {
        /// Data of the last `Ready` state, if any.
        prev_data: Option<D>,
        /// The error of the state this run replaced, if it was `Error`.
        prev_error: Option<CombineError>,
    },
    /// The latest committed value.
    Ready { data: D },
    /// The last run failed.
    Error {
        cause: CombineError,
        /// Data of the last `Ready` state, retained across failures.
        prev_data: Option<D>,
    },
}

impl<D> Default for CombineState<D> {
    fn default() -> Self {
        CombineState::Idle
    }
}

impl<D> CombineState<D> {
    pub fn is_idle(&self) -> bool {
        matches!(self, CombineState::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CombineState::Pending { .. })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CombineState::Ready { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CombineState::Error { .. })
    }

    /// Last good data: the `Ready` payload, or the carried `prev_data`.
    pub fn data(&self) -> Option<&D> {
        match self {
            CombineState::Idle => None,
            CombineState::Ready { data } => Some(data),
            CombineState::Pending { prev_data, .. } | CombineState::Error { prev_data, .. } => {
                prev_data.as_ref()
            }
        }
    }

    /// The current error, or the one a pending run is replacing.
    pub fn error(&self) -> Option<&CombineError> {
        match self {
            CombineState::Error { cause, .. } => Some(cause),
            CombineState::Pending { prev_error, .. } => prev_error.as_ref(),
            _ => None,
        }
    }

    /// Short tag name, used as a logging field.
    pub fn tag(&self) -> &'static str {
        match self {
            CombineState::Idle => "idle",
            CombineState::Pending { .. } => "pending",
            CombineState::Ready { .. } => "ready",
            CombineState::Error { .. } => "error",
        }
    }
}

impl<D: Clone> CombineState<D> {
    /// The `Pending` state that replaces `self` when a run starts.
    pub(crate) fn to_pending(&self) -> Self {
        CombineState::Pending {
            prev_data: self.data().cloned(),
            prev_error: self.error().cloned(),
        }
    }

    /// The `Error` state that replaces `self` when a run fails.
    pub(crate) fn to_error(&self, cause: CombineError) -> Self {
        CombineState::Error {
            cause,
            prev_data: self.data().cloned(),
        }
    }
}
