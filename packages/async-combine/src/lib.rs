//! # Async Combine
//!
//! A reactive async-derivation engine: derive a value from reactive inputs by
//! running an async producer whenever they change, publish it through a
//! four-phase lifecycle, and never observe a result older than the newest
//! started run.
//!
//! ## Core Concepts
//!
//! - [`Cell`] = a mutable reactive value
//! - [`Source`] = anything an instance can derive from (cells, other
//!   instances, named [`Record`]s of both)
//! - [`Combine`] = one engine instance, created with [`create`]
//! - [`Extension`] = middleware wrapping the producer
//!
//! ## Architecture
//!
//! ```text
//! Cell / Combine / Record
//!     │ change
//!     ▼
//! Source Resolver ──► snapshot {value, status}
//!     │
//!     ▼
//! Execution Engine (driver task per instance)
//!     │  coalesce intents, revoke old token, dedup, Pending
//!     ▼
//! Extension Chain ──► handler[0] ──► handler[1] ──► producer
//!     │
//!     ▼ commit (only if the attempt's token is still live)
//! State Cell: Idle | Pending | Ready | Error
//!     │
//!     └─► data / is_error / is_pending projections, dependent instances
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Latest wins** - an attempt's result is committed only while its token
//!    is the live one; starting a new attempt revokes the previous token
//! 2. **One writer** - only the engine replaces the state, always as a whole
//! 3. **Prev data is last-good** - `prev_data` always comes from a `Ready` state
//! 4. **Cooperative cancellation** - only work raced against the token stops early
//!
//! ## Example
//!
//! ```ignore
//! use async_combine::{create, Cell, CombineConfig, Context, Failure};
//!
//! let user_id = Cell::new(1u64);
//!
//! let profile = create(user_id.clone(), |id: u64, ctx: Context<u64, Profile>| async move {
//!     let profile = ctx.token().race(api.profile(id)).await??;
//!     Ok::<_, Failure>(profile)
//! }, CombineConfig::default());
//!
//! user_id.set(2);           // supersedes the run for user 1
//! profile.settled().await;
//!
//! match profile.state().get() {
//!     CombineState::Ready { data } => render(data),
//!     CombineState::Error { cause, .. } => show(cause),
//!     _ => {}
//! }
//! ```
//!
//! ## What This Is Not
//!
//! Async Combine is **not**:
//! - A general task scheduler
//! - A persistent store
//! - A network client

// Core modules
mod cell;
mod context;
mod engine;
mod error;
mod extension;
mod merge;
mod source;
mod state;
mod token;

// Shared defaults and instance settings
pub mod config;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export reactive primitives
pub use cell::{Cell, ReadCell};

// Re-export source types
pub use source::{ChangeListener, Record, Snapshot, Source, Status};

// Re-export state and cancellation
pub use state::CombineState;
pub use token::{CancelToken, Cancelled};

// Re-export error types
pub use error::{CombineError, Failure, MergeError, MergeSide};

// Re-export extension types
pub use context::{ChainContext, Context, Extras};
pub use extension::{
    ChainResult, Extension, ExtensionConfig, ExtensionScope, IntoPipeline, Next, Outcome,
    Pipeline, Producer, SlotTrigger,
};
pub use merge::Merge;

// Re-export engine types (primary entry point)
pub use engine::{create, Combine, InstanceId};

// Re-export configuration
pub use config::{configure, CombineConfig, ConfigureOptions, Configured};

// Re-export commonly used external types
pub use async_trait::async_trait;
