//! Contexts handed to extension handlers and producers.
//!
//! Extension-contributed fields live in [`Extras`], a map keyed by type.
//! Each extension defines its own newtype for what it contributes, so fields
//! from different extensions never collide by accident:
//!
//! ```ignore
//! #[derive(Clone)]
//! struct Offset(usize);
//!
//! let next = next.run(Extras::new().with(Offset(20))).await?;
//!
//! // later, in the producer
//! let offset = ctx.get::<Offset>().map(|o| o.0).unwrap_or(0);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::token::CancelToken;

// =============================================================================
// Extras
// =============================================================================

/// A map of values keyed by their type.
///
/// Used for context fields contributed by extensions, context patches passed
/// down the chain, and instance extras exposed on the engine handle.
#[derive(Clone, Default)]
pub struct Extras {
    fields: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Extras::insert`].
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Insert `value`, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.fields.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.fields
            .get(&TypeId::of::<T>())
            .and_then(|value| (**value).downcast_ref::<T>())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.fields.contains_key(&TypeId::of::<T>())
    }

    /// Copy every field of `other` into `self`; `other` wins on conflicts.
    pub fn extend(&mut self, other: &Extras) {
        for (id, value) in &other.fields {
            self.fields.insert(*id, value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for Extras {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extras")
            .field("fields", &self.fields.len())
            .finish()
    }
}

// =============================================================================
// Handler context
// =============================================================================

/// What an extension handler sees.
///
/// Handlers are independent of the source type, so the previous source value
/// is only available to the producer.
pub struct ChainContext<D> {
    pub(crate) token: CancelToken,
    pub(crate) prev_data: Option<D>,
    pub(crate) fields: Extras,
}

impl<D> ChainContext<D> {
    /// The token of the current execution attempt.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn prev_data(&self) -> Option<&D> {
        self.prev_data.as_ref()
    }

    /// A field contributed by this or an outer extension.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.fields.get::<T>()
    }

    pub fn fields(&self) -> &Extras {
        &self.fields
    }
}

// =============================================================================
// Producer context
// =============================================================================

/// What the producer sees: `{token, prev_source, prev_data}` plus every field
/// contributed by the extension chain.
pub struct Context<V, D> {
    pub(crate) token: CancelToken,
    pub(crate) prev_source: Option<V>,
    pub(crate) prev_data: Option<D>,
    pub(crate) fields: Extras,
}

impl<V, D> Context<V, D> {
    /// The token of the current execution attempt.
    ///
    /// Wrap slow operations with [`CancelToken::race`] to stop them early
    /// once a newer attempt starts.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The source value of the last successful run.
    ///
    /// `None` before the first success, after a decline, and after
    /// `set_data`.
    pub fn prev_source(&self) -> Option<&V> {
        self.prev_source.as_ref()
    }

    /// Data of the last `Ready` state.
    pub fn prev_data(&self) -> Option<&D> {
        self.prev_data.as_ref()
    }

    /// A field contributed by the extension chain.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.fields.get::<T>()
    }

    pub fn fields(&self) -> &Extras {
        &self.fields
    }
}

impl<V: fmt::Debug, D: fmt::Debug> fmt::Debug for Context<V, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("token", &self.token)
            .field("prev_source", &self.prev_source)
            .field("prev_data", &self.prev_data)
            .field("fields", &self.fields)
            .finish()
    }
}
