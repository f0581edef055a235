//! Reactive cells - the mutable values engines observe and publish.
//!
//! A [`Cell`] holds one value and notifies two kinds of observers when it is
//! replaced:
//!
//! - **Listeners** registered with [`Cell::listen`] run synchronously inside
//!   `set`, in registration order. Engines use them to enqueue work the moment
//!   a source changes, so the change is accounted for before `set` returns.
//! - **Receivers** from [`Cell::subscribe`] are `tokio::sync::watch` receivers
//!   for async consumers that only care about the latest value.
//!
//! [`ReadCell`] is the read-only half. Engine projections (`state`, `data`,
//! `is_error`, `is_pending`) are handed out as `ReadCell`s so only the engine
//! can write them.
//!
//! # Example
//!
//! ```ignore
//! let count = Cell::new(1);
//! let doubled = count.map(|n| n * 2);
//!
//! count.set(21);
//! assert_eq!(doubled.get(), 42);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

/// Synchronous change callback. Returning `false` unregisters it.
type Listener<T> = dyn Fn(&T) -> bool + Send + Sync;

struct Shared<T> {
    sender: watch::Sender<T>,
    listeners: Mutex<Vec<Arc<Listener<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn new(value: T) -> Self {
        let (sender, _) = watch::channel(value);
        Self {
            sender,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    fn replace(&self, value: T) {
        self.sender.send_replace(value.clone());
        self.notify(&value);
    }

    fn listen(&self, listener: Arc<Listener<T>>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Run listeners outside the lock so they may touch other cells (or this one).
    fn notify(&self, value: &T) {
        let snapshot: Vec<Arc<Listener<T>>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let dead: Vec<Arc<Listener<T>>> = snapshot
            .into_iter()
            .filter(|listener| !listener(value))
            .collect();

        if !dead.is_empty() {
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|listener| !dead.iter().any(|d| Arc::ptr_eq(d, listener)));
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// =============================================================================
// Cell
// =============================================================================

/// A mutable reactive value.
///
/// Cloning a `Cell` clones the handle, not the value: every clone reads and
/// writes the same slot.
pub struct Cell<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared::new(value)),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.shared.get()
    }

    /// Replace the value and notify every observer.
    ///
    /// Observers are notified even if the new value equals the old one;
    /// deduplication is left to whoever consumes the change.
    pub fn set(&self, value: T) {
        self.shared.replace(value);
    }

    /// Replace the value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.shared.get());
        self.shared.replace(next);
    }

    /// Subscribe to changes asynchronously.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.shared.sender.subscribe()
    }

    /// Register a synchronous change listener.
    ///
    /// The listener runs inside every subsequent `set` and stays registered
    /// until it returns `false`.
    pub fn listen<F>(&self, listener: F)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.shared.listen(Arc::new(listener));
    }

    /// Derive a read-only cell that tracks `f(value)`.
    ///
    /// The derived cell stops tracking once every handle to it is dropped.
    pub fn map<U, F>(&self, f: F) -> ReadCell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        map_shared(&self.shared, f)
    }

    /// A read-only handle to the same value.
    pub fn read_only(&self) -> ReadCell<T> {
        ReadCell {
            shared: self.shared.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.shared.listener_count()
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cell").field(&*self.shared.sender.borrow()).finish()
    }
}

// =============================================================================
// ReadCell
// =============================================================================

/// Read-only view of a [`Cell`].
pub struct ReadCell<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> ReadCell<T> {
    /// Current value.
    pub fn get(&self) -> T {
        self.shared.get()
    }

    /// Subscribe to changes asynchronously.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.shared.sender.subscribe()
    }

    /// Register a synchronous change listener. See [`Cell::listen`].
    pub fn listen<F>(&self, listener: F)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.shared.listen(Arc::new(listener));
    }

    /// Derive a read-only cell that tracks `f(value)`.
    pub fn map<U, F>(&self, f: F) -> ReadCell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        map_shared(&self.shared, f)
    }
}

impl<T> Clone for ReadCell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadCell")
            .field(&*self.shared.sender.borrow())
            .finish()
    }
}

fn map_shared<T, U, F>(source: &Arc<Shared<T>>, f: F) -> ReadCell<U>
where
    T: Clone + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    let derived = Arc::new(Shared::new(f(&source.get())));
    let weak = Arc::downgrade(&derived);

    source.listen(Arc::new(move |value: &T| match weak.upgrade() {
        Some(derived) => {
            derived.replace(f(value));
            true
        }
        None => false,
    }));

    ReadCell { shared: derived }
}
