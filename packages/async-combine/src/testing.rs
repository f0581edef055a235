//! Testing utilities for engine instances.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! async-combine = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Recording every state
//!
//! ```ignore
//! use async_combine::testing::StateRecorder;
//!
//! let recorder = StateRecorder::new(&instance.state());
//! source.set(2);
//! instance.settled().await;
//!
//! assert!(recorder.values().iter().all(|s| s.data() != Some(&20)));
//! ```
//!
//! ## Holding a producer in flight with `Gate`
//!
//! ```ignore
//! use async_combine::testing::Gate;
//!
//! let gate = Gate::new();
//! let held = gate.clone();
//! let instance = create(source, move |n: u32, _ctx: Context<u32, u32>| {
//!     let held = held.clone();
//!     async move {
//!         held.wait().await;
//!         Ok::<_, Failure>(n)
//!     }
//! }, CombineConfig::default());
//!
//! assert!(instance.is_pending().get());
//! gate.open();
//! instance.settled().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::cell::ReadCell;

/// Records every value a cell takes, starting with the current one.
#[derive(Clone)]
pub struct StateRecorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> StateRecorder<T> {
    pub fn new(cell: &ReadCell<T>) -> Self {
        let values = Arc::new(Mutex::new(vec![cell.get()]));
        let weak = Arc::downgrade(&values);
        cell.listen(move |value: &T| match weak.upgrade() {
            Some(values) => {
                values
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(value.clone());
                true
            }
            None => false,
        });
        Self { values }
    }

    /// Every recorded value, oldest first.
    pub fn values(&self) -> Vec<T> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<T> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any recorded value satisfies `predicate`.
    pub fn any(&self, predicate: impl Fn(&T) -> bool) -> bool {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(predicate)
    }
}

#[derive(Debug, Default)]
struct GateInner {
    open: AtomicBool,
    notify: Notify,
}

/// A latch opened manually. Producers awaiting it stay in flight until then.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        self.inner.open.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

/// Counts calls, e.g. producer invocations.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and return its 1-based number.
    pub fn hit(&self) -> usize {
        self.calls.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}
