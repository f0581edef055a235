//! Source resolution: one snapshot type for every kind of dependency.
//!
//! An engine can depend on a plain cell, on another engine instance, or on a
//! named record mixing both. Each kind implements [`Source`], which yields a
//! [`Snapshot`] of the current value plus an aggregate readiness status.
//!
//! | Source                 | value                    | status                                  |
//! |------------------------|--------------------------|-----------------------------------------|
//! | `Cell` / `ReadCell`    | current value            | always `Ready`                          |
//! | `Combine`              | last good data           | mirrors the tag (`Idle` = uninitialised)|
//! | `Record`               | JSON object, only if ready | aggregated over members               |
//!
//! Record aggregation: `Uninitialized` if any member is, else `Error` if any
//! member is, else `Pending` if any member is, else `Ready`.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::cell::{Cell, ReadCell};
use crate::engine::Combine;
use crate::state::CombineState;

/// Aggregate readiness of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// An engine dependency has never left `Idle`.
    Uninitialized,
    Ready,
    Pending,
    Error,
}

/// A resolved source value plus its readiness.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<V> {
    pub value: Option<V>,
    pub status: Status,
}

impl<V> Snapshot<V> {
    pub fn ready(value: V) -> Self {
        Self {
            value: Some(value),
            status: Status::Ready,
        }
    }

    pub fn not_ready(status: Status) -> Self {
        Self {
            value: None,
            status,
        }
    }

    /// The value, if the snapshot is ready.
    pub fn into_ready(self) -> Option<V> {
        match self.status {
            Status::Ready => self.value,
            _ => None,
        }
    }
}

/// Change callback registered on a source. Returning `false` unregisters it.
pub type ChangeListener = Arc<dyn Fn() -> bool + Send + Sync>;

/// A dependency an engine instance can derive from.
pub trait Source: Send + Sync + 'static {
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Resolve the current value and readiness.
    fn snapshot(&self) -> Snapshot<Self::Value>;

    /// Call `listener` on every change until it returns `false`.
    fn subscribe(&self, listener: ChangeListener);
}

impl<T> Source for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn snapshot(&self) -> Snapshot<T> {
        Snapshot::ready(self.get())
    }

    fn subscribe(&self, listener: ChangeListener) {
        self.listen(move |_| listener());
    }
}

impl<T> Source for ReadCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn snapshot(&self) -> Snapshot<T> {
        Snapshot::ready(self.get())
    }

    fn subscribe(&self, listener: ChangeListener) {
        self.listen(move |_| listener());
    }
}

impl<D> Source for Combine<D>
where
    D: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = D;

    fn snapshot(&self) -> Snapshot<D> {
        let state = self.state().get();
        let status = match &state {
            CombineState::Idle => Status::Uninitialized,
            CombineState::Pending { .. } => Status::Pending,
            CombineState::Ready { .. } => Status::Ready,
            CombineState::Error { .. } => Status::Error,
        };
        Snapshot {
            value: state.data().cloned(),
            status,
        }
    }

    fn subscribe(&self, listener: ChangeListener) {
        self.state().listen(move |_| listener());
    }
}

// =============================================================================
// Record
// =============================================================================

trait RecordField: Send + Sync {
    fn snapshot(&self, name: &str) -> Snapshot<Value>;
    fn subscribe(&self, listener: ChangeListener);
}

struct Member<S>(S);

impl<S> RecordField for Member<S>
where
    S: Source,
    S::Value: Serialize,
{
    fn snapshot(&self, name: &str) -> Snapshot<Value> {
        let snapshot = self.0.snapshot();
        let Some(value) = snapshot.value else {
            return Snapshot::not_ready(snapshot.status);
        };
        match serde_json::to_value(&value) {
            Ok(json) => Snapshot {
                value: Some(json),
                status: snapshot.status,
            },
            Err(error) => {
                warn!(field = %name, error = %error, "record field failed to serialize");
                Snapshot::not_ready(Status::Error)
            }
        }
    }

    fn subscribe(&self, listener: ChangeListener) {
        self.0.subscribe(listener);
    }
}

/// A named record of sources, resolved to a JSON object.
///
/// ```ignore
/// let filters = Record::new()
///     .field("query", query_cell)
///     .field("user", user_instance);
///
/// let results = create(filters, |f: Value, _ctx: Context<Value, Page>| async move { ... }, Default::default());
/// ```
///
/// The object is only materialised when every member is ready, so the
/// producer never sees a partial record.
#[derive(Clone, Default)]
pub struct Record {
    fields: Vec<(String, Arc<dyn RecordField>)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. A later member with the same name replaces the earlier one.
    pub fn field<S>(mut self, name: impl Into<String>, source: S) -> Self
    where
        S: Source,
        S::Value: Serialize,
    {
        let name = name.into();
        self.fields.retain(|(existing, _)| *existing != name);
        self.fields.push((name, Arc::new(Member(source))));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Source for Record {
    type Value = Value;

    fn snapshot(&self) -> Snapshot<Value> {
        let mut status = Status::Ready;
        let mut object = Map::with_capacity(self.fields.len());

        for (name, field) in &self.fields {
            let snapshot = field.snapshot(name);
            status = aggregate(status, snapshot.status);
            if let (Status::Ready, Some(value)) = (snapshot.status, snapshot.value) {
                object.insert(name.clone(), value);
            }
        }

        match status {
            Status::Ready => Snapshot::ready(Value::Object(object)),
            other => Snapshot::not_ready(other),
        }
    }

    fn subscribe(&self, listener: ChangeListener) {
        for (_, field) in &self.fields {
            field.subscribe(listener.clone());
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|(name, _)| name))
            .finish()
    }
}

fn aggregate(acc: Status, next: Status) -> Status {
    fn rank(status: Status) -> u8 {
        match status {
            Status::Ready => 0,
            Status::Pending => 1,
            Status::Error => 2,
            Status::Uninitialized => 3,
        }
    }
    if rank(next) > rank(acc) {
        next
    } else {
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cell_is_always_ready() {
        let cell = Cell::new(4);
        assert_eq!(cell.snapshot(), Snapshot::ready(4));
        assert_eq!(cell.read_only().snapshot(), Snapshot::ready(4));
    }

    #[test]
    fn test_record_of_cells_materialises_object() {
        let query = Cell::new("rust".to_string());
        let page = Cell::new(2u32);
        let record = Record::new().field("query", query).field("page", page.clone());

        assert_eq!(
            record.snapshot(),
            Snapshot::ready(json!({"query": "rust", "page": 2}))
        );

        page.set(3);
        assert_eq!(record.snapshot().into_ready(), Some(json!({"query": "rust", "page": 3})));
    }

    #[test]
    fn test_nested_record() {
        let inner = Record::new().field("a", Cell::new(1));
        let outer = Record::new().field("inner", inner).field("b", Cell::new(true));

        assert_eq!(
            outer.snapshot().into_ready(),
            Some(json!({"inner": {"a": 1}, "b": true}))
        );
    }

    #[test]
    fn test_aggregate_precedence() {
        use Status::*;
        let fold = |statuses: &[Status]| statuses.iter().copied().fold(Ready, aggregate);

        assert_eq!(fold(&[Ready, Ready]), Ready);
        assert_eq!(fold(&[Ready, Pending]), Pending);
        assert_eq!(fold(&[Pending, Error, Ready]), Error);
        assert_eq!(fold(&[Error, Uninitialized, Pending]), Uninitialized);
    }

    #[test]
    fn test_record_subscribe_reaches_every_member() {
        let a = Cell::new(1);
        let b = Cell::new(2);
        let record = Record::new().field("a", a.clone()).field("b", b.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        record.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));

        a.set(10);
        b.set(20);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unserializable_member_is_an_error() {
        #[derive(Clone, PartialEq)]
        struct Opaque;

        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("opaque"))
            }
        }

        let record = Record::new().field("ok", Cell::new(1)).field("bad", Cell::new(Opaque));

        assert_eq!(record.snapshot(), Snapshot::not_ready(Status::Error));
    }
}
