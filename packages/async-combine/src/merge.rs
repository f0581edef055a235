//! Array merging for paginated results.
//!
//! Merging prepends the previous `Ready` data's elements to the freshly
//! produced batch, so successive "load next" runs accumulate:
//!
//! ```text
//! prev  [1, 2, 3]
//! next           [4, 5, 6]
//! ────────────────────────
//! data  [1, 2, 3, 4, 5, 6]
//! ```

use serde_json::Value;

use crate::error::{MergeError, MergeSide};

/// Data that can absorb the previous `Ready` data's elements.
pub trait Merge {
    /// Prepend the elements of `prev` to `self`.
    fn merge_prev(&mut self, prev: &Self) -> Result<(), MergeError>;
}

impl<T: Clone> Merge for Vec<T> {
    fn merge_prev(&mut self, prev: &Self) -> Result<(), MergeError> {
        let mut merged = Vec::with_capacity(prev.len() + self.len());
        merged.extend(prev.iter().cloned());
        merged.append(self);
        *self = merged;
        Ok(())
    }
}

impl Merge for Value {
    fn merge_prev(&mut self, prev: &Self) -> Result<(), MergeError> {
        let found = describe(Some(&*self));
        let Value::Array(next_items) = self else {
            return Err(MergeError::NotAnArray {
                side: MergeSide::Next,
                found,
            });
        };
        let Value::Array(prev_items) = prev else {
            return Err(MergeError::NotAnArray {
                side: MergeSide::Previous,
                found: describe(Some(prev)),
            });
        };
        next_items.merge_prev(prev_items)
    }
}

/// Merge the arrays stored under `key` in two JSON objects.
pub(crate) fn merge_value_at(next: &mut Value, prev: &Value, key: &str) -> Result<(), MergeError> {
    let found = describe(next.get(key));
    let Some(Value::Array(next_items)) = next.get_mut(key) else {
        return Err(MergeError::KeyNotAnArray {
            key: key.to_string(),
            side: MergeSide::Next,
            found,
        });
    };
    let Some(Value::Array(prev_items)) = prev.get(key) else {
        return Err(MergeError::KeyNotAnArray {
            key: key.to_string(),
            side: MergeSide::Previous,
            found: describe(prev.get(key)),
        });
    };
    next_items.merge_prev(prev_items)
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "nothing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string",
        Some(Value::Array(_)) => "an array",
        Some(Value::Object(_)) => "an object",
    }
}
