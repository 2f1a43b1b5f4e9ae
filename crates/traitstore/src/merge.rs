#![forbid(unsafe_code)]

//! Deep merge of an incoming value into the previous one.
//!
//! Two key/value records merge recursively: keys present in `next` win,
//! keys only in `prev` survive. Every other pairing replaces: scalars,
//! arrays, and null all overwrite whatever was there before. Null is the
//! clear sentinel, so merging null over anything yields null.

use serde_json::Value;

/// Merge `next` into `prev`.
#[must_use]
pub fn deep_merge(prev: Value, next: Value) -> Value {
    match (prev, next) {
        (Value::Object(mut merged), Value::Object(incoming)) => {
            for (key, next_child) in incoming {
                let child = match merged.remove(&key) {
                    Some(prev_child) => deep_merge(prev_child, next_child),
                    None => next_child,
                };
                merged.insert(key, child);
            }
            Value::Object(merged)
        }
        (_, next) => next,
    }
}
