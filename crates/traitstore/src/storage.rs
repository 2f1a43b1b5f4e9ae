#![forbid(unsafe_code)]

//! The storage adapter contract.
//!
//! The store can pass root traits through to an external key/value service:
//! a never-seen root is imported on first read, every successful root
//! mutation is saved, and clearing a root removes it. The store consumes
//! this contract; it ships no implementation of its own.

use serde_json::Value;

/// External key/value persistence consumed by the store.
///
/// Keys are root trait paths. The store calls `get` at most once per
/// unseen root, `set` after each successful root-level mutation (selector
/// roots are skipped: compute functions are not data), and `clear` when a
/// root's value becomes null.
///
/// Implementations are free to be fallible internally (caching, IO), but
/// the contract is infallible: an adapter that cannot serve a `get` returns
/// `None`, and failed writes are the adapter's own concern.
pub trait StorageService {
    /// Fetch the persisted value for a root trait, if any.
    fn get(&self, key: &str) -> Option<Value>;

    /// Persist the value of a root trait.
    fn set(&self, key: &str, value: &Value);

    /// Remove the persisted value of a root trait.
    fn clear(&self, key: &str);
}
