#![forbid(unsafe_code)]

//! Error taxonomy for store operations.
//!
//! Every public operation pre-validates its inputs and the store lifecycle
//! before touching any state, so a returned error always means the store is
//! exactly as it was before the call.

use thiserror::Error;

use crate::compare::ValueKind;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by store operations.
///
/// All variants are produced synchronously at the point of violation; there
/// is no retry or partial application.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An operation other than `create` was called before the store was
    /// created, or after it was destroyed.
    #[error("no store found: the store must be created before traits can be accessed")]
    NoStoreFound,

    /// A trait was addressed with an empty path.
    #[error("a trait cannot be accessed with an empty path")]
    InvalidPath,

    /// An update would change the kind of value a trait holds. Traits are
    /// type stable: once set, they keep their kind until cleared.
    #[error("trait <{path}> has been initialized as <{expected}> and cannot receive a <{found}> update")]
    TypeMismatch {
        path: String,
        expected: ValueKind,
        found: ValueKind,
    },

    /// An updater read a path that has never been registered. Selectors can
    /// only depend on traits that exist.
    #[error("trait <{path}> doesn't exist and cannot be used as a dependency")]
    MissingDependency { path: String },

    /// A stored value could not be deserialized into the requested type.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
