#![forbid(unsafe_code)]

//! Dependency-tracking key-value store.
//!
//! Dotted string paths map into a nested tree of JSON-like values
//! ("traits"). Derived values ("selectors") are registered through the same
//! write surface, track exactly the traits their latest evaluation read,
//! and recompute when any of them changes. Per-path channels broadcast
//! changes to subscribers, and an optional storage adapter gives root
//! traits pass-through persistence.
//!
//! # Architecture
//!
//! - [`subject`]: the single-value broadcast primitive under every channel.
//! - [`path`] / [`tree`]: dotted-path resolution into the trait tree.
//! - [`compare`] / [`merge`]: the value laws - deep equality for no-op
//!   suppression, deep merge for record updates.
//! - [`selector`]: updater contexts and dependency bookkeeping.
//! - [`store`]: the engine tying it all together behind `create`, `get`,
//!   `set`, `subscribe`, and `destroy`.
//! - [`storage`]: the adapter contract for external persistence.
//!
//! The store is single-threaded by design: state is shared via
//! `Rc<RefCell<..>>`, every operation runs to completion on the caller's
//! stack, and the only ordering discipline is the subject's
//! snapshot-of-observers delivery.
//!
//! # Quick start
//!
//! ```
//! use serde_json::json;
//! use traitstore::{StoreOptions, TraitStore};
//!
//! let store = TraitStore::with_options(StoreOptions::default());
//!
//! store.set("session.user", json!({ "name": "ada" })).unwrap();
//! assert_eq!(store.get("session.user.name").unwrap(), Some(json!("ada")));
//!
//! let sub = store
//!     .subscribe("session.user.name", |name| println!("name is now {name}"))
//!     .unwrap();
//! store.set("session.user.name", "turing").unwrap();
//! sub.unsubscribe();
//! ```

pub mod compare;
pub mod error;
pub mod merge;
pub mod path;
pub mod selector;
pub mod storage;
pub mod store;
pub mod subject;
pub mod tree;

pub use compare::{ValueKind, deep_equal};
pub use error::{Result, StoreError};
pub use merge::deep_merge;
pub use selector::{SelectorNode, TraitContext};
pub use storage::StorageService;
pub use store::{StoreOptions, TraitStore};
pub use subject::{Observer, Subject, Subscription};
pub use tree::{TraitNode, TraitTree};
