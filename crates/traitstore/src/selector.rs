#![forbid(unsafe_code)]

//! Selector support: updater contexts and dependency bookkeeping.
//!
//! A selector is registered through the same `set` surface as a plain
//! trait, by supplying an updater function. While the updater runs, every
//! [`TraitContext::get`] call is recorded into the evaluation session; a
//! function that read at least one other trait becomes a selector tied to
//! exactly those traits. Each re-evaluation collects a fresh read set which
//! is diffed against the previous one, so the dependency graph always
//! reflects the latest evaluation only: dependencies from earlier
//! evaluations that were not read again are pruned.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use serde_json::Value;

use crate::error::Result;
use crate::store::StoreCore;

/// The signature of updater and selector compute functions.
///
/// The function receives the evaluation context and returns the new value.
/// Errors propagate to the caller of the triggering operation.
pub type UpdaterFn = dyn Fn(&TraitContext<'_>) -> Result<Value>;

/// A selector's record: compute function, latest dependency set, cache.
pub struct SelectorNode {
    pub(crate) compute: Rc<UpdaterFn>,
    pub(crate) dependencies: BTreeSet<String>,
    pub(crate) cached: Value,
}

impl SelectorNode {
    /// The result of the latest evaluation.
    #[must_use]
    pub fn cached(&self) -> &Value {
        &self.cached
    }

    /// The paths read by the latest evaluation.
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }
}

impl std::fmt::Debug for SelectorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorNode")
            .field("dependencies", &self.dependencies)
            .field("cached", &self.cached)
            .finish()
    }
}

/// One evaluation pass's dependency collection.
#[derive(Debug, Default)]
pub(crate) struct EvalSession {
    reads: RefCell<BTreeSet<String>>,
}

impl EvalSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, path: &str) {
        self.reads.borrow_mut().insert(path.to_string());
    }

    pub(crate) fn into_reads(self) -> BTreeSet<String> {
        self.reads.into_inner()
    }
}

/// The context handed to updater and selector functions.
///
/// Exposes the current value at the path being written and `get` access to
/// other traits. Reads through `get` are what tie a selector to its
/// dependencies.
pub struct TraitContext<'a> {
    pub(crate) current: Option<&'a Value>,
    pub(crate) store: &'a StoreCore,
    pub(crate) session: &'a EvalSession,
}

impl TraitContext<'_> {
    /// The current value at the path being written, if any.
    ///
    /// Absent for a fresh registration and during selector re-evaluation.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.current.filter(|value| !value.is_null())
    }

    /// Read another trait and record it as a dependency of this evaluation.
    ///
    /// Fails with [`StoreError::MissingDependency`](crate::StoreError) if
    /// the path has never been registered (after attempting a storage
    /// import). A registered-but-cleared trait reads as null.
    pub fn get(&self, path: &str) -> Result<Value> {
        self.session.record(path);
        self.store.resolve_dependency(path)
    }
}

impl std::fmt::Debug for TraitContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraitContext")
            .field("current", &self.current)
            .finish()
    }
}

/// Diff the latest read set against the previous one.
///
/// Returns `(added, removed)`: dependencies to gain a reverse edge and
/// dependencies whose reverse edge must be pruned.
pub(crate) fn diff_dependencies(
    previous: &BTreeSet<String>,
    latest: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = latest.difference(previous).cloned().collect();
    let removed = previous.difference(latest).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| (*p).to_string()).collect()
    }

    #[test]
    fn session_collects_distinct_reads() {
        let session = EvalSession::new();
        session.record("a");
        session.record("b");
        session.record("a");
        assert_eq!(session.into_reads(), set_of(&["a", "b"]));
    }

    #[test]
    fn diff_splits_added_and_removed() {
        let previous = set_of(&["a", "b"]);
        let latest = set_of(&["b", "c"]);
        let (added, removed) = diff_dependencies(&previous, &latest);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let deps = set_of(&["a", "b"]);
        let (added, removed) = diff_dependencies(&deps, &deps);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
