#![forbid(unsafe_code)]

//! The store engine: lifecycle, the public actions, and change orchestration.
//!
//! [`TraitStore`] is an explicitly owned handle over shared store state.
//! Cloning the handle shares the same store; `create` and `destroy` bracket
//! the usable lifetime, and every other operation fails with
//! [`StoreError::NoStoreFound`] outside that bracket.
//!
//! A successful write flows through a fixed pipeline: resolve the current
//! value, evaluate the updater (recording dependency reads), enforce type
//! stability, deep-merge records, suppress no-ops by deep equality, write
//! the tree, then notify - ancestor-chain channels root to leaf, dependent
//! selectors transitively, and finally the storage adapter for the root.
//!
//! # Invariants
//!
//! 1. A registered path holds exactly one node and exactly one channel.
//! 2. Traits are type stable: a non-null value can only be replaced by a
//!    value of the same kind, or cleared to null.
//! 3. A set that returns an error has not mutated the store: evaluation,
//!    type checks, and dependency collection all happen before the first
//!    tree write, and dependency edges are committed only on success.
//! 4. Setting a value deep-equal to the current one causes no broadcast and
//!    no storage traffic.
//!
//! # Failure Modes
//!
//! - **Selector error during refresh**: the error propagates to the caller
//!   of the triggering `set`; the triggering write itself stays committed,
//!   as in a partially-applied dependent update chain.
//! - **Dependency cycles between selectors**: a refresh pass carries an
//!   in-flight set, so a cycle settles with the values computed on the way
//!   around instead of recursing forever.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use serde_json::Value;

use crate::compare::{ValueKind, deep_equal};
use crate::error::{Result, StoreError};
use crate::merge::deep_merge;
use crate::path;
use crate::selector::{EvalSession, SelectorNode, TraitContext, UpdaterFn, diff_dependencies};
use crate::storage::StorageService;
use crate::subject::{Observer, Subject, Subscription};
use crate::tree::{TraitNode, TraitTree};

/// Options accepted by [`TraitStore::create`].
pub struct StoreOptions {
    /// Separator splitting a dotted path into segments. An empty separator
    /// falls back to the default `"."`.
    pub path_separator: String,
    /// Optional pass-through persistence for root traits.
    pub storage: Option<Rc<dyn StorageService>>,
    /// Emit a `tracing` debug event for every create/update/import/save/
    /// remove/refresh.
    pub debug: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path_separator: ".".to_string(),
            storage: None,
            debug: false,
        }
    }
}

impl StoreOptions {
    /// Set the path separator.
    #[must_use]
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.path_separator = separator.into();
        self
    }

    /// Attach a storage adapter.
    #[must_use]
    pub fn with_storage(mut self, storage: Rc<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enable diagnostic logging.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("path_separator", &self.path_separator)
            .field("has_storage", &self.storage.is_some())
            .field("debug", &self.debug)
            .finish()
    }
}

/// The two faces of a write: a literal value or an updater function.
enum SetterInput {
    Literal(Value),
    Updater(Rc<UpdaterFn>),
}

#[derive(Clone, Copy)]
struct RegisterOptions {
    /// Skip resolving the previous value (fresh imports and defaults).
    ignore_previous: bool,
    /// Push the root to the storage adapter after a successful mutation.
    persist: bool,
}

/// Paths whose stored value changed during one registration pass.
#[derive(Default)]
struct ChangeLog {
    changed: BTreeSet<String>,
}

struct StoreState {
    separator: String,
    tree: TraitTree,
    paths: AHashSet<String>,
    channels: AHashMap<String, Subject<Value>>,
    /// Dependency graph, dependency to dependents: dep path to the selector
    /// paths whose latest evaluation read it.
    tied_traits: AHashMap<String, BTreeSet<String>>,
    storage: Option<Rc<dyn StorageService>>,
    debug: bool,
}

/// Shared interior of a [`TraitStore`].
pub struct StoreCore {
    state: RefCell<Option<StoreState>>,
}

/// A dependency-tracking key-value store.
///
/// Cloning the handle shares the same underlying store. The handle is
/// single-threaded (`!Send`); all operations run to completion on the
/// caller's stack.
///
/// ```
/// use traitstore::TraitStore;
/// use serde_json::json;
///
/// let store = TraitStore::with_options(Default::default());
/// store.set("counter", 1).unwrap();
/// store
///     .set_with("doubled", |ctx| Ok(json!(ctx.get("counter")?.as_i64().unwrap_or(0) * 2)))
///     .unwrap();
/// assert_eq!(store.get("doubled").unwrap(), Some(json!(2)));
///
/// store.set("counter", 5).unwrap();
/// assert_eq!(store.get("doubled").unwrap(), Some(json!(10)));
/// ```
pub struct TraitStore {
    core: Rc<StoreCore>,
}

impl Clone for TraitStore {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl Default for TraitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TraitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraitStore")
            .field("created", &self.created())
            .finish()
    }
}

impl TraitStore {
    /// A handle to a store that has not been created yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Rc::new(StoreCore {
                state: RefCell::new(None),
            }),
        }
    }

    /// Convenience: `new` followed by `create`.
    #[must_use]
    pub fn with_options(options: StoreOptions) -> Self {
        let store = Self::new();
        store.create(options);
        store
    }

    /// Initialize the store. Idempotent: a second create while the store
    /// exists is a no-op and keeps the original options.
    pub fn create(&self, options: StoreOptions) {
        self.core.create(options);
    }

    /// Whether the store currently exists.
    #[must_use]
    pub fn created(&self) -> bool {
        self.core.is_created()
    }

    /// The current value at `path`, or `None` when the trait is absent or
    /// cleared. Selector paths resolve from their cache.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        self.core.ensure_created()?;
        check_path(path)?;
        Ok(self
            .core
            .resolve_value(path)?
            .filter(|value| !value.is_null()))
    }

    /// Like [`get`](Self::get), deserialized into `T`.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Set a trait to a literal value.
    ///
    /// Record values are deep-merged into the previous record and flattened
    /// so that every nested key becomes its own subscribable trait. Null
    /// clears the value but keeps the path registered. Setting a selector
    /// path to a literal unregisters the selector.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        self.core.set_input(path, SetterInput::Literal(value.into()))
    }

    /// Set a trait through an updater function.
    ///
    /// The updater receives the current value and `get` access to other
    /// traits. If it reads at least one other trait, the path becomes a
    /// selector: it is re-evaluated whenever any dependency changes.
    pub fn set_with(
        &self,
        path: &str,
        updater: impl Fn(&TraitContext<'_>) -> Result<Value> + 'static,
    ) -> Result<()> {
        self.core
            .set_input(path, SetterInput::Updater(Rc::new(updater)))
    }

    /// Subscribe to changes of the trait at `path`.
    ///
    /// An unregistered path is first materialized (storage import, then
    /// null), so subscribing to a brand-new path is valid. The callback
    /// sees values from the next change on; read the current value with
    /// [`get`](Self::get) if needed.
    pub fn subscribe(
        &self,
        path: &str,
        callback: impl Fn(&Value) + 'static,
    ) -> Result<Subscription> {
        self.core.subscribe_path(path, Box::new(callback), None)
    }

    /// Like [`subscribe`](Self::subscribe), materializing an unregistered
    /// path with `default` instead of null.
    pub fn subscribe_with_default(
        &self,
        path: &str,
        callback: impl Fn(&Value) + 'static,
        default: impl Into<Value>,
    ) -> Result<Subscription> {
        self.core
            .subscribe_path(path, Box::new(callback), Some(default.into()))
    }

    /// Discard the entire store state. Idempotent. Subsequent operations
    /// fail until the next [`create`](Self::create).
    pub fn destroy(&self) {
        self.core.destroy();
    }
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(StoreError::InvalidPath);
    }
    Ok(())
}

impl StoreCore {
    fn create(&self, options: StoreOptions) {
        let mut guard = self.state.borrow_mut();
        if guard.is_some() {
            return;
        }
        let separator = if options.path_separator.is_empty() {
            ".".to_string()
        } else {
            options.path_separator
        };
        let debug = options.debug;
        *guard = Some(StoreState {
            separator,
            tree: TraitTree::new(),
            paths: AHashSet::new(),
            channels: AHashMap::new(),
            tied_traits: AHashMap::new(),
            storage: options.storage,
            debug,
        });
        drop(guard);
        if debug {
            tracing::debug!("store created");
        }
    }

    fn destroy(&self) {
        let debug = self.debug_enabled();
        *self.state.borrow_mut() = None;
        if debug {
            tracing::debug!("store destroyed");
        }
    }

    fn is_created(&self) -> bool {
        self.state.borrow().is_some()
    }

    fn ensure_created(&self) -> Result<()> {
        if self.is_created() {
            Ok(())
        } else {
            Err(StoreError::NoStoreFound)
        }
    }

    fn debug_enabled(&self) -> bool {
        self.state
            .borrow()
            .as_ref()
            .is_some_and(|state| state.debug)
    }

    /// Run `f` against the live state. Borrows are confined to `f`: user
    /// callbacks (updaters, observers, storage adapters) are never invoked
    /// while the state is borrowed.
    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> Result<R> {
        let mut guard = self.state.borrow_mut();
        match guard.as_mut() {
            Some(state) => Ok(f(state)),
            None => Err(StoreError::NoStoreFound),
        }
    }

    /// Read the value at `path`, attempting a storage import for roots the
    /// store has never seen.
    fn resolve_value(&self, path: &str) -> Result<Option<Value>> {
        let found = self.with_state(|state| {
            let segments = path::segments(path, &state.separator);
            state.tree.value_at(&segments)
        })?;
        if found.is_some() {
            return Ok(found);
        }
        if self.try_import_from_storage(path)? {
            return self.with_state(|state| {
                let segments = path::segments(path, &state.separator);
                state.tree.value_at(&segments)
            });
        }
        Ok(None)
    }

    /// Resolve a dependency read from inside an updater.
    pub(crate) fn resolve_dependency(&self, path: &str) -> Result<Value> {
        check_path(path)?;
        match self.resolve_value(path)? {
            Some(value) => Ok(value),
            None => {
                if self.with_state(|state| state.paths.contains(path))? {
                    // Registered but cleared: reads as null.
                    Ok(Value::Null)
                } else {
                    Err(StoreError::MissingDependency {
                        path: path.to_string(),
                    })
                }
            }
        }
    }

    /// Import a root trait from the storage adapter if this store has never
    /// seen it. Only roots are imported; child traits come out of the
    /// registration recursion.
    fn try_import_from_storage(&self, path: &str) -> Result<bool> {
        let import = self.with_state(|state| {
            let root = path::root_of(path, &state.separator).to_string();
            if state.paths.contains(&root) {
                None
            } else {
                state.storage.clone().map(|storage| (root, storage))
            }
        })?;
        let Some((root, storage)) = import else {
            return Ok(false);
        };
        let Some(value) = storage.get(&root) else {
            return Ok(false);
        };
        if self.debug_enabled() {
            tracing::debug!(path = %root, value = %value, "trait imported from storage");
        }
        self.register(
            &root,
            SetterInput::Literal(value),
            RegisterOptions {
                ignore_previous: true,
                persist: false,
            },
        )?;
        Ok(true)
    }

    fn set_input(&self, path: &str, input: SetterInput) -> Result<()> {
        self.ensure_created()?;
        check_path(path)?;
        self.register(
            path,
            input,
            RegisterOptions {
                ignore_previous: false,
                persist: true,
            },
        )
    }

    /// One registration pass: write the node (and its children), then run
    /// the notification pipeline over everything that changed.
    fn register(&self, path: &str, input: SetterInput, opts: RegisterOptions) -> Result<()> {
        let mut log = ChangeLog::default();
        self.register_node(path, input, opts, &mut log)?;
        if log.changed.is_empty() {
            return Ok(());
        }
        self.register_ancestors(path, &mut log)?;
        self.broadcast_affected(&log)?;
        self.refresh_dependents(&log.changed)?;
        if opts.persist {
            self.persist_root(path)?;
        }
        Ok(())
    }

    /// Register the proper ancestors of a nested write, so that the whole
    /// wrapping chain is addressable and subscribable.
    fn register_ancestors(&self, path: &str, log: &mut ChangeLog) -> Result<()> {
        let chain = self.with_state(|state| path::ancestor_chain(path, &state.separator))?;
        for ancestor in chain.iter().take(chain.len().saturating_sub(1)) {
            let newly = self.with_state(|state| {
                if state.paths.contains(ancestor) {
                    false
                } else {
                    state.paths.insert(ancestor.clone());
                    state
                        .channels
                        .entry(ancestor.clone())
                        .or_insert_with(Subject::new);
                    true
                }
            })?;
            if newly {
                log.changed.insert(ancestor.clone());
                if self.debug_enabled() {
                    tracing::debug!(path = %ancestor, "trait created");
                }
            }
        }
        Ok(())
    }

    /// Evaluate and write one node, recursing into record children.
    fn register_node(
        &self,
        path: &str,
        input: SetterInput,
        opts: RegisterOptions,
        log: &mut ChangeLog,
    ) -> Result<()> {
        let (separator, is_new) =
            self.with_state(|state| (state.separator.clone(), !state.paths.contains(path)))?;

        let current = if opts.ignore_previous || is_new {
            None
        } else {
            self.resolve_value(path)?
        };

        let (new_value, updater, reads) = match input {
            SetterInput::Literal(value) => (value, None, BTreeSet::new()),
            SetterInput::Updater(compute) => {
                let session = EvalSession::new();
                let ctx = TraitContext {
                    current: current.as_ref(),
                    store: self,
                    session: &session,
                };
                let value = (*compute)(&ctx)?;
                (value, Some(compute), session.into_reads())
            }
        };

        // Type stability: null is the absent sentinel and always passes.
        if let Some(current_value) = &current
            && !current_value.is_null()
            && !new_value.is_null()
        {
            let expected = ValueKind::of(current_value);
            let found = ValueKind::of(&new_value);
            if expected != found {
                return Err(StoreError::TypeMismatch {
                    path: path.to_string(),
                    expected,
                    found,
                });
            }
        }

        match (&updater, reads.is_empty()) {
            (Some(compute), false) => {
                self.write_selector(path, Rc::clone(compute), reads, new_value, is_new, log)
            }
            _ => self.write_plain(path, &separator, current, new_value, opts, is_new, log),
        }
    }

    /// Commit a selector registration: dependency edges, node, cache.
    fn write_selector(
        &self,
        path: &str,
        compute: Rc<UpdaterFn>,
        reads: BTreeSet<String>,
        new_value: Value,
        is_new: bool,
        log: &mut ChangeLog,
    ) -> Result<()> {
        let previous_deps = self.with_state(|state| {
            let segments = path::segments(path, &state.separator);
            match state.tree.node(&segments) {
                Some(TraitNode::Selector(node)) => node.dependencies.clone(),
                _ => BTreeSet::new(),
            }
        })?;
        let (added, removed) = diff_dependencies(&previous_deps, &reads);

        let old_value = self.with_state(|state| {
            for dep in &removed {
                if let Some(tied) = state.tied_traits.get_mut(dep) {
                    tied.remove(path);
                    if tied.is_empty() {
                        state.tied_traits.remove(dep);
                    }
                }
            }
            for dep in &added {
                state
                    .tied_traits
                    .entry(dep.clone())
                    .or_default()
                    .insert(path.to_string());
            }
            let segments = path::segments(path, &state.separator);
            let old_value = state.tree.node(&segments).map(TraitNode::materialize);
            state.tree.write(
                &segments,
                TraitNode::Selector(SelectorNode {
                    compute,
                    dependencies: reads,
                    cached: new_value.clone(),
                }),
            );
            if !state.paths.contains(path) {
                state.paths.insert(path.to_string());
                state
                    .channels
                    .entry(path.to_string())
                    .or_insert_with(Subject::new);
            }
            old_value
        })?;

        let changed = match &old_value {
            Some(old) => !deep_equal(old, &new_value),
            None => true,
        };
        if changed {
            log.changed.insert(path.to_string());
        }
        if self.debug_enabled() {
            if is_new {
                tracing::debug!(path = %path, value = %new_value, "trait created");
            } else {
                tracing::debug!(path = %path, value = %new_value, "trait updated");
            }
        }
        Ok(())
    }

    /// Commit a plain write: merge, suppress no-ops, flatten records.
    #[allow(clippy::too_many_arguments)]
    fn write_plain(
        &self,
        path: &str,
        separator: &str,
        current: Option<Value>,
        new_value: Value,
        opts: RegisterOptions,
        is_new: bool,
        log: &mut ChangeLog,
    ) -> Result<()> {
        // No-op suppression against the merged result.
        if let Some(current_value) = &current
            && !current_value.is_null()
        {
            let merged = deep_merge(current_value.clone(), new_value.clone());
            if deep_equal(current_value, &merged) {
                return Ok(());
            }
        }

        // Validate the whole subtree before the first write, so a failed
        // set never leaves part of a record applied.
        self.validate_children(path, separator, &new_value)?;

        // Soft selectors: a plain assignment converts the path back into an
        // ordinary trait.
        let was_selector = self.with_state(|state| {
            let segments = path::segments(path, &state.separator);
            state
                .tree
                .node(&segments)
                .is_some_and(TraitNode::is_selector)
        })?;
        if was_selector {
            self.unregister_selector(path)?;
        }

        match new_value {
            Value::Object(record) => {
                self.with_state(|state| {
                    let segments = path::segments(path, &state.separator);
                    state.tree.ensure_branch(&segments);
                    if !state.paths.contains(path) {
                        state.paths.insert(path.to_string());
                        state
                            .channels
                            .entry(path.to_string())
                            .or_insert_with(Subject::new);
                    }
                })?;
                for (key, child) in record {
                    let child_path = path::join(path, &key, separator);
                    self.register_node(&child_path, SetterInput::Literal(child), opts, log)?;
                }
                let now = self.with_state(|state| {
                    let segments = path::segments(path, &state.separator);
                    state.tree.value_at(&segments)
                })?;
                let changed = match (&current, &now) {
                    (Some(before), Some(after)) => !deep_equal(before, after),
                    _ => true,
                };
                if changed {
                    log.changed.insert(path.to_string());
                    if self.debug_enabled() {
                        if is_new {
                            tracing::debug!(path = %path, "trait created");
                        } else {
                            tracing::debug!(path = %path, "trait updated");
                        }
                    }
                }
            }
            leaf => {
                let logged = if self.debug_enabled() {
                    Some(leaf.to_string())
                } else {
                    None
                };
                self.with_state(|state| {
                    let segments = path::segments(path, &state.separator);
                    state.tree.write(&segments, TraitNode::Leaf(leaf));
                    if !state.paths.contains(path) {
                        state.paths.insert(path.to_string());
                        state
                            .channels
                            .entry(path.to_string())
                            .or_insert_with(Subject::new);
                    }
                })?;
                log.changed.insert(path.to_string());
                if let Some(rendered) = logged {
                    if is_new {
                        tracing::debug!(path = %path, value = %rendered, "trait created");
                    } else {
                        tracing::debug!(path = %path, value = %rendered, "trait updated");
                    }
                }
            }
        }
        Ok(())
    }

    /// Type-check every key of an incoming record against the values
    /// already stored under the corresponding child paths.
    fn validate_children(&self, path: &str, separator: &str, value: &Value) -> Result<()> {
        let Value::Object(record) = value else {
            return Ok(());
        };
        for (key, child) in record {
            let child_path = path::join(path, key, separator);
            let current = self.with_state(|state| {
                let segments = path::segments(&child_path, &state.separator);
                state.tree.value_at(&segments)
            })?;
            if let Some(current_value) = &current
                && !current_value.is_null()
                && !child.is_null()
            {
                let expected = ValueKind::of(current_value);
                let found = ValueKind::of(child);
                if expected != found {
                    return Err(StoreError::TypeMismatch {
                        path: child_path,
                        expected,
                        found,
                    });
                }
            }
            self.validate_children(&child_path, separator, child)?;
        }
        Ok(())
    }

    /// Drop a selector's dependency edges before it becomes a plain trait.
    fn unregister_selector(&self, path: &str) -> Result<()> {
        let had_deps = self.with_state(|state| {
            let segments = path::segments(path, &state.separator);
            let deps = match state.tree.node(&segments) {
                Some(TraitNode::Selector(node)) => node.dependencies.clone(),
                _ => BTreeSet::new(),
            };
            for dep in &deps {
                if let Some(tied) = state.tied_traits.get_mut(dep) {
                    tied.remove(path);
                    if tied.is_empty() {
                        state.tied_traits.remove(dep);
                    }
                }
            }
            !deps.is_empty()
        })?;
        if had_deps && self.debug_enabled() {
            tracing::debug!(path = %path, "selector unregistered");
        }
        Ok(())
    }

    /// Notify every channel affected by the change set: the union of the
    /// ancestor chains of all changed paths, each exactly once, parents
    /// before children.
    fn broadcast_affected(&self, log: &ChangeLog) -> Result<()> {
        let affected = self.with_state(|state| {
            let mut affected = BTreeSet::new();
            for changed in &log.changed {
                for ancestor in path::ancestor_chain(changed, &state.separator) {
                    affected.insert(ancestor);
                }
            }
            affected
        })?;
        for target in affected {
            let delivery = self.with_state(|state| {
                state
                    .channels
                    .get(&target)
                    .filter(|subject| subject.has_observers())
                    .map(|subject| {
                        let segments = path::segments(&target, &state.separator);
                        let value = state.tree.value_at(&segments).unwrap_or(Value::Null);
                        (subject.clone(), value)
                    })
            })?;
            if let Some((subject, value)) = delivery {
                subject.emit(&value);
            }
        }
        Ok(())
    }

    /// Recompute every selector tied to any path in the change set's
    /// ancestor chains, recursing into selectors that depend on selectors.
    fn refresh_dependents(&self, changed: &BTreeSet<String>) -> Result<()> {
        let dependents = self.with_state(|state| {
            let mut dependents = BTreeSet::new();
            for changed_path in changed {
                for ancestor in path::ancestor_chain(changed_path, &state.separator) {
                    if let Some(tied) = state.tied_traits.get(&ancestor) {
                        dependents.extend(tied.iter().cloned());
                    }
                }
            }
            dependents
        })?;
        let mut in_flight = BTreeSet::new();
        for selector_path in dependents {
            self.refresh_selector(&selector_path, &mut in_flight)?;
        }
        Ok(())
    }

    fn refresh_selector(&self, path: &str, in_flight: &mut BTreeSet<String>) -> Result<()> {
        // Cycle guard: skip selectors already refreshing further up this
        // call stack.
        if !in_flight.insert(path.to_string()) {
            return Ok(());
        }
        let outcome = self.refresh_selector_inner(path, in_flight);
        in_flight.remove(path);
        outcome
    }

    fn refresh_selector_inner(&self, path: &str, in_flight: &mut BTreeSet<String>) -> Result<()> {
        let snapshot = self.with_state(|state| {
            let segments = path::segments(path, &state.separator);
            match state.tree.node(&segments) {
                Some(TraitNode::Selector(node)) => {
                    Some((Rc::clone(&node.compute), node.dependencies.clone()))
                }
                _ => None,
            }
        })?;
        let Some((compute, previous_deps)) = snapshot else {
            return Ok(());
        };

        let session = EvalSession::new();
        let ctx = TraitContext {
            current: None,
            store: self,
            session: &session,
        };
        let new_value = (*compute)(&ctx)?;
        let reads = session.into_reads();
        let (added, removed) = diff_dependencies(&previous_deps, &reads);

        self.with_state(|state| {
            for dep in &removed {
                if let Some(tied) = state.tied_traits.get_mut(dep) {
                    tied.remove(path);
                    if tied.is_empty() {
                        state.tied_traits.remove(dep);
                    }
                }
            }
            for dep in &added {
                state
                    .tied_traits
                    .entry(dep.clone())
                    .or_default()
                    .insert(path.to_string());
            }
            let segments = path::segments(path, &state.separator);
            if let Some(TraitNode::Selector(node)) = state.tree.node_mut(&segments) {
                node.dependencies = reads;
                node.cached = new_value.clone();
            }
        })?;

        let subject = self.with_state(|state| {
            state
                .channels
                .get(path)
                .filter(|subject| subject.has_observers())
                .cloned()
        })?;
        if let Some(subject) = subject {
            subject.emit(&new_value);
        }
        if self.debug_enabled() {
            tracing::debug!(path = %path, value = %new_value, "selector refreshed");
        }

        let dependents = self.with_state(|state| {
            let mut dependents = BTreeSet::new();
            for ancestor in path::ancestor_chain(path, &state.separator) {
                if let Some(tied) = state.tied_traits.get(&ancestor) {
                    dependents.extend(tied.iter().cloned());
                }
            }
            dependents
        })?;
        for dependent in dependents {
            self.refresh_selector(&dependent, in_flight)?;
        }
        Ok(())
    }

    /// Push the root of a mutated path to the storage adapter. Selector
    /// roots are skipped: compute functions are not data.
    fn persist_root(&self, path: &str) -> Result<()> {
        let plan = self.with_state(|state| {
            let storage = state.storage.clone()?;
            let root = path::root_of(path, &state.separator).to_string();
            if state
                .tree
                .node(&[root.as_str()])
                .is_some_and(TraitNode::is_selector)
            {
                return None;
            }
            let value = state.tree.value_at(&[root.as_str()]);
            Some((storage, root, value, state.debug))
        })?;
        let Some((storage, root, value, debug)) = plan else {
            return Ok(());
        };
        match value {
            Some(value) if !value.is_null() => {
                storage.set(&root, &value);
                if debug {
                    tracing::debug!(path = %root, value = %value, "trait saved to storage");
                }
            }
            _ => {
                storage.clear(&root);
                if debug {
                    tracing::debug!(path = %root, "trait removed from storage");
                }
            }
        }
        Ok(())
    }

    fn subscribe_path(
        &self,
        path: &str,
        callback: Box<dyn Fn(&Value)>,
        default: Option<Value>,
    ) -> Result<Subscription> {
        self.ensure_created()?;
        check_path(path)?;
        let registered = self.with_state(|state| state.paths.contains(path))?;
        if !registered {
            let imported = self.try_import_from_storage(path)?
                && self.with_state(|state| state.paths.contains(path))?;
            if !imported {
                self.register(
                    path,
                    SetterInput::Literal(default.unwrap_or(Value::Null)),
                    RegisterOptions {
                        ignore_previous: true,
                        persist: true,
                    },
                )?;
            }
        }
        let subject = self.with_state(|state| {
            state
                .channels
                .entry(path.to_string())
                .or_insert_with(Subject::new)
                .clone()
        })?;
        Ok(subject.subscribe(Observer::new(move |value: &Value| callback(value))))
    }
}
