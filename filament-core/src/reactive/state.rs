//! Reactive State
//!
//! A `ReactiveState` is the reactive handle over a keyed record of dynamic
//! values. Every read funnels through [`ReactiveState::get`] (or
//! [`ReactiveState::child`] for nested records) so the engine can record the
//! read against the currently executing binding; every write funnels through
//! [`ReactiveState::set`] (or the list mutators) so subscribers of the
//! touched key are notified.
//!
//! # Nested state
//!
//! Nested records are reactive by need, not eagerly: a map value stays a
//! plain value until the first `child` access promotes it to a nested
//! `ReactiveState`. The promoted handle is cached in the entry, so repeated
//! accesses observe the same handle and the one-handle-per-record invariant
//! holds. Reading through the chain (`state.child("user")?.get("name")`)
//! tracks both the parent key and the nested key, which is exactly the
//! granularity updates propagate at.
//!
//! # Lists
//!
//! In-place list mutation cannot be observed key-by-key, so the list
//! mutators (`push`, `pop`, `splice`, `sort_list_by`, `reverse_list`)
//! mutate the underlying vector and issue a single notification for the
//! key: "this list changed".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::computed::ComputedCell;
use super::context;
use super::error::BindingError;
use super::runtime::Runtime;
use super::value::Value;

/// Unique identifier for a reactive state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(u64);

impl StateId {
    /// Generate a new unique state ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One stored entry of a state object.
#[derive(Clone)]
enum Entry {
    /// A plain value.
    Leaf(Value),
    /// A nested record promoted to its own reactive handle.
    Child(ReactiveState),
    /// A computed cell installed on this key.
    Computed(Arc<ComputedCell>),
}

struct StateInner {
    id: StateId,
    runtime: Weak<Runtime>,
    entries: RwLock<IndexMap<String, Entry>>,
}

/// A reactive handle over keyed application state. Cheap to clone; all
/// clones share the same entries and identity.
pub struct ReactiveState {
    inner: Arc<StateInner>,
}

impl ReactiveState {
    pub(crate) fn from_fields(
        runtime: &Arc<Runtime>,
        fields: IndexMap<String, Value>,
    ) -> Self {
        Self {
            inner: Arc::new(StateInner {
                id: StateId::next(),
                runtime: Arc::downgrade(runtime),
                entries: RwLock::new(
                    fields
                        .into_iter()
                        .map(|(key, value)| (key, Entry::Leaf(value)))
                        .collect(),
                ),
            }),
        }
    }

    /// The state's unique ID.
    pub fn id(&self) -> StateId {
        self.inner.id
    }

    /// Read the value stored under `key`, tracking the read against the
    /// current binding. A missing key reads as `Value::Null`.
    ///
    /// Nested records materialize to a plain snapshot; computed keys read
    /// through their cache.
    pub fn get(&self, key: &str) -> Value {
        self.track(key);
        self.read_entry(key)
    }

    /// Read the value stored under `key` without recording a dependency.
    pub fn get_untracked(&self, key: &str) -> Value {
        self.read_entry(key)
    }

    fn read_entry(&self, key: &str) -> Value {
        let entry = self.inner.entries.read().get(key).cloned();
        match entry {
            None => Value::Null,
            Some(Entry::Leaf(value)) => value,
            Some(Entry::Child(child)) => child.snapshot(),
            Some(Entry::Computed(cell)) => cell.read(),
        }
    }

    /// Access the nested record stored under `key`, promoting a plain map
    /// value to a nested reactive handle on first access.
    ///
    /// Returns `None` when the key is missing or does not hold a record.
    /// The read is tracked like any other.
    pub fn child(&self, key: &str) -> Option<ReactiveState> {
        self.track(key);
        let mut entries = self.inner.entries.write();
        match entries.get_mut(key) {
            Some(Entry::Child(child)) => Some(child.clone()),
            Some(entry @ Entry::Leaf(Value::Map(_))) => {
                let Entry::Leaf(Value::Map(fields)) = std::mem::replace(
                    entry,
                    Entry::Leaf(Value::Null),
                ) else {
                    unreachable!("entry shape checked by match arm");
                };
                let runtime = self.inner.runtime.upgrade();
                let child = match &runtime {
                    Some(runtime) => ReactiveState::from_fields(runtime, fields),
                    None => ReactiveState {
                        inner: Arc::new(StateInner {
                            id: StateId::next(),
                            runtime: Weak::new(),
                            entries: RwLock::new(
                                fields
                                    .into_iter()
                                    .map(|(key, value)| (key, Entry::Leaf(value)))
                                    .collect(),
                            ),
                        }),
                    },
                };
                *entry = Entry::Child(child.clone());
                Some(child)
            }
            _ => None,
        }
    }

    /// Write `value` under `key`, notifying subscribers of the key.
    ///
    /// The write is skipped entirely when the new value structurally equals
    /// the stored one; a binding writing back the value it read must not
    /// re-trigger itself. Writing to a computed key is rejected.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let changed = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(Entry::Leaf(old)) if *old == value => false,
                Some(Entry::Computed(_)) => {
                    tracing::warn!(key, "ignored write to a computed key");
                    false
                }
                Some(entry @ Entry::Child(_)) => {
                    let same = matches!(entry, Entry::Child(child) if child.snapshot() == value);
                    if same {
                        false
                    } else {
                        *entry = Entry::Leaf(value);
                        true
                    }
                }
                Some(entry @ Entry::Leaf(_)) => {
                    *entry = Entry::Leaf(value);
                    true
                }
                None => {
                    entries.insert(key.to_owned(), Entry::Leaf(value));
                    true
                }
            }
        };
        if changed {
            self.notify_key(key);
        }
    }

    /// Read-modify-write convenience for updates that depend on the current
    /// value. The read does not track; the write notifies as usual.
    pub fn update(&self, key: &str, f: impl FnOnce(&Value) -> Value) {
        let current = self.get_untracked(key);
        self.set(key, f(&current));
    }

    /// Install a computed cell under `key`.
    ///
    /// The compute function runs lazily on first read and after
    /// invalidation, never eagerly. A failing computation keeps the cell's
    /// last good value.
    pub fn define_computed<F>(&self, key: &str, compute: F)
    where
        F: Fn() -> Result<Value, BindingError> + Send + Sync + 'static,
    {
        let Some(runtime) = self.inner.runtime.upgrade() else {
            tracing::warn!(key, "runtime gone; computed not installed");
            return;
        };
        let cell = ComputedCell::install(&runtime, self.inner.id, key, Box::new(compute));
        self.inner.entries.write().insert(key.to_owned(), Entry::Computed(cell));
        // Subscribers that read the key before it was computed re-evaluate.
        self.notify_key(key);
    }

    // ------------------------------------------------------------------
    // List mutators
    // ------------------------------------------------------------------

    /// Append to the list under `key`, creating the list if the key is
    /// absent. One notification covers the whole mutation.
    pub fn push(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let changed = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(Entry::Leaf(Value::List(items))) => {
                    items.push(value);
                    true
                }
                None => {
                    entries.insert(key.to_owned(), Entry::Leaf(Value::List(vec![value])));
                    true
                }
                _ => {
                    tracing::warn!(key, "push on a non-list key ignored");
                    false
                }
            }
        };
        if changed {
            self.notify_key(key);
        }
    }

    /// Remove and return the last element of the list under `key`.
    pub fn pop(&self, key: &str) -> Option<Value> {
        let popped = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(Entry::Leaf(Value::List(items))) => items.pop(),
                Some(_) => {
                    tracing::warn!(key, "pop on a non-list key ignored");
                    None
                }
                None => None,
            }
        };
        if popped.is_some() {
            self.notify_key(key);
        }
        popped
    }

    /// Remove `delete` elements starting at `start` and insert `items` in
    /// their place, returning the removed elements.
    pub fn splice(
        &self,
        key: &str,
        start: usize,
        delete: usize,
        items: Vec<Value>,
    ) -> Vec<Value> {
        let inserting = !items.is_empty();
        let mut mutated = false;
        let removed = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(Entry::Leaf(Value::List(list))) => {
                    let start = start.min(list.len());
                    let end = start.saturating_add(delete).min(list.len());
                    let removed: Vec<Value> = list.splice(start..end, items).collect();
                    mutated = inserting || !removed.is_empty();
                    removed
                }
                _ => {
                    if inserting {
                        tracing::warn!(key, "splice on a non-list key ignored");
                    }
                    Vec::new()
                }
            }
        };
        if mutated {
            self.notify_key(key);
        }
        removed
    }

    /// Sort the list under `key` in place with the given comparator.
    pub fn sort_list_by(
        &self,
        key: &str,
        mut compare: impl FnMut(&Value, &Value) -> std::cmp::Ordering,
    ) {
        let changed = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(Entry::Leaf(Value::List(items))) => {
                    items.sort_by(&mut compare);
                    items.len() > 1
                }
                Some(_) => {
                    tracing::warn!(key, "sort on a non-list key ignored");
                    false
                }
                None => false,
            }
        };
        if changed {
            self.notify_key(key);
        }
    }

    /// Reverse the list under `key` in place.
    pub fn reverse_list(&self, key: &str) {
        let changed = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(Entry::Leaf(Value::List(items))) => {
                    items.reverse();
                    items.len() > 1
                }
                Some(_) => {
                    tracing::warn!(key, "reverse on a non-list key ignored");
                    false
                }
                None => false,
            }
        };
        if changed {
            self.notify_key(key);
        }
    }

    // ------------------------------------------------------------------
    // Manual invalidation & introspection
    // ------------------------------------------------------------------

    /// Re-trigger subscribers of `key` as if it had been written, for
    /// mutations that bypassed this API.
    pub fn invalidate(&self, key: &str) {
        self.notify_key(key);
    }

    /// Re-trigger subscribers of every tracked key on this state.
    pub fn invalidate_all(&self) {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.notify_state(self.inner.id);
        }
    }

    /// Untracked deep materialization of the state into a plain value.
    ///
    /// Nested handles recurse; computed keys contribute their cached value
    /// (or null when never computed) without forcing an evaluation.
    pub fn snapshot(&self) -> Value {
        let entries = self.inner.entries.read();
        let mut map = IndexMap::with_capacity(entries.len());
        for (key, entry) in entries.iter() {
            let value = match entry {
                Entry::Leaf(value) => value.clone(),
                Entry::Child(child) => child.snapshot(),
                Entry::Computed(cell) => cell.cached().unwrap_or(Value::Null),
            };
            map.insert(key.clone(), value);
        }
        Value::Map(map)
    }

    /// The keys currently present, untracked.
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.read().keys().cloned().collect()
    }

    /// Whether `key` is present, untracked.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    /// Number of keys, untracked.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Whether the state has no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track(&self, key: &str) {
        if !context::is_tracking() {
            return;
        }
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.track(self.inner.id, key);
        }
    }

    fn notify_key(&self, key: &str) {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.notify(self.inner.id, key);
        }
    }
}

impl Clone for ReactiveState {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ReactiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveState")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .finish()
    }
}
