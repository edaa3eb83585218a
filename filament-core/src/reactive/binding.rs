//! Binding Implementation
//!
//! A binding is a registered side effect plus the set of reactive keys it
//! read on its most recent execution. Effects, watches, node bindings, and
//! the internal binding behind every computed cell are all instances of this
//! one type; they differ only in their sink and in how notifications treat
//! them.
//!
//! # Execution
//!
//! 1. The runtime removes the binding's previous `(state, key)` pairs from
//!    the dependency graph. Reads are path-dependent (a conditional in the
//!    body may read different keys on different runs), so stale
//!    subscriptions must go before re-tracking.
//!
//! 2. The body runs inside a tracking frame; every state read lands in the
//!    graph and in the frame.
//!
//! 3. The collected pairs become the binding's new tracked set, and the
//!    produced value is handed to the sink together with the previous one.
//!
//! # Disposal
//!
//! Disposal is explicit: the [`Disposer`] returned at registration removes
//! the binding from the graph and from the pending queue, and flips a flag
//! that execution re-checks. A disposed binding never runs again, even if it
//! was already scheduled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;

use super::computed::ComputedCell;
use super::error::BindingError;
use super::runtime::Runtime;
use super::state::StateId;
use super::value::Value;
use crate::lifecycle::NodeId;

/// Unique identifier for a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

impl BindingId {
    /// Generate a new unique binding ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The side-effect body of a binding.
pub type Body = dyn Fn() -> Result<Value, BindingError> + Send + Sync;

/// Output sink invoked with the produced value and the previous one.
pub type Sink = dyn Fn(&Value, Option<&Value>) + Send + Sync;

pub(crate) struct BindingInner {
    id: BindingId,
    runtime: Weak<Runtime>,
    body: Box<Body>,
    sink: Option<Box<Sink>>,
    node: Option<NodeId>,
    /// Keys read on the most recent execution, grouped per state.
    tracked: Mutex<HashMap<StateId, IndexSet<String>>>,
    last_value: Mutex<Option<Value>>,
    disposed: AtomicBool,
    run_count: AtomicUsize,
    /// Set when this binding is the internal binding of a computed cell.
    computed: OnceLock<Weak<ComputedCell>>,
}

/// Handle to a registered side effect. Cheap to clone; all clones share
/// state.
pub struct Binding {
    inner: Arc<BindingInner>,
}

impl Binding {
    pub(crate) fn new(
        runtime: Weak<Runtime>,
        body: Box<Body>,
        sink: Option<Box<Sink>>,
        node: Option<NodeId>,
    ) -> Self {
        Self {
            inner: Arc::new(BindingInner {
                id: BindingId::next(),
                runtime,
                body,
                sink,
                node,
                tracked: Mutex::new(HashMap::new()),
                last_value: Mutex::new(None),
                disposed: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
                computed: OnceLock::new(),
            }),
        }
    }

    /// The binding's unique ID.
    pub fn id(&self) -> BindingId {
        self.inner.id
    }

    /// The output node this binding is attached to, if any.
    pub fn node(&self) -> Option<NodeId> {
        self.inner.node
    }

    /// Whether the binding has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of times the body has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// The value produced by the most recent successful run.
    pub fn last_value(&self) -> Option<Value> {
        self.inner.last_value.lock().clone()
    }

    pub(crate) fn runtime(&self) -> Option<Arc<Runtime>> {
        self.inner.runtime.upgrade()
    }

    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn call_body(&self) -> Result<Value, BindingError> {
        self.inner.run_count.fetch_add(1, Ordering::SeqCst);
        (self.inner.body)()
    }

    /// Replace the last value, returning the previous one.
    pub(crate) fn swap_last_value(&self, value: Value) -> Option<Value> {
        self.inner.last_value.lock().replace(value)
    }

    /// Deliver a produced value to the sink, if one is registered.
    pub(crate) fn emit(&self, value: &Value, previous: Option<&Value>) {
        if let Some(sink) = &self.inner.sink {
            sink(value, previous);
        }
    }

    /// Replace the tracked set with freshly collected reads.
    pub(crate) fn store_tracked(&self, reads: Vec<(StateId, String)>) {
        let mut tracked: HashMap<StateId, IndexSet<String>> = HashMap::new();
        for (state, key) in reads {
            tracked.entry(state).or_default().insert(key);
        }
        *self.inner.tracked.lock() = tracked;
    }

    /// Take the tracked set, leaving it empty.
    pub(crate) fn take_tracked(&self) -> HashMap<StateId, IndexSet<String>> {
        std::mem::take(&mut self.inner.tracked.lock())
    }

    /// Number of distinct keys tracked by the most recent execution.
    pub fn dependency_count(&self) -> usize {
        self.inner.tracked.lock().values().map(IndexSet::len).sum()
    }

    pub(crate) fn set_computed(&self, cell: Weak<ComputedCell>) {
        let _ = self.inner.computed.set(cell);
    }

    /// The computed cell this binding belongs to, if it is a computed's
    /// internal binding.
    pub(crate) fn computed_cell(&self) -> Option<Arc<ComputedCell>> {
        self.inner.computed.get().and_then(Weak::upgrade)
    }
}

impl Clone for Binding {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.inner.id)
            .field("node", &self.inner.node)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Explicit teardown handle for a binding.
///
/// Dropping a `Disposer` does nothing: bindings stay alive until disposed
/// explicitly or until their output node is reported removed. This matches
/// the ownership model of the engine, where a registered side effect keeps
/// running for the life of the application unless torn down on purpose.
#[derive(Debug)]
pub struct Disposer {
    binding: Binding,
}

impl Disposer {
    pub(crate) fn new(binding: Binding) -> Self {
        Self { binding }
    }

    /// Tear the binding down: purge its dependency-graph entries, discard any
    /// pending execution, and prevent it from ever running again.
    pub fn dispose(&self) {
        if let Some(runtime) = self.binding.runtime() {
            runtime.dispose_binding(&self.binding);
        } else {
            self.binding.mark_disposed();
        }
    }

    /// Whether the underlying binding has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.binding.is_disposed()
    }

    /// Number of times the underlying binding has run.
    pub fn run_count(&self) -> usize {
        self.binding.run_count()
    }
}
