//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects state objects,
//! computed cells, and bindings. It owns the shared registries (the
//! dependency graph, the node lifecycle registry, the removal observer,
//! and the error hook), so lifetime and ownership are explicit instead of
//! hiding in module-level statics scattered across the engine.
//!
//! # How It Works
//!
//! 1. When a binding executes, it becomes the current tracking frame.
//!
//! 2. Every state key read while it is current lands in the dependency
//!    graph: `state → key → ordered set of bindings`.
//!
//! 3. When a key is written, the runtime looks up the subscriber set:
//!    computed cells are marked dirty synchronously (they recompute lazily
//!    on next read), everything else goes to the scheduler.
//!
//! A process-wide default instance is reachable through
//! [`Runtime::global`]; isolated instances serve tests and embedders that
//! want their own reactive world.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::binding::{Binding, BindingId, Body, Disposer, Sink};
use super::context::{self, TrackScope};
use super::error::{BindingError, ReactiveError};
use super::scheduler;
use super::state::{ReactiveState, StateId};
use super::value::Value;
use crate::lifecycle::{NodeId, NodeRegistry, RemovalObserver};

/// Callback invoked with every reported engine error.
pub type ErrorHook = Arc<dyn Fn(&ReactiveError) + Send + Sync>;

type SubscriberSet = IndexMap<BindingId, Binding>;

/// The reactive runtime: owner of the dependency graph and all registries.
pub struct Runtime {
    /// `state → key → bindings subscribed to that key`, in subscription
    /// order.
    graph: RwLock<HashMap<StateId, IndexMap<String, SubscriberSet>>>,
    /// Bindings attached to output nodes, for removal-driven cleanup.
    lifecycle: NodeRegistry,
    observer: RwLock<Option<Arc<dyn RemovalObserver>>>,
    error_hook: RwLock<Option<ErrorHook>>,
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    /// Create an isolated runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            graph: RwLock::new(HashMap::new()),
            lifecycle: NodeRegistry::new(),
            observer: RwLock::new(None),
            error_hook: RwLock::new(None),
        })
    }

    /// The process-wide default runtime.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new()).clone()
    }

    /// Wrap a record value into a reactive state owned by this runtime.
    ///
    /// Anything other than a record produces an empty state: there are no
    /// keys to subscribe to on a bare primitive.
    pub fn create_state(self: &Arc<Self>, value: Value) -> ReactiveState {
        let fields = match value {
            Value::Map(fields) => fields,
            Value::Null => IndexMap::new(),
            other => {
                tracing::warn!(value = %other, "create_state expects a record");
                IndexMap::new()
            }
        };
        ReactiveState::from_fields(self, fields)
    }

    // ------------------------------------------------------------------
    // Dependency graph
    // ------------------------------------------------------------------

    /// Record that the current binding read `(state, key)`.
    ///
    /// No-op when no binding is current (untracked read).
    pub(crate) fn track(&self, state: StateId, key: &str) {
        let Some(binding) = context::current_binding() else {
            return;
        };
        if binding.is_disposed() {
            return;
        }
        self.graph
            .write()
            .entry(state)
            .or_default()
            .entry(key.to_owned())
            .or_default()
            .insert(binding.id(), binding);
        context::record_read(state, key);
    }

    /// Notify the subscribers of `(state, key)` that the key changed.
    ///
    /// Computed cells are marked dirty on the spot, with no side-effect
    /// work here, and cascade their own key notification.
    /// Every other binding goes through the scheduler.
    pub(crate) fn notify(&self, state: StateId, key: &str) {
        let subscribers: Vec<Binding> = {
            let graph = self.graph.read();
            graph
                .get(&state)
                .and_then(|keys| keys.get(key))
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default()
        };
        for binding in subscribers {
            if binding.is_disposed() {
                continue;
            }
            if let Some(cell) = binding.computed_cell() {
                cell.mark_dirty();
            } else {
                scheduler::schedule(self, binding);
            }
        }
    }

    /// Notify the subscribers of every tracked key on `state`.
    pub(crate) fn notify_state(&self, state: StateId) {
        let keys: Vec<String> = self
            .graph
            .read()
            .get(&state)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            self.notify(state, &key);
        }
    }

    /// Remove a binding's previously tracked pairs from the graph.
    ///
    /// Runs before every re-execution so that keys read only on an earlier,
    /// now-untaken code path stop triggering it.
    pub(crate) fn untrack_binding(&self, binding: &Binding) {
        let tracked = binding.take_tracked();
        if tracked.is_empty() {
            return;
        }
        let mut graph = self.graph.write();
        for (state, keys) in tracked {
            if let Some(per_state) = graph.get_mut(&state) {
                for key in keys {
                    if let Some(subscribers) = per_state.get_mut(&key) {
                        subscribers.shift_remove(&binding.id());
                        if subscribers.is_empty() {
                            per_state.shift_remove(&key);
                        }
                    }
                }
                if per_state.is_empty() {
                    graph.remove(&state);
                }
            }
        }
    }

    /// Number of bindings currently subscribed to `(state, key)`.
    pub fn subscriber_count(&self, state: StateId, key: &str) -> usize {
        self.graph
            .read()
            .get(&state)
            .and_then(|keys| keys.get(key))
            .map(SubscriberSet::len)
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Binding execution
    // ------------------------------------------------------------------

    /// Execute a binding: clear its stale subscriptions, run the body under
    /// a tracking frame, store the freshly collected dependency set, and
    /// deliver the produced value to the sink.
    pub(crate) fn run_binding(&self, binding: &Binding) {
        if binding.is_disposed() {
            return;
        }
        self.untrack_binding(binding);

        let scope = match TrackScope::enter(binding) {
            Ok(scope) => scope,
            Err(err) => {
                self.report(&err);
                return;
            }
        };
        let result = binding.call_body();
        let reads = scope.finish();
        binding.store_tracked(reads);

        match result {
            Ok(value) => {
                let previous = binding.swap_last_value(value.clone());
                binding.emit(&value, previous.as_ref());
            }
            Err(err) => self.report(&ReactiveError::BindingExecution(err)),
        }
    }

    /// Tear down a binding: graph entries purged, pending execution
    /// discarded, node registration removed.
    pub(crate) fn dispose_binding(&self, binding: &Binding) {
        binding.mark_disposed();
        self.untrack_binding(binding);
        scheduler::discard(binding.id());
        if let Some(node) = binding.node() {
            self.lifecycle.remove_binding(node, binding.id());
        }
    }

    // ------------------------------------------------------------------
    // Registration surface
    // ------------------------------------------------------------------

    fn register(
        self: &Arc<Self>,
        body: Box<Body>,
        sink: Option<Box<Sink>>,
        node: Option<NodeId>,
    ) -> Disposer {
        let binding = Binding::new(Arc::downgrade(self), body, sink, node);
        if let Some(node) = node {
            self.lifecycle.attach(node, binding.clone());
            let observer = self.observer.read().clone();
            if let Some(observer) = observer {
                observer.watch(node);
            }
        }
        // Runs immediately to establish the initial dependency set (and, for
        // node bindings, to initialize the output).
        scheduler::run_initial(self, &binding);
        Disposer::new(binding)
    }

    /// Register an eager side effect. Runs now and again whenever any state
    /// key it read changes.
    pub fn effect<F>(self: &Arc<Self>, f: F) -> Disposer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(
            Box::new(move || {
                f();
                Ok(Value::Null)
            }),
            None,
            None,
        )
    }

    /// Fallible variant of [`Runtime::effect`]. A failure is reported to
    /// the error hook for that cycle; the effect stays registered.
    pub fn try_effect<F>(self: &Arc<Self>, f: F) -> Disposer
    where
        F: Fn() -> Result<(), BindingError> + Send + Sync + 'static,
    {
        self.register(Box::new(move || f().map(|()| Value::Null)), None, None)
    }

    /// Watch one key of a state object. `callback(new, previous)` fires on
    /// every subsequent change of the key's value; the initial read only
    /// establishes the dependency.
    pub fn watch<C>(self: &Arc<Self>, state: &ReactiveState, key: &str, callback: C) -> Disposer
    where
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let state = state.clone();
        let key = key.to_owned();
        self.watch_fn(move || state.get(&key), callback)
    }

    /// Watch an arbitrary read function. `callback(new, previous)` fires
    /// whenever a re-execution produces a value different from the previous
    /// one.
    pub fn watch_fn<R, C>(self: &Arc<Self>, read: R, callback: C) -> Disposer
    where
        R: Fn() -> Value + Send + Sync + 'static,
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.register(
            Box::new(move || Ok(read())),
            Some(Box::new(move |new: &Value, previous: Option<&Value>| {
                if let Some(previous) = previous {
                    if previous != new {
                        callback(new, previous);
                    }
                }
            })),
            None,
        )
    }

    /// Register a binding attached to an output node. The sink decides how
    /// the resolved value is written into the node; the engine treats it as
    /// opaque. Runs now so the node is initialized, and is torn down
    /// automatically when the node is reported removed.
    pub fn bind<R, S>(self: &Arc<Self>, node: NodeId, read: R, sink: S) -> Disposer
    where
        R: Fn() -> Value + Send + Sync + 'static,
        S: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(
            Box::new(move || Ok(read())),
            Some(Box::new(move |new: &Value, _previous: Option<&Value>| {
                sink(new);
            })),
            Some(node),
        )
    }

    /// Group writes: every write inside `f` applies immediately, but
    /// subscribers run once, after the outermost batch exits.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        scheduler::batch(self, f)
    }

    // ------------------------------------------------------------------
    // Lifecycle & diagnostics
    // ------------------------------------------------------------------

    /// Install the host's removal observer. It is told about every node a
    /// binding attaches to, and is expected to call
    /// [`Runtime::node_removed`] when such a node leaves the document.
    pub fn set_removal_observer(&self, observer: Arc<dyn RemovalObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Dispose every binding attached to `node`.
    ///
    /// Hosts with a mutation observer call this per removed node while
    /// walking the removed subtree; hosts without one call it manually.
    pub fn node_removed(&self, node: NodeId) {
        let bindings = self.lifecycle.detach_all(node);
        if bindings.is_empty() {
            return;
        }
        tracing::debug!(node = node.raw(), count = bindings.len(), "node removed");
        for binding in bindings {
            binding.mark_disposed();
            self.untrack_binding(&binding);
            scheduler::discard(binding.id());
        }
    }

    /// Number of bindings currently attached to `node`.
    pub fn node_binding_count(&self, node: NodeId) -> usize {
        self.lifecycle.binding_count(node)
    }

    /// Install the error hook all reported failures are routed to,
    /// replacing the default `tracing` output.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&ReactiveError) + Send + Sync + 'static,
    {
        *self.error_hook.write() = Some(Arc::new(hook));
    }

    /// Report an engine error without letting it propagate.
    pub(crate) fn report(&self, err: &ReactiveError) {
        let hook = self.error_hook.read().clone();
        if let Some(hook) = hook {
            hook(err);
            return;
        }
        match err {
            ReactiveError::BindingExecution(_) => {
                tracing::warn!(error = %err, "binding failed for this cycle");
            }
            ReactiveError::TrackingOverflow { .. } | ReactiveError::CyclicUpdate { .. } => {
                tracing::error!(error = %err, "reactive graph fault");
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("tracked_states", &self.graph.read().len())
            .finish()
    }
}
