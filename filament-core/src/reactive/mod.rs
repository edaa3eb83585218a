//! Fine-Grained Reactive State Engine
//!
//! Dependency tracking at the level of individual object keys: a binding
//! that reads `state.get("count")` re-runs when `"count"` changes, and
//! nothing else does. No virtual trees, no diffing, no full re-render.
//!
//! # How It Works
//!
//! 1. **Track.** While a binding executes, every `(state, key)` it reads
//!    is recorded in the runtime's dependency graph.
//!
//! 2. **Notify.** A write compares structurally against the stored value;
//!    a real change notifies exactly that key's subscribers. Computed keys
//!    are marked dirty, everything else is enqueued.
//!
//! 3. **Flush.** The scheduler deduplicates the queue and runs each
//!    binding once, in first-enqueue order. [`batch`] defers the flush so
//!    a burst of writes costs one run per binding.
//!
//! ```
//! use filament_core::reactive::{self, Value};
//!
//! let state = reactive::create_state(Value::from([("count", 0)]));
//! let doubled = state.clone();
//! state.define_computed("doubled", move || {
//!     Ok(Value::Int(doubled.get("count").as_i64().unwrap_or(0) * 2))
//! });
//! state.set("count", 21);
//! assert_eq!(state.get("doubled"), Value::Int(42));
//! ```

mod binding;
mod computed;
mod context;
mod error;
mod runtime;
mod scheduler;
mod state;
mod value;

pub use binding::{Binding, BindingId, Body, Disposer, Sink};
pub use context::TRACK_DEPTH_LIMIT;
pub use error::{BindingError, ReactiveError};
pub use runtime::{ErrorHook, Runtime};
pub use scheduler::FLUSH_PASS_LIMIT;
pub use state::{ReactiveState, StateId};
pub use value::Value;

use crate::lifecycle::NodeId;
use context::TrackScope;

/// Wrap a record value into a reactive state on the global runtime.
pub fn create_state(value: Value) -> ReactiveState {
    Runtime::global().create_state(value)
}

/// Register an eager side effect on the global runtime. See
/// [`Runtime::effect`].
pub fn effect<F>(f: F) -> Disposer
where
    F: Fn() + Send + Sync + 'static,
{
    Runtime::global().effect(f)
}

/// See [`Runtime::try_effect`].
pub fn try_effect<F>(f: F) -> Disposer
where
    F: Fn() -> Result<(), BindingError> + Send + Sync + 'static,
{
    Runtime::global().try_effect(f)
}

/// See [`Runtime::watch`].
pub fn watch<C>(state: &ReactiveState, key: &str, callback: C) -> Disposer
where
    C: Fn(&Value, &Value) + Send + Sync + 'static,
{
    Runtime::global().watch(state, key, callback)
}

/// See [`Runtime::watch_fn`].
pub fn watch_fn<R, C>(read: R, callback: C) -> Disposer
where
    R: Fn() -> Value + Send + Sync + 'static,
    C: Fn(&Value, &Value) + Send + Sync + 'static,
{
    Runtime::global().watch_fn(read, callback)
}

/// See [`Runtime::bind`].
pub fn bind<R, S>(node: NodeId, read: R, sink: S) -> Disposer
where
    R: Fn() -> Value + Send + Sync + 'static,
    S: Fn(&Value) + Send + Sync + 'static,
{
    Runtime::global().bind(node, read, sink)
}

/// Group writes on the global runtime so subscribers run once, after the
/// outermost batch exits.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Runtime::global().batch(f)
}

/// Run `f` with dependency tracking suspended. Reads inside do not
/// subscribe the current binding.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _scope = TrackScope::enter_untracked();
    f()
}
