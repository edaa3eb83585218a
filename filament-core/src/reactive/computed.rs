//! Computed Cache
//!
//! A computed cell is a lazily-evaluated, memoized derived property
//! installed on a state key. The cell owns an internal binding whose only
//! job on notification is to flip the cell's dirty flag; recomputation
//! happens on the next read, never eagerly.
//!
//! # Two-hop propagation
//!
//! Reading a computed key tracks the *computed* key for the current binding,
//! while the cell's internal binding tracks the raw keys the compute
//! function reads. A raw write therefore marks the cell dirty (cheap, no
//! side-effect work) and cascades one notification for the computed key, so
//! downstream bindings schedule without ever re-tracking the compute
//! function's inputs themselves.
//!
//! # Failure
//!
//! A compute function that fails is reported through the runtime's error
//! hook and the cell keeps serving its last good cached value. Dependents
//! never observe a null produced by a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::binding::{Binding, Body};
use super::context::TrackScope;
use super::error::ReactiveError;
use super::runtime::Runtime;
use super::state::StateId;
use super::value::Value;

/// A memoized derived property installed on a state key.
pub(crate) struct ComputedCell {
    /// The state the computed key lives on.
    host: StateId,
    /// The key the cell is installed under.
    key: String,
    runtime: Weak<Runtime>,
    /// Internal binding; its tracked set is the compute function's inputs.
    binding: Binding,
    value: Mutex<Option<Value>>,
    dirty: AtomicBool,
}

impl ComputedCell {
    /// Create a cell for `key` on `host`. The compute function does not run
    /// here; the first read performs the initial evaluation.
    pub(crate) fn install(
        runtime: &Arc<Runtime>,
        host: StateId,
        key: &str,
        compute: Box<Body>,
    ) -> Arc<Self> {
        let binding = Binding::new(Arc::downgrade(runtime), compute, None, None);
        let cell = Arc::new(Self {
            host,
            key: key.to_owned(),
            runtime: Arc::downgrade(runtime),
            binding: binding.clone(),
            value: Mutex::new(None),
            dirty: AtomicBool::new(true),
        });
        binding.set_computed(Arc::downgrade(&cell));
        cell
    }

    /// Whether the next read will recompute.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// The cached value, without forcing a recomputation.
    pub(crate) fn cached(&self) -> Option<Value> {
        self.value.lock().clone()
    }

    /// Mark the cell stale. On the clean-to-dirty transition this cascades a
    /// notification for the computed key itself, which is what schedules the
    /// cell's dependents.
    pub(crate) fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::SeqCst) {
            if let Some(runtime) = self.runtime.upgrade() {
                runtime.notify(self.host, &self.key);
            }
        }
    }

    /// Read the cell's value, recomputing if it is dirty.
    pub(crate) fn read(&self) -> Value {
        if !self.dirty.load(Ordering::SeqCst) {
            if let Some(value) = self.cached() {
                return value;
            }
        }

        let Some(runtime) = self.runtime.upgrade() else {
            return self.cached().unwrap_or(Value::Null);
        };

        // Re-track from scratch: conditional compute functions may read
        // different inputs on different runs.
        runtime.untrack_binding(&self.binding);

        let scope = match TrackScope::enter(&self.binding) {
            Ok(scope) => scope,
            Err(err) => {
                runtime.report(&err);
                return self.cached().unwrap_or(Value::Null);
            }
        };
        let result = self.binding.call_body();
        let reads = scope.finish();
        self.binding.store_tracked(reads);
        self.dirty.store(false, Ordering::SeqCst);

        match result {
            Ok(value) => {
                *self.value.lock() = Some(value.clone());
                value
            }
            Err(err) => {
                runtime.report(&ReactiveError::BindingExecution(err));
                self.cached().unwrap_or(Value::Null)
            }
        }
    }
}

impl std::fmt::Debug for ComputedCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedCell")
            .field("key", &self.key)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.cached().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::error::BindingError;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn computes_on_first_read_only() {
        let runtime = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let cell = ComputedCell::install(
            &runtime,
            StateId::next(),
            "answer",
            Box::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int(42))
            }),
        );

        assert!(cell.is_dirty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(cell.read(), Value::Int(42));
        assert_eq!(cell.read(), Value::Int(42));
        assert_eq!(cell.read(), Value::Int(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cell.is_dirty());
    }

    #[test]
    fn dirty_flag_forces_recompute() {
        let runtime = Runtime::new();
        let source = Arc::new(AtomicI32::new(1));
        let source_clone = source.clone();

        let cell = ComputedCell::install(
            &runtime,
            StateId::next(),
            "n",
            Box::new(move || Ok(Value::Int(i64::from(source_clone.load(Ordering::SeqCst))))),
        );

        assert_eq!(cell.read(), Value::Int(1));

        source.store(5, Ordering::SeqCst);
        assert_eq!(cell.read(), Value::Int(1));

        cell.mark_dirty();
        assert_eq!(cell.read(), Value::Int(5));
    }

    #[test]
    fn failing_compute_keeps_last_good_value() {
        let runtime = Runtime::new();
        let fail = Arc::new(AtomicBool::new(false));
        let fail_clone = fail.clone();

        let cell = ComputedCell::install(
            &runtime,
            StateId::next(),
            "fragile",
            Box::new(move || {
                if fail_clone.load(Ordering::SeqCst) {
                    Err(BindingError::new("boom"))
                } else {
                    Ok(Value::Int(10))
                }
            }),
        );

        assert_eq!(cell.read(), Value::Int(10));

        fail.store(true, Ordering::SeqCst);
        cell.mark_dirty();

        // Failure is absorbed; the stale value keeps serving.
        assert_eq!(cell.read(), Value::Int(10));
        assert_eq!(cell.read(), Value::Int(10));
    }

    #[test]
    fn mark_dirty_is_idempotent_until_read() {
        let runtime = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let cell = ComputedCell::install(
            &runtime,
            StateId::next(),
            "n",
            Box::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int(0))
            }),
        );

        cell.read();
        cell.mark_dirty();
        cell.mark_dirty();
        cell.mark_dirty();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cell.read();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
