//! Update Scheduler
//!
//! The scheduler coalesces notifications into flush passes. Outside a batch
//! a single write flushes immediately (batching is opt-in for grouping
//! writes, not required for correctness); inside a batch, or while a flush
//! pass is already running, notified bindings are parked in a pending queue.
//!
//! # Flush semantics
//!
//! The pending queue is an insertion-ordered map keyed by binding ID, which
//! gives both guarantees the engine needs: bindings run in the order they
//! were enqueued, and a binding notified several times in one pass runs
//! exactly once.
//!
//! A flush loops because bindings may write to other reactive state while
//! running; those re-entrant notifications land in a fresh pending queue and
//! drain on the next pass. The loop is bounded by [`FLUSH_PASS_LIMIT`]: a
//! graph where a write keeps triggering another write is a design bug in the
//! consuming application, and the scheduler reports `CyclicUpdate` and
//! clears the queue instead of hanging.
//!
//! # Thread scoping
//!
//! All scheduling state is thread-local. The engine is synchronous and
//! cooperative: a write notifies and flushes on the calling stack frame, so
//! each thread's write/flush cycle is self-contained and needs no locking.

use std::cell::RefCell;

use indexmap::IndexMap;

use super::binding::{Binding, BindingId};
use super::error::ReactiveError;
use super::runtime::Runtime;

/// Maximum number of passes one flush will run before reporting
/// `CyclicUpdate` and abandoning the queue.
pub const FLUSH_PASS_LIMIT: usize = 100;

#[derive(Default)]
struct SchedState {
    pending: IndexMap<BindingId, Binding>,
    batch_depth: usize,
    flushing: bool,
}

thread_local! {
    static SCHED: RefCell<SchedState> = RefCell::new(SchedState::default());
}

/// Enqueue a binding for execution.
///
/// Outside a batch and outside a flush this drains the queue immediately, so
/// a lone write executes its subscribers synchronously.
pub(crate) fn schedule(runtime: &Runtime, binding: Binding) {
    let drain_now = SCHED.with(|sched| {
        let mut sched = sched.borrow_mut();
        sched.pending.insert(binding.id(), binding);
        sched.batch_depth == 0 && !sched.flushing
    });
    if drain_now {
        flush(runtime);
    }
}

/// Remove a binding from the pending queue.
///
/// Called on disposal so an already-scheduled binding is not merely skipped
/// but actually gone.
pub(crate) fn discard(id: BindingId) {
    SCHED.with(|sched| {
        sched.borrow_mut().pending.shift_remove(&id);
    });
}

/// Drain the pending queue, running each binding at most once per pass.
///
/// A no-op while a batch is open; the queue drains at outermost batch exit.
pub(crate) fn flush(runtime: &Runtime) {
    let entered = SCHED.with(|sched| {
        let mut sched = sched.borrow_mut();
        if sched.flushing || sched.batch_depth > 0 {
            return false;
        }
        sched.flushing = true;
        true
    });
    if !entered {
        return;
    }
    let _guard = FlushGuard;

    let mut passes = 0;
    loop {
        let batch: Vec<Binding> = SCHED.with(|sched| {
            std::mem::take(&mut sched.borrow_mut().pending)
                .into_values()
                .collect()
        });
        if batch.is_empty() {
            break;
        }

        passes += 1;
        if passes > FLUSH_PASS_LIMIT {
            SCHED.with(|sched| sched.borrow_mut().pending.clear());
            runtime.report(&ReactiveError::CyclicUpdate {
                passes: FLUSH_PASS_LIMIT,
            });
            break;
        }
        tracing::trace!(pass = passes, bindings = batch.len(), "flush pass");

        for binding in batch {
            if binding.is_disposed() {
                continue;
            }
            // A binding always executes against its own runtime, which may
            // not be the one that triggered the flush.
            if let Some(owner) = binding.runtime() {
                owner.run_binding(&binding);
            }
        }
    }
}

/// Resets the `flushing` flag even when a binding body panics out of the
/// drain loop; a stuck flag would park every later write forever.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        SCHED.with(|sched| sched.borrow_mut().flushing = false);
    }
}

/// Run `binding` immediately, trapping any writes it performs into the
/// pending queue.
///
/// Used for the initial execution at registration time; without the trap, a
/// body that writes one of its own dependencies would recurse on the call
/// stack instead of hitting the flush guard. The trapped writes drain right
/// after, unless a batch is open, in which case they wait for batch exit
/// like any other pending work.
pub(crate) fn run_initial(runtime: &Runtime, binding: &Binding) {
    let trapped = SCHED.with(|sched| {
        let mut sched = sched.borrow_mut();
        if sched.flushing {
            return false;
        }
        sched.flushing = true;
        true
    });

    if trapped {
        let guard = FlushGuard;
        runtime.run_binding(binding);
        drop(guard);
        flush(runtime);
    } else {
        runtime.run_binding(binding);
    }
}

/// Execute `f` with binding execution deferred until the outermost batch
/// exits.
///
/// Writes inside the batch still apply to raw state immediately, so reads
/// inside the batch observe fresh values; only the re-execution of
/// subscribers is deferred and deduplicated.
pub(crate) fn batch<R>(runtime: &Runtime, f: impl FnOnce() -> R) -> R {
    SCHED.with(|sched| sched.borrow_mut().batch_depth += 1);
    let guard = BatchGuard;
    let out = f();
    drop(guard);
    let drain_now = SCHED.with(|sched| {
        let sched = sched.borrow();
        sched.batch_depth == 0 && !sched.flushing
    });
    if drain_now {
        flush(runtime);
    }
    out
}

struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        SCHED.with(|sched| {
            let mut sched = sched.borrow_mut();
            sched.batch_depth = sched.batch_depth.saturating_sub(1);
        });
    }
}

/// Number of bindings currently awaiting flush on this thread.
#[cfg(test)]
pub(crate) fn pending_len() -> usize {
    SCHED.with(|sched| sched.borrow().pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::value::Value;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn counting(runtime: &Arc<Runtime>, counter: Arc<AtomicI32>) -> Binding {
        Binding::new(
            Arc::downgrade(runtime),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }),
            None,
            None,
        )
    }

    #[test]
    fn schedule_outside_batch_runs_immediately() {
        let runtime = Runtime::new();
        let counter = Arc::new(AtomicI32::new(0));
        let binding = counting(&runtime, counter.clone());

        schedule(&runtime, binding);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pending_len(), 0);
    }

    #[test]
    fn batch_defers_and_dedupes() {
        let runtime = Runtime::new();
        let counter = Arc::new(AtomicI32::new(0));
        let binding = counting(&runtime, counter.clone());

        let out = batch(&runtime, || {
            schedule(&runtime, binding.clone());
            schedule(&runtime, binding.clone());
            schedule(&runtime, binding.clone());
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            "done"
        });

        assert_eq!(out, "done");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_flush_once_at_outermost_exit() {
        let runtime = Runtime::new();
        let counter = Arc::new(AtomicI32::new(0));
        let binding = counting(&runtime, counter.clone());

        batch(&runtime, || {
            schedule(&runtime, binding.clone());
            batch(&runtime, || {
                schedule(&runtime, binding.clone());
            });
            // Inner batch exit must not flush while the outer one is open.
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_initial_inside_batch_leaves_pending_parked() {
        let runtime = Runtime::new();
        let parked_runs = Arc::new(AtomicI32::new(0));
        let parked = counting(&runtime, parked_runs.clone());
        let fresh_runs = Arc::new(AtomicI32::new(0));
        let fresh = counting(&runtime, fresh_runs.clone());

        batch(&runtime, || {
            schedule(&runtime, parked.clone());
            run_initial(&runtime, &fresh);
            // The fresh binding gets its initial run; already-queued work
            // must not drain until the batch exits.
            assert_eq!(fresh_runs.load(Ordering::SeqCst), 1);
            assert_eq!(parked_runs.load(Ordering::SeqCst), 0);
            assert_eq!(pending_len(), 1);
        });

        assert_eq!(parked_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_binding_does_not_wedge_the_scheduler() {
        let runtime = Runtime::new();
        let panicking = Binding::new(
            Arc::downgrade(&runtime),
            Box::new(|| panic!("body panic")),
            None,
            None,
        );

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            schedule(&runtime, panicking);
        }));
        assert!(result.is_err());

        // The flushing flag was restored on unwind; later work still runs.
        let counter = Arc::new(AtomicI32::new(0));
        schedule(&runtime, counting(&runtime, counter.clone()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn discard_removes_pending_entry() {
        let runtime = Runtime::new();
        let counter = Arc::new(AtomicI32::new(0));
        let binding = counting(&runtime, counter.clone());

        batch(&runtime, || {
            schedule(&runtime, binding.clone());
            assert_eq!(pending_len(), 1);
            discard(binding.id());
            assert_eq!(pending_len(), 0);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disposed_binding_is_skipped_at_flush() {
        let runtime = Runtime::new();
        let counter = Arc::new(AtomicI32::new(0));
        let binding = counting(&runtime, counter.clone());

        batch(&runtime, || {
            schedule(&runtime, binding.clone());
            binding.mark_disposed();
        });

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn flush_order_is_enqueue_order() {
        let runtime = Runtime::new();
        let order: Arc<parking_lot::Mutex<Vec<&'static str>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let make = |label: &'static str| {
            let order = order.clone();
            Binding::new(
                Arc::downgrade(&runtime),
                Box::new(move || {
                    order.lock().push(label);
                    Ok(Value::Null)
                }),
                None,
                None,
            )
        };

        let first = make("first");
        let second = make("second");

        batch(&runtime, || {
            schedule(&runtime, first.clone());
            schedule(&runtime, second);
            // Re-notifying does not move a binding to the back.
            schedule(&runtime, first);
        });

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
