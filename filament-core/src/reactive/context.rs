//! Tracking Context
//!
//! The tracking context records which binding is currently executing. When a
//! state key is read while a binding is current, the read is recorded both in
//! the runtime's dependency graph and in the frame for the executing binding,
//! which re-collects the binding's dependency set on every run.
//!
//! # Implementation
//!
//! An explicit thread-local stack of frames. Executing a binding pushes a
//! tracked frame; `untrack` pushes an untracked frame that suppresses
//! recording underneath it. The stack shape makes nesting work naturally
//! (a computed read from inside an effect pushes its own frame on top) and
//! makes the save/restore semantics auditable.
//!
//! The stack depth is bounded: blowing past [`TRACK_DEPTH_LIMIT`] frames
//! means some computation is recursively reading itself, and entering the
//! next frame fails with `TrackingOverflow` instead of overflowing the call
//! stack.

use std::cell::RefCell;

use super::binding::{Binding, BindingId};
use super::error::ReactiveError;
use super::state::StateId;

/// Maximum nesting depth for tracking frames.
pub const TRACK_DEPTH_LIMIT: usize = 64;

enum Frame {
    /// A binding is executing; reads are recorded here.
    Tracked {
        binding: Binding,
        reads: Vec<(StateId, String)>,
    },
    /// Reads underneath this frame are deliberately not recorded.
    Untracked,
}

thread_local! {
    static SCOPE_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Guard for one tracking frame. Pops the frame when dropped.
pub(crate) struct TrackScope {
    binding_id: Option<BindingId>,
}

impl TrackScope {
    /// Push a tracked frame for `binding`.
    ///
    /// Fails with `TrackingOverflow` when the stack is already at the depth
    /// limit; the caller reports the error and skips the execution.
    pub(crate) fn enter(binding: &Binding) -> Result<Self, ReactiveError> {
        SCOPE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= TRACK_DEPTH_LIMIT {
                return Err(ReactiveError::TrackingOverflow {
                    limit: TRACK_DEPTH_LIMIT,
                });
            }
            stack.push(Frame::Tracked {
                binding: binding.clone(),
                reads: Vec::new(),
            });
            Ok(Self {
                binding_id: Some(binding.id()),
            })
        })
    }

    /// Push an untracked frame.
    pub(crate) fn enter_untracked() -> Self {
        SCOPE_STACK.with(|stack| stack.borrow_mut().push(Frame::Untracked));
        Self { binding_id: None }
    }

    /// Pop the frame and hand back the reads recorded while it was current.
    pub(crate) fn finish(self) -> Vec<(StateId, String)> {
        let reads = SCOPE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            match popped {
                Some(Frame::Tracked { binding, reads }) => {
                    debug_assert_eq!(
                        Some(binding.id()),
                        self.binding_id,
                        "tracking frame mismatch on finish"
                    );
                    reads
                }
                _ => Vec::new(),
            }
        });
        std::mem::forget(self);
        reads
    }
}

impl Drop for TrackScope {
    fn drop(&mut self) {
        SCOPE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The binding whose frame is on top of the stack, if reads are currently
/// being tracked.
pub(crate) fn current_binding() -> Option<Binding> {
    SCOPE_STACK.with(|stack| match stack.borrow().last() {
        Some(Frame::Tracked { binding, .. }) => Some(binding.clone()),
        _ => None,
    })
}

/// True while a tracked frame is current.
pub(crate) fn is_tracking() -> bool {
    SCOPE_STACK.with(|stack| matches!(stack.borrow().last(), Some(Frame::Tracked { .. })))
}

/// Record a `(state, key)` read into the current tracked frame.
pub(crate) fn record_read(state: StateId, key: &str) {
    SCOPE_STACK.with(|stack| {
        if let Some(Frame::Tracked { reads, .. }) = stack.borrow_mut().last_mut() {
            reads.push((state, key.to_owned()));
        }
    });
}
