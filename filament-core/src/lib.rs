//! Filament Core
//!
//! This crate provides the reactive state engine behind the Filament UI
//! framework. It implements:
//!
//! - Key-level dependency tracking between state objects and bindings
//! - A computed-property cache with lazy, memoized evaluation
//! - A batched update scheduler with deduplication and ordering guarantees
//! - Binding lifecycle management tied to host output nodes
//!
//! Updates propagate directly from a changed key to the bindings that read
//! it. There is no virtual tree and no diffing step; the granularity of
//! change is a single key on a single state object.
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: state objects, the dependency graph, computed cells, the
//!   scheduler, and the tracking context
//! - `lifecycle`: node identity, the removal observer contract, and the
//!   node-to-binding registry
//!
//! # Example
//!
//! ```rust
//! use filament_core::reactive::{self, Value};
//!
//! let state = reactive::create_state(Value::from([("count", 0)]));
//!
//! let observed = state.clone();
//! let effect = reactive::effect(move || {
//!     let count = observed.get("count");
//!     tracing::info!(%count, "count changed");
//! });
//!
//! // The effect re-runs once per real change of "count".
//! state.set("count", 5);
//! assert_eq!(effect.run_count(), 2);
//!
//! effect.dispose();
//! ```

pub mod lifecycle;
pub mod reactive;
