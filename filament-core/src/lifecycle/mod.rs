//! Binding Lifecycle
//!
//! Bindings attached to output nodes must die with their node, or they keep
//! their dependency subscriptions alive and re-run against a target nobody
//! can see. This module keeps the `node → bindings` registry the runtime
//! consults when a node is reported removed, and defines the observer trait
//! a host implements to deliver those reports.
//!
//! The engine never watches the host's tree itself. A host with a mutation
//! observer installs a [`RemovalObserver`] and calls
//! [`Runtime::node_removed`](crate::reactive::Runtime::node_removed) per
//! removed node while walking the removed subtree; a host without one calls
//! it manually at teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::reactive::{Binding, BindingId};

/// Opaque handle for a host output node (a DOM element, a widget, a row in
/// a native view). The engine only ever compares and hashes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    /// Allocate a fresh engine-side node id.
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Implemented by hosts that can watch their own tree for removals.
///
/// The runtime calls [`watch`](RemovalObserver::watch) for every node a
/// binding attaches to; the host is expected to report the node's eventual
/// removal back through `Runtime::node_removed`.
pub trait RemovalObserver: Send + Sync {
    fn watch(&self, node: NodeId);
}

/// `node → bindings attached to it`. Most nodes carry one or two bindings,
/// hence the inline-capacity vector.
pub(crate) struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, SmallVec<[Binding; 2]>>>,
}

impl NodeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn attach(&self, node: NodeId, binding: Binding) {
        self.nodes.write().entry(node).or_default().push(binding);
    }

    /// Remove and return every binding attached to `node`.
    pub(crate) fn detach_all(&self, node: NodeId) -> SmallVec<[Binding; 2]> {
        self.nodes.write().remove(&node).unwrap_or_default()
    }

    /// Drop a single binding from `node`, pruning the entry when it was the
    /// last one. Used when a binding is disposed ahead of its node.
    pub(crate) fn remove_binding(&self, node: NodeId, id: BindingId) {
        let mut nodes = self.nodes.write();
        if let Some(bindings) = nodes.get_mut(&node) {
            bindings.retain(|binding| binding.id() != id);
            if bindings.is_empty() {
                nodes.remove(&node);
            }
        }
    }

    pub(crate) fn binding_count(&self, node: NodeId) -> usize {
        self.nodes.read().get(&node).map(SmallVec::len).unwrap_or(0)
    }
}
