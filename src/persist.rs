//! Node storage.
//!
//! The tree never holds nodes directly: it asks a [`PersistenceProvider`] to
//! resolve [`NodeRef`] handles. [`InMemory`] keeps nodes in a slab with a free
//! list and is the default. A disk-backed provider can serialize nodes on
//! `update_node`/`flush` and page them back in on `load_node`.

use crate::error::{PhError, Result};
use crate::node::Node;

/// Opaque handle to a node owned by a [`PersistenceProvider`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(u32);

impl NodeRef {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_raw(self) -> u32 {
        self.0
    }
}

/// Storage backend for tree nodes and tree-level metadata.
///
/// Calls are synchronous; a provider that blocks on I/O blocks the calling
/// tree operation. Errors propagate unchanged out of that operation.
pub trait PersistenceProvider<V> {
    /// Resolve a reference to a live node.
    fn load_node(&self, node: NodeRef) -> Result<&Node<V>>;

    /// Resolve a reference for mutation. Callers follow up with
    /// [`update_node`](Self::update_node) once the mutation is complete.
    fn load_node_mut(&mut self, node: NodeRef) -> Result<&mut Node<V>>;

    /// Take ownership of a brand-new node and return a fresh reference to it.
    fn register_node(&mut self, node: Node<V>) -> Result<NodeRef>;

    /// The node behind `node` changed.
    fn update_node(&mut self, _node: NodeRef) -> Result<()> {
        Ok(())
    }

    /// Release a node, returning it. The reference is invalid afterwards.
    fn discard_node(&mut self, node: NodeRef) -> Result<Node<V>>;

    /// A tree with `dims` dimensions was created on this provider.
    fn write_tree(&mut self, _dims: usize) -> Result<()> {
        Ok(())
    }

    /// Entry count or root changed.
    fn update_tree(&mut self, _dims: usize, _size: usize, _root: NodeRef) -> Result<()> {
        Ok(())
    }

    /// Durability barrier, triggered by the caller.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Number of nodes currently held.
    fn node_count(&self) -> usize;

    /// Human-readable description for diagnostics.
    fn description(&self) -> String;
}

/// Slab of nodes with a free list; the default provider.
pub struct InMemory<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<u32>,
    live: usize,
}

impl<V> InMemory<V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Approximate heap bytes held by all nodes.
    pub fn memory_usage(&self) -> usize {
        self.nodes.capacity() * std::mem::size_of::<Option<Node<V>>>()
            + self.free.capacity() * 4
            + self.nodes.iter().flatten().map(Node::heap_bytes).sum::<usize>()
    }
}

impl<V> Default for InMemory<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PersistenceProvider<V> for InMemory<V> {
    #[inline]
    fn load_node(&self, node: NodeRef) -> Result<&Node<V>> {
        self.nodes
            .get(node.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PhError::DanglingNode(node))
    }

    #[inline]
    fn load_node_mut(&mut self, node: NodeRef) -> Result<&mut Node<V>> {
        self.nodes
            .get_mut(node.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(PhError::DanglingNode(node))
    }

    fn register_node(&mut self, node: Node<V>) -> Result<NodeRef> {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            return Ok(NodeRef(idx));
        }
        let idx = u32::try_from(self.nodes.len())
            .map_err(|_| PhError::Persistence("node slab exhausted".into()))?;
        self.nodes.push(Some(node));
        Ok(NodeRef(idx))
    }

    fn discard_node(&mut self, node: NodeRef) -> Result<Node<V>> {
        let taken = self
            .nodes
            .get_mut(node.0 as usize)
            .and_then(Option::take)
            .ok_or(PhError::DanglingNode(node))?;
        self.free.push(node.0);
        self.live -= 1;
        Ok(taken)
    }

    fn node_count(&self) -> usize {
        self.live
    }

    fn description(&self) -> String {
        format!("in-memory ({} nodes, {} free slots)", self.live, self.free.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_reuses_discarded_slots() {
        let mut p: InMemory<u8> = InMemory::new();
        let a = p.register_node(Node::new(2, 10)).unwrap();
        let b = p.register_node(Node::new(2, 5)).unwrap();
        assert_ne!(a, b);
        assert_eq!(p.node_count(), 2);

        let n = p.discard_node(a).unwrap();
        assert_eq!(n.post_len(), 10);
        assert!(matches!(p.load_node(a), Err(PhError::DanglingNode(r)) if r == a));
        assert!(p.discard_node(a).is_err());

        let c = p.register_node(Node::new(2, 3)).unwrap();
        assert_eq!(c, a);
        assert_eq!(p.load_node(c).unwrap().post_len(), 3);
        assert_eq!(p.node_count(), 2);
    }
}
