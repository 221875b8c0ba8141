//! Structural statistics and consistency checks.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::error::Result;
use crate::hc::apply_hc_pos;
use crate::node::{NodeCursor, Slot};
use crate::persist::{NodeRef, PersistenceProvider};

/// Shape of a tree, gathered by a full traversal.
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    /// Nodes reachable from the root.
    pub nodes: usize,
    pub ahc_nodes: usize,
    /// Nodes whose entries live in a node tree.
    pub nt_nodes: usize,
    /// Node tree levels summed over all node-tree-backed nodes.
    pub nt_inner_nodes: usize,
    /// Leaf entries.
    pub entries: usize,
    /// Longest root-to-node path, the root being depth 0.
    pub max_depth: usize,
    /// Nodes per `post_len`.
    pub post_len_histogram: BTreeMap<u32, usize>,
    /// Children per infix length (bits skipped between parent and child).
    pub infix_histogram: BTreeMap<u32, usize>,
    /// Nodes per entry count.
    pub node_size_histogram: BTreeMap<usize, usize>,
    /// Heap bytes held by the nodes.
    pub heap_bytes: usize,
    /// Structural problems found; zero for a healthy tree.
    pub violations: usize,
}

impl TreeStats {
    /// Average entries (leaves and children) per node.
    pub fn mean_fanout(&self) -> f64 {
        if self.nodes == 0 {
            return 0.0;
        }
        let slots: usize = self.node_size_histogram.iter().map(|(n, c)| n * c).sum();
        slots as f64 / self.nodes as f64
    }
}

pub(crate) fn collect<V, P>(store: &P, root: NodeRef, expected_len: usize) -> Result<TreeStats>
where
    P: PersistenceProvider<V>,
{
    let mut s = TreeStats::default();
    let mut stack = vec![(root, 0usize)];
    while let Some((at, depth)) = stack.pop() {
        let node = store.load_node(at)?;
        let pl = node.post_len();
        s.nodes += 1;
        s.max_depth = s.max_depth.max(depth);
        s.heap_bytes += node.heap_bytes();
        *s.post_len_histogram.entry(pl).or_default() += 1;
        *s.node_size_histogram.entry(node.entry_count()).or_default() += 1;
        if node.is_ahc() {
            s.ahc_nodes += 1;
        }
        if let Some(nt) = node.nt() {
            s.nt_nodes += 1;
            nt.for_each_node(&mut |_| s.nt_inner_nodes += 1);
        }

        if depth > 0 && node.entry_count() < 2 {
            s.violations += 1;
            if node.entry_count() == 0 {
                warn!(node = ?at, "zombie node without entries");
            } else {
                warn!(node = ?at, "lonely node with a single entry");
            }
        }

        let capacity = 1usize.checked_shl(node.dims() as u32).unwrap_or(usize::MAX);
        if node.entry_count() > capacity {
            s.violations += 1;
            warn!(node = ?at, entries = node.entry_count(), capacity, "over-populated node");
        }

        let mut seen = 0;
        for entry in NodeCursor::full(node) {
            seen += 1;
            match *entry.slot {
                Slot::Leaf(_) => s.entries += 1,
                Slot::Child { post_len, node: child } => {
                    let sub = post_len as u32;
                    if sub < pl {
                        *s.infix_histogram.entry(pl - sub - 1).or_default() += 1;
                    } else {
                        s.violations += 1;
                        warn!(node = ?at, post_len = pl, child_post_len = sub, "child not below its parent");
                    }
                    let actual = store.load_node(child)?.post_len();
                    if actual != sub {
                        s.violations += 1;
                        warn!(node = ?child, recorded = sub, actual, "child post_len mismatch");
                    }
                    stack.push((child, depth + 1));
                }
            }
        }
        if seen != node.entry_count() {
            s.violations += 1;
            warn!(node = ?at, counted = seen, recorded = node.entry_count(), "entry count mismatch");
        }
        if let Some(nt) = node.nt() {
            let mut held = 0;
            nt.for_each_node(&mut |n| held += n.entries_here());
            if held != seen {
                s.violations += 1;
                warn!(node = ?at, "node tree entry count mismatch");
            }
        }
    }
    if s.entries != expected_len {
        s.violations += 1;
        warn!(counted = s.entries, recorded = expected_len, "tree size mismatch");
    }
    Ok(s)
}

/// Indented listing of every node and leaf, parents before their entries.
pub(crate) fn dump<V, P>(store: &P, root: NodeRef, dims: usize) -> Result<String>
where
    V: fmt::Debug,
    P: PersistenceProvider<V>,
{
    let mut lines = Vec::new();
    dump_node(store, root, 0, &vec![0; dims], &mut lines)?;
    Ok(lines.join("\n"))
}

fn dump_node<V, P>(store: &P, at: NodeRef, depth: usize, prefix: &[i64], lines: &mut Vec<String>) -> Result<()>
where
    V: fmt::Debug,
    P: PersistenceProvider<V>,
{
    let node = store.load_node(at)?;
    let pl = node.post_len();
    let indent = "  ".repeat(depth);
    let layout = match (node.nt().is_some(), node.is_ahc()) {
        (true, _) => "NT",
        (false, true) => "AHC",
        (false, false) => "LHC",
    };
    lines.push(format!(
        "{indent}{at:?} post_len={pl} entries={} layout={layout}",
        node.entry_count()
    ));
    let mut key = Vec::with_capacity(prefix.len());
    for entry in NodeCursor::full(node) {
        key.clear();
        key.extend_from_slice(prefix);
        apply_hc_pos(entry.hc, pl, &mut key);
        entry.key.fill(&mut key, pl);
        match entry.slot {
            Slot::Leaf(value) => lines.push(format!("{indent}  #{} {key:?} => {value:?}", entry.hc)),
            Slot::Child { node: child, .. } => {
                lines.push(format!("{indent}  #{} +", entry.hc));
                dump_node(store, *child, depth + 1, &key, lines)?;
            }
        }
    }
    Ok(())
}
