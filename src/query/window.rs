use smallvec::SmallVec;

use super::{child_in_range, leaf_in_range, node_masks, AcceptAll, Filter};
use crate::error::{PhError, Result};
use crate::hc::{apply_hc_pos, mask_above};
use crate::node::{Node, NodeCursor, Slot};
use crate::persist::{NodeRef, PersistenceProvider};

struct Frame<'a, V> {
    cursor: NodeCursor<'a, V>,
    post_len: u32,
    /// Key bits above `post_len` shared by everything below this node.
    prefix: SmallVec<[i64; 8]>,
}

/// Streaming window query: yields every entry whose key lies inside
/// `[min, max]` (inclusive, per dimension) and passes the filter.
///
/// The query borrows the tree; mutating the tree while a query is alive is
/// prevented by the borrow checker.
pub struct WindowQuery<'a, V, P, F = AcceptAll> {
    store: &'a P,
    /// Node the query starts from and its key bits above its `post_len`.
    start: NodeRef,
    start_prefix: SmallVec<[i64; 8]>,
    min: Vec<i64>,
    max: Vec<i64>,
    filter: F,
    hci: bool,
    stack: Vec<Frame<'a, V>>,
    key: Vec<i64>,
}

impl<'a, V, P, F> WindowQuery<'a, V, P, F>
where
    P: PersistenceProvider<V>,
    F: Filter,
{
    pub(crate) fn new(
        store: &'a P,
        root: NodeRef,
        min: Vec<i64>,
        max: Vec<i64>,
        filter: F,
        hci: bool,
    ) -> Result<Self> {
        let prefix = vec![0; min.len()];
        Self::starting_at(store, root, &prefix, min, max, filter, hci)
    }

    /// Query restricted to the subtree of `node`, whose key bits above its
    /// `post_len` are those of `prefix`.
    pub(crate) fn starting_at(
        store: &'a P,
        node: NodeRef,
        prefix: &[i64],
        min: Vec<i64>,
        max: Vec<i64>,
        filter: F,
        hci: bool,
    ) -> Result<Self> {
        let dims = min.len();
        let mut q = Self {
            store,
            start: node,
            start_prefix: SmallVec::from_slice(prefix),
            min,
            max,
            filter,
            hci,
            stack: Vec::new(),
            key: Vec::with_capacity(dims),
        };
        q.push(store.load_node(node)?, prefix);
        Ok(q)
    }

    fn push(&mut self, node: &'a Node<V>, prefix: &[i64]) {
        let post_len = node.post_len();
        let (lower, upper) = node_masks(prefix, post_len, &self.min, &self.max);
        self.stack.push(Frame {
            cursor: NodeCursor::masked(node, lower, upper, self.hci),
            post_len,
            prefix: SmallVec::from_slice(prefix),
        });
    }

    /// Advance to the next match. The returned key lives in a scratch buffer
    /// that the following call overwrites.
    pub fn advance(&mut self) -> Result<Option<(&[i64], &'a V)>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = frame.cursor.next() else {
                self.stack.pop();
                continue;
            };
            let post_len = frame.post_len;
            self.key.clear();
            self.key.extend_from_slice(&frame.prefix);
            apply_hc_pos(entry.hc, post_len, &mut self.key);
            entry.key.fill(&mut self.key, post_len);

            match entry.slot {
                Slot::Leaf(value) => {
                    if leaf_in_range(&self.key, &self.min, &self.max) && self.filter.is_valid(&self.key) {
                        return Ok(Some((&self.key, value)));
                    }
                }
                Slot::Child { post_len, node } => {
                    let sub = *post_len as u32;
                    if child_in_range(&self.key, sub, &self.min, &self.max)
                        && self.filter.is_prefix_valid(&self.key, sub + 1)
                    {
                        let child = match self.store.load_node(*node) {
                            Ok(child) => child,
                            Err(e) => {
                                self.stack.clear();
                                return Err(e);
                            }
                        };
                        let prefix = std::mem::take(&mut self.key);
                        self.push(child, &prefix);
                        self.key = prefix;
                    }
                }
            }
        }
    }

    /// Next match, or [`PhError::NoSuchElement`] once the query is exhausted.
    pub fn next_entry(&mut self) -> Result<(Vec<i64>, &'a V)> {
        match self.advance()? {
            Some((key, value)) => Ok((key.to_vec(), value)),
            None => Err(PhError::NoSuchElement),
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    fn check_dims(&self, min: &[i64], max: &[i64]) -> Result<()> {
        let expected = self.min.len();
        match [min.len(), max.len()].into_iter().find(|&n| n != expected) {
            Some(actual) => Err(PhError::DimensionMismatch { expected, actual }),
            None => Ok(()),
        }
    }

    /// Change the rectangle of a running query. Subtrees already left behind
    /// are not revisited; pending subtrees outside the new rectangle are
    /// dropped, and the nodes still being walked continue with the new
    /// rectangle from their current position. Use [`reset`](Self::reset) to
    /// start over.
    pub fn set_range(&mut self, min: &[i64], max: &[i64]) -> Result<()> {
        self.check_dims(min, max)?;
        self.min.copy_from_slice(min);
        self.max.copy_from_slice(max);
        let dead = self.stack.iter().skip(1).position(|f| {
            let keep = mask_above(f.post_len + 1);
            !f.prefix.iter().zip(min).zip(max).all(|((&p, &lo), &hi)| {
                ((p as u64 & keep) as i64) <= hi && ((p as u64 | !keep) as i64) >= lo
            })
        });
        if let Some(i) = dead {
            self.stack.truncate(i + 1);
        }
        for frame in self.stack.iter_mut() {
            let (lower, upper) = node_masks(&frame.prefix, frame.post_len, min, max);
            frame.cursor.set_limits(lower, upper);
        }
        Ok(())
    }

    /// Restart the query with a new rectangle, keeping the filter.
    pub fn reset(&mut self, min: &[i64], max: &[i64]) -> Result<()> {
        self.check_dims(min, max)?;
        self.min.copy_from_slice(min);
        self.max.copy_from_slice(max);
        self.stack.clear();
        let node = self.store.load_node(self.start)?;
        let prefix = std::mem::take(&mut self.start_prefix);
        self.push(node, &prefix);
        self.start_prefix = prefix;
        Ok(())
    }

    pub fn min(&self) -> &[i64] {
        &self.min
    }

    pub fn max(&self) -> &[i64] {
        &self.max
    }
}

impl<'a, V, P, F> Iterator for WindowQuery<'a, V, P, F>
where
    P: PersistenceProvider<V>,
    F: Filter,
{
    type Item = Result<(Vec<i64>, &'a V)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some((key, value))) => Some(Ok((key.to_vec(), value))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
