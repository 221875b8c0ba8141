use std::fmt;
use std::marker::PhantomData;

use tracing::debug;

use crate::config::Config;
use crate::distance::{Distance, DistanceFilter};
use crate::error::{PhError, Result};
use crate::hc::{infix_mask, low_mask, pos_in_array, DEPTH, MAX_DIMS};
use crate::node::{Insert, Node, Relocate, Remove, Slot};
use crate::persist::{InMemory, NodeRef, PersistenceProvider};
use crate::query::{nearest, AcceptAll, Filter, KnnQuery, WindowQuery};
use crate::stats::{self, TreeStats};

/// A PH-tree: a map from `dims`-dimensional `i64` keys to values.
///
/// Nodes are owned by a [`PersistenceProvider`]; the default keeps them in
/// memory. Every operation validates key dimensionality and reports provider
/// failures as errors.
pub struct PhTree<V, P = InMemory<V>> {
    dims: usize,
    config: Config,
    store: P,
    root: NodeRef,
    size: usize,
    _marker: PhantomData<fn() -> V>,
}

impl<V> PhTree<V> {
    /// Empty in-memory tree with default configuration.
    pub fn new(dims: usize) -> Result<Self> {
        Self::with_config(dims, Config::default())
    }

    pub fn with_config(dims: usize, config: Config) -> Result<Self> {
        Self::with_provider(dims, config, InMemory::new())
    }

    /// Approximate heap bytes held by the tree.
    pub fn memory_usage(&self) -> usize {
        self.store.memory_usage()
    }
}

impl<V, P: PersistenceProvider<V>> PhTree<V, P> {
    /// Empty tree whose nodes are kept by `store`.
    pub fn with_provider(dims: usize, config: Config, mut store: P) -> Result<Self> {
        if dims == 0 || dims > MAX_DIMS {
            return Err(PhError::InvalidDimensions(dims));
        }
        config.validate()?;
        store.write_tree(dims)?;
        let root = store.register_node(Node::new(dims, DEPTH - 1))?;
        store.update_tree(dims, 0, root)?;
        debug!(dims, provider = %store.description(), "created tree");
        Ok(Self {
            dims,
            config,
            store,
            root,
            size: 0,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.store
    }

    #[inline]
    pub(crate) fn root(&self) -> NodeRef {
        self.root
    }

    /// Ask the provider to make all changes durable.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    fn check_dims(&self, len: usize) -> Result<()> {
        if len != self.dims {
            return Err(PhError::DimensionMismatch {
                expected: self.dims,
                actual: len,
            });
        }
        Ok(())
    }

    fn set_size(&mut self, size: usize) -> Result<()> {
        self.size = size;
        self.store.update_tree(self.dims, size, self.root)
    }

    /// Follow `key` down the tree. Returns the deepest node on its path and
    /// the value stored under exactly `key`, if any.
    pub(crate) fn walk(&self, key: &[i64]) -> Result<(NodeRef, Option<&V>)> {
        let mut at = self.root;
        loop {
            let node = self.store.load_node(at)?;
            let pl = node.post_len();
            let Some((stored, slot)) = node.lookup(pos_in_array(key, pl)) else {
                return Ok((at, None));
            };
            match slot {
                Slot::Leaf(value) => {
                    let hit = stored.diff(key, low_mask(pl)) == 0;
                    return Ok((at, hit.then_some(value)));
                }
                Slot::Child { post_len, node } => {
                    if stored.diff(key, infix_mask(pl, *post_len as u32)) != 0 {
                        return Ok((at, None));
                    }
                    at = *node;
                }
            }
        }
    }

    pub fn get(&self, key: &[i64]) -> Result<Option<&V>> {
        self.check_dims(key.len())?;
        Ok(self.walk(key)?.1)
    }

    pub fn contains(&self, key: &[i64]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace. Returns the previous value under `key`.
    pub fn put(&mut self, key: &[i64], value: V) -> Result<Option<V>> {
        self.check_dims(key.len())?;
        let old = self.insert_from(self.root, key, value)?;
        if old.is_none() {
            self.set_size(self.size + 1)?;
        }
        Ok(old)
    }

    /// Insert starting at node `start`, which must cover `key`.
    fn insert_from(&mut self, start: NodeRef, key: &[i64], mut value: V) -> Result<Option<V>> {
        let mut at = start;
        loop {
            let node = self.store.load_node_mut(at)?;
            match node.insert(key, value, &self.config) {
                Insert::Added => {
                    self.store.update_node(at)?;
                    return Ok(None);
                }
                Insert::Replaced(old) => {
                    self.store.update_node(at)?;
                    return Ok(Some(old));
                }
                Insert::Descend(child, v) => {
                    at = child;
                    value = v;
                }
                Insert::Split {
                    hc,
                    sub_post_len,
                    value,
                } => {
                    self.split(at, hc, key, sub_post_len, value)?;
                    return Ok(None);
                }
            }
        }
    }

    /// Put a new node between `parent` and its entry at `hc`, holding that
    /// entry and the new leaf.
    fn split(&mut self, parent: NodeRef, hc: u64, key: &[i64], sub_post_len: u32, value: V) -> Result<()> {
        let child = self.store.register_node(Node::new(self.dims, sub_post_len))?;
        let split = self
            .store
            .load_node_mut(parent)?
            .split_entry(hc, key, sub_post_len, child);
        let Some((old_key, old_slot)) = split else {
            self.store.discard_node(child)?;
            return Err(PhError::CorruptNode {
                node: parent,
                reason: "split of a missing entry",
            });
        };
        self.store
            .load_node_mut(child)?
            .add_pair(&old_key, old_slot, key, Slot::Leaf(value), &self.config);
        self.store.update_node(parent)?;
        self.store.update_node(child)?;
        debug!(?parent, ?child, post_len = sub_post_len, "split");
        Ok(())
    }

    /// Remove `key`. Returns its value if it was present.
    pub fn remove(&mut self, key: &[i64]) -> Result<Option<V>> {
        self.check_dims(key.len())?;
        let mut parent = None;
        let mut at = self.root;
        loop {
            let node = self.store.load_node_mut(at)?;
            match node.remove(key, &self.config) {
                Remove::Missing => return Ok(None),
                Remove::Descend(child) => {
                    parent = Some(at);
                    at = child;
                }
                Remove::Removed(value) => {
                    let remaining = node.entry_count();
                    self.size -= 1;
                    self.store.update_node(at)?;
                    if let (Some(parent), 1) = (parent, remaining) {
                        self.merge(parent, at, key)?;
                    }
                    self.set_size(self.size)?;
                    return Ok(Some(value));
                }
            }
        }
    }

    /// Dissolve `at`, left with a single entry, into `parent`. `key` is any
    /// key under `at`.
    fn merge(&mut self, parent: NodeRef, at: NodeRef, key: &[i64]) -> Result<()> {
        let node = self.store.discard_node(at)?;
        let mut survivor = key.to_vec();
        let Some(slot) = node.into_single(&mut survivor) else {
            return Ok(());
        };
        let p = self.store.load_node_mut(parent)?;
        let hc = pos_in_array(&survivor, p.post_len());
        let replaced = p.replace_entry(hc, &survivor, slot);
        debug_assert!(replaced, "merge target vanished");
        self.store.update_node(parent)?;
        debug!(?parent, discarded = ?at, "merge");
        Ok(())
    }

    /// Move the entry at `old` to `new`. Returns the value now stored under
    /// `new`, or `None` if `old` was absent. An entry already at `new` is
    /// replaced.
    pub fn update(&mut self, old: &[i64], new: &[i64]) -> Result<Option<&V>> {
        self.check_dims(old.len())?;
        self.check_dims(new.len())?;
        let mut path = Vec::new();
        let mut at = self.root;
        loop {
            let node = self.store.load_node_mut(at)?;
            match node.relocate(old, new, &self.config) {
                Relocate::Missing => return Ok(None),
                Relocate::Descend(child) => {
                    path.push(at);
                    at = child;
                }
                Relocate::Moved => {
                    self.store.update_node(at)?;
                    return self.get(new);
                }
                Relocate::Removed { value, diff_bits } => {
                    let remaining = node.entry_count();
                    self.size -= 1;
                    self.store.update_node(at)?;
                    match path.last() {
                        Some(&parent) if remaining == 1 => self.merge(parent, at, old)?,
                        _ => path.push(at),
                    }
                    let mut start = self.root;
                    for &r in path.iter().rev() {
                        if self.store.load_node(r)?.post_len() + 1 >= diff_bits {
                            start = r;
                            break;
                        }
                    }
                    if self.insert_from(start, new, value)?.is_none() {
                        self.size += 1;
                    }
                    self.set_size(self.size)?;
                    return self.get(new);
                }
            }
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) -> Result<()> {
        let mut pending = vec![self.root];
        while let Some(r) = pending.pop() {
            let node = self.store.discard_node(r)?;
            pending.extend(node.children());
        }
        self.root = self.store.register_node(Node::new(self.dims, DEPTH - 1))?;
        debug!(entries = self.size, "cleared");
        self.set_size(0)
    }

    /// Entries with `min[d] <= key[d] <= max[d]` in every dimension.
    pub fn query(&self, min: &[i64], max: &[i64]) -> Result<WindowQuery<'_, V, P>> {
        self.query_with_filter(min, max, AcceptAll)
    }

    pub fn query_with_filter<F: Filter>(
        &self,
        min: &[i64],
        max: &[i64],
        filter: F,
    ) -> Result<WindowQuery<'_, V, P, F>> {
        self.check_dims(min.len())?;
        self.check_dims(max.len())?;
        WindowQuery::new(
            &self.store,
            self.root,
            min.to_vec(),
            max.to_vec(),
            filter,
            self.config.hc_incrementer,
        )
    }

    /// Every entry.
    pub fn query_extent(&self) -> Result<WindowQuery<'_, V, P>> {
        let (min, max) = (vec![i64::MIN; self.dims], vec![i64::MAX; self.dims]);
        self.query(&min, &max)
    }

    /// Run a window query to completion, mapping each match. Stops after
    /// `max_results` matches; zero means no limit.
    pub fn query_all<F, M, R>(
        &self,
        min: &[i64],
        max: &[i64],
        max_results: usize,
        filter: F,
        mut mapper: M,
    ) -> Result<Vec<R>>
    where
        F: Filter,
        M: FnMut(&[i64], &V) -> R,
    {
        let limit = if max_results == 0 { usize::MAX } else { max_results };
        let mut q = self.query_with_filter(min, max, filter)?;
        let mut out = Vec::new();
        while out.len() < limit {
            let Some((key, value)) = q.advance()? else {
                break;
            };
            out.push(mapper(key, value));
        }
        Ok(out)
    }

    /// The `n` entries closest to `center`, closest first. Entries tied with
    /// the n-th distance may be cut arbitrarily.
    pub fn nearest_neighbour<D: Distance + ?Sized>(
        &self,
        n: usize,
        dist: &D,
        center: &[i64],
    ) -> Result<KnnQuery<'_, V, P>> {
        self.check_dims(center.len())?;
        nearest(self, n, dist, center)
    }

    /// Entries within `radius` of `center`.
    pub fn range_query<'a, D: Distance + ?Sized>(
        &'a self,
        radius: f64,
        dist: &'a D,
        center: &'a [i64],
    ) -> Result<WindowQuery<'a, V, P, DistanceFilter<'a, D>>> {
        self.check_dims(center.len())?;
        if radius.is_nan() || radius < 0.0 {
            return Err(PhError::InvalidRadius(radius));
        }
        let (mut min, mut max) = (vec![0; self.dims], vec![0; self.dims]);
        dist.to_mbb(radius, center, &mut min, &mut max);
        self.query_with_filter(&min, &max, DistanceFilter::new(center, dist, radius))
    }

    /// Walk the whole tree, collecting shape statistics and checking
    /// structural invariants.
    pub fn stats(&self) -> Result<TreeStats> {
        stats::collect::<V, P>(&self.store, self.root, self.size)
    }
}

impl<V: fmt::Debug, P: PersistenceProvider<V>> PhTree<V, P> {
    /// Every node with its `post_len`, entry count and layout, followed by
    /// its entries; children are indented below their parent.
    pub fn dump(&self) -> Result<String> {
        stats::dump::<V, P>(&self.store, self.root, self.dims)
    }
}

/// One `key => value` line per entry, in tree order.
impl<V: fmt::Debug, P: PersistenceProvider<V>> fmt::Display for PhTree<V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.query_extent().map_err(|_| fmt::Error)? {
            let (key, value) = entry.map_err(|_| fmt::Error)?;
            writeln!(f, "{key:?} => {value:?}")?;
        }
        Ok(())
    }
}

impl<V, P: PersistenceProvider<V>> fmt::Debug for PhTree<V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhTree")
            .field("dims", &self.dims)
            .field("len", &self.size)
            .field("provider", &self.store.description())
            .finish()
    }
}
