//! k-nearest-neighbour search.
//!
//! The search guesses an initial radius from a point close to the center,
//! then runs distance-filtered window queries over the radius' bounding box.
//! While a query runs, the candidate list shrinks the box and the filter
//! radius to the current k-th distance. If a round finds fewer than `k`
//! points, the radius grows tenfold and the query restarts.

use std::fmt;

use tracing::debug;

use super::window::WindowQuery;
use super::AcceptAll;
use crate::distance::{Distance, DistanceFilter};
use crate::error::Result;
use crate::persist::{InMemory, PersistenceProvider};
use crate::tree::PhTree;

/// Accepted candidates between two shrinks of the search box.
const CONSOLIDATION_INTERVAL: usize = 10;

/// One result of a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbour<'a, V> {
    pub key: Vec<i64>,
    pub value: &'a V,
    pub dist: f64,
}

/// Nearest-neighbour results, closest first.
pub struct KnnQuery<'a, V, P = InMemory<V>> {
    tree: &'a PhTree<V, P>,
    results: std::vec::IntoIter<Neighbour<'a, V>>,
}

impl<'a, V, P> KnnQuery<'a, V, P> {
    fn new(tree: &'a PhTree<V, P>, results: Vec<Neighbour<'a, V>>) -> Self {
        Self {
            tree,
            results: results.into_iter(),
        }
    }

    /// Results not yet consumed.
    pub fn as_slice(&self) -> &[Neighbour<'a, V>] {
        self.results.as_slice()
    }
}

impl<'a, V, P: PersistenceProvider<V>> KnnQuery<'a, V, P> {
    /// Search again with new parameters, discarding unconsumed results.
    pub fn reset<D: Distance + ?Sized>(&mut self, n: usize, dist: &D, center: &[i64]) -> Result<()> {
        *self = self.tree.nearest_neighbour(n, dist, center)?;
        Ok(())
    }
}

impl<V: fmt::Debug, P> fmt::Debug for KnnQuery<'_, V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnnQuery").field("results", &self.as_slice()).finish()
    }
}

impl<'a, V, P> Iterator for KnnQuery<'a, V, P> {
    type Item = Neighbour<'a, V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.results.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.results.size_hint()
    }
}

impl<V, P> ExactSizeIterator for KnnQuery<'_, V, P> {}

struct Candidates<'a, V> {
    n: usize,
    dims: usize,
    list: Vec<Neighbour<'a, V>>,
    full: bool,
    since_shrink: usize,
    max_dist: f64,
}

impl<'a, V> Candidates<'a, V> {
    fn new(n: usize, dims: usize) -> Self {
        Self {
            n,
            dims,
            list: Vec::with_capacity(n + CONSOLIDATION_INTERVAL),
            full: false,
            since_shrink: 0,
            max_dist: f64::INFINITY,
        }
    }

    /// Add a candidate; returns the new search radius when it shrinks.
    fn push(&mut self, key: &[i64], value: &'a V, dist: f64) -> Option<f64> {
        if dist > self.max_dist {
            return None;
        }
        self.list.push(Neighbour {
            key: key.to_vec(),
            value,
            dist,
        });
        if !self.full {
            if self.list.len() < self.n {
                return None;
            }
            self.full = true;
        } else {
            self.since_shrink += 1;
            if self.since_shrink < CONSOLIDATION_INTERVAL {
                return None;
            }
        }
        self.consolidate();
        Some(self.max_dist)
    }

    /// Sort, then drop everything clearly beyond the k-th distance. Ties
    /// with the k-th (up to rounding) are kept until the end.
    fn consolidate(&mut self) {
        self.sort();
        let kth = self.list[self.n - 1].dist;
        let eps = self.dims as f64 * kth / (1u64 << 51) as f64;
        self.list.retain(|c| c.dist <= kth + eps);
        self.max_dist = kth;
        self.since_shrink = 0;
    }

    fn sort(&mut self) {
        self.list.sort_by(|a, b| a.dist.total_cmp(&b.dist));
    }

    fn finish(mut self) -> Vec<Neighbour<'a, V>> {
        self.sort();
        self.list.truncate(self.n);
        self.list
    }
}

/// Distance to some entry near `center`, used as the first search radius.
fn seed_distance<V, P, D>(tree: &PhTree<V, P>, n: usize, dist: &D, center: &[i64]) -> Result<f64>
where
    P: PersistenceProvider<V>,
    D: Distance + ?Sized,
{
    let (deepest, _) = tree.walk(center)?;
    let (min, max) = (vec![i64::MIN; center.len()], vec![i64::MAX; center.len()]);
    let subtree = WindowQuery::starting_at(
        tree.provider(),
        deepest,
        center,
        min.clone(),
        max.clone(),
        AcceptAll,
        false,
    )?;
    if let Some(d) = first_distance(subtree, n, dist, center)? {
        return Ok(d);
    }
    let whole = WindowQuery::new(tree.provider(), tree.root(), min, max, AcceptAll, false)?;
    Ok(first_distance(whole, n, dist, center)?.unwrap_or(1.0))
}

fn first_distance<V, P, D>(
    mut q: WindowQuery<'_, V, P>,
    n: usize,
    dist: &D,
    center: &[i64],
) -> Result<Option<f64>>
where
    P: PersistenceProvider<V>,
    D: Distance + ?Sized,
{
    while let Some((key, _)) = q.advance()? {
        if n > 1 && key == center {
            continue;
        }
        return Ok(Some(dist.dist(center, key)));
    }
    Ok(None)
}

pub(crate) fn nearest<'a, V, P, D>(
    tree: &'a PhTree<V, P>,
    n: usize,
    dist: &D,
    center: &[i64],
) -> Result<KnnQuery<'a, V, P>>
where
    P: PersistenceProvider<V>,
    D: Distance + ?Sized,
{
    if n == 0 || tree.is_empty() {
        return Ok(KnnQuery::new(tree, Vec::new()));
    }
    if n == 1 {
        if let Some(value) = tree.get(center)? {
            return Ok(KnnQuery::new(
                tree,
                vec![Neighbour {
                    key: center.to_vec(),
                    value,
                    dist: 0.0,
                }],
            ));
        }
    }
    if tree.len() <= n {
        let mut all = Candidates::new(n, center.len());
        for entry in tree.query_extent()? {
            let (key, value) = entry?;
            let d = dist.dist(center, &key);
            all.list.push(Neighbour { key, value, dist: d });
        }
        return Ok(KnnQuery::new(tree, all.finish()));
    }

    let d0 = seed_distance(tree, n, dist, center)?;
    let mut radius = if d0 > 0.0 && d0.is_finite() { d0 } else { 1.0 };
    let dims = center.len();
    let hci = tree.config().hc_incrementer;
    let (mut min, mut max) = (vec![0; dims], vec![0; dims]);
    loop {
        dist.to_mbb(radius, center, &mut min, &mut max);
        let covers_all = min.iter().all(|&v| v == i64::MIN) && max.iter().all(|&v| v == i64::MAX);
        // Once the box spans everything, far corners may lie beyond `radius`.
        let max_dist = if covers_all { f64::INFINITY } else { radius };
        let filter = DistanceFilter::new(center, dist, max_dist);
        let mut q = WindowQuery::new(tree.provider(), tree.root(), min.clone(), max.clone(), filter, hci)?;
        let mut found = Candidates::new(n, dims);
        while let Some((key, value)) = q.advance()? {
            let d = dist.dist(center, key);
            if let Some(kth) = found.push(key, value, d) {
                q.filter_mut().set_max_dist(kth);
                dist.to_mbb(kth, center, &mut min, &mut max);
                q.set_range(&min, &max)?;
            }
        }
        debug!(radius, found = found.list.len(), wanted = n, "knn round");
        if found.list.len() >= n || covers_all {
            return Ok(KnnQuery::new(tree, found.finish()));
        }
        radius *= 10.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_keep_ties_until_finish() {
        let v = 0u8;
        let mut c = Candidates::new(2, 1);
        assert_eq!(c.push(&[5], &v, 5.0), None);
        assert_eq!(c.push(&[3], &v, 3.0), Some(5.0));
        assert_eq!(c.push(&[9], &v, 9.0), None);
        assert_eq!(c.push(&[-5], &v, 5.0), None);
        assert_eq!(c.list.len(), 3);
        let out = c.finish();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, vec![3]);
        assert_eq!(out[1].dist, 5.0);
    }

    #[test]
    fn test_candidates_shrink_periodically() {
        let v = 0u8;
        let mut c = Candidates::new(1, 1);
        assert_eq!(c.push(&[100], &v, 100.0), Some(100.0));
        for i in 1..CONSOLIDATION_INTERVAL as i64 {
            assert_eq!(c.push(&[50 + i], &v, (50 + i) as f64), None);
        }
        assert_eq!(c.push(&[50], &v, 50.0), Some(50.0));
        assert_eq!(c.list.len(), 1);
    }
}
