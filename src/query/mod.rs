//! Window, range and nearest-neighbour queries.
//!
//! A window query walks the tree top-down. At every node it derives an
//! address envelope `(lower, upper)` from the query rectangle so that only
//! addresses that can hold matches are visited, then checks each child's
//! infix and each leaf's full key against the rectangle.

mod knn;
mod window;

pub use knn::{KnnQuery, Neighbour};
pub use window::WindowQuery;

pub(crate) use knn::nearest;

use crate::hc::{mask_above, DEPTH};

/// Predicate applied to query results.
///
/// `is_prefix_valid` is asked before descending into a subtree whose keys all
/// share the bits of `prefix` above `bits_to_ignore`; returning `false` prunes
/// the subtree.
pub trait Filter {
    fn is_valid(&self, key: &[i64]) -> bool;

    fn is_prefix_valid(&self, _prefix: &[i64], _bits_to_ignore: u32) -> bool {
        true
    }
}

/// Filter that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Filter for AcceptAll {
    #[inline]
    fn is_valid(&self, _key: &[i64]) -> bool {
        true
    }
}

impl<F> Filter for F
where
    F: Fn(&[i64]) -> bool,
{
    #[inline]
    fn is_valid(&self, key: &[i64]) -> bool {
        self(key)
    }
}

/// Address envelope of a node at `post_len` for the rectangle `[min, max]`.
/// `prefix` supplies the node's key bits above `post_len`.
pub(crate) fn node_masks(prefix: &[i64], post_len: u32, min: &[i64], max: &[i64]) -> (u64, u64) {
    let mut lower = 0u64;
    let mut upper = 0u64;
    if post_len == DEPTH - 1 {
        // The sign bit: a set bit means a smaller value.
        for (&lo, &hi) in min.iter().zip(max) {
            lower <<= 1;
            upper <<= 1;
            if lo < 0 {
                upper |= 1;
            }
            if hi < 0 {
                lower |= 1;
            }
        }
        return (lower, upper);
    }
    let keep = mask_above(post_len);
    let bit = 1u64 << post_len;
    for ((&p, &lo), &hi) in prefix.iter().zip(min).zip(max) {
        let bisection = ((p as u64 | bit) & keep) as i64;
        lower <<= 1;
        upper <<= 1;
        if lo >= bisection {
            lower |= 1;
        }
        if hi >= bisection {
            upper |= 1;
        }
    }
    (lower, upper)
}

/// Whether the subtree of a child at `sub_post_len`, whose bits above
/// `sub_post_len` are those of `key`, can intersect `[min, max]`.
pub(crate) fn child_in_range(key: &[i64], sub_post_len: u32, min: &[i64], max: &[i64]) -> bool {
    let keep = mask_above(sub_post_len + 1);
    key.iter().zip(min).zip(max).all(|((&k, &lo), &hi)| {
        let first = (k as u64 & keep) as i64;
        let last = (k as u64 | !keep) as i64;
        first <= hi && last >= lo
    })
}

#[inline]
pub(crate) fn leaf_in_range(key: &[i64], min: &[i64], max: &[i64]) -> bool {
    key.iter()
        .zip(min)
        .zip(max)
        .all(|((&k, &lo), &hi)| lo <= k && k <= hi)
}
