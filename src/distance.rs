//! Distance functions for range and nearest-neighbour queries.

use smallvec::SmallVec;

use crate::hc::{low_mask, mask_above};
use crate::query::Filter;

/// A metric over `i64` keys.
///
/// [`to_mbb`](Distance::to_mbb) must return a box containing every point
/// within `radius` of `center`; the default is correct for any metric where
/// no single coordinate difference exceeds the distance (L1, L2, L-inf).
pub trait Distance {
    fn dist(&self, a: &[i64], b: &[i64]) -> f64;

    fn to_mbb(&self, radius: f64, center: &[i64], min: &mut [i64], max: &mut [i64]) {
        // Float to int casts saturate, so huge radii cover the whole axis.
        let r = radius.ceil() as i128;
        for ((&c, lo), hi) in center.iter().zip(min.iter_mut()).zip(max.iter_mut()) {
            let c = c as i128;
            *lo = c.saturating_sub(r).max(i64::MIN as i128) as i64;
            *hi = c.saturating_add(r).min(i64::MAX as i128) as i64;
        }
    }
}

impl<D: Distance + ?Sized> Distance for &D {
    #[inline]
    fn dist(&self, a: &[i64], b: &[i64]) -> f64 {
        (**self).dist(a, b)
    }

    #[inline]
    fn to_mbb(&self, radius: f64, center: &[i64], min: &mut [i64], max: &mut [i64]) {
        (**self).to_mbb(radius, center, min, max)
    }
}

#[inline]
fn axis_delta(a: i64, b: i64) -> f64 {
    (a as i128 - b as i128) as f64
}

/// Euclidean (L2) distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl Distance for Euclidean {
    fn dist(&self, a: &[i64], b: &[i64]) -> f64 {
        debug_assert_eq!(a.len(), b.len(), "points of different dimensionality");
        a.iter()
            .zip(b)
            .map(|(&x, &y)| {
                let d = axis_delta(x, y);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

/// Manhattan (L1) distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manhattan;

impl Distance for Manhattan {
    fn dist(&self, a: &[i64], b: &[i64]) -> f64 {
        debug_assert_eq!(a.len(), b.len(), "points of different dimensionality");
        a.iter().zip(b).map(|(&x, &y)| axis_delta(x, y).abs()).sum()
    }
}

/// Accepts keys within `max_dist` of `center` and prunes subtrees whose
/// bounding box lies farther away.
pub struct DistanceFilter<'a, D: ?Sized> {
    center: &'a [i64],
    dist: &'a D,
    pub(crate) max_dist: f64,
}

impl<'a, D: Distance + ?Sized> DistanceFilter<'a, D> {
    pub fn new(center: &'a [i64], dist: &'a D, max_dist: f64) -> Self {
        Self {
            center,
            dist,
            max_dist,
        }
    }

    pub fn max_dist(&self) -> f64 {
        self.max_dist
    }

    pub fn set_max_dist(&mut self, max_dist: f64) {
        self.max_dist = max_dist;
    }
}

impl<D: Distance + ?Sized> Filter for DistanceFilter<'_, D> {
    #[inline]
    fn is_valid(&self, key: &[i64]) -> bool {
        self.dist.dist(self.center, key) <= self.max_dist
    }

    fn is_prefix_valid(&self, prefix: &[i64], bits_to_ignore: u32) -> bool {
        if bits_to_ignore >= 64 {
            return true;
        }
        let keep = mask_above(bits_to_ignore);
        let low = low_mask(bits_to_ignore);
        // Closest point of the prefix box to the center.
        let closest: SmallVec<[i64; 8]> = prefix
            .iter()
            .zip(self.center)
            .map(|(&p, &c)| {
                let lo = (p as u64 & keep) as i64;
                let hi = (p as u64 | low) as i64;
                c.clamp(lo, hi)
            })
            .collect();
        self.dist.dist(self.center, &closest) <= self.max_dist
    }
}
