//! Hypercube address arithmetic.
//!
//! A node at `post_len` addresses its children by one bit per dimension, taken
//! at bit position `post_len` of every key coordinate. Dimension 0 supplies the
//! most significant address bit.

pub(crate) use crate::bits::low_mask;

/// Bit width of every key coordinate.
pub(crate) const DEPTH: u32 = 64;

/// Largest supported dimensionality (one address bit per dimension in a `u64`).
pub const MAX_DIMS: usize = 64;

/// Bits charged per slot for a child reference in the size heuristics.
const REF_BITS: f64 = 32.0;
/// Bits charged per slot for the slot tag.
const TAG_BITS: f64 = 8.0;

/// Mask clearing the lowest `bits` bits.
#[inline]
pub(crate) fn mask_above(bits: u32) -> u64 {
    if bits >= 64 {
        0
    } else {
        u64::MAX << bits
    }
}

/// Mask of the infix bits stored with a child entry: strictly between the
/// child's `sub_post_len` and the parent's `post_len`.
#[inline]
pub(crate) fn infix_mask(post_len: u32, sub_post_len: u32) -> u64 {
    mask_above(sub_post_len + 1) & low_mask(post_len)
}

#[inline]
pub(crate) fn pos_in_array(key: &[i64], post_len: u32) -> u64 {
    let mut pos = 0u64;
    for &k in key {
        pos = (pos << 1) | ((k as u64 >> post_len) & 1);
    }
    pos
}

/// Write the address bits of `pos` into bit `post_len` of every coordinate.
#[inline]
pub(crate) fn apply_hc_pos(mut pos: u64, post_len: u32, key: &mut [i64]) {
    let bit = 1u64 << post_len;
    for k in key.iter_mut().rev() {
        let v = *k as u64;
        *k = (if pos & 1 == 1 { v | bit } else { v & !bit }) as i64;
        pos >>= 1;
    }
}

/// Number of significant bits in `diff`; the highest differing bit is at
/// `conflicting_bits(diff) - 1`, zero means no difference.
#[inline]
pub(crate) fn conflicting_bits(diff: u64) -> u32 {
    64 - diff.leading_zeros()
}

/// OR of the per-coordinate XOR of two keys, restricted to `mask`.
#[inline]
pub(crate) fn key_diff(a: &[i64], b: &[i64], mask: u64) -> u64 {
    a.iter()
        .zip(b)
        .fold(0u64, |acc, (&x, &y)| acc | (x as u64 ^ y as u64))
        & mask
}

/// Next address after `v` that satisfies `((a | lower) & upper) == a`.
/// Wraps around to `lower` after the last valid address.
#[inline]
pub(crate) fn inc(v: u64, lower: u64, upper: u64) -> u64 {
    ((v | !upper).wrapping_add(1) & upper) | lower
}

/// Whether `pos` lies inside the bit envelope `[lower, upper]`.
#[inline]
pub(crate) fn check_hc_pos(pos: u64, lower: u64, upper: u64) -> bool {
    ((pos | lower) & upper) == pos
}

/// Choose array (AHC) over linear (LHC) layout for a node with `entries`
/// entries. AHC costs a slot per address, LHC stores the address per entry.
pub(crate) fn use_ahc(entries: usize, dims: usize, post_len: u32, bias: f64) -> bool {
    if dims > 31 {
        return false;
    }
    let entry_bits = (dims as f64) * post_len as f64 + REF_BITS + TAG_BITS;
    let size_ahc = entry_bits * (1u64 << dims) as f64;
    let size_lhc = (entry_bits + dims as f64) * entries as f64;
    size_lhc * bias >= size_ahc
}

/// Node tree variant of [`use_ahc`]: fixed fan-out, every slot also carries a
/// full `dims`-wide key.
pub(crate) fn nt_use_ahc(entries: usize, dims: usize, post_bits: u32, bias: f64) -> bool {
    let entry_bits = post_bits as f64 + (dims as f64) * DEPTH as f64 + REF_BITS + TAG_BITS;
    let size_ahc = entry_bits * crate::nt::NT_FANOUT as f64;
    let size_lhc = (entry_bits + crate::nt::NT_BITS as f64) * entries as f64;
    size_lhc * bias >= size_ahc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pos_in_array_dim0_is_msb() {
        assert_eq!(pos_in_array(&[1, 0], 0), 0b10);
        assert_eq!(pos_in_array(&[0, 1], 0), 0b01);
        assert_eq!(pos_in_array(&[4, 4, 0], 2), 0b110);
        assert_eq!(pos_in_array(&[-1, 0], 63), 0b10);
    }

    #[test]
    fn test_apply_hc_pos_inverts_pos_in_array() {
        let mut key = [0i64, -1, 5];
        apply_hc_pos(0b101, 3, &mut key);
        assert_eq!(pos_in_array(&key, 3), 0b101);
        assert_eq!(key, [8, -9, 13]);
        apply_hc_pos(0, 63, &mut key);
        assert!(key.iter().all(|&k| k >= 0));
    }

    #[test]
    fn test_conflicting_bits() {
        assert_eq!(conflicting_bits(0), 0);
        assert_eq!(conflicting_bits(1), 1);
        assert_eq!(conflicting_bits(0b1000), 4);
        assert_eq!(conflicting_bits(u64::MAX), 64);
        assert_eq!(key_diff(&[8, 1], &[0, 1], u64::MAX), 8);
        assert_eq!(key_diff(&[8, 1], &[0, 1], low_mask(3)), 0);
    }

    #[test]
    fn test_inc_enumerates_envelope() {
        let lower = 0b0010;
        let upper = 0b1011;
        let mut seen = vec![lower];
        let mut v = lower;
        loop {
            let n = inc(v, lower, upper);
            if n <= v {
                break;
            }
            seen.push(n);
            v = n;
        }
        let expected: Vec<u64> = (0..16u64).filter(|&a| check_hc_pos(a, lower, upper)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_masks() {
        assert_eq!(mask_above(64), 0);
        assert_eq!(mask_above(0), u64::MAX);
        assert_eq!(infix_mask(10, 4), 0b11_1110_0000);
        assert_eq!(infix_mask(5, 4), 0);
    }

    #[test]
    fn test_ahc_heuristic_grows_with_entries() {
        assert!(!use_ahc(1, 2, 63, 2.0));
        assert!(use_ahc(4, 2, 63, 2.0));
        assert!(!use_ahc(1000, 40, 10, 2.0));
        assert!(!nt_use_ahc(2, 10, 12, 1.5));
        assert!(nt_use_ahc(64, 10, 12, 1.5));
    }
}
