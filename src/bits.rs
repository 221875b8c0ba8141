//! Packed bit fields.
//!
//! Nodes store their addresses, postfixes and infixes back to back in a single
//! `BitArray`. Fields are 0..=64 bits wide and are laid out LSB first: bit `i`
//! of the array lives in bit `i % 64` of word `i / 64`, and a field's lowest
//! bit sits at the lowest offset.

/// Mask with the lowest `width` bits set.
#[inline]
pub(crate) fn low_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline]
fn words_for(bits: usize) -> usize {
    bits.div_ceil(64)
}

#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct BitArray {
    words: Vec<u64>,
    len: usize,
}

impl BitArray {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Zeroed array of `len` bits.
    pub(crate) fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; words_for(len)],
            len,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn heap_bytes(&self) -> usize {
        self.words.capacity() * 8
    }

    #[inline]
    pub(crate) fn read(&self, offset: usize, width: u32) -> u64 {
        debug_assert!(width <= 64);
        debug_assert!(offset + width as usize <= self.len, "read past end");
        if width == 0 {
            return 0;
        }
        let word = offset / 64;
        let shift = (offset % 64) as u32;
        let mut v = self.words[word] >> shift;
        if shift + width > 64 {
            v |= self.words[word + 1] << (64 - shift);
        }
        v & low_mask(width)
    }

    #[inline]
    pub(crate) fn write(&mut self, offset: usize, width: u32, value: u64) {
        debug_assert!(width <= 64);
        debug_assert!(offset + width as usize <= self.len, "write past end");
        if width == 0 {
            return;
        }
        let mask = low_mask(width);
        let value = value & mask;
        let word = offset / 64;
        let shift = (offset % 64) as u32;
        self.words[word] = (self.words[word] & !(mask << shift)) | (value << shift);
        if shift + width > 64 {
            let spill = 64 - shift;
            self.words[word + 1] = (self.words[word + 1] & !(mask >> spill)) | (value >> spill);
        }
    }

    /// Copy `len` bits from `src[src_off..]` into `self[dst_off..]`.
    pub(crate) fn copy_from(&mut self, src: &BitArray, src_off: usize, dst_off: usize, len: usize) {
        let mut done = 0;
        while done < len {
            let w = (len - done).min(64) as u32;
            let v = src.read(src_off + done, w);
            self.write(dst_off + done, w, v);
            done += w as usize;
        }
    }

    /// Open a zeroed gap of `n` bits at `offset`, shifting the tail up.
    pub(crate) fn insert(&mut self, offset: usize, n: usize) {
        debug_assert!(offset <= self.len);
        if n == 0 {
            return;
        }
        let old_len = self.len;
        self.len += n;
        self.words.resize(words_for(self.len), 0);

        // Move the tail from the top down so no chunk is overwritten before it is read.
        let mut remaining = old_len - offset;
        while remaining > 0 {
            let w = remaining.min(64);
            let src = offset + remaining - w;
            let v = self.read(src, w as u32);
            self.write(src + n, w as u32, v);
            remaining -= w;
        }
        self.clear_range(offset, n);
    }

    /// Drop `n` bits at `offset`, shifting the tail down.
    pub(crate) fn remove(&mut self, offset: usize, n: usize) {
        debug_assert!(offset + n <= self.len);
        if n == 0 {
            return;
        }
        let tail = self.len - offset - n;
        let mut done = 0;
        while done < tail {
            let w = (tail - done).min(64);
            let v = self.read(offset + n + done, w as u32);
            self.write(offset + done, w as u32, v);
            done += w;
        }
        self.len -= n;
        self.words.truncate(words_for(self.len));
        let used = (self.len % 64) as u32;
        if used != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= low_mask(used);
            }
        }
    }

    fn clear_range(&mut self, offset: usize, len: usize) {
        let mut done = 0;
        while done < len {
            let w = (len - done).min(64);
            self.write(offset + done, w as u32, 0);
            done += w;
        }
    }

    /// Binary search over `count` sorted fields of `width` bits, placed every
    /// `stride` bits starting at `base`. Same contract as `slice::binary_search`.
    pub(crate) fn binary_search(
        &self,
        base: usize,
        stride: usize,
        width: u32,
        count: usize,
        key: u64,
    ) -> Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let v = self.read(base + mid * stride, width);
            if v < key {
                lo = mid + 1;
            } else if v > key {
                hi = mid;
            } else {
                return Ok(mid);
            }
        }
        Err(lo)
    }
}

impl std::fmt::Debug for BitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitArray").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn model_read(bits: &[bool], offset: usize, width: u32) -> u64 {
        let mut v = 0u64;
        for i in (0..width as usize).rev() {
            v = (v << 1) | bits[offset + i] as u64;
        }
        v
    }

    #[test]
    fn test_read_write_across_words() {
        let mut a = BitArray::zeroed(200);
        a.write(60, 10, 0b10_1100_1011);
        a.write(0, 64, u64::MAX);
        a.write(130, 64, 0x0123_4567_89ab_cdef);
        assert_eq!(a.read(0, 60), low_mask(60));
        assert_eq!(a.read(60, 10) >> 4, 0b10_1100_1011 >> 4);
        assert_eq!(a.read(130, 64), 0x0123_4567_89ab_cdef);
        assert_eq!(a.read(129, 1), 0);
        assert_eq!(a.read(5, 0), 0);
    }

    #[test]
    fn test_insert_remove_against_model() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut a = BitArray::new();
        let mut model: Vec<bool> = Vec::new();

        for _ in 0..500 {
            if model.is_empty() || rng.gen_bool(0.6) {
                let at = rng.gen_range(0..=model.len());
                let n = rng.gen_range(1..150);
                let value: u64 = rng.gen();
                let w = n.min(64) as u32;
                a.insert(at, n);
                a.write(at, w, value);
                let mut chunk = vec![false; n];
                for (i, b) in chunk.iter_mut().enumerate().take(w as usize) {
                    *b = (value >> i) & 1 == 1;
                }
                model.splice(at..at, chunk);
            } else {
                let at = rng.gen_range(0..model.len());
                let n = rng.gen_range(0..=(model.len() - at).min(150));
                a.remove(at, n);
                model.drain(at..at + n);
            }
            assert_eq!(a.len(), model.len());
            let mut off = 0;
            while off < model.len() {
                let w = (model.len() - off).min(64) as u32;
                assert_eq!(a.read(off, w), model_read(&model, off, w), "offset {off}");
                off += w as usize;
            }
        }
    }

    #[test]
    fn test_binary_search_strided() {
        let stride = 13;
        let keys = [1u64, 4, 9, 10, 31];
        let mut a = BitArray::zeroed(stride * keys.len());
        for (i, k) in keys.iter().enumerate() {
            a.write(i * stride, 5, *k);
            a.write(i * stride + 5, 8, 0xff);
        }
        assert_eq!(a.binary_search(0, stride, 5, keys.len(), 9), Ok(2));
        assert_eq!(a.binary_search(0, stride, 5, keys.len(), 0), Err(0));
        assert_eq!(a.binary_search(0, stride, 5, keys.len(), 11), Err(4));
        assert_eq!(a.binary_search(0, stride, 5, keys.len(), 32), Err(5));
        assert_eq!(a.binary_search(0, stride, 5, 0, 3), Err(0));
    }
}
