//! Node tree: a fixed fan-out radix tree over hypercube addresses.
//!
//! Once a node holds more entries than is practical to keep in one flat
//! hypercube (high dimensionality, many entries), its entries move into an
//! `NtNode` tree. The tree is keyed by the outer node's hypercube address,
//! consumed `NT_BITS` at a time from the top. Every entry keeps the full
//! `dims`-wide key it was inserted with, so the outer node's postfix and
//! infix checks work unchanged.
//!
//! An `NtNode` at level `post_len` stores the address bits below its own
//! digit (`post_len * NT_BITS` of them) per entry: the address postfix of a
//! leaf entry, or the infix of a sub-node.

mod iter;

pub(crate) use iter::NtCursor;

use crate::bits::BitArray;
use crate::hc::{conflicting_bits, low_mask, mask_above, nt_use_ahc};
use crate::node::Slot;

/// Address bits consumed per node tree level.
pub(crate) const NT_BITS: u32 = 6;
pub(crate) const NT_FANOUT: usize = 1 << NT_BITS;
const LOCAL_MASK: u64 = (NT_FANOUT - 1) as u64;

/// Levels needed to cover a `dims`-bit address.
#[inline]
pub(crate) fn nt_height(dims: usize) -> u32 {
    (dims as u32 - 1) / NT_BITS + 1
}

pub(crate) enum NtSlot<V> {
    Sub(Box<NtNode<V>>),
    /// An entry of the outer node: a leaf value or a reference to an outer child.
    Entry(Slot<V>),
}

pub(crate) struct NtNode<V> {
    dims: u8,
    post_len: u8,
    entry_count: u8,
    ahc: bool,
    /// AHC: `post_bits` per address. LHC: sorted `(address, post bits)` runs.
    bits: BitArray,
    /// One full key per slot, `dims` coordinates each. Unused for sub-nodes.
    keys: Vec<i64>,
    slots: Vec<Option<NtSlot<V>>>,
}

impl<V> NtNode<V> {
    pub(crate) fn new(dims: usize, post_len: u32) -> Self {
        Self {
            dims: dims as u8,
            post_len: post_len as u8,
            entry_count: 0,
            ahc: false,
            bits: BitArray::new(),
            keys: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Empty root for a node with `dims` dimensions.
    pub(crate) fn root(dims: usize) -> Self {
        Self::new(dims, nt_height(dims) - 1)
    }

    fn empty_like(&self, ahc: bool) -> Self {
        let mut n = Self::new(self.dims as usize, self.post_len as u32);
        n.ahc = ahc;
        if ahc {
            n.bits = BitArray::zeroed(NT_FANOUT * n.post_bits() as usize);
            n.keys = vec![0; NT_FANOUT * n.dims as usize];
            n.slots = (0..NT_FANOUT).map(|_| None).collect();
        }
        n
    }

    #[inline]
    pub(crate) fn post_len(&self) -> u32 {
        self.post_len as u32
    }

    #[inline]
    pub(crate) fn post_bits(&self) -> u32 {
        self.post_len as u32 * NT_BITS
    }

    #[inline]
    pub(crate) fn entry_count(&self) -> usize {
        self.entry_count as usize
    }

    #[inline]
    pub(crate) fn is_ahc(&self) -> bool {
        self.ahc
    }

    #[inline]
    fn local(&self, hc: u64) -> u64 {
        (hc >> self.post_bits()) & LOCAL_MASK
    }

    #[inline]
    fn stride(&self) -> usize {
        (NT_BITS + self.post_bits()) as usize
    }

    #[inline]
    pub(crate) fn slot_len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn find(&self, local: u64) -> Option<usize> {
        if self.ahc {
            let pin = local as usize;
            self.slots[pin].is_some().then_some(pin)
        } else {
            self.search(local).ok()
        }
    }

    /// LHC position of `local`, or where it would be inserted.
    pub(crate) fn search(&self, local: u64) -> Result<usize, usize> {
        self.bits
            .binary_search(0, self.stride(), NT_BITS, self.slots.len(), local)
    }

    #[inline]
    pub(crate) fn address(&self, pin: usize) -> u64 {
        if self.ahc {
            pin as u64
        } else {
            self.bits.read(pin * self.stride(), NT_BITS)
        }
    }

    #[inline]
    fn stored_offset(&self, pin: usize) -> usize {
        if self.ahc {
            pin * self.post_bits() as usize
        } else {
            pin * self.stride() + NT_BITS as usize
        }
    }

    #[inline]
    pub(crate) fn stored(&self, pin: usize) -> u64 {
        self.bits.read(self.stored_offset(pin), self.post_bits())
    }

    fn write_stored(&mut self, pin: usize, value: u64) {
        let off = self.stored_offset(pin);
        self.bits.write(off, self.post_bits(), value);
    }

    #[inline]
    pub(crate) fn key_at(&self, pin: usize) -> &[i64] {
        let d = self.dims as usize;
        &self.keys[pin * d..(pin + 1) * d]
    }

    fn write_key(&mut self, pin: usize, key: &[i64]) {
        let d = self.dims as usize;
        self.keys[pin * d..(pin + 1) * d].copy_from_slice(key);
    }

    #[inline]
    pub(crate) fn slot(&self, pin: usize) -> Option<&NtSlot<V>> {
        self.slots[pin].as_ref()
    }

    /// Full address of the slot at `pin`, given any address sharing this node's prefix.
    #[inline]
    pub(crate) fn full_address(&self, prefix: u64, pin: usize) -> u64 {
        let pb = self.post_bits();
        (prefix & mask_above(pb + NT_BITS)) | (self.address(pin) << pb) | self.stored(pin)
    }

    /// Infix bits of a sub-node with `sub_post_len`, inside this node's post bits.
    #[inline]
    fn sub_infix_mask(&self, sub_post_len: u32) -> u64 {
        mask_above((sub_post_len + 1) * NT_BITS) & low_mask(self.post_bits())
    }

    fn place(&mut self, local: u64, stored: u64, key: &[i64], slot: NtSlot<V>) {
        let pin = if self.ahc {
            local as usize
        } else {
            let pin = match self.search(local) {
                Ok(pin) | Err(pin) => pin,
            };
            let stride = self.stride();
            self.bits.insert(pin * stride, stride);
            self.bits.write(pin * stride, NT_BITS, local);
            let d = self.dims as usize;
            self.keys.splice(pin * d..pin * d, key.iter().copied());
            self.slots.insert(pin, None);
            pin
        };
        self.write_stored(pin, stored);
        self.write_key(pin, key);
        self.slots[pin] = Some(slot);
    }

    fn take(&mut self, pin: usize) -> Option<NtSlot<V>> {
        if self.ahc {
            self.slots[pin].take()
        } else {
            let stride = self.stride();
            self.bits.remove(pin * stride, stride);
            let d = self.dims as usize;
            self.keys.drain(pin * d..(pin + 1) * d);
            self.slots.remove(pin)
        }
    }

    fn add(&mut self, local: u64, stored: u64, key: &[i64], slot: NtSlot<V>, bias: f64) {
        let next = self.entry_count() + 1;
        if !self.ahc && nt_use_ahc(next, self.dims as usize, self.post_bits(), bias) {
            self.relayout(true);
        }
        self.place(local, stored, key, slot);
        self.entry_count += 1;
    }

    fn remove_at(&mut self, pin: usize, bias: f64) -> Option<NtSlot<V>> {
        let slot = self.take(pin);
        self.entry_count -= 1;
        let n = self.entry_count() + 1;
        if self.ahc && !nt_use_ahc(n, self.dims as usize, self.post_bits(), bias) {
            self.relayout(false);
        }
        slot
    }

    fn relayout(&mut self, ahc: bool) {
        let mut next = self.empty_like(ahc);
        for pin in 0..self.slots.len() {
            if let Some(slot) = self.slots[pin].take() {
                next.place(self.address(pin), self.stored(pin), self.key_at(pin), slot);
            }
        }
        next.entry_count = self.entry_count;
        *self = next;
    }

    pub(crate) fn get(&self, hc: u64) -> Option<(&[i64], &Slot<V>)> {
        let mut node = self;
        loop {
            let pin = node.find(node.local(hc))?;
            let diff = node.stored(pin) ^ hc;
            match node.slots[pin].as_ref()? {
                NtSlot::Entry(slot) => {
                    return (diff & low_mask(node.post_bits()) == 0).then(|| (node.key_at(pin), slot));
                }
                NtSlot::Sub(sub) => {
                    if diff & node.sub_infix_mask(sub.post_len()) != 0 {
                        return None;
                    }
                    node = sub;
                }
            }
        }
    }

    pub(crate) fn get_mut(&mut self, hc: u64) -> Option<(&mut [i64], &mut Slot<V>)> {
        let pin = self.find(self.local(hc))?;
        let diff = self.stored(pin) ^ hc;
        let post_mask = low_mask(self.post_bits());
        let infix_mask = match self.slots[pin].as_ref()? {
            NtSlot::Sub(sub) => self.sub_infix_mask(sub.post_len()),
            NtSlot::Entry(_) => post_mask,
        };
        if diff & infix_mask != 0 {
            return None;
        }
        let d = self.dims as usize;
        let Self { keys, slots, .. } = self;
        match slots[pin].as_mut()? {
            NtSlot::Sub(sub) => sub.get_mut(hc),
            NtSlot::Entry(slot) => Some((&mut keys[pin * d..(pin + 1) * d], slot)),
        }
    }

    /// Add an entry at `hc`. The address must not be present yet.
    pub(crate) fn insert(&mut self, hc: u64, key: &[i64], slot: Slot<V>, bias: f64) {
        let pb = self.post_bits();
        let local = self.local(hc);
        let Some(pin) = self.find(local) else {
            self.add(local, hc & low_mask(pb), key, NtSlot::Entry(slot), bias);
            return;
        };
        let stored = self.stored(pin);
        let infix_mask = match self.slots[pin].as_ref() {
            Some(NtSlot::Sub(sub)) => Some(self.sub_infix_mask(sub.post_len())),
            _ => None,
        };
        let diff = match (infix_mask, self.slots[pin].as_mut()) {
            (Some(mask), Some(NtSlot::Sub(sub))) => {
                let diff = (stored ^ hc) & mask;
                if diff == 0 {
                    sub.insert(hc, key, slot, bias);
                    return;
                }
                diff
            }
            _ => (stored ^ hc) & low_mask(pb),
        };
        debug_assert_ne!(diff, 0, "node tree insert on an occupied address");
        self.split(pin, diff, hc, key, slot, bias);
    }

    /// Push the slot at `pin` and the new entry down into a fresh sub-node at
    /// the level of their highest differing bit.
    fn split(&mut self, pin: usize, diff: u64, hc: u64, key: &[i64], slot: Slot<V>, bias: f64) {
        let sub_post_len = (conflicting_bits(diff) - 1) / NT_BITS;
        let mut sub = NtNode::new(self.dims as usize, sub_post_len);
        let sub_bits = sub.post_bits();
        let old_stored = self.stored(pin);
        if let Some(old) = self.slots[pin].take() {
            sub.add(sub.local(old_stored), old_stored & low_mask(sub_bits), self.key_at(pin), old, bias);
        }
        sub.add(sub.local(hc), hc & low_mask(sub_bits), key, NtSlot::Entry(slot), bias);
        self.slots[pin] = Some(NtSlot::Sub(Box::new(sub)));
    }

    /// Remove the entry at `hc`, folding a sub-node that drops to one entry
    /// back into this node.
    pub(crate) fn remove(&mut self, hc: u64, bias: f64) -> Option<Slot<V>> {
        let pin = self.find(self.local(hc))?;
        let diff = self.stored(pin) ^ hc;
        let sub_post_len = match self.slots[pin].as_ref()? {
            NtSlot::Sub(sub) => Some(sub.post_len()),
            NtSlot::Entry(_) => None,
        };
        let Some(sub_post_len) = sub_post_len else {
            if diff & low_mask(self.post_bits()) != 0 {
                return None;
            }
            return match self.remove_at(pin, bias) {
                Some(NtSlot::Entry(slot)) => Some(slot),
                _ => None,
            };
        };
        if diff & self.sub_infix_mask(sub_post_len) != 0 {
            return None;
        }
        let Some(NtSlot::Sub(sub)) = self.slots[pin].as_mut() else {
            return None;
        };
        let removed = sub.remove(hc, bias)?;
        if sub.entry_count() == 1 {
            self.merge_sub(pin, hc);
        }
        Some(removed)
    }

    fn merge_sub(&mut self, pin: usize, hc: u64) {
        let Some(NtSlot::Sub(mut sub)) = self.slots[pin].take() else {
            return;
        };
        let Some(pin2) = (0..sub.slots.len()).find(|&p| sub.slots[p].is_some()) else {
            return;
        };
        let sub_bits = sub.post_bits();
        let merged = (hc & mask_above(sub_bits + NT_BITS) & low_mask(self.post_bits()))
            | (sub.address(pin2) << sub_bits)
            | sub.stored(pin2);
        self.write_stored(pin, merged);
        self.write_key(pin, sub.key_at(pin2));
        self.slots[pin] = sub.slots[pin2].take();
    }

    /// Consume the tree, handing every entry with its full address to `f`.
    pub(crate) fn drain_with<F>(mut self, prefix: u64, f: &mut F)
    where
        F: FnMut(u64, &[i64], Slot<V>),
    {
        for pin in 0..self.slots.len() {
            let Some(slot) = self.slots[pin].take() else {
                continue;
            };
            let hc = self.full_address(prefix, pin);
            match slot {
                NtSlot::Entry(slot) => f(hc, self.key_at(pin), slot),
                NtSlot::Sub(sub) => sub.drain_with(hc, f),
            }
        }
    }

    /// Outer-node entries held directly at this level.
    pub(crate) fn entries_here(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| matches!(s, NtSlot::Entry(_)))
            .count()
    }

    /// Visit every reachable slot, sub-nodes before their contents.
    pub(crate) fn for_each_node<F: FnMut(&NtNode<V>)>(&self, f: &mut F) {
        f(self);
        for slot in self.slots.iter().flatten() {
            if let NtSlot::Sub(sub) = slot {
                sub.for_each_node(f);
            }
        }
    }

    pub(crate) fn heap_bytes(&self) -> usize {
        let mut total = self.bits.heap_bytes()
            + self.keys.capacity() * 8
            + self.slots.capacity() * std::mem::size_of::<Option<NtSlot<V>>>();
        for slot in self.slots.iter().flatten() {
            if let NtSlot::Sub(sub) = slot {
                total += std::mem::size_of::<NtNode<V>>() + sub.heap_bytes();
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    const DIMS: usize = 20;
    const BIAS: f64 = 1.5;

    fn leaf(v: u32) -> Slot<u32> {
        Slot::Leaf(v)
    }

    fn leaf_value(s: &Slot<u32>) -> u32 {
        match s {
            Slot::Leaf(v) => *v,
            Slot::Child { .. } => panic!("expected leaf"),
        }
    }

    fn check_tree(nt: &NtNode<u32>, model: &BTreeMap<u64, u32>) {
        for (&hc, &v) in model {
            let (key, slot) = nt.get(hc).expect("present");
            assert_eq!(leaf_value(slot), v);
            assert_eq!(key[0], hc as i64);
        }
        let mut total = 0;
        nt.for_each_node(&mut |n| {
            total += n.entries_here();
            assert!(n.post_len() <= nt.post_len());
        });
        assert_eq!(total, model.len());
    }

    #[test]
    fn test_height() {
        assert_eq!(nt_height(1), 1);
        assert_eq!(nt_height(6), 1);
        assert_eq!(nt_height(7), 2);
        assert_eq!(nt_height(64), 11);
    }

    #[test]
    fn test_insert_get_remove_random() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut nt = NtNode::root(DIMS);
        let mut model = BTreeMap::new();

        for i in 0..2000u32 {
            let hc = rng.gen::<u64>() & low_mask(DIMS as u32);
            if model.contains_key(&hc) {
                continue;
            }
            let mut key = [0i64; DIMS];
            key[0] = hc as i64;
            nt.insert(hc, &key, leaf(i), BIAS);
            model.insert(hc, i);
        }
        check_tree(&nt, &model);

        let keys: Vec<u64> = model.keys().copied().collect();
        for (i, hc) in keys.iter().enumerate() {
            if i % 3 == 0 {
                let removed = nt.remove(*hc, BIAS).expect("present");
                assert_eq!(leaf_value(&removed), model.remove(hc).expect("model"));
                assert!(nt.get(*hc).is_none());
            }
        }
        check_tree(&nt, &model);
        assert!(nt.remove(u64::MAX, BIAS).is_none());
    }

    #[test]
    fn test_split_and_merge_restore_flat_node() {
        let mut nt = NtNode::root(12);
        let key = [0i64; 12];
        // Same top digit, differ only in the low digit.
        nt.insert(0b000001_000001, &key, leaf(1), BIAS);
        nt.insert(0b000001_000010, &key, leaf(2), BIAS);
        assert_eq!(nt.entry_count(), 1);
        assert!(matches!(nt.slot(0), Some(NtSlot::Sub(_))));

        assert!(nt.remove(0b000001_000001, BIAS).is_some());
        assert_eq!(nt.entry_count(), 1);
        let (_, slot) = nt.get(0b000001_000010).expect("merged entry");
        assert_eq!(leaf_value(slot), 2);
        assert!(matches!(nt.slot(0), Some(NtSlot::Entry(_))));
    }

    #[test]
    fn test_drain_yields_full_addresses() {
        let mut nt = NtNode::root(18);
        let key = [0i64; 18];
        let addrs = [3u64, 64 + 3, 4096 * 5 + 7, 4096 * 5 + 8, 200_000];
        for (i, &a) in addrs.iter().enumerate() {
            nt.insert(a, &key, leaf(i as u32), BIAS);
        }
        let mut out = Vec::new();
        nt.drain_with(0, &mut |hc, _, slot| out.push((hc, leaf_value(&slot))));
        out.sort_unstable();
        let expected: Vec<(u64, u32)> = addrs.iter().enumerate().map(|(i, &a)| (a, i as u32)).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_get_mut_rewrites_entry() {
        let mut nt = NtNode::root(8);
        nt.insert(5, &[1; 8], leaf(1), BIAS);
        nt.insert(200, &[2; 8], leaf(2), BIAS);
        if let Some((key, slot)) = nt.get_mut(200) {
            key[0] = 99;
            *slot = leaf(3);
        }
        let (key, slot) = nt.get(200).expect("present");
        assert_eq!(key[0], 99);
        assert_eq!(leaf_value(slot), 3);
        assert!(nt.get_mut(201).is_none());
    }
}
