//! Hypercube nodes.
//!
//! A node at `post_len` owns bit `post_len` of every key below it. Each entry
//! sits at a hypercube address (one bit per dimension) and is either a leaf
//! value or a child node. Next to the slot the node stores `dims * post_len`
//! key bits: the postfix of a leaf, or for a child the infix between this
//! node and the child (low bits below the child's `post_len` are don't-care).
//!
//! Entries live in one of three layouts:
//! - AHC: a slot per address, `2^dims` of them.
//! - LHC: occupied addresses only, sorted, with the address packed next to
//!   the key bits.
//! - NT: a node tree (see [`crate::nt`]) once the node is very full.

mod iter;

pub(crate) use iter::NodeCursor;

use tracing::trace;

use crate::bits::{low_mask, BitArray};
use crate::config::Config;
use crate::hc::{
    apply_hc_pos, conflicting_bits, infix_mask, key_diff, pos_in_array, use_ahc, DEPTH,
};
use crate::nt::NtNode;
use crate::persist::NodeRef;

/// An occupied node entry.
pub(crate) enum Slot<V> {
    Leaf(V),
    /// `post_len` is the child's, kept here so infix checks need no load.
    Child { post_len: u8, node: NodeRef },
}

/// Key bits of one entry.
#[derive(Clone, Copy)]
pub(crate) enum EntryKey<'a> {
    /// `width` bits per dimension, dimension 0 first.
    Packed {
        bits: &'a BitArray,
        offset: usize,
        width: u32,
    },
    /// Full key, as kept by node trees.
    Full(&'a [i64]),
}

impl EntryKey<'_> {
    #[inline]
    fn coord(&self, d: usize) -> u64 {
        match *self {
            EntryKey::Packed {
                bits,
                offset,
                width,
            } => bits.read(offset + d * width as usize, width),
            EntryKey::Full(key) => key[d] as u64,
        }
    }

    /// OR of the per-coordinate XOR against `key`, restricted to `mask`.
    #[inline]
    pub(crate) fn diff(&self, key: &[i64], mask: u64) -> u64 {
        if mask == 0 {
            return 0;
        }
        let mut acc = 0u64;
        for (d, &k) in key.iter().enumerate() {
            acc |= (k as u64 ^ self.coord(d)) & mask;
        }
        acc
    }

    /// Overwrite the low `post_len` bits of every coordinate of `key`.
    #[inline]
    pub(crate) fn fill(&self, key: &mut [i64], post_len: u32) {
        if post_len == 0 {
            return;
        }
        let low = low_mask(post_len);
        for (d, k) in key.iter_mut().enumerate() {
            *k = ((*k as u64 & !low) | (self.coord(d) & low)) as i64;
        }
    }
}

#[derive(Clone, Copy)]
struct Geometry {
    dims: usize,
    post_len: u32,
}

impl Geometry {
    #[inline]
    fn key_bits(self) -> usize {
        self.dims * self.post_len as usize
    }

    #[inline]
    fn stride(self) -> usize {
        self.dims + self.key_bits()
    }
}

struct Table<V> {
    ahc: bool,
    bits: BitArray,
    slots: Vec<Option<Slot<V>>>,
}

impl<V> Table<V> {
    fn lhc() -> Self {
        Self {
            ahc: false,
            bits: BitArray::new(),
            slots: Vec::new(),
        }
    }

    fn ahc(g: Geometry) -> Self {
        let n = 1usize << g.dims;
        Self {
            ahc: true,
            bits: BitArray::zeroed(n * g.key_bits()),
            slots: (0..n).map(|_| None).collect(),
        }
    }

    fn search(&self, g: Geometry, hc: u64) -> Result<usize, usize> {
        self.bits
            .binary_search(0, g.stride(), g.dims as u32, self.slots.len(), hc)
    }

    fn find(&self, g: Geometry, hc: u64) -> Option<usize> {
        if self.ahc {
            let pin = hc as usize;
            self.slots.get(pin)?.as_ref().map(|_| pin)
        } else {
            self.search(g, hc).ok()
        }
    }

    #[inline]
    fn addr(&self, g: Geometry, pin: usize) -> u64 {
        if self.ahc {
            pin as u64
        } else {
            self.bits.read(pin * g.stride(), g.dims as u32)
        }
    }

    #[inline]
    fn key_offset(&self, g: Geometry, pin: usize) -> usize {
        if self.ahc {
            pin * g.key_bits()
        } else {
            pin * g.stride() + g.dims
        }
    }

    #[inline]
    fn entry_key(&self, g: Geometry, pin: usize) -> EntryKey<'_> {
        EntryKey::Packed {
            bits: &self.bits,
            offset: self.key_offset(g, pin),
            width: g.post_len,
        }
    }

    /// Occupy the slot for `hc`; returns its position.
    fn reserve(&mut self, g: Geometry, hc: u64, slot: Slot<V>) -> usize {
        let pin = if self.ahc {
            hc as usize
        } else {
            let pin = match self.search(g, hc) {
                Ok(pin) | Err(pin) => pin,
            };
            let stride = g.stride();
            self.bits.insert(pin * stride, stride);
            self.bits.write(pin * stride, g.dims as u32, hc);
            self.slots.insert(pin, None);
            pin
        };
        self.slots[pin] = Some(slot);
        pin
    }

    fn release(&mut self, g: Geometry, pin: usize) -> Option<Slot<V>> {
        if self.ahc {
            self.slots[pin].take()
        } else {
            let stride = g.stride();
            self.bits.remove(pin * stride, stride);
            self.slots.remove(pin)
        }
    }

    fn write_key(&mut self, g: Geometry, pin: usize, key: &[i64]) {
        let offset = self.key_offset(g, pin);
        for (d, &k) in key.iter().enumerate() {
            self.bits
                .write(offset + d * g.post_len as usize, g.post_len, k as u64);
        }
    }
}

enum Repr<V> {
    Flat(Table<V>),
    Nt(Box<NtNode<V>>),
}

/// Outcome of [`Node::insert`].
pub(crate) enum Insert<V> {
    Added,
    Replaced(V),
    Descend(NodeRef, V),
    /// The entry at `hc` conflicts with the key; a new node at
    /// `sub_post_len` must take both.
    Split {
        hc: u64,
        sub_post_len: u32,
        value: V,
    },
}

/// Outcome of [`Node::remove`].
pub(crate) enum Remove<V> {
    Missing,
    Descend(NodeRef),
    Removed(V),
}

/// Outcome of [`Node::relocate`].
pub(crate) enum Relocate<V> {
    Missing,
    Descend(NodeRef),
    /// The key was rewritten in place.
    Moved,
    /// The entry was removed; the new key must be inserted at a node whose
    /// `post_len + 1 >= diff_bits`.
    Removed { value: V, diff_bits: u32 },
}

/// One node of a PH-tree. Opaque outside the crate; persistence providers
/// only store and hand back nodes.
pub struct Node<V> {
    dims: u8,
    post_len: u8,
    entry_count: u32,
    repr: Repr<V>,
}

impl<V> Node<V> {
    pub(crate) fn new(dims: usize, post_len: u32) -> Self {
        debug_assert!(post_len < DEPTH);
        Self {
            dims: dims as u8,
            post_len: post_len as u8,
            entry_count: 0,
            repr: Repr::Flat(Table::lhc()),
        }
    }

    /// Bits below this node's hypercube bit.
    #[inline]
    pub fn post_len(&self) -> u32 {
        self.post_len as u32
    }

    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entry_count as usize
    }

    #[inline]
    pub(crate) fn dims(&self) -> usize {
        self.dims as usize
    }

    #[inline]
    pub(crate) fn is_ahc(&self) -> bool {
        matches!(&self.repr, Repr::Flat(t) if t.ahc)
    }

    #[inline]
    pub(crate) fn nt(&self) -> Option<&NtNode<V>> {
        match &self.repr {
            Repr::Nt(nt) => Some(nt),
            Repr::Flat(_) => None,
        }
    }

    #[inline]
    fn geometry(&self) -> Geometry {
        Geometry {
            dims: self.dims(),
            post_len: self.post_len(),
        }
    }

    /// Heap bytes owned by this node.
    pub fn heap_bytes(&self) -> usize {
        match &self.repr {
            Repr::Flat(t) => {
                t.bits.heap_bytes() + t.slots.capacity() * std::mem::size_of::<Option<Slot<V>>>()
            }
            Repr::Nt(nt) => std::mem::size_of::<NtNode<V>>() + nt.heap_bytes(),
        }
    }

    pub(crate) fn lookup(&self, hc: u64) -> Option<(EntryKey<'_>, &Slot<V>)> {
        let g = self.geometry();
        match &self.repr {
            Repr::Flat(t) => {
                let pin = t.find(g, hc)?;
                Some((t.entry_key(g, pin), t.slots[pin].as_ref()?))
            }
            Repr::Nt(nt) => nt.get(hc).map(|(k, s)| (EntryKey::Full(k), s)),
        }
    }

    fn lookup_mut(&mut self, hc: u64) -> Option<(EntryKey<'_>, &mut Slot<V>)> {
        let g = self.geometry();
        match &mut self.repr {
            Repr::Flat(t) => {
                let pin = t.find(g, hc)?;
                let offset = t.key_offset(g, pin);
                let Table { bits, slots, .. } = t;
                let key = EntryKey::Packed {
                    bits,
                    offset,
                    width: g.post_len,
                };
                Some((key, slots[pin].as_mut()?))
            }
            Repr::Nt(nt) => nt.get_mut(hc).map(|(k, s)| (EntryKey::Full(k), s)),
        }
    }

    fn prefers_ahc(&self, entries: usize, cfg: &Config) -> bool {
        cfg.ahc_enabled && use_ahc(entries, self.dims(), self.post_len(), cfg.ahc_lhc_bias)
    }

    /// Store a new entry at `hc`, switching layout first if the new count
    /// calls for it.
    fn add_entry(&mut self, hc: u64, key: &[i64], slot: Slot<V>, cfg: &Config) {
        let g = self.geometry();
        let flat = matches!(self.repr, Repr::Flat(_));
        if flat && self.entry_count() >= cfg.nt_threshold {
            self.flat_to_nt(key, cfg);
        } else if flat && !self.is_ahc() && self.prefers_ahc(self.entry_count() + 1, cfg) {
            self.relayout(true);
        }
        match &mut self.repr {
            Repr::Flat(t) => {
                let pin = t.reserve(g, hc, slot);
                t.write_key(g, pin, key);
            }
            Repr::Nt(nt) => nt.insert(hc, key, slot, cfg.nt_ahc_lhc_bias),
        }
        self.entry_count += 1;
    }

    /// Remove the entry at `hc` without any key check.
    fn remove_entry(&mut self, hc: u64, cfg: &Config) -> Option<Slot<V>> {
        let g = self.geometry();
        let slot = match &mut self.repr {
            Repr::Flat(t) => {
                let pin = t.find(g, hc)?;
                t.release(g, pin)
            }
            Repr::Nt(nt) => nt.remove(hc, cfg.nt_ahc_lhc_bias),
        }?;
        self.entry_count -= 1;
        let n = self.entry_count();
        if self.nt().is_some() && n <= cfg.nt_floor() {
            self.nt_to_flat(cfg);
        } else if self.is_ahc() && !self.prefers_ahc(n + 1, cfg) {
            self.relayout(false);
        }
        Some(slot)
    }

    /// Rewrite every entry into the AHC or LHC layout.
    fn relayout(&mut self, ahc: bool) {
        let g = self.geometry();
        let Repr::Flat(old) = &mut self.repr else {
            return;
        };
        trace!(
            post_len = g.post_len,
            entries = self.entry_count,
            to = if ahc { "AHC" } else { "LHC" },
            "node relayout"
        );
        let mut next = if ahc { Table::ahc(g) } else { Table::lhc() };
        let width = g.key_bits();
        for pin in 0..old.slots.len() {
            if let Some(slot) = old.slots[pin].take() {
                let hc = old.addr(g, pin);
                let to = next.reserve(g, hc, slot);
                let (src, dst) = (old.key_offset(g, pin), next.key_offset(g, to));
                next.bits.copy_from(&old.bits, src, dst, width);
            }
        }
        *old = next;
    }

    /// Move all entries into a node tree. `template` supplies the key bits
    /// above this node, which every entry shares.
    fn flat_to_nt(&mut self, template: &[i64], cfg: &Config) {
        let g = self.geometry();
        let table = match std::mem::replace(&mut self.repr, Repr::Flat(Table::lhc())) {
            Repr::Flat(t) => t,
            nt @ Repr::Nt(_) => {
                self.repr = nt;
                return;
            }
        };
        trace!(post_len = g.post_len, entries = self.entry_count, "node to node tree");
        let mut nt = Box::new(NtNode::root(g.dims));
        let mut key = template.to_vec();
        let Table { ahc, bits, slots } = table;
        let view = Table::<V> {
            ahc,
            bits,
            slots: Vec::new(),
        };
        for (pin, slot) in slots.into_iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            view.entry_key(g, pin).fill(&mut key, g.post_len);
            nt.insert(view.addr(g, pin), &key, slot, cfg.nt_ahc_lhc_bias);
        }
        self.repr = Repr::Nt(nt);
    }

    fn nt_to_flat(&mut self, cfg: &Config) {
        let g = self.geometry();
        let ahc = self.prefers_ahc(self.entry_count(), cfg);
        let mut table = if ahc { Table::ahc(g) } else { Table::lhc() };
        let nt = match std::mem::replace(&mut self.repr, Repr::Flat(Table::lhc())) {
            Repr::Nt(nt) => nt,
            flat @ Repr::Flat(_) => {
                self.repr = flat;
                return;
            }
        };
        trace!(post_len = g.post_len, entries = self.entry_count, "node tree to node");
        nt.drain_with(0, &mut |hc, key, slot| {
            let pin = table.reserve(g, hc, slot);
            table.write_key(g, pin, key);
        });
        self.repr = Repr::Flat(table);
    }

    /// Insert step for one node.
    pub(crate) fn insert(&mut self, key: &[i64], value: V, cfg: &Config) -> Insert<V> {
        let pl = self.post_len();
        let hc = pos_in_array(key, pl);
        let Some((stored, slot)) = self.lookup_mut(hc) else {
            self.add_entry(hc, key, Slot::Leaf(value), cfg);
            return Insert::Added;
        };
        match slot {
            Slot::Leaf(old) => match conflicting_bits(stored.diff(key, low_mask(pl))) {
                0 => Insert::Replaced(std::mem::replace(old, value)),
                bits => Insert::Split {
                    hc,
                    sub_post_len: bits - 1,
                    value,
                },
            },
            Slot::Child { post_len, node } => {
                match conflicting_bits(stored.diff(key, infix_mask(pl, *post_len as u32))) {
                    0 => Insert::Descend(*node, value),
                    bits => Insert::Split {
                        hc,
                        sub_post_len: bits - 1,
                        value,
                    },
                }
            }
        }
    }

    /// Point the entry at `hc` to `child` (a fresh node at `sub_post_len`).
    /// Returns the displaced entry's slot and key; bits above this node come
    /// from `key`.
    pub(crate) fn split_entry(
        &mut self,
        hc: u64,
        key: &[i64],
        sub_post_len: u32,
        child: NodeRef,
    ) -> Option<(Vec<i64>, Slot<V>)> {
        let pl = self.post_len();
        let (stored, slot) = self.lookup_mut(hc)?;
        let mut old_key = key.to_vec();
        stored.fill(&mut old_key, pl);
        let old = std::mem::replace(
            slot,
            Slot::Child {
                post_len: sub_post_len as u8,
                node: child,
            },
        );
        Some((old_key, old))
    }

    /// Fill an empty node with the two entries of a split.
    pub(crate) fn add_pair(
        &mut self,
        a: &[i64],
        a_slot: Slot<V>,
        b: &[i64],
        b_slot: Slot<V>,
        cfg: &Config,
    ) {
        let pl = self.post_len();
        debug_assert_ne!(pos_in_array(a, pl), pos_in_array(b, pl));
        self.add_entry(pos_in_array(a, pl), a, a_slot, cfg);
        self.add_entry(pos_in_array(b, pl), b, b_slot, cfg);
    }

    /// Remove step for one node.
    pub(crate) fn remove(&mut self, key: &[i64], cfg: &Config) -> Remove<V> {
        let pl = self.post_len();
        let hc = pos_in_array(key, pl);
        let Some((stored, slot)) = self.lookup(hc) else {
            return Remove::Missing;
        };
        match *slot {
            Slot::Child { post_len, node } => {
                if stored.diff(key, infix_mask(pl, post_len as u32)) == 0 {
                    Remove::Descend(node)
                } else {
                    Remove::Missing
                }
            }
            Slot::Leaf(_) => {
                if stored.diff(key, low_mask(pl)) != 0 {
                    return Remove::Missing;
                }
                match self.remove_entry(hc, cfg) {
                    Some(Slot::Leaf(v)) => Remove::Removed(v),
                    _ => Remove::Missing,
                }
            }
        }
    }

    /// Update step for one node: move the entry at `old` to `new`, in place
    /// when both keys agree on every bit above this node's postfix.
    pub(crate) fn relocate(&mut self, old: &[i64], new: &[i64], cfg: &Config) -> Relocate<V> {
        let pl = self.post_len();
        let hc = pos_in_array(old, pl);
        let Some((stored, slot)) = self.lookup(hc) else {
            return Relocate::Missing;
        };
        match *slot {
            Slot::Child { post_len, node } => {
                if stored.diff(old, infix_mask(pl, post_len as u32)) == 0 {
                    Relocate::Descend(node)
                } else {
                    Relocate::Missing
                }
            }
            Slot::Leaf(_) => {
                if stored.diff(old, low_mask(pl)) != 0 {
                    return Relocate::Missing;
                }
                let diff_bits = conflicting_bits(key_diff(old, new, u64::MAX));
                if diff_bits <= pl {
                    self.rewrite(hc, new, None);
                    return Relocate::Moved;
                }
                match self.remove_entry(hc, cfg) {
                    Some(Slot::Leaf(value)) => Relocate::Removed { value, diff_bits },
                    _ => Relocate::Missing,
                }
            }
        }
    }

    /// Overwrite the key bits (and optionally the slot) of the entry at `hc`.
    fn rewrite(&mut self, hc: u64, key: &[i64], slot: Option<Slot<V>>) -> bool {
        let g = self.geometry();
        match &mut self.repr {
            Repr::Flat(t) => {
                let Some(pin) = t.find(g, hc) else {
                    return false;
                };
                t.write_key(g, pin, key);
                if let Some(slot) = slot {
                    t.slots[pin] = Some(slot);
                }
                true
            }
            Repr::Nt(nt) => match nt.get_mut(hc) {
                Some((kd, s)) => {
                    kd.copy_from_slice(key);
                    if let Some(slot) = slot {
                        *s = slot;
                    }
                    true
                }
                None => false,
            },
        }
    }

    /// Replace the entry at `hc` with a merged survivor.
    pub(crate) fn replace_entry(&mut self, hc: u64, key: &[i64], slot: Slot<V>) -> bool {
        self.rewrite(hc, key, Some(slot))
    }

    /// Consume a node holding one entry, returning that entry. `key` must
    /// carry the bits above this node and receives the entry's full key.
    pub(crate) fn into_single(self, key: &mut [i64]) -> Option<Slot<V>> {
        let g = self.geometry();
        match self.repr {
            Repr::Flat(table) => {
                let pin = table.slots.iter().position(Option::is_some)?;
                apply_hc_pos(table.addr(g, pin), g.post_len, key);
                table.entry_key(g, pin).fill(key, g.post_len);
                table.slots.into_iter().nth(pin).flatten()
            }
            Repr::Nt(nt) => {
                let mut out = None;
                nt.drain_with(0, &mut |hc, kd, slot| {
                    if out.is_none() {
                        apply_hc_pos(hc, g.post_len, key);
                        EntryKey::Full(kd).fill(key, g.post_len);
                        out = Some(slot);
                    }
                });
                out
            }
        }
    }

    /// Child references held by this node.
    pub(crate) fn children(&self) -> impl Iterator<Item = NodeRef> + '_ {
        NodeCursor::full(self).filter_map(|e| match e.slot {
            Slot::Child { node, .. } => Some(*node),
            Slot::Leaf(_) => None,
        })
    }
}
