use smallvec::SmallVec;

use super::{NtNode, NtSlot, NT_BITS};
use crate::hc::{check_hc_pos, inc, mask_above};
use crate::node::Slot;

const LOCAL_MASK: u64 = (super::NT_FANOUT - 1) as u64;

struct Frame<'a, V> {
    node: &'a NtNode<V>,
    /// Any full address below this node; only the bits above its digit count.
    prefix: u64,
    lower: u64,
    upper: u64,
    /// Next local address (AHC scan), next position (LHC scan) or, for the
    /// incrementer, the last address examined.
    pos: u64,
    hci: bool,
    /// Incrementer has not examined `pos` yet.
    fresh: bool,
    done: bool,
}

impl<'a, V> Frame<'a, V> {
    fn new(node: &'a NtNode<V>, prefix: u64, lower: u64, upper: u64, hci: bool) -> Self {
        let pb = node.post_bits();
        let lower = (lower >> pb) & LOCAL_MASK;
        let upper = (upper >> pb) & LOCAL_MASK;
        let pos = if hci || node.is_ahc() {
            lower
        } else {
            match node.search(lower) {
                Ok(pin) | Err(pin) => pin as u64,
            }
        };
        Self {
            node,
            prefix,
            lower,
            upper,
            pos,
            hci,
            fresh: true,
            done: false,
        }
    }

    /// Whether this frame's subtree can still hold addresses in `[lower, upper]`.
    fn intersects(&self, lower: u64, upper: u64) -> bool {
        let known = mask_above(self.node.post_bits() + NT_BITS);
        let p = self.prefix & known;
        ((p | lower) & upper & known) == p
    }

    /// Switch to a new envelope, keeping the position. Incrementer frames
    /// continue as scans.
    fn set_limits(&mut self, lower: u64, upper: u64) {
        let pb = self.node.post_bits();
        self.lower = (lower >> pb) & LOCAL_MASK;
        self.upper = (upper >> pb) & LOCAL_MASK;
        if !self.hci || self.done {
            return;
        }
        let resume = if self.fresh { self.pos } else { self.pos + 1 };
        if resume > LOCAL_MASK {
            self.done = true;
            return;
        }
        self.hci = false;
        self.pos = if self.node.is_ahc() {
            resume
        } else {
            match self.node.search(resume) {
                Ok(pin) | Err(pin) => pin as u64,
            }
        };
    }

    fn advance(&mut self) -> Option<usize> {
        let node = self.node;
        if self.done {
            return None;
        }
        if self.hci {
            loop {
                if self.fresh {
                    self.fresh = false;
                } else {
                    let next = inc(self.pos, self.lower, self.upper);
                    if next <= self.pos {
                        self.done = true;
                        return None;
                    }
                    self.pos = next;
                }
                if let Some(pin) = node.find(self.pos) {
                    return Some(pin);
                }
            }
        }
        if node.is_ahc() {
            while self.pos <= self.upper {
                let local = self.pos;
                self.pos += 1;
                if node.slot(local as usize).is_some() && check_hc_pos(local, self.lower, self.upper) {
                    return Some(local as usize);
                }
            }
        } else {
            while (self.pos as usize) < node.slot_len() {
                let pin = self.pos as usize;
                self.pos += 1;
                let local = node.address(pin);
                if check_hc_pos(local, self.lower, self.upper) {
                    return Some(pin);
                }
                if local > self.upper {
                    break;
                }
            }
        }
        self.done = true;
        None
    }
}

/// Depth-first walk over the entries of a node tree whose full address lies in
/// the envelope `[lower, upper]`. Yields `(address, key, slot)`.
pub(crate) struct NtCursor<'a, V> {
    lower: u64,
    upper: u64,
    hci: bool,
    stack: SmallVec<[Frame<'a, V>; 4]>,
}

impl<'a, V> NtCursor<'a, V> {
    pub(crate) fn new(root: &'a NtNode<V>, lower: u64, upper: u64, hci: bool) -> Self {
        let mut stack = SmallVec::new();
        stack.push(Frame::new(root, 0, lower, upper, hci));
        Self {
            lower,
            upper,
            hci,
            stack,
        }
    }

    /// Replace the envelope mid-walk. Pending subtrees outside it are
    /// dropped; the rest continue from their current position.
    pub(crate) fn set_limits(&mut self, lower: u64, upper: u64) {
        self.lower = lower;
        self.upper = upper;
        if let Some(dead) = self.stack.iter().skip(1).position(|f| !f.intersects(lower, upper)) {
            self.stack.truncate(dead + 1);
        }
        for frame in self.stack.iter_mut() {
            frame.set_limits(lower, upper);
        }
    }
}

impl<'a, V> Iterator for NtCursor<'a, V> {
    type Item = (u64, &'a [i64], &'a Slot<V>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frame) = self.stack.last_mut() {
            let Some(pin) = frame.advance() else {
                self.stack.pop();
                continue;
            };
            let node = frame.node;
            let hc = node.full_address(frame.prefix, pin);
            match node.slot(pin) {
                Some(NtSlot::Entry(slot)) => {
                    if check_hc_pos(hc, self.lower, self.upper) {
                        return Some((hc, node.key_at(pin), slot));
                    }
                }
                Some(NtSlot::Sub(sub)) => {
                    let frame = Frame::new(sub, hc, self.lower, self.upper, self.hci);
                    if frame.intersects(self.lower, self.upper) {
                        self.stack.push(frame);
                    }
                }
                None => {}
            }
        }
        None
    }
}
