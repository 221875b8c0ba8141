use super::{EntryKey, Geometry, Node, Repr, Slot, Table};
use crate::bits::low_mask;
use crate::hc::{check_hc_pos, inc};
use crate::nt::NtCursor;

/// One entry produced by a [`NodeCursor`].
pub(crate) struct NodeEntry<'a, V> {
    pub(crate) hc: u64,
    pub(crate) key: EntryKey<'a>,
    pub(crate) slot: &'a Slot<V>,
}

enum Walk<'a, V> {
    /// Next address (AHC) or next position (LHC).
    Scan { pos: u64 },
    /// Hypercube incrementer: last address examined, or the first
    /// candidate while `fresh`.
    Hci { pos: u64, fresh: bool, done: bool },
    Nt(NtCursor<'a, V>),
}

/// Cursor over the entries of one node whose address lies in `[lower, upper]`
/// (bitwise, see [`check_hc_pos`]).
pub(crate) struct NodeCursor<'a, V> {
    node: &'a Node<V>,
    lower: u64,
    upper: u64,
    walk: Walk<'a, V>,
}

impl<'a, V> NodeCursor<'a, V> {
    pub(crate) fn full(node: &'a Node<V>) -> Self {
        Self::masked(node, 0, low_mask(node.dims() as u32), false)
    }

    pub(crate) fn masked(node: &'a Node<V>, lower: u64, upper: u64, allow_hci: bool) -> Self {
        let hci = allow_hci && prefer_hci(node, lower, upper);
        let walk = match &node.repr {
            Repr::Nt(nt) => Walk::Nt(NtCursor::new(nt, lower, upper, hci)),
            Repr::Flat(_) if hci => Walk::Hci {
                pos: lower,
                fresh: true,
                done: false,
            },
            Repr::Flat(t) if t.ahc => Walk::Scan { pos: lower },
            Repr::Flat(t) => Walk::Scan {
                pos: match t.search(node.geometry(), lower) {
                    Ok(pin) | Err(pin) => pin as u64,
                },
            },
        };
        Self {
            node,
            lower,
            upper,
            walk,
        }
    }

    /// Replace the envelope without moving the cursor: addresses already
    /// passed stay behind, everything ahead is checked against the new
    /// envelope.
    pub(crate) fn set_limits(&mut self, lower: u64, upper: u64) {
        self.lower = lower;
        self.upper = upper;
        let node = self.node;
        let Repr::Flat(table) = &node.repr else {
            if let Walk::Nt(cursor) = &mut self.walk {
                cursor.set_limits(lower, upper);
            }
            return;
        };
        // The incrementer only steps between addresses valid for one
        // envelope, so resume as a scan from where it stood.
        if let Walk::Hci { pos, fresh, done } = self.walk {
            let resume = if fresh { Some(pos) } else { pos.checked_add(1) };
            let Some(resume) = resume.filter(|&a| !done && a <= low_mask(node.dims() as u32)) else {
                return;
            };
            self.walk = Walk::Scan {
                pos: if table.ahc {
                    resume
                } else {
                    match table.search(node.geometry(), resume) {
                        Ok(pin) | Err(pin) => pin as u64,
                    }
                },
            };
        }
    }
}

/// Whether jumping between valid addresses beats scanning the node.
fn prefer_hci<V>(node: &Node<V>, lower: u64, upper: u64) -> bool {
    let dims = node.dims() as u32;
    let n = node.entry_count();
    if dims <= 6 || n <= 10 {
        return false;
    }
    let max_addr = low_mask(dims);
    let fixed = (lower | (!upper & max_addr)).count_ones();
    let n_possible = 2f64.powi((dims - fixed) as i32);
    let n = n as f64;
    let log_n = n.log2();
    match &node.repr {
        Repr::Flat(t) if t.ahc => n_possible < max_addr as f64,
        Repr::Flat(_) => n > n_possible * (log_n + 1.0),
        Repr::Nt(_) => dims < 50 && n > n_possible * log_n * 2.0,
    }
}

fn flat_entry<'a, V>(t: &'a Table<V>, g: Geometry, pin: usize, hc: u64) -> Option<NodeEntry<'a, V>> {
    Some(NodeEntry {
        hc,
        key: t.entry_key(g, pin),
        slot: t.slots[pin].as_ref()?,
    })
}

impl<'a, V> Iterator for NodeCursor<'a, V> {
    type Item = NodeEntry<'a, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node;
        let g = node.geometry();
        let (lower, upper) = (self.lower, self.upper);
        if let Walk::Nt(cursor) = &mut self.walk {
            return cursor.next().map(|(hc, key, slot)| NodeEntry {
                hc,
                key: EntryKey::Full(key),
                slot,
            });
        }
        let Repr::Flat(table) = &node.repr else {
            return None;
        };
        match &mut self.walk {
            Walk::Scan { pos } if table.ahc => {
                while *pos <= upper {
                    let hc = *pos;
                    *pos += 1;
                    if table.slots[hc as usize].is_some() && check_hc_pos(hc, lower, upper) {
                        return flat_entry(table, g, hc as usize, hc);
                    }
                }
                None
            }
            Walk::Scan { pos } => {
                while (*pos as usize) < table.slots.len() {
                    let pin = *pos as usize;
                    *pos += 1;
                    let hc = table.addr(g, pin);
                    if check_hc_pos(hc, lower, upper) {
                        return flat_entry(table, g, pin, hc);
                    }
                    if hc > upper {
                        *pos = table.slots.len() as u64;
                    }
                }
                None
            }
            Walk::Hci { pos, fresh, done } => {
                while !*done {
                    if *fresh {
                        *fresh = false;
                    } else {
                        let next = inc(*pos, lower, upper);
                        if next <= *pos {
                            *done = true;
                            break;
                        }
                        *pos = next;
                    }
                    if let Some(pin) = table.find(g, *pos) {
                        return flat_entry(table, g, pin, *pos);
                    }
                }
                None
            }
            Walk::Nt(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hc::{apply_hc_pos, pos_in_array};
    use rand::{Rng, SeedableRng};

    fn node_with(dims: usize, n: usize, cfg: &Config, seed: u64) -> (Node<u64>, Vec<u64>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut node = Node::new(dims, 30);
        let mut addrs = Vec::new();
        while addrs.len() < n {
            let hc = rng.gen::<u64>() & low_mask(dims as u32);
            if node.lookup(hc).is_some() {
                continue;
            }
            let mut key = vec![rng.gen_range(0..1 << 20); dims];
            apply_hc_pos(hc, 30, &mut key);
            assert_eq!(pos_in_array(&key, 30), hc);
            node.insert(&key, hc, cfg);
            addrs.push(hc);
        }
        addrs.sort_unstable();
        (node, addrs)
    }

    fn check_all_strategies(node: &Node<u64>, addrs: &[u64]) {
        let full: Vec<u64> = NodeCursor::full(node).map(|e| e.hc).collect();
        assert_eq!(full, addrs);
        let dims = node.dims() as u32;
        let lower = 0b101 << (dims - 3);
        for upper in [low_mask(dims) & !0b1001, lower | 0b111] {
            let expected: Vec<u64> = addrs
                .iter()
                .copied()
                .filter(|&a| check_hc_pos(a, lower, upper))
                .collect();
            for allow_hci in [false, true] {
                let mut seen: Vec<u64> = NodeCursor::masked(node, lower, upper, allow_hci)
                    .map(|e| {
                        assert!(matches!(e.slot, Slot::Leaf(v) if *v == e.hc));
                        e.hc
                    })
                    .collect();
                seen.sort_unstable();
                assert_eq!(seen, expected, "upper={upper:b} allow_hci={allow_hci}");
            }
        }
    }

    /// Switch envelopes after a few entries; the rest must be exactly the
    /// later addresses valid for the new envelope.
    fn check_set_limits(node: &Node<u64>, addrs: &[u64]) {
        let dims = node.dims() as u32;
        let all = low_mask(dims);
        let wide = (0, all);
        let narrow = (0, all & !0b1001);
        let skewed = (0b101 << (dims - 3), all);
        for (from, to) in [(narrow, wide), (wide, skewed), (skewed, narrow)] {
            for allow_hci in [false, true] {
                let mut cursor = NodeCursor::masked(node, from.0, from.1, allow_hci);
                let head: Vec<u64> = cursor.by_ref().take(3).map(|e| e.hc).collect();
                assert_eq!(head.len(), 3);
                cursor.set_limits(to.0, to.1);
                let rest: Vec<u64> = cursor.map(|e| e.hc).collect();
                let expected: Vec<u64> = addrs
                    .iter()
                    .copied()
                    .filter(|&a| a > head[2] && check_hc_pos(a, to.0, to.1))
                    .collect();
                assert_eq!(rest, expected, "from={from:?} to={to:?} allow_hci={allow_hci}");
            }
        }
    }

    #[test]
    fn test_lhc_cursor() {
        let cfg = Config {
            ahc_enabled: false,
            ..Config::default()
        };
        let (node, addrs) = node_with(10, 90, &cfg, 3);
        assert!(!node.is_ahc());
        check_all_strategies(&node, &addrs);
        check_set_limits(&node, &addrs);
    }

    #[test]
    fn test_ahc_cursor() {
        let (node, addrs) = node_with(8, 140, &Config::default(), 4);
        assert!(node.is_ahc());
        check_all_strategies(&node, &addrs);
        check_set_limits(&node, &addrs);
    }

    #[test]
    fn test_nt_cursor() {
        let (node, addrs) = node_with(20, 400, &Config::default(), 5);
        assert!(node.nt().is_some());
        check_all_strategies(&node, &addrs);
        check_set_limits(&node, &addrs);
    }
}
