use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

const DIMS: usize = 3;

type Key = Vec<i64>;

fn validate_tree<V>(t: &PhTree<V>) {
    let stats = t.stats().expect("in-memory stats");
    assert_eq!(stats.violations, 0, "structural violations: {stats:?}");
    assert_eq!(stats.entries, t.len(), "reachable leaves must match PhTree::len");
    assert_eq!(
        stats.nodes,
        t.provider().node_count(),
        "every registered node must be reachable"
    );
}

/// Node layouts to force through the configuration.
#[derive(Clone, Copy, Debug, Arbitrary)]
enum Layout {
    Default,
    LhcOnly,
    NodeTrees,
    NoIncrementer,
}

impl Layout {
    fn config(self) -> Config {
        match self {
            Layout::Default => Config::default(),
            Layout::LhcOnly => Config {
                ahc_enabled: false,
                ..Config::default()
            },
            Layout::NodeTrees => Config {
                nt_threshold: 5,
                nt_hysteresis: 2,
                ..Config::default()
            },
            Layout::NoIncrementer => Config {
                hc_incrementer: false,
                ..Config::default()
            },
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    Put(Key, u32),
    Remove(Key),
    Get(Key),
    Update(Key, Key),
    Query(Key, Key),
    Knn(Key, usize),
}

fn coord_strategy() -> impl Strategy<Value = i64> + Clone {
    // Mostly a tiny domain so keys collide and nodes fill up; the rest
    // exercises the sign bit and long infixes.
    prop_oneof![
        8 => -8i64..8,
        1 => Just(i64::MIN),
        1 => Just(i64::MAX),
        1 => any::<i64>(),
    ]
}

fn key_strategy() -> impl Strategy<Value = Key> + Clone {
    prop::collection::vec(coord_strategy(), DIMS)
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let key = key_strategy();
    let op = prop_oneof![
        40 => (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
        20 => key.clone().prop_map(Op::Remove),
        15 => key.clone().prop_map(Op::Get),
        15 => (key.clone(), key.clone()).prop_map(|(a, b)| Op::Update(a, b)),
        5 => (key.clone(), key.clone()).prop_map(|(a, b)| Op::Query(a, b)),
        5 => (key.clone(), 1usize..6).prop_map(|(c, n)| Op::Knn(c, n)),
    ];
    prop::collection::vec(op, 0..=500)
}

fn in_window(k: &[i64], min: &[i64], max: &[i64]) -> bool {
    k.iter()
        .zip(min)
        .zip(max)
        .all(|((&c, &lo), &hi)| lo <= c && c <= hi)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(layout in any::<Layout>(), ops in ops_strategy()) {
        let mut t: PhTree<u32> = PhTree::with_config(DIMS, layout.config()).unwrap();
        let mut m: BTreeMap<Key, u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(key, value) => {
                    let old_t = t.put(&key, value).unwrap();
                    let old_m = m.insert(key, value);
                    prop_assert_eq!(old_t, old_m);
                }
                Op::Remove(key) => {
                    let old_t = t.remove(&key).unwrap();
                    let old_m = m.remove(&key);
                    prop_assert_eq!(old_t, old_m);
                }
                Op::Get(key) => {
                    let got_t = t.get(&key).unwrap().copied();
                    let got_m = m.get(&key).copied();
                    prop_assert_eq!(got_t, got_m);
                }
                Op::Update(old, new) => {
                    let got_t = t.update(&old, &new).unwrap().copied();
                    let got_m = m.remove(&old).map(|v| {
                        m.insert(new.clone(), v);
                        v
                    });
                    prop_assert_eq!(got_t, got_m);
                }
                Op::Query(a, b) => {
                    let min: Key = a.iter().zip(&b).map(|(&x, &y)| x.min(y)).collect();
                    let max: Key = a.iter().zip(&b).map(|(&x, &y)| x.max(y)).collect();
                    let mut got: Vec<(Key, u32)> = t
                        .query(&min, &max)
                        .unwrap()
                        .map(|r| r.map(|(k, v)| (k, *v)))
                        .collect::<Result<_>>()
                        .unwrap();
                    got.sort();
                    let expected: Vec<(Key, u32)> = m
                        .iter()
                        .filter(|(k, _)| in_window(k, &min, &max))
                        .map(|(k, v)| (k.clone(), *v))
                        .collect();
                    prop_assert_eq!(got, expected);
                }
                Op::Knn(center, n) => {
                    let got: Vec<f64> = t
                        .nearest_neighbour(n, &Euclidean, &center)
                        .unwrap()
                        .map(|nb| nb.dist)
                        .collect();
                    let mut expected: Vec<f64> = m.keys().map(|k| Euclidean.dist(&center, k)).collect();
                    expected.sort_by(f64::total_cmp);
                    expected.truncate(n);
                    prop_assert_eq!(got, expected);
                }
            }

            prop_assert_eq!(t.len(), m.len());
        }

        validate_tree(&t);
        let mut got: Vec<(Key, u32)> = t
            .query_extent()
            .unwrap()
            .map(|r| r.map(|(k, v)| (k, *v)))
            .collect::<Result<_>>()
            .unwrap();
        got.sort();
        let expected: Vec<(Key, u32)> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(got, expected);
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

/// Keys that split at the sign bit, in the middle and at the lowest bit.
fn small_set() -> Vec<[i64; 2]> {
    vec![[0, 0], [0, 1], [1, 0], [-1, 0], [1 << 40, 3], [(1 << 40) + 1, 3]]
}

#[test]
fn exhaustive_insert_order_small_set() {
    let keys = small_set();
    for_each_permutation(&keys, |perm| {
        let mut t: PhTree<u64> = PhTree::new(2).unwrap();
        let mut m: BTreeMap<Key, u64> = BTreeMap::new();

        for (i, k) in perm.into_iter().enumerate() {
            let v = i as u64;
            assert_eq!(t.put(&k, v).unwrap(), m.insert(k.to_vec(), v));
        }

        validate_tree(&t);
        for (k, v) in &m {
            assert_eq!(t.get(k).unwrap(), Some(v));
        }
    });
}

#[test]
fn exhaustive_remove_order_small_set() {
    let keys = small_set();
    for_each_permutation(&keys, |perm| {
        let mut t: PhTree<u64> = PhTree::new(2).unwrap();
        for (i, k) in keys.iter().enumerate() {
            t.put(k, i as u64).unwrap();
        }

        let mut left = keys.len();
        for k in perm {
            assert!(t.remove(&k).unwrap().is_some());
            left -= 1;
            assert_eq!(t.len(), left);
            validate_tree(&t);
        }
        assert_eq!(t.provider().node_count(), 1);
    });
}
