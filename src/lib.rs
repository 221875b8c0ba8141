//! # phtree-rs
//!
//! A multi-dimensional index over `i64` keys using the PH-tree, a
//! prefix-sharing hypercube trie.
//!
//! Every node splits space at one bit position across all dimensions, so a
//! node addresses up to `2^dims` entries by a hypercube address. Runs of
//! bits shared by all keys below a node are stored once as an infix. Nodes
//! switch between an array layout, a sorted linear layout and a nested node
//! tree as they fill up.
//!
//! Based on "The PH-Tree: A Space-Efficient Storage Structure and
//! Multi-Dimensional Index" (SIGMOD 2014, Zäschke et al.)
//!
//! ## Example
//!
//! ```rust
//! use phtree_rs::{Euclidean, PhTree};
//!
//! let mut tree = PhTree::new(2).unwrap();
//! tree.put(&[0, 0], "origin").unwrap();
//! tree.put(&[3, 4], "far").unwrap();
//! tree.put(&[-1, 1], "near").unwrap();
//!
//! assert_eq!(tree.get(&[3, 4]).unwrap(), Some(&"far"));
//!
//! let window: Vec<_> = tree
//!     .query(&[-1, 0], &[0, 1])
//!     .unwrap()
//!     .map(|r| r.unwrap().0)
//!     .collect();
//! assert_eq!(window.len(), 2);
//!
//! let closest: Vec<_> = tree
//!     .nearest_neighbour(2, &Euclidean, &[2, 2])
//!     .unwrap()
//!     .map(|n| *n.value)
//!     .collect();
//! assert_eq!(closest, vec!["far", "origin"]);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod bits;
mod config;
mod distance;
mod error;
mod hc;
mod node;
mod nt;
mod persist;
mod query;
mod stats;
mod tree;

pub use config::Config;
pub use distance::{Distance, DistanceFilter, Euclidean, Manhattan};
pub use error::{PhError, Result};
pub use hc::MAX_DIMS;
pub use node::Node;
pub use persist::{InMemory, NodeRef, PersistenceProvider};
pub use query::{AcceptAll, Filter, KnnQuery, Neighbour, WindowQuery};
pub use stats::TreeStats;
pub use tree::PhTree;

#[cfg(test)]
mod proptests;
