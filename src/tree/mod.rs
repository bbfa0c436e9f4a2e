//! # Tree Layer
//!
//! Persistent B+-trees over the page store: slotted pages with
//! variable-length keys, inline or overflow values, copy-on-write
//! structural updates, and cursor-stack iteration.
//!
//! - `state`: the 48-byte persistent per-tree record
//! - `node`: page views and the node record encoding
//! - `tree`: search, insert, delete, rebalance, multi-value operations
//! - `iter`: ordered forward iteration and prefix scans

mod iter;
mod node;
mod state;
#[allow(clippy::module_inception)]
mod tree;

pub use iter::TreeIterator;
pub use node::{Payload, TreePage, TreePageMut};
pub use state::{TreeState, TREE_STATE_SIZE};
pub use tree::{Tree, ROOT_TREE_NAME};
