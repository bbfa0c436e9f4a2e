//! # Tree Iteration
//!
//! Forward, key-ordered iteration driven by a cursor stack of
//! `(page, index)` pairs from the root down to the current leaf. Leaves are
//! deliberately not linked to their siblings — COW would have to copy a
//! neighbor on every leaf change just to fix its link — so the cursor walks
//! back up through branch pages instead.
//!
//! The iterator borrows its transaction; within a snapshot the pages it
//! visits are frozen, so positions stay valid for the iterator's lifetime.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::tree::node::{Payload, TreePage};
use crate::tree::state::TreeState;
use crate::tree::tree::read_overflow;
use crate::txn::PageRead;

pub struct TreeIterator<'t, T: PageRead> {
    tx: &'t T,
    state: TreeState,
    stack: SmallVec<[(u64, usize); 8]>,
}

impl<'t, T: PageRead> TreeIterator<'t, T> {
    pub(crate) fn new(tx: &'t T, state: TreeState) -> Self {
        Self {
            tx,
            state,
            stack: SmallVec::new(),
        }
    }

    /// Positions before the smallest key.
    pub fn seek_first(&mut self) -> Result<()> {
        self.seek(&[])
    }

    /// Positions at the first key not below `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.stack.clear();
        if self.state.is_empty() {
            return Ok(());
        }

        let tx = self.tx;
        let mut current = self.state.root_page();
        loop {
            let page = TreePage::new(tx.page(current)?)?;
            if page.is_leaf() {
                let index = match page.search(key)? {
                    Ok(at) | Err(at) => at,
                };
                self.stack.push((current, index));
                return Ok(());
            }

            let index = match page.search(key)? {
                Ok(at) => at,
                Err(at) => at.saturating_sub(1),
            };
            self.stack.push((current, index));
            current = page.child_at(index)?;
        }
    }

    /// Next entry in key order, with overflow values resolved.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tx = self.tx;

        loop {
            let Some(&(page_no, index)) = self.stack.last() else {
                return Ok(None);
            };

            let page = TreePage::new(tx.page(page_no)?)?;

            if page.is_leaf() {
                if index < page.count() {
                    let key = page.key_at(index)?.to_vec();
                    let value = match page.payload_at(index)? {
                        Payload::Inline(value) => value.to_vec(),
                        Payload::Overflow { start_page, size } => {
                            read_overflow(tx, start_page, size)?
                        }
                        Payload::Child(_) => {
                            bail!("leaf page {} holds a branch entry", page_no)
                        }
                    };
                    self.stack.last_mut().unwrap().1 += 1;
                    return Ok(Some((key, value)));
                }
                self.stack.pop();
                continue;
            }

            // Branch frame: advance to the next child, then dive to its
            // leftmost leaf.
            let next_child = index + 1;
            if next_child >= page.count() {
                self.stack.pop();
                continue;
            }
            self.stack.last_mut().unwrap().1 = next_child;

            let mut current = page.child_at(next_child)?;
            loop {
                let child = TreePage::new(tx.page(current)?)?;
                self.stack.push((current, 0));
                if child.is_leaf() {
                    break;
                }
                current = child.child_at(0)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::env::{EnvOptions, StorageEnvironment};

    #[test]
    fn iterates_in_key_order_across_pages() {
        let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("t").unwrap();

        for i in (0..400u32).rev() {
            tree.add(&mut tx, format!("k{:05}", i).as_bytes(), i.to_le_bytes().as_ref())
                .unwrap();
        }

        let mut iter = tree.iter(&tx);
        iter.seek_first().unwrap();
        for i in 0..400u32 {
            let (key, value) = iter.next().unwrap().expect("entry missing");
            assert_eq!(key, format!("k{:05}", i).into_bytes());
            assert_eq!(value, i.to_le_bytes());
        }
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn seek_lands_on_first_key_at_or_after() {
        let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("t").unwrap();

        for key in ["apple", "banana", "cherry", "damson"] {
            tree.add(&mut tx, key.as_bytes(), b"v").unwrap();
        }

        let mut iter = tree.iter(&tx);
        iter.seek(b"b").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, b"banana".to_vec());

        iter.seek(b"cherry").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, b"cherry".to_vec());

        iter.seek(b"zebra").unwrap();
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn seek_past_a_leaf_boundary_continues_in_the_next_leaf() {
        let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("t").unwrap();

        for i in 0..600u32 {
            tree.add(&mut tx, format!("k{:05}", i).as_bytes(), b"v").unwrap();
        }

        let mut iter = tree.iter(&tx);
        iter.seek(b"k00299x").unwrap();

        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"k00300".to_vec());
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();
        let tx = env.write_txn().unwrap();
        let tree = tx.open_or_create_tree("t").unwrap();

        let mut iter = tree.iter(&tx);
        iter.seek_first().unwrap();

        assert!(iter.next().unwrap().is_none());
    }
}
