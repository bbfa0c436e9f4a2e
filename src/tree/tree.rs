//! # B+-Tree Operations
//!
//! A `Tree` is a lightweight handle: a name plus the persistent `TreeState`
//! record. Every operation runs against a transaction — reads against any
//! snapshot, mutations against the single write transaction, which
//! copy-on-writes the whole descent path so no committed page is ever
//! touched.
//!
//! ## Insert
//!
//! Descend with COW, repointing parents at the copies. If the leaf fits the
//! new record, insert in slot order. Otherwise split: records (plus the
//! newcomer) are redistributed around a size-balanced midpoint, the
//! separator climbs into the parent, and parent splits propagate up a path
//! stack; a root split adds a level.
//!
//! ## Delete
//!
//! A read-only probe skips missing keys without COW garbage. Otherwise the
//! slot is removed and, when the page's used space falls under a third of
//! its capacity, the page merges with a sibling when the two fit together,
//! or the pair is rebalanced around a fresh separator. The evaporating side
//! of a merge is only read, never copied. A branch root left with a single
//! child collapses into it.
//!
//! ## Overflow Values
//!
//! Values past the inline threshold are written to a contiguous page run;
//! the first page's header carries the total byte size and the leaf stores
//! an overflow reference. Runs are freed with their owning node.
//!
//! ## Multi-Valued Keys
//!
//! `multi_add(key, value)` stores the composite `key · NUL · value` with an
//! empty inline value, so the set of values under one key is a contiguous
//! key range readable by prefix scan. Multi keys must be NUL-free.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::trace;

use crate::config::{max_inline_value, max_key_size, page_space, PAGE_MIN_FILL_DIVISOR};
use crate::errors::StoreError;
use crate::storage::{PageHeader, PAGE_FLAG_OVERFLOW};
use crate::tree::iter::TreeIterator;
use crate::tree::node::{
    decode_node, encode_node, encoded_node_len, Payload, TreePage, TreePageMut,
};
use crate::tree::state::TreeState;
use crate::txn::{PageRead, WriteTransaction};

/// Name of the distinguished tree that maps tree names to tree states.
pub const ROOT_TREE_NAME: &str = "$root";

type Path = SmallVec<[(u64, usize); 8]>;

#[derive(Debug, Clone)]
pub struct Tree {
    name: String,
    state: TreeState,
}

impl Tree {
    pub fn from_state(name: &str, state: TreeState) -> Self {
        Self {
            name: name.to_string(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &TreeState {
        &self.state
    }

    pub fn entry_count(&self) -> u64 {
        self.state.entries()
    }

    /// Point lookup; resolves overflow references to the full value.
    pub fn read<T: PageRead>(&self, tx: &T, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.state.is_empty() {
            return Ok(None);
        }

        let mut current = self.state.root_page();
        loop {
            let page = TreePage::new(tx.page(current)?)?;
            if page.is_leaf() {
                return match page.search(key)? {
                    Ok(index) => match page.payload_at(index)? {
                        Payload::Inline(value) => Ok(Some(value.to_vec())),
                        Payload::Overflow { start_page, size } => {
                            Ok(Some(read_overflow(tx, start_page, size)?))
                        }
                        Payload::Child(_) => bail!(
                            "leaf page {} holds a branch entry for {:?}",
                            current,
                            String::from_utf8_lossy(key)
                        ),
                    },
                    Err(_) => Ok(None),
                };
            }

            let index = match page.search(key)? {
                Ok(i) => i,
                Err(at) => at.saturating_sub(1),
            };
            current = page.child_at(index)?;
        }
    }

    pub fn contains<T: PageRead>(&self, tx: &T, key: &[u8]) -> Result<bool> {
        if self.state.is_empty() {
            return Ok(false);
        }

        let mut current = self.state.root_page();
        loop {
            let page = TreePage::new(tx.page(current)?)?;
            if page.is_leaf() {
                return Ok(page.search(key)?.is_ok());
            }
            let index = match page.search(key)? {
                Ok(i) => i,
                Err(at) => at.saturating_sub(1),
            };
            current = page.child_at(index)?;
        }
    }

    /// Inserts or replaces `key`. Values past the inline threshold go to an
    /// overflow run.
    pub fn add(&mut self, tx: &mut WriteTransaction<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        let max_key = max_key_size(tx.page_size());
        ensure!(
            !key.is_empty(),
            StoreError::InvalidData("empty tree key".into())
        );
        ensure!(
            key.len() <= max_key,
            StoreError::KeyTooLarge {
                len: key.len(),
                max: max_key
            }
        );

        if self.state.is_empty() {
            let root = tx.allocate(1)?;
            TreePageMut::init(tx.page_mut(root)?, root, true)?;
            self.state.set_root_page(root);
            self.state.set_depth(1);
            self.state.add_leaf_pages(1);
        }

        let (leaf, path) = self.descend_cow(tx, key)?;

        // Build the payload before taking page references: an overflow
        // write may grow and remap the region.
        let payload = if value.len() > max_inline_value(tx.page_size()) {
            let (start_page, pages) = write_overflow(tx, value)?;
            self.state.add_overflow_pages(pages as i64);
            Payload::Overflow {
                start_page,
                size: value.len() as u32,
            }
        } else {
            Payload::Inline(value)
        };

        let existing = {
            let page = TreePage::new(tx.page(leaf)?)?;
            match page.search(key)? {
                Ok(index) => {
                    let old = page.payload_at(index)?;
                    let overflow = match old {
                        Payload::Overflow { start_page, size } => Some((start_page, size)),
                        _ => None,
                    };
                    Some((index, overflow))
                }
                Err(_) => None,
            }
        };

        match existing {
            Some((index, old_overflow)) => {
                if let Some((start, size)) = old_overflow {
                    let pages = overflow_page_count(tx.page_size(), size);
                    tx.free_run(start, pages);
                    self.state.add_overflow_pages(-(pages as i64));
                }
                TreePageMut::new(tx.page_mut(leaf)?)?.remove(index)?;
            }
            None => self.state.add_entries(1),
        }

        let mut record = Vec::with_capacity(encoded_node_len(key.len(), &payload));
        encode_node(&mut record, key, &payload);
        self.insert_record(tx, path, leaf, key.to_vec(), record)
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&mut self, tx: &mut WriteTransaction<'_>, key: &[u8]) -> Result<bool> {
        if self.state.is_empty() || !self.contains(tx, key)? {
            return Ok(false);
        }

        let (leaf, path) = self.descend_cow(tx, key)?;

        let (index, old_overflow) = {
            let page = TreePage::new(tx.page(leaf)?)?;
            let index = match page.search(key)? {
                Ok(i) => i,
                Err(_) => bail!("key vanished between probe and delete"),
            };
            let overflow = match page.payload_at(index)? {
                Payload::Overflow { start_page, size } => Some((start_page, size)),
                _ => None,
            };
            (index, overflow)
        };

        if let Some((start, size)) = old_overflow {
            let pages = overflow_page_count(tx.page_size(), size);
            tx.free_run(start, pages);
            self.state.add_overflow_pages(-(pages as i64));
        }

        TreePageMut::new(tx.page_mut(leaf)?)?.remove(index)?;
        self.state.add_entries(-1);

        self.rebalance(tx, path, leaf)?;
        Ok(true)
    }

    /// Forward iterator over this tree; call `seek`/`seek_first` before
    /// `next`.
    pub fn iter<'t, T: PageRead>(&self, tx: &'t T) -> TreeIterator<'t, T> {
        TreeIterator::new(tx, self.state)
    }

    /// Largest key currently in the tree.
    pub fn last_key<T: PageRead>(&self, tx: &T) -> Result<Option<Vec<u8>>> {
        if self.state.is_empty() {
            return Ok(None);
        }

        let mut current = self.state.root_page();
        loop {
            let page = TreePage::new(tx.page(current)?)?;
            let count = page.count();
            if page.is_leaf() {
                return match count {
                    0 => Ok(None),
                    n => Ok(Some(page.key_at(n - 1)?.to_vec())),
                };
            }
            current = page.child_at(count - 1)?;
        }
    }

    // ---- multi-valued keys -------------------------------------------------

    pub fn multi_add(
        &mut self,
        tx: &mut WriteTransaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let composite = multi_key(key, value)?;
        self.add(tx, &composite, b"")
    }

    pub fn multi_delete(
        &mut self,
        tx: &mut WriteTransaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let composite = multi_key(key, value)?;
        self.delete(tx, &composite)
    }

    /// All values stored under a multi-valued key, in value order.
    pub fn multi_read<T: PageRead>(&self, tx: &T, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        ensure!(
            !key.contains(&0),
            StoreError::InvalidData("multi keys must not contain NUL".into())
        );

        let mut prefix = key.to_vec();
        prefix.push(0);

        let mut values = Vec::new();
        let mut iter = self.iter(tx);
        iter.seek(&prefix)?;
        while let Some((composite, _)) = iter.next()? {
            if !composite.starts_with(&prefix) {
                break;
            }
            values.push(composite[prefix.len()..].to_vec());
        }
        Ok(values)
    }

    // ---- internals ---------------------------------------------------------

    /// COW descent to the leaf that owns `key`. Every page on the path is
    /// made writable and parents are repointed at the copies.
    fn descend_cow(
        &mut self,
        tx: &mut WriteTransaction<'_>,
        key: &[u8],
    ) -> Result<(u64, Path)> {
        let root = tx.modify_page(self.state.root_page())?;
        self.state.set_root_page(root);

        let mut path: Path = SmallVec::new();
        let mut current = root;
        loop {
            let step = {
                let page = TreePage::new(tx.page(current)?)?;
                if page.is_leaf() {
                    None
                } else {
                    let index = match page.search(key)? {
                        Ok(i) => i,
                        Err(at) => at.saturating_sub(1),
                    };
                    Some((index, page.child_at(index)?))
                }
            };

            let Some((index, child)) = step else {
                return Ok((current, path));
            };

            let writable = tx.modify_page(child)?;
            if writable != child {
                TreePageMut::new(tx.page_mut(current)?)?.set_child(index, writable)?;
            }
            path.push((current, index));
            current = writable;
        }
    }

    /// Inserts an encoded record into a dirty page, splitting as needed and
    /// propagating separators up the path.
    fn insert_record(
        &mut self,
        tx: &mut WriteTransaction<'_>,
        mut path: Path,
        target: u64,
        key: Vec<u8>,
        record: Vec<u8>,
    ) -> Result<()> {
        let mut target = target;
        let mut key = key;
        let mut record = record;

        loop {
            {
                let mut page = TreePageMut::new(tx.page_mut(target)?)?;
                if page.free_space() >= record.len() + 2 {
                    let index = match page.search(&key)? {
                        Ok(_) => bail!("duplicate key during insert"),
                        Err(at) => at,
                    };
                    page.insert_raw(index, &record)?;
                    return Ok(());
                }
            }

            let (separator, new_page) = self.split_page(tx, target, &key, &record)?;
            trace!(
                tree = %self.name,
                page = target,
                sibling = new_page,
                "tree.split"
            );

            match path.pop() {
                Some((parent, _)) => {
                    let mut rec = Vec::new();
                    encode_node(&mut rec, &separator, &Payload::Child(new_page));
                    target = parent;
                    key = separator;
                    record = rec;
                }
                None => {
                    let old_root = target;
                    let new_root = tx.allocate(1)?;
                    let mut page = TreePageMut::init(tx.page_mut(new_root)?, new_root, false)?;
                    page.insert(0, b"", &Payload::Child(old_root))?;
                    page.insert(1, &separator, &Payload::Child(new_page))?;

                    self.state.set_root_page(new_root);
                    self.state.set_depth(self.state.depth() + 1);
                    self.state.add_branch_pages(1);
                    return Ok(());
                }
            }
        }
    }

    /// Splits a full page around a size-balanced midpoint, inserting the
    /// pending record on the correct side. Returns the separator to push up
    /// and the new right sibling.
    fn split_page(
        &mut self,
        tx: &mut WriteTransaction<'_>,
        page_no: u64,
        new_key: &[u8],
        new_record: &[u8],
    ) -> Result<(Vec<u8>, u64)> {
        let (is_leaf, mut records, mut keys) = collect_records(tx, page_no)?;

        let position = keys.partition_point(|k| k.as_slice() < new_key);
        records.insert(position, new_record.to_vec());
        keys.insert(position, new_key.to_vec());

        let total: usize = records.iter().map(|r| r.len() + 2).sum();
        let mid = {
            let mut acc = 0usize;
            let mut mid = records.len() - 1;
            for (i, record) in records.iter().enumerate() {
                acc += record.len() + 2;
                if acc >= total / 2 {
                    mid = i + 1;
                    break;
                }
            }
            mid.clamp(1, records.len() - 1)
        };

        let new_page = tx.allocate(1)?;
        let separator = keys[mid].clone();

        {
            let mut page = TreePageMut::init(tx.page_mut(page_no)?, page_no, is_leaf)?;
            for (i, record) in records[..mid].iter().enumerate() {
                page.insert_raw(i, record)?;
            }
        }

        {
            let mut page = TreePageMut::init(tx.page_mut(new_page)?, new_page, is_leaf)?;
            if is_leaf {
                for (i, record) in records[mid..].iter().enumerate() {
                    page.insert_raw(i, record)?;
                }
            } else {
                // The separator moves up; its child becomes the right
                // page's implicit low entry.
                let (_, payload, _) = decode_node(&records[mid])?;
                let mut first = Vec::new();
                encode_node(&mut first, b"", &payload);
                page.insert_raw(0, &first)?;
                for (i, record) in records[mid + 1..].iter().enumerate() {
                    page.insert_raw(i + 1, record)?;
                }
            }
        }

        if is_leaf {
            self.state.add_leaf_pages(1);
        } else {
            self.state.add_branch_pages(1);
        }

        Ok((separator, new_page))
    }

    /// Restores fill invariants after a delete, walking merges up the path.
    fn rebalance(&mut self, tx: &mut WriteTransaction<'_>, mut path: Path, start: u64) -> Result<()> {
        let space = page_space(tx.page_size());
        let min_fill = space / PAGE_MIN_FILL_DIVISOR;
        let mut current = start;

        loop {
            let (is_leaf, count, used) = {
                let page = TreePage::new(tx.page(current)?)?;
                (page.is_leaf(), page.count(), page.used_space())
            };

            let Some(&(parent, index)) = path.last() else {
                // Root fixes: an empty tree drops its root, a one-child
                // branch root collapses (possibly repeatedly).
                if count == 0 && is_leaf {
                    tx.free_page(current);
                    self.state.add_leaf_pages(-1);
                    self.state.set_root_page(0);
                    self.state.set_depth(0);
                    return Ok(());
                }
                if !is_leaf && count == 1 {
                    let child = TreePage::new(tx.page(current)?)?.child_at(0)?;
                    tx.free_page(current);
                    self.state.add_branch_pages(-1);
                    self.state.set_root_page(child);
                    self.state.set_depth(self.state.depth() - 1);
                    current = child;
                    continue;
                }
                return Ok(());
            };

            if used >= min_fill {
                return Ok(());
            }

            let parent_count = TreePage::new(tx.page(parent)?)?.count();
            if parent_count < 2 {
                path.pop();
                current = parent;
                continue;
            }

            let (left_index, right_index) = if index + 1 < parent_count {
                (index, index + 1)
            } else {
                (index - 1, index)
            };

            let merged = self.merge_or_redistribute(tx, parent, left_index, right_index)?;
            if !merged {
                return Ok(());
            }

            path.pop();
            current = parent;
        }
    }

    /// Merges two adjacent siblings when their records fit one page,
    /// otherwise rebalances them around a fresh separator. Returns whether
    /// a merge happened (the parent lost an entry).
    fn merge_or_redistribute(
        &mut self,
        tx: &mut WriteTransaction<'_>,
        parent: u64,
        left_index: usize,
        right_index: usize,
    ) -> Result<bool> {
        let (left_page, right_page, separator) = {
            let page = TreePage::new(tx.page(parent)?)?;
            (
                page.child_at(left_index)?,
                page.child_at(right_index)?,
                page.key_at(right_index)?.to_vec(),
            )
        };

        let (is_leaf, left_records, _) = collect_records(tx, left_page)?;
        let (right_leaf, right_records, _) = collect_records(tx, right_page)?;
        ensure!(
            is_leaf == right_leaf,
            StoreError::Corrupt("sibling pages disagree on their kind".into())
        );

        let mut combined = left_records;
        if is_leaf {
            combined.extend(right_records);
        } else {
            // The right page's implicit low entry takes the parent's
            // separator as its explicit key.
            let mut iter = right_records.into_iter();
            if let Some(first) = iter.next() {
                let (_, payload, _) = decode_node(&first)?;
                let mut rekeyed = Vec::new();
                encode_node(&mut rekeyed, &separator, &payload);
                combined.push(rekeyed);
            }
            combined.extend(iter);
        }

        let space = page_space(tx.page_size());
        let total: usize = combined.iter().map(|r| r.len() + 2).sum();

        if total <= space {
            // Merge into whichever side this transaction already owns; the
            // other side is only read and then freed.
            let survivor = if tx.is_dirty(left_page) {
                left_page
            } else {
                right_page
            };
            let dropped = if survivor == left_page {
                right_page
            } else {
                left_page
            };

            TreePageMut::new(tx.page_mut(survivor)?)?.rebuild_from(&combined)?;

            let mut parent_page = TreePageMut::new(tx.page_mut(parent)?)?;
            parent_page.remove(right_index)?;
            parent_page.set_child(left_index, survivor)?;

            tx.free_page(dropped);
            if is_leaf {
                self.state.add_leaf_pages(-1);
            } else {
                self.state.add_branch_pages(-1);
            }

            trace!(tree = %self.name, survivor, dropped, "tree.merge");
            return Ok(true);
        }

        // Redistribute: both sides survive, so both must be owned. The
        // parent must also be able to take the fresh separator; when it
        // cannot, leave the pair underfull rather than cascade a split out
        // of a delete.
        let total_all: usize = combined.iter().map(|r| r.len() + 2).sum();
        let mid = {
            let mut acc = 0usize;
            let mut mid = combined.len() - 1;
            for (i, record) in combined.iter().enumerate() {
                acc += record.len() + 2;
                if acc >= total_all / 2 {
                    mid = i + 1;
                    break;
                }
            }
            mid.clamp(1, combined.len() - 1)
        };
        let (new_separator, _, _) =
            decode_node(&combined[mid]).map(|(key, payload, len)| (key.to_vec(), payload, len))?;

        {
            let parent_page = TreePage::new(tx.page(parent)?)?;
            let old_record_len = parent_page.record_at(right_index)?.len();
            let new_record_len =
                encoded_node_len(new_separator.len(), &Payload::Child(right_page));
            if new_record_len > old_record_len + parent_page.free_space() {
                return Ok(false);
            }
        }

        let left_owned = tx.modify_page(left_page)?;
        if left_owned != left_page {
            TreePageMut::new(tx.page_mut(parent)?)?.set_child(left_index, left_owned)?;
        }
        let right_owned = tx.modify_page(right_page)?;
        if right_owned != right_page {
            TreePageMut::new(tx.page_mut(parent)?)?.set_child(right_index, right_owned)?;
        }

        TreePageMut::new(tx.page_mut(left_owned)?)?.rebuild_from(&combined[..mid])?;

        {
            let mut page = TreePageMut::new(tx.page_mut(right_owned)?)?;
            if is_leaf {
                page.rebuild_from(&combined[mid..])?;
            } else {
                let (_, payload, _) = decode_node(&combined[mid])?;
                let mut first = Vec::new();
                encode_node(&mut first, b"", &payload);
                let mut records = vec![first];
                records.extend_from_slice(&combined[mid + 1..]);
                page.rebuild_from(&records)?;
            }
        }

        TreePageMut::new(tx.page_mut(parent)?)?.replace_key(right_index, &new_separator)?;

        trace!(tree = %self.name, left = left_owned, right = right_owned, "tree.redistribute");
        Ok(false)
    }
}

fn multi_key(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    ensure!(
        !key.contains(&0),
        StoreError::InvalidData("multi keys must not contain NUL".into())
    );
    let mut composite = Vec::with_capacity(key.len() + 1 + value.len());
    composite.extend_from_slice(key);
    composite.push(0);
    composite.extend_from_slice(value);
    Ok(composite)
}

fn collect_records<T: PageRead>(
    tx: &T,
    page_no: u64,
) -> Result<(bool, Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let page = TreePage::new(tx.page(page_no)?)?;
    let count = page.count();

    let mut records = Vec::with_capacity(count);
    let mut keys = Vec::with_capacity(count);
    for i in 0..count {
        records.push(page.record_at(i)?.to_vec());
        keys.push(page.key_at(i)?.to_vec());
    }
    Ok((page.is_leaf(), records, keys))
}

pub(crate) fn overflow_page_count(page_size: u32, size: u32) -> u64 {
    let chunk = page_space(page_size) as u64;
    (size as u64).div_ceil(chunk).max(1)
}

fn write_overflow(tx: &mut WriteTransaction<'_>, value: &[u8]) -> Result<(u64, u64)> {
    let page_size = tx.page_size();
    let chunk = page_space(page_size);
    let pages = overflow_page_count(page_size, value.len() as u32);

    let start = tx.allocate(pages)?;
    for i in 0..pages {
        let page_no = start + i;
        let data = tx.page_mut(page_no)?;

        let mut header = PageHeader::new(page_no, PAGE_FLAG_OVERFLOW);
        if i == 0 {
            header.set_overflow_size(value.len() as u32);
        }
        header.write_to(data)?;

        let from = i as usize * chunk;
        let to = (from + chunk).min(value.len());
        if from < value.len() {
            data[crate::config::PAGE_HEADER_SIZE..][..to - from]
                .copy_from_slice(&value[from..to]);
        }
    }

    Ok((start, pages))
}

pub(crate) fn read_overflow<T: PageRead>(tx: &T, start_page: u64, size: u32) -> Result<Vec<u8>> {
    let page_size = tx.page_size();
    let chunk = page_space(page_size);
    let pages = overflow_page_count(page_size, size);

    let first = PageHeader::from_bytes(tx.page(start_page)?)?;
    ensure!(
        first.is_overflow() && first.overflow_size() == size,
        StoreError::Corrupt(format!(
            "overflow run at page {} does not match its reference",
            start_page
        ))
    );

    let mut value = Vec::with_capacity(size as usize);
    for i in 0..pages {
        let data = tx.page(start_page + i)?;
        let remaining = size as usize - value.len();
        let take = remaining.min(chunk);
        value.extend_from_slice(&data[crate::config::PAGE_HEADER_SIZE..][..take]);
    }
    Ok(value)
}
