//! Free-space manager behavior observed through the public transaction
//! API: reuse after delete, cross-section allocation, exactness of the
//! free set, and the no-double-allocation guarantee.

use std::sync::Arc;

use hashbrown::HashSet;
use vellum::config::SECTION_PAGES;
use vellum::tree::{Payload, TreePage, TreeState};
use vellum::txn::PageRead;
use vellum::{EnvOptions, StorageEnvironment};

fn value(size: usize, seed: u8) -> Vec<u8> {
    vec![seed; size]
}

#[test]
fn delete_and_reinsert_reuses_pages_instead_of_growing() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    // Fill tree "foo" with 25 entries of ~512 bytes.
    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("foo").unwrap();
        for i in 0..25u32 {
            tree.add(&mut tx, format!("key/{:03}", i).as_bytes(), &value(512, i as u8))
                .unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }
    let after_insert = env.committed_state().next_page;

    // Delete everything.
    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_tree("foo").unwrap().unwrap();
        for i in 0..25u32 {
            assert!(tree.delete(&mut tx, format!("key/{:03}", i).as_bytes()).unwrap());
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }
    let baseline = env.committed_state().next_page;

    // Reinsert the same 25 entries: the pages freed by the delete pass
    // must satisfy the allocations.
    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_tree("foo").unwrap().unwrap();
        for i in 0..25u32 {
            tree.add(&mut tx, format!("key/{:03}", i).as_bytes(), &value(512, i as u8))
                .unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }
    let after_reinsert = env.committed_state().next_page;

    assert!(
        after_reinsert < baseline + 2,
        "reinsertion grew the file: {} -> {}",
        baseline,
        after_reinsert
    );
    // The full cycle also stays within a few pages of the first load.
    assert!(after_reinsert <= after_insert + 6);
}

#[test]
fn free_in_a_later_section_is_served_across_the_boundary() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    // Stretch the store exactly to the section boundary, then across it.
    let target = {
        let mut tx = env.write_txn().unwrap();
        let chunk = SECTION_PAGES / 2;
        tx.allocate(chunk - 2).unwrap(); // pages 3..1025
        tx.allocate(chunk - 1).unwrap(); // pages 1025..2048
        let run = tx.allocate(5).unwrap(); // steps over the section 1 bitmap
        tx.commit().unwrap();
        run
    };
    assert_eq!(target, SECTION_PAGES + 1);

    {
        let mut tx = env.write_txn().unwrap();
        tx.free_page(SECTION_PAGES + 1);
        tx.commit().unwrap();
    }

    let mut tx = env.write_txn().unwrap();
    assert_eq!(tx.allocate(1).unwrap(), SECTION_PAGES + 1);
    tx.rollback();
}

#[test]
fn freed_pages_are_reused_before_the_file_grows() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("data").unwrap();
        for i in 0..200u32 {
            tree.add(&mut tx, format!("k{:04}", i).as_bytes(), &value(256, 1))
                .unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }

    // Drop a scattered half of the keys.
    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_tree("data").unwrap().unwrap();
        for i in (0..200u32).step_by(2) {
            tree.delete(&mut tx, format!("k{:04}", i).as_bytes()).unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }

    let freed: HashSet<u64> = env.all_free_pages().unwrap().into_iter().collect();
    assert!(!freed.is_empty());

    let before = env.committed_state().next_page;
    let mut tx = env.write_txn().unwrap();
    let mut served_from_freed = 0usize;
    for _ in 0..freed.len() {
        let page = tx.allocate(1).unwrap();
        if freed.contains(&page) {
            served_from_freed += 1;
        }
    }
    assert_eq!(tx.next_page_number(), before, "the file grew during reuse");
    assert!(
        served_from_freed * 10 >= freed.len() * 8,
        "only {}/{} allocations came from freed pages",
        served_from_freed,
        freed.len()
    );
    tx.rollback();
}

#[test]
fn free_set_is_exactly_the_unreachable_pages() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("data").unwrap();
        for i in 0..300u32 {
            tree.add(&mut tx, format!("k{:04}", i).as_bytes(), &value(200, 2))
                .unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }
    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_tree("data").unwrap().unwrap();
        for i in 100..300u32 {
            tree.delete(&mut tx, format!("k{:04}", i).as_bytes()).unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }

    let state = env.committed_state();
    let reachable = reachable_pages(&env);
    let free = env.all_free_pages().unwrap();

    // Free and reachable partition the allocated space (bitmap overhead
    // pages aside): no overlap, nothing unaccounted for.
    let free_set: HashSet<u64> = free.iter().copied().collect();
    assert!(free_set.is_disjoint(&reachable));
    assert!(free.windows(2).all(|w| w[0] < w[1]), "free list not sorted");

    for page in 3..state.next_page {
        let is_bitmap = page >= SECTION_PAGES && page % SECTION_PAGES == 0;
        if is_bitmap {
            continue;
        }
        assert!(
            free_set.contains(&page) ^ reachable.contains(&page),
            "page {} is in {} sets",
            page,
            free_set.contains(&page) as u8 + reachable.contains(&page) as u8
        );
    }
}

#[test]
fn no_page_is_both_reachable_and_allocatable() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("data").unwrap();
        for i in 0..150u32 {
            tree.add(&mut tx, format!("k{:04}", i).as_bytes(), &value(300, 3))
                .unwrap();
        }
        for i in 0..75u32 {
            tree.delete(&mut tx, format!("k{:04}", i).as_bytes()).unwrap();
        }
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }

    let reachable = reachable_pages(&env);

    let mut tx = env.write_txn().unwrap();
    for _ in 0..50 {
        let page = tx.allocate(1).unwrap();
        assert!(
            !reachable.contains(&page),
            "allocator handed out live page {}",
            page
        );
    }
    tx.rollback();
}

/// Walks every page reachable from the committed root: the root tree's
/// pages, every named tree's pages, and overflow runs.
fn reachable_pages(env: &Arc<StorageEnvironment>) -> HashSet<u64> {
    let tx = env.read_txn().unwrap();
    let root = env.committed_state().root;
    let mut reachable = HashSet::new();

    walk_tree(&tx, root, &mut reachable);

    // Every value in the root tree is a named tree's state.
    if !root.is_empty() {
        let root_tree = vellum::Tree::from_state("$walk", root);
        let mut iter = root_tree.iter(&tx);
        iter.seek_first().unwrap();
        while let Some((_, state_bytes)) = iter.next().unwrap() {
            let state = TreeState::from_bytes(&state_bytes).unwrap();
            walk_tree(&tx, state, &mut reachable);
        }
    }
    reachable
}

fn walk_tree(tx: &vellum::ReadTransaction, state: TreeState, out: &mut HashSet<u64>) {
    if state.is_empty() {
        return;
    }
    let mut stack = vec![state.root_page()];
    while let Some(page_no) = stack.pop() {
        if !out.insert(page_no) {
            continue;
        }
        let page = TreePage::new(tx.page(page_no).unwrap()).unwrap();
        if page.is_leaf() {
            for i in 0..page.count() {
                if let Payload::Overflow { start_page, size } = page.payload_at(i).unwrap() {
                    let chunk = vellum::config::page_space(tx.page_size()) as u64;
                    let pages = (size as u64).div_ceil(chunk).max(1);
                    for p in start_page..start_page + pages {
                        out.insert(p);
                    }
                }
            }
        } else {
            for i in 0..page.count() {
                stack.push(page.child_at(i).unwrap());
            }
        }
    }
}
