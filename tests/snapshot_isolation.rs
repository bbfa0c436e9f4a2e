//! Snapshot isolation: readers pin the commit point they opened at,
//! whatever the writer does afterwards, including across pager growth and
//! from concurrent threads.

use std::sync::Arc;
use std::thread;

use vellum::docs::decode_document;
use vellum::{DocumentStore, EnvOptions, StorageEnvironment};

fn folded(key: &str) -> Vec<u8> {
    key.bytes().map(|b| b.to_ascii_lowercase()).collect()
}

/// Reads a document through an already-open snapshot.
fn snapshot_get(tx: &vellum::ReadTransaction, key: &str) -> Option<(u64, Vec<u8>)> {
    let docs = tx.open_tree("docs").unwrap()?;
    let record = docs.read(tx, &folded(key)).unwrap()?;
    let view = decode_document(&record).unwrap();
    Some((view.etag, view.body.to_vec()))
}

#[test]
fn reader_sees_exactly_the_documents_committed_before_it_opened() {
    let store = DocumentStore::open(EnvOptions::memory()).unwrap();

    store.put("a", None, b"a1", &()).unwrap();
    store.put("b", None, b"b1", &()).unwrap();

    let snapshot = store.env().read_txn().unwrap();

    // Mutate heavily after the snapshot opened.
    store.put("c", None, b"c1", &()).unwrap();
    store.put("a", None, b"a2", &()).unwrap();
    store.delete("b", None).unwrap();

    // The snapshot still shows the world at its open point.
    assert_eq!(snapshot_get(&snapshot, "a").unwrap().1, b"a1");
    assert_eq!(snapshot_get(&snapshot, "b").unwrap().1, b"b1");
    assert!(snapshot_get(&snapshot, "c").is_none());

    // A fresh snapshot shows the new world.
    let fresh = store.env().read_txn().unwrap();
    assert_eq!(snapshot_get(&fresh, "a").unwrap().1, b"a2");
    assert!(snapshot_get(&fresh, "b").is_none());
    assert_eq!(snapshot_get(&fresh, "c").unwrap().1, b"c1");
}

#[test]
fn snapshot_survives_pager_growth() {
    let store = DocumentStore::open(EnvOptions::memory()).unwrap();
    store.put("pin", None, b"before", &()).unwrap();

    let snapshot = store.env().read_txn().unwrap();

    // Force several growth cycles with bulky documents.
    for i in 0..40 {
        let body = vec![(i % 251) as u8; 30_000];
        store.put(&format!("bulk/{}", i), None, &body, &()).unwrap();
    }

    assert_eq!(snapshot_get(&snapshot, "pin").unwrap().1, b"before");
    assert!(snapshot_get(&snapshot, "bulk/0").is_none());
}

#[test]
fn concurrent_readers_hold_their_snapshots_while_a_writer_churns() {
    let store = DocumentStore::open(EnvOptions::memory()).unwrap();
    for i in 0..50 {
        store
            .put(&format!("doc/{:02}", i), None, format!("v{}", i).as_bytes(), &())
            .unwrap();
    }

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        let snapshot = store.env().read_txn().unwrap();
        readers.push(thread::spawn(move || {
            // Each reader repeatedly verifies its frozen view.
            for _ in 0..20 {
                for i in 0..50 {
                    let key = format!("doc/{:02}", i);
                    let (_, body) = snapshot_get(&snapshot, &key).expect("document vanished");
                    assert_eq!(body, format!("v{}", i).as_bytes());
                }
                thread::yield_now();
            }
        }));
    }

    // Writer rewrites everything while the readers run.
    for round in 0..5 {
        for i in 0..50 {
            let key = format!("doc/{:02}", i);
            store
                .put(&key, None, format!("round{}-{}", round, i).as_bytes(), &())
                .unwrap();
        }
    }

    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn write_transaction_reads_its_own_writes() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    let mut tx = env.write_txn().unwrap();
    let mut tree = tx.open_or_create_tree("scratch").unwrap();
    tree.add(&mut tx, b"k", b"uncommitted").unwrap();

    assert_eq!(tree.read(&tx, b"k").unwrap(), Some(b"uncommitted".to_vec()));
}

#[test]
fn rollback_leaves_the_previous_root_visible() {
    let env = StorageEnvironment::open(EnvOptions::memory()).unwrap();

    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_or_create_tree("t").unwrap();
        tree.add(&mut tx, b"stable", b"1").unwrap();
        tx.update_tree(&tree);
        tx.commit().unwrap();
    }

    {
        let mut tx = env.write_txn().unwrap();
        let mut tree = tx.open_tree("t").unwrap().unwrap();
        tree.add(&mut tx, b"doomed", b"2").unwrap();
        tree.delete(&mut tx, b"stable").unwrap();
        tx.update_tree(&tree);
        tx.rollback();
    }

    let tx = env.read_txn().unwrap();
    let tree = tx.open_tree("t").unwrap().unwrap();
    assert_eq!(tree.read(&tx, b"stable").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.read(&tx, b"doomed").unwrap(), None);
}

#[test]
fn commits_are_visible_to_transactions_opened_after_return() {
    let store = DocumentStore::open(EnvOptions::memory()).unwrap();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..100 {
                store
                    .put(&format!("seq/{:03}", i), None, b"x", &())
                    .unwrap();
            }
        })
    };

    // Observed etags only ever move forward.
    let mut last_seen = 0;
    for _ in 0..200 {
        let seen = store.last_etag();
        assert!(seen >= last_seen);
        last_seen = seen;
        thread::yield_now();
    }

    writer.join().unwrap();
    assert_eq!(store.last_etag(), 100);

    let all = store.documents_after(None, 0, 1000).unwrap();
    assert_eq!(all.len(), 100);
    assert!(all.windows(2).all(|w| w[0].etag + 1 == w[1].etag));
}
