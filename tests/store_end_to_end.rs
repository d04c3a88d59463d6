//! End-to-end store scenarios
//!
//! The full write / flush / reopen / concurrent-update cycle through
//! the public API, plus a randomized workload checked against an
//! in-memory mirror.

mod common;

use std::collections::HashMap;

use common::{codec, open_store, temp_dir};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn read_string(tx: &mut pagedb::Transaction, page: u32, len: usize) -> String {
    let mut buf = vec![0u8; len];
    tx.read(page, &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

#[test]
fn test_hello_world_scenario() {
    let dir = temp_dir();
    {
        let store = open_store(&dir);
        let mut t1 = store.tx();
        assert_eq!(t1.alloc().unwrap(), 0);
        assert_eq!(t1.alloc().unwrap(), 1);
        t1.write(0, b"Hello").unwrap();
        t1.write(1, b"World").unwrap();
        t1.commit().unwrap();
        store.flush().unwrap();
    }

    // Reopen: the flushed state is all there.
    let store = open_store(&dir);
    let mut check = store.tx();
    assert_eq!(read_string(&mut check, 0, 5), "Hello");
    assert_eq!(read_string(&mut check, 1, 5), "World");
    drop(check);

    // T2 stages an update without committing.
    let mut t2 = store.tx();
    t2.write(0, b"Change 1").unwrap();

    // T3 sees the committed state, not T2's buffer, and commits its
    // own change.
    let mut t3 = store.tx();
    assert_eq!(read_string(&mut t3, 0, 5), "Hello");
    t3.write(0, b"Change 2").unwrap();
    t3.commit().unwrap();

    // T2 still sees its own uncommitted write.
    assert_eq!(read_string(&mut t2, 0, 8), "Change 1");

    // And loses the race.
    assert!(t2.commit().unwrap_err().is_conflict());

    let mut after = store.tx();
    assert_eq!(read_string(&mut after, 0, 8), "Change 2");
}

#[test]
fn test_flush_callback_fires_once_durable() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let dir = temp_dir();
    let store = open_store(&dir);
    let codec = codec();

    let mut tx = store.tx();
    let page = tx.alloc().unwrap();
    tx.put(&codec, page, "payload".to_string()).unwrap();
    tx.commit().unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    store.flush_with(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));
    // Inline store: the flush ran before flush_with returned.
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_transaction_on_flush_fires_after_commit_durability() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let dir = temp_dir();
    let store = open_store(&dir);
    let codec = codec();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();

    let mut tx = store.tx();
    let page = tx.alloc().unwrap();
    tx.put(&codec, page, "notify me".to_string()).unwrap();
    tx.on_flush(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));
    tx.commit().unwrap();
    // Committed but not yet durable.
    assert!(!fired.load(Ordering::SeqCst));

    store.flush().unwrap();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_background_worker_flush() {
    let dir = temp_dir();
    let config = common::store_config(&dir).use_worker(true);
    let page;
    {
        let store = pagedb::TxPageFile::open(config).unwrap();
        let codec = codec();
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.put(&codec, page, "via worker".to_string()).unwrap();
        tx.commit().unwrap();
        // Blocks until the worker reports the cycle done.
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    let codec = codec();
    let mut tx = store.tx();
    assert_eq!(
        tx.get(&codec, page).unwrap().unwrap().as_str(),
        "via worker"
    );
}

#[test]
fn test_slices_roundtrip_across_pages() {
    let dir = temp_dir();
    let store = open_store(&dir);

    let mut tx = store.tx();
    let first = tx.alloc().unwrap();
    let second = tx.alloc().unwrap();
    assert_eq!(second, first + 1);

    let mut slice = tx
        .slice(pagedb::SliceMode::Write, first, 2)
        .unwrap();
    slice.data_mut()[..4].copy_from_slice(b"page");
    slice.data_mut()[512..516].copy_from_slice(b"next");
    tx.unslice(slice).unwrap();
    tx.commit().unwrap();
    store.flush().unwrap();

    let mut check = store.tx();
    let slice = check
        .slice(pagedb::SliceMode::Read, first, 2)
        .unwrap();
    assert_eq!(&slice.data()[..4], b"page");
    assert_eq!(&slice.data()[512..516], b"next");
    check.unslice(slice).unwrap();
}

#[test]
fn test_randomized_workload_matches_mirror() {
    let dir = temp_dir();
    let codec = codec();
    let mut rng = StdRng::seed_from_u64(0x70617065);
    let mut mirror: HashMap<u32, String> = HashMap::new();

    {
        let store = open_store(&dir);
        let mut pages = Vec::new();
        for _ in 0..16 {
            let mut tx = store.tx();
            pages.push(tx.alloc().unwrap());
            tx.commit().unwrap();
        }

        for round in 0..200 {
            let page = pages[rng.gen_range(0..pages.len())];
            let mut tx = store.tx();
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let value = format!("r{round} p{page}");
                    tx.put(&codec, page, value.clone()).unwrap();
                    tx.commit().unwrap();
                    mirror.insert(page, value);
                }
                2 => {
                    let expected = mirror.get(&page);
                    let actual = tx.get(&codec, page).unwrap();
                    if let Some(expected) = expected {
                        assert_eq!(actual.unwrap().as_str(), expected);
                    }
                    tx.rollback();
                }
                _ => {
                    if mirror.contains_key(&page) {
                        tx.clear(&codec, page).unwrap();
                        tx.commit().unwrap();
                        mirror.remove(&page);
                    } else {
                        tx.rollback();
                    }
                }
            }
            if round % 17 == 0 {
                store.flush().unwrap();
            }
        }
        store.flush().unwrap();
    }

    // Everything was flushed; a reopened store must agree with the
    // mirror exactly.
    let store = open_store(&dir);
    for (&page, expected) in &mirror {
        let mut tx = store.tx();
        assert_eq!(tx.get(&codec, page).unwrap().unwrap().as_str(), expected);
    }
}
