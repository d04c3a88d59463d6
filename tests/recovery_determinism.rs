//! Crash recovery tests
//!
//! Reopening a store must reconstruct exactly the last flushed state:
//! flushed commits survive, unflushed ones are gone, and stored but
//! not yet performed batches are re-performed deterministically.

mod common;

use common::{codec, open_store, store_config, temp_dir};
use pagedb::TxPageFile;

#[test]
fn test_flushed_state_survives_reopen() {
    let dir = temp_dir();
    let page;
    {
        let store = open_store(&dir);
        let codec = codec();
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.put(&codec, page, "durable".to_string()).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    let codec = codec();
    let mut tx = store.tx();
    assert_eq!(tx.get(&codec, page).unwrap().unwrap().as_str(), "durable");
}

#[test]
fn test_unflushed_commit_is_lost() {
    let dir = temp_dir();
    let page;
    {
        let store = open_store(&dir);
        let codec = codec();
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.put(&codec, page, "flushed".to_string()).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();

        let mut tx = store.tx();
        tx.put(&codec, page, "not flushed".to_string()).unwrap();
        tx.commit().unwrap();
        // No flush: the open batch dies with the process.
    }

    let store = open_store(&dir);
    let codec = codec();
    let mut tx = store.tx();
    assert_eq!(tx.get(&codec, page).unwrap().unwrap().as_str(), "flushed");
}

#[test]
fn test_stored_unperformed_batch_is_recovered() {
    let dir = temp_dir();
    let page;
    {
        let store = open_store(&dir);
        let codec = codec();
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.put(&codec, page, "first".to_string()).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();

        // Pin a snapshot so the next batch stores but cannot perform.
        let mut reader = store.tx();
        assert_eq!(reader.get(&codec, page).unwrap().unwrap().as_str(), "first");

        let mut tx = store.tx();
        tx.put(&codec, page, "second".to_string()).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();

        assert_eq!(reader.get(&codec, page).unwrap().unwrap().as_str(), "first");
        // Drop everything with the batch stored but unperformed.
    }

    let store = open_store(&dir);
    let codec = codec();
    let mut tx = store.tx();
    assert_eq!(tx.get(&codec, page).unwrap().unwrap().as_str(), "second");
}

#[test]
fn test_head_revision_survives_clean_reopen() {
    let dir = temp_dir();
    {
        let store = open_store(&dir);
        let mut tx = store.tx();
        let page = tx.alloc().unwrap();
        tx.write(page, b"x").unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();
        assert_eq!(store.head_revision(), 0);
    }

    // Every batch was performed and released, so recovery rebuilds the
    // chain from the durable baseline alone.
    let store = open_store(&dir);
    assert_eq!(store.head_revision(), 0);
}

#[test]
fn test_commit_after_reopen_survives_another_reopen() {
    let dir = temp_dir();
    let page;
    {
        let store = open_store(&dir);
        let codec = codec();
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.put(&codec, page, "first".to_string()).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();
    }

    {
        // The reopened store must assign a revision above the durable
        // baseline, or the next recovery discards this commit.
        let store = open_store(&dir);
        let codec = codec();
        let mut reader = store.tx();
        assert_eq!(reader.get(&codec, page).unwrap().unwrap().as_str(), "first");

        let mut tx = store.tx();
        tx.put(&codec, page, "second".to_string()).unwrap();
        tx.commit().unwrap();
        // The reader keeps the batch stored but unperformed.
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    let codec = codec();
    let mut tx = store.tx();
    assert_eq!(tx.get(&codec, page).unwrap().unwrap().as_str(), "second");
}

#[test]
fn test_recovery_is_deterministic_across_reopens() {
    let dir = temp_dir();
    let mut pages = Vec::new();
    {
        let store = open_store(&dir);
        let codec = codec();
        for i in 0..10 {
            let mut tx = store.tx();
            let page = tx.alloc().unwrap();
            tx.put(&codec, page, format!("value {i}")).unwrap();
            tx.commit().unwrap();
            if i % 3 == 0 {
                store.flush().unwrap();
            }
            pages.push(page);
        }
        store.flush().unwrap();
    }

    let read_all = || {
        let store = open_store(&dir);
        let codec = codec();
        let mut tx = store.tx();
        pages
            .iter()
            .map(|&p| tx.get(&codec, p).unwrap().unwrap().as_str().to_string())
            .collect::<Vec<_>>()
    };

    let first = read_all();
    let second = read_all();
    assert_eq!(first, second);
    for (i, value) in first.iter().enumerate() {
        assert_eq!(value, &format!("value {i}"));
    }
}

#[test]
fn test_freed_pages_stay_free_after_recovery() {
    let dir = temp_dir();
    let page;
    {
        let store = open_store(&dir);
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.write(page, b"short lived").unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();

        let mut tx = store.tx();
        tx.free(page).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    let mut tx = store.tx();
    // First fit lands back on the reclaimed page.
    assert_eq!(tx.alloc().unwrap(), page);
    tx.rollback();
}

#[test]
fn test_corrupted_primary_header_falls_back_to_copy() {
    use std::io::{Seek, SeekFrom, Write};

    let dir = temp_dir();
    let page;
    {
        let store = open_store(&dir);
        let codec = codec();
        let mut tx = store.tx();
        page = tx.alloc().unwrap();
        tx.put(&codec, page, "survives".to_string()).unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();
    }

    // Smash a byte inside the first header copy; the second copy in
    // the reserved region stays intact.
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("pages.db"))
        .unwrap();
    file.seek(SeekFrom::Start(40)).unwrap();
    file.write_all(&[0xff]).unwrap();
    drop(file);

    let store = open_store(&dir);
    let codec = codec();
    let mut tx = store.tx();
    assert_eq!(tx.get(&codec, page).unwrap().unwrap().as_str(), "survives");
}

#[test]
fn test_reopen_with_wrong_page_size_fails() {
    let dir = temp_dir();
    {
        let store = open_store(&dir);
        let mut tx = store.tx();
        let page = tx.alloc().unwrap();
        tx.write(page, b"x").unwrap();
        tx.commit().unwrap();
        store.flush().unwrap();
    }

    let err = TxPageFile::open(store_config(&dir).page_size(1024)).unwrap_err();
    assert_eq!(err.code().code(), "PAGE_ILLEGAL_STATE");
}

#[test]
fn test_empty_store_reopens_clean() {
    let dir = temp_dir();
    {
        let store = open_store(&dir);
        assert_eq!(store.head_revision(), -1);
    }
    let store = open_store(&dir);
    assert_eq!(store.head_revision(), -1);
    let mut tx = store.tx();
    assert_eq!(tx.alloc().unwrap(), 0);
    tx.rollback();
}
