use std::time::Duration;

use burrowdb::{DB, Error, FreelistType, Options, Result};
use tempfile::NamedTempFile;

fn temp_db() -> (NamedTempFile, DB) {
    temp_db_with(Options::default())
}

fn temp_db_with(options: Options) -> (NamedTempFile, DB) {
    let _ = env_logger::builder().is_test(true).try_init();
    let file = tempfile::Builder::new()
        .prefix("burrowdb-")
        .suffix(".db")
        .tempfile()
        .unwrap();
    let db = DB::open_with(file.path(), options).unwrap();
    (file, db)
}

fn key(i: usize) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("v{:05}", i).into_bytes()
}

#[test]
fn test_put_commit_reopen_scan() -> Result<()> {
    let (file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"a", b"1")?;
        b.put(b"b", b"2")
    })?;
    db.close()?;

    let db = DB::open(file.path())?;
    db.view(|tx| {
        let b = tx.bucket(b"widgets").expect("bucket lost after reopen");
        let mut c = b.cursor();

        assert_eq!(c.first(), Some((b"a".to_vec(), Some(b"1".to_vec()))));
        assert_eq!(c.next(), Some((b"b".to_vec(), Some(b"2".to_vec()))));
        assert_eq!(c.next(), None);
        Ok(())
    })?;
    db.close()?;
    Ok(())
}

#[test]
fn test_bulk_insert_across_many_transactions() -> Result<()> {
    let (_file, db) = temp_db();

    let initial_size = {
        let tx = db.begin(false)?;
        let size = tx.size();
        tx.rollback()?;
        size
    };

    // 10k keys over 100 committed transactions.
    for batch in 0..100 {
        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists(b"widgets")?;
            for i in 0..100 {
                let n = batch * 100 + i;
                b.put(&key(n), &value(n))?;
            }
            Ok(())
        })?;
    }

    db.view(|tx| {
        let b = tx.bucket(b"widgets").expect("bucket missing");

        // A full scan returns exactly 10k entries in sorted order.
        let mut count = 0;
        let mut c = b.cursor();
        let mut item = c.first();
        while let Some((k, v)) = item {
            assert_eq!(k, key(count));
            assert_eq!(v, Some(value(count)));
            count += 1;
            item = c.next();
        }
        assert_eq!(count, 10000);

        // The high water mark has grown well past the initial four pages.
        assert!(tx.size() > initial_size);

        // Free pages and reachable pages stay disjoint.
        tx.check()
    })?;

    // Rewriting pages across 100 commits must have recycled some and left
    // others free; nothing should be stuck pending.
    let stats = db.stats();
    assert!(stats.free_page_n() > 0);
    assert_eq!(stats.pending_page_n(), 0);

    db.close()?;
    Ok(())
}

#[test]
fn test_delete_half_and_reuse_freed_pages() -> Result<()> {
    let (file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        for i in 0..10000 {
            b.put(&key(i), &value(i))?;
        }
        Ok(())
    })?;

    // Delete every odd key.
    db.update(|tx| {
        let b = tx.bucket(b"widgets").expect("bucket missing");
        for i in (1..10000).step_by(2) {
            b.delete(&key(i))?;
        }
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"widgets").expect("bucket missing");
        for i in (0..10000).step_by(2) {
            assert_eq!(b.get(&key(i)), Some(value(i)), "missing even key {}", i);
        }
        for i in (1..10000).step_by(2) {
            assert_eq!(b.get(&key(i)), None, "odd key {} survived", i);
        }
        assert_eq!(b.stats().key_n, 5000);
        tx.check()
    })?;

    // A later transaction allocates from the freed pages instead of
    // growing the file.
    let size_before = file.as_file().metadata().unwrap().len();
    db.update(|tx| {
        let b = tx.bucket(b"widgets").expect("bucket missing");
        for i in 0..10 {
            b.put(&key(20000 + i), &value(i))?;
        }
        Ok(())
    })?;
    let size_after = file.as_file().metadata().unwrap().len();
    assert_eq!(size_before, size_after);

    db.close()?;
    Ok(())
}

#[test]
fn test_nested_bucket_delete_reclaims_pages() -> Result<()> {
    let (file, db) = temp_db_with(Options {
        page_size: 4096,
        ..Default::default()
    });

    db.update(|tx| {
        let b = tx.create_bucket(b"a")?;
        // enough data to force both trees out of their inline form
        for i in 0..500 {
            b.put(&key(i), &value(i))?;
        }
        let nested = b.create_bucket(b"a1")?;
        for i in 0..500 {
            nested.put(&key(i), &value(i))?;
        }
        Ok(())
    })?;
    db.close()?;

    let db = DB::open(file.path())?;

    // Populate the freelist gauges with a commit that doesn't touch "a".
    db.update(|tx| {
        tx.create_bucket(b"other")?;
        Ok(())
    })?;
    let free_before = db.stats().free_page_n() + db.stats().pending_page_n();

    db.update(|tx| tx.delete_bucket(b"a"))?;

    let free_after = db.stats().free_page_n() + db.stats().pending_page_n();
    assert!(
        free_after > free_before,
        "expected page reclamation, free {} -> {}",
        free_before,
        free_after
    );

    db.view(|tx| {
        assert!(tx.bucket(b"a").is_none());
        tx.check()
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_snapshot_isolation_and_release() -> Result<()> {
    // A roomy initial map keeps the writer from having to remap (and thus
    // block on the open reader) during this test.
    let (_file, db) = temp_db_with(Options {
        initial_mmap_size: 1 << 20,
        ..Default::default()
    });

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"k", b"v1")
    })?;

    // Pin a snapshot.
    let reader = db.begin(false)?;

    // Two writer commits while the reader stays open.
    db.update(|tx| tx.bucket(b"widgets").unwrap().put(b"k", b"v2"))?;
    db.update(|tx| tx.bucket(b"widgets").unwrap().put(b"k", b"v3"))?;

    // The reader still observes the state at its begin.
    let b = reader.bucket(b"widgets").expect("bucket missing in snapshot");
    assert_eq!(b.get(b"k"), Some(b"v1".to_vec()));

    // Pages freed by those commits stay pending while the reader lives.
    assert!(db.stats().pending_page_n() > 0);
    let free_before = db.stats().free_page_n();

    reader.rollback()?;

    // The next writer's release moves the pending pages to the free set.
    db.update(|tx| tx.bucket(b"widgets").unwrap().put(b"k", b"v4"))?;
    assert!(db.stats().free_page_n() > free_before);
    assert_eq!(db.stats().pending_page_n(), 0);

    db.view(|tx| {
        assert_eq!(
            tx.bucket(b"widgets").unwrap().get(b"k"),
            Some(b"v4".to_vec())
        );
        tx.check()
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_rollback_leaves_disk_identical() -> Result<()> {
    let (file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"a", b"1")
    })?;
    db.sync()?;

    let before = std::fs::read(file.path()).unwrap();

    let tx = db.begin(true)?;
    tx.bucket(b"widgets").unwrap().put(b"b", b"2")?;
    tx.bucket(b"widgets").unwrap().delete(b"a")?;
    tx.rollback()?;

    let after = std::fs::read(file.path()).unwrap();
    assert_eq!(before, after, "rollback must not touch the file");

    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(b.get(b"b"), None);
        Ok(())
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_dropped_writer_rolls_back() -> Result<()> {
    let (_file, db) = temp_db();

    db.update(|tx| {
        tx.create_bucket(b"widgets")?;
        Ok(())
    })?;

    {
        let tx = db.begin(true)?;
        tx.bucket(b"widgets").unwrap().put(b"x", b"y")?;
        // dropped without commit
    }

    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets").unwrap().get(b"x"), None);
        Ok(())
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_cursor_navigation() -> Result<()> {
    let (_file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        for k in [b"bar", b"baz", b"foo"] {
            b.put(k, b"x")?;
        }
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        let mut c = b.cursor();

        assert_eq!(c.first().unwrap().0, b"bar".to_vec());
        assert_eq!(c.next().unwrap().0, b"baz".to_vec());
        assert_eq!(c.prev().unwrap().0, b"bar".to_vec());
        assert_eq!(c.last().unwrap().0, b"foo".to_vec());
        assert_eq!(c.next(), None);

        // Seek lands on the exact key or the one after it.
        assert_eq!(c.seek(b"baz").unwrap().0, b"baz".to_vec());
        assert_eq!(c.seek(b"bb").unwrap().0, b"foo".to_vec());
        assert_eq!(c.seek(b"zzz"), None);
        Ok(())
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_incompatible_values() -> Result<()> {
    let (_file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"plain", b"value")?;
        b.create_bucket(b"nested")?;
        Ok(())
    })?;

    db.update(|tx| {
        let b = tx.bucket(b"widgets").unwrap();

        // value ops on a bucket key
        assert_eq!(b.put(b"nested", b"x"), Err(Error::IncompatibleValue));
        assert_eq!(b.delete(b"nested"), Err(Error::IncompatibleValue));
        assert_eq!(b.get(b"nested"), None);

        // bucket ops on a plain key
        assert_eq!(
            b.create_bucket(b"plain").err(),
            Some(Error::IncompatibleValue)
        );
        assert_eq!(b.delete_bucket(b"plain"), Err(Error::IncompatibleValue));

        // other bucket errors
        assert_eq!(b.create_bucket(b"nested").err(), Some(Error::BucketExists));
        assert_eq!(b.delete_bucket(b"missing"), Err(Error::BucketNotFound));
        assert_eq!(b.create_bucket(b"").err(), Some(Error::BucketNameRequired));
        assert_eq!(b.put(b"", b"x"), Err(Error::KeyRequired));
        Ok(())
    })?;

    // mutations through a read-only transaction are rejected
    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.put(b"a", b"b"), Err(Error::TxNotWritable));
        assert_eq!(b.delete(b"plain"), Err(Error::TxNotWritable));
        assert_eq!(b.create_bucket(b"x").err(), Some(Error::TxNotWritable));
        Ok(())
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_overflow_values() -> Result<()> {
    let (file, db) = temp_db_with(Options {
        page_size: 4096,
        ..Default::default()
    });

    // Values larger than a page force overflow allocations.
    let big: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 251) as u8).collect();

    db.update(|tx| {
        let b = tx.create_bucket(b"blobs")?;
        b.put(b"big0", &big)?;
        b.put(b"big1", &big)?;
        b.put(b"small", b"s")
    })?;
    db.close()?;

    let db = DB::open(file.path())?;
    db.view(|tx| {
        let b = tx.bucket(b"blobs").unwrap();
        assert_eq!(b.get(b"big0"), Some(big.clone()));
        assert_eq!(b.get(b"big1"), Some(big.clone()));
        assert_eq!(b.get(b"small"), Some(b"s".to_vec()));
        tx.check()
    })?;
    db.close()?;
    Ok(())
}

#[test]
fn test_sequence() -> Result<()> {
    let (file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        assert_eq!(b.sequence(), 0);
        assert_eq!(b.next_sequence()?, 1);
        assert_eq!(b.next_sequence()?, 2);
        b.set_sequence(1000)?;
        assert_eq!(b.next_sequence()?, 1001);
        Ok(())
    })?;
    db.close()?;

    // sequences survive reopen
    let db = DB::open(file.path())?;
    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets").unwrap().sequence(), 1001);
        Ok(())
    })?;
    db.close()?;
    Ok(())
}

#[test]
fn test_for_each() -> Result<()> {
    let (_file, db) = temp_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"bar", b"2")?;
        b.put(b"foo", b"1")?;
        b.create_bucket(b"sub")?;
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        let mut seen = Vec::new();
        b.for_each(|k, v| {
            seen.push((k.to_vec(), v.map(|v| v.to_vec())));
            Ok(())
        })?;
        assert_eq!(
            seen,
            vec![
                (b"bar".to_vec(), Some(b"2".to_vec())),
                (b"foo".to_vec(), Some(b"1".to_vec())),
                (b"sub".to_vec(), None),
            ]
        );

        // the bucket-only walk skips plain keys
        let mut buckets = Vec::new();
        b.for_each_bucket(|k| {
            buckets.push(k.to_vec());
            Ok(())
        })?;
        assert_eq!(buckets, vec![b"sub".to_vec()]);
        Ok(())
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_no_freelist_sync_reopen() -> Result<()> {
    let options = Options {
        no_freelist_sync: true,
        ..Default::default()
    };
    let (file, db) = temp_db_with(options.clone());

    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        for i in 0..500 {
            b.put(&key(i), &value(i))?;
        }
        Ok(())
    })?;
    db.update(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        for i in 0..250 {
            b.delete(&key(i))?;
        }
        Ok(())
    })?;
    db.close()?;

    // The freelist is rebuilt by scanning reachable pages.
    let db = DB::open_with(file.path(), options)?;
    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.get(&key(0)), None);
        assert_eq!(b.get(&key(300)), Some(value(300)));
        tx.check()
    })?;

    // And the rebuilt free set is usable for allocation.
    db.update(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        b.put(b"new-key", b"new-value")
    })?;

    db.close()?;
    Ok(())
}

#[test]
fn test_hashmap_freelist_end_to_end() -> Result<()> {
    let (file, db) = temp_db_with(Options {
        freelist_type: FreelistType::HashMap,
        ..Default::default()
    });

    for batch in 0..10 {
        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists(b"widgets")?;
            for i in 0..200 {
                b.put(&key(batch * 200 + i), &value(i))?;
            }
            Ok(())
        })?;
    }
    db.update(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        for i in (0..2000).step_by(3) {
            b.delete(&key(i))?;
        }
        Ok(())
    })?;

    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.get(&key(1)), Some(value(1 % 200)));
        assert_eq!(b.get(&key(3)), None);
        tx.check()
    })?;
    db.close()?;

    // A hashmap-freelist file reopens cleanly with the array form too; the
    // serialized format is shared.
    let db = DB::open(file.path())?;
    db.view(|tx| tx.check())?;
    db.close()?;
    Ok(())
}

#[test]
fn test_open_timeout_on_locked_file() -> Result<()> {
    let (file, db) = temp_db();

    // The first handle holds the exclusive lock; a second open with a short
    // timeout must give up.
    let result = DB::open_with(
        file.path(),
        Options {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    assert_eq!(result.err(), Some(Error::Timeout));

    db.close()?;
    Ok(())
}

#[test]
fn test_nested_bucket_roundtrip() -> Result<()> {
    let (file, db) = temp_db();

    db.update(|tx| {
        let a = tx.create_bucket(b"a")?;
        a.put(b"k1", b"v1")?;
        let a1 = a.create_bucket(b"a1")?;
        a1.put(b"k2", b"v2")?;
        Ok(())
    })?;
    db.close()?;

    let db = DB::open(file.path())?;
    db.view(|tx| {
        let a = tx.bucket(b"a").unwrap();
        assert_eq!(a.get(b"k1"), Some(b"v1".to_vec()));
        let a1 = a.bucket(b"a1").expect("nested bucket lost");
        assert_eq!(a1.get(b"k2"), Some(b"v2".to_vec()));

        // bucket entries read as values return nothing
        assert_eq!(a.get(b"a1"), None);

        let stats = a.stats();
        assert_eq!(stats.bucket_n, 2);
        assert_eq!(stats.key_n, 3);
        Ok(())
    })?;
    db.close()?;
    Ok(())
}
