use bptdb::{Db, Setting};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

use std::sync::Once;
static INIT: Once = Once::new();
fn setup() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

#[test]
fn test_insert_split_and_scan() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let db = Db::init(Setting::default()).unwrap();
    let table = db.open_table(dir.path().join("table1")).unwrap();
    assert_eq!(4, db.page_count(table).unwrap());

    for key in 1..=50i64 {
        assert!(db.insert(table, key, key.to_string().as_bytes()).unwrap());
    }
    assert!(db.page_count(table).unwrap() > 4, "a leaf must have been split");
    db.verify(table).unwrap();

    let keys = db
        .scan(table)
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect::<Vec<_>>();
    assert_eq!((1..=50).collect::<Vec<_>>(), keys);
    for key in 1..=50i64 {
        let value = db.find(table, key).unwrap().unwrap();
        assert_eq!(key.to_string().as_bytes(), value.as_bytes());
    }

    for key in (1..=50i64).rev() {
        assert!(db.delete(table, key).unwrap());
        assert_eq!(None, db.find(table, key).unwrap());
        for remaining in 1..key {
            assert!(db.find(table, remaining).unwrap().is_some());
        }
        db.verify(table).unwrap();
    }
    assert!(db.scan(table).unwrap().is_empty());
    assert!(!db.delete(table, 1).unwrap());

    db.shutdown().unwrap();
}

#[test]
fn test_reopen_keeps_records() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table1");
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let mut keys = (0..3000i64).collect::<Vec<_>>();
    keys.shuffle(&mut rng);

    let db = Db::init(Setting::default()).unwrap();
    let table = db.open_table(&path).unwrap();
    for key in &keys {
        db.insert(table, *key, format!("val{key:05}").as_bytes())
            .unwrap();
    }
    for key in keys.iter().filter(|key| *key % 3 == 0) {
        assert!(db.delete(table, *key).unwrap());
    }
    db.shutdown().unwrap();

    let file_size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(0, file_size % 4096);

    let db = Db::init(Setting::default()).unwrap();
    let table = db.open_table(&path).unwrap();
    assert_eq!(file_size / 4096, db.page_count(table).unwrap());
    db.verify(table).unwrap();
    for key in 0..3000i64 {
        let value = db.find(table, key).unwrap();
        if key % 3 == 0 {
            assert_eq!(None, value);
        } else {
            assert_eq!(
                format!("val{key:05}").as_bytes(),
                value.unwrap().as_bytes()
            );
        }
    }
    db.shutdown().unwrap();
}

#[test]
fn test_drop_without_shutdown_persists() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table1");

    let db = Db::init(Setting::default()).unwrap();
    let table = db.open_table(&path).unwrap();
    for key in 0..100i64 {
        db.insert(table, key, b"value").unwrap();
    }
    drop(db);

    let db = Db::init(Setting::default()).unwrap();
    let table = db.open_table(&path).unwrap();
    assert_eq!(100, db.scan(table).unwrap().len());
}

#[test]
fn test_multiple_tables_small_pool() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let db = Db::init(Setting {
        buffer_frames: 10,
        ..Setting::default()
    })
    .unwrap();
    let tables = (0..3)
        .map(|i| db.open_table(dir.path().join(format!("table{i}"))).unwrap())
        .collect::<Vec<_>>();

    for key in 0..2000i64 {
        for (i, table) in tables.iter().enumerate() {
            db.insert(*table, key, format!("{i}:{key}").as_bytes())
                .unwrap();
        }
    }
    for (i, table) in tables.iter().enumerate() {
        db.verify(*table).unwrap();
        let records = db.scan(*table).unwrap();
        assert_eq!(2000, records.len());
        for (key, value) in records {
            assert_eq!(format!("{i}:{key}").as_bytes(), value.as_bytes());
        }
    }
    db.shutdown().unwrap();
}

#[test]
fn test_random_operations() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let db = Db::init(Setting {
        buffer_frames: 20,
        wal: false,
        ..Setting::default()
    })
    .unwrap();
    let table = db.open_table(dir.path().join("table1")).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    let mut expected = BTreeMap::new();
    for i in 0..20000 {
        let key = rng.gen_range(0..4000i64);
        match rng.gen_range(0..3) {
            0 | 1 => {
                let value = rng.gen::<u64>().to_string();
                let inserted = db.insert(table, key, value.as_bytes()).unwrap();
                assert_eq!(!expected.contains_key(&key), inserted);
                expected.entry(key).or_insert(value);
            }
            _ => {
                let deleted = db.delete(table, key).unwrap();
                assert_eq!(expected.remove(&key).is_some(), deleted);
            }
        }
        if i % 2000 == 0 {
            db.verify(table).unwrap();
        }
    }

    db.verify(table).unwrap();
    let records = db.scan(table).unwrap();
    assert_eq!(expected.len(), records.len());
    for ((key, value), (expected_key, expected_value)) in records.iter().zip(expected.iter()) {
        assert_eq!(expected_key, key);
        assert_eq!(expected_value.as_bytes(), value.as_bytes());
    }
    db.shutdown().unwrap();
}

#[test]
fn test_clean_shrinks_file() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table1");
    let db = Db::init(Setting::default()).unwrap();
    let table = db.open_table(&path).unwrap();
    let initial = db.page_count(table).unwrap();

    for key in 0..5000i64 {
        db.insert(table, key, b"value").unwrap();
    }
    let grown = db.page_count(table).unwrap();
    assert!(grown > initial);
    for key in 0..5000i64 {
        db.delete(table, key).unwrap();
    }
    assert_eq!(grown, db.page_count(table).unwrap());

    db.clean(table).unwrap();
    db.verify(table).unwrap();
    assert!(db.page_count(table).unwrap() < grown);
    assert!(db.insert(table, 1, b"again").unwrap());

    db.close_table(table).unwrap();
    let table = db.open_table(&path).unwrap();
    assert_eq!(
        std::fs::metadata(&path).unwrap().len() / 4096,
        db.page_count(table).unwrap()
    );
    assert_eq!(b"again", db.find(table, 1).unwrap().unwrap().as_bytes());
    db.shutdown().unwrap();
}

#[test]
fn test_table_limit() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let db = Db::init(Setting::default()).unwrap();
    let tables = (0..10)
        .map(|i| db.open_table(dir.path().join(format!("table{i}"))).unwrap())
        .collect::<Vec<_>>();
    assert!(db.open_table(dir.path().join("table10")).is_err());

    db.close_table(tables[4]).unwrap();
    let reopened = db.open_table(dir.path().join("table10")).unwrap();
    assert_eq!(tables[4], reopened);
    assert!(!db.is_poisoned());
    db.shutdown().unwrap();
}

#[test]
fn test_tables_in_parallel() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Db::init(Setting {
            buffer_frames: 64,
            ..Setting::default()
        })
        .unwrap(),
    );

    let handles = (0..4)
        .map(|i| {
            let db = db.clone();
            let path = dir.path().join(format!("table{i}"));
            std::thread::spawn(move || {
                let table = db.open_table(&path).unwrap();
                let mut rng = rand::rngs::StdRng::seed_from_u64(i);
                let mut expected = BTreeMap::new();
                for _ in 0..3000 {
                    let key = rng.gen_range(0..1000i64);
                    if rng.gen_bool(0.7) {
                        let inserted = db.insert(table, key, format!("{i}:{key}").as_bytes());
                        assert_eq!(!expected.contains_key(&key), inserted.unwrap());
                        expected.insert(key, ());
                    } else {
                        let deleted = db.delete(table, key).unwrap();
                        assert_eq!(expected.remove(&key).is_some(), deleted);
                    }
                    let lookup = rng.gen_range(0..1000i64);
                    let found = db.find(table, lookup).unwrap();
                    assert_eq!(expected.contains_key(&lookup), found.is_some());
                }
                db.verify(table).unwrap();
                (table, expected.len())
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        let (table, len) = handle.join().unwrap();
        assert_eq!(len, db.scan(table).unwrap().len());
    }
    assert!(!db.is_poisoned());
}

#[test]
fn test_open_while_closing() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Db::init(Setting::default()).unwrap());

    for round in 0..5 {
        let closing_path = dir.path().join(format!("closing{round}"));
        let closing = db.open_table(&closing_path).unwrap();
        for key in 0..5000i64 {
            db.insert(closing, key, b"value").unwrap();
        }

        let closer = {
            let db = db.clone();
            std::thread::spawn(move || db.close_table(closing).unwrap())
        };
        // once the table is gone from lookups, its id and path must be safe to open again
        while db.find(closing, 0).is_ok() {
            std::thread::yield_now();
        }
        let other = db
            .open_table(dir.path().join(format!("other{round}")))
            .unwrap();
        assert_eq!(closing, other, "the lowest free id is reused");
        closer.join().unwrap();
        db.close_table(other).unwrap();

        let reopened = db.open_table(&closing_path).unwrap();
        assert_eq!(5000, db.scan(reopened).unwrap().len());
        db.verify(reopened).unwrap();
        db.close_table(reopened).unwrap();
    }
    assert!(!db.is_poisoned());
}
